//! Parsing of unit-suffixed parameter values such as `50ns`, `1.77GB/s` or `2KiB`.
//!
//! Bare numbers are taken in base units: nanoseconds for time, bytes per second
//! for bandwidth and bytes for sizes.

const TIME_UNITS: &[(&str, f64)] = &[
    ("ps", 1e-3),
    ("ns", 1.0),
    ("us", 1e3),
    ("µs", 1e3),
    ("ms", 1e6),
    ("s", 1e9),
];

const SIZE_UNITS: &[(&str, f64)] = &[
    ("KiB", 1024.0),
    ("MiB", 1024.0 * 1024.0),
    ("GiB", 1024.0 * 1024.0 * 1024.0),
    ("KB", 1e3),
    ("MB", 1e6),
    ("GB", 1e9),
    ("B", 1.0),
];

/// Parses a duration into nanoseconds.
pub fn parse_time_ns(value: &str) -> Result<f64, String> {
    parse_with_units(value, TIME_UNITS, "time")
}

/// Parses a bandwidth into bytes per second.
pub fn parse_bandwidth(value: &str) -> Result<f64, String> {
    let value = value.trim();
    match value.strip_suffix("/s") {
        Some(size) => parse_with_units(size, SIZE_UNITS, "bandwidth"),
        None => parse_number(value, "bandwidth"),
    }
}

/// Parses a byte count.
pub fn parse_bytes(value: &str) -> Result<u64, String> {
    let bytes = parse_with_units(value, SIZE_UNITS, "size")?;
    if bytes < 0.0 || bytes.fract() != 0.0 || bytes > u64::MAX as f64 {
        return Err(format!("`{value}` is not a whole number of bytes"));
    }
    Ok(bytes as u64)
}

fn parse_with_units(value: &str, units: &[(&str, f64)], what: &str) -> Result<f64, String> {
    let value = value.trim();
    // longest suffixes are listed first where they share a tail ("KiB" before "B")
    for (suffix, scale) in units {
        if let Some(number) = value.strip_suffix(suffix) {
            if number.ends_with(|c: char| c.is_ascii_alphabetic() || c == 'µ') {
                continue;
            }
            return parse_number(number, what).map(|n| n * scale);
        }
    }
    parse_number(value, what)
}

fn parse_number(value: &str, what: &str) -> Result<f64, String> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("`{value}` is not a valid {what}"))
}
