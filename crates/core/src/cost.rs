//! Analytic latency/bandwidth cost model for point-to-point messages.

use std::time::Duration;

use crate::config::TimingModelError;

/// Validated link timing parameters.
///
/// Latency is in nanoseconds, bandwidth in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    latency_ns: f64,
    bandwidth: f64,
}

impl CostModel {
    pub fn new(latency_ns: f64, bandwidth: f64) -> Result<Self, TimingModelError> {
        if !(latency_ns.is_finite() && latency_ns >= 0.0) {
            return Err(TimingModelError::InvalidLatency(latency_ns));
        }
        if !(bandwidth.is_finite() && bandwidth > 0.0) {
            return Err(TimingModelError::InvalidBandwidth(bandwidth));
        }
        Ok(Self {
            latency_ns,
            bandwidth,
        })
    }

    /// Time between issuing a message of `bytes` and its arrival.
    pub fn send_delay(&self, bytes: u64) -> Duration {
        send_delay(self.latency_ns, self.bandwidth, bytes)
    }
}

/// `latency + bytes / bandwidth`, rounded to the nearest nanosecond.
///
/// Callers are expected to pass parameters already validated by [`CostModel::new`].
pub fn send_delay(latency_ns: f64, bandwidth: f64, bytes: u64) -> Duration {
    let transfer_ns = bytes as f64 * 1e9 / bandwidth;
    nanos_to_duration(latency_ns + transfer_ns)
}

/// Converts fractional nanoseconds into the kernel's whole-nanosecond resolution.
pub fn nanos_to_duration(nanos: f64) -> Duration {
    if !(nanos.is_finite() && nanos > 0.0) {
        return Duration::ZERO;
    }
    let rounded = nanos.round();
    if rounded >= u64::MAX as f64 {
        return Duration::from_nanos(u64::MAX);
    }
    Duration::from_nanos(rounded as u64)
}
