//! Virtual time for deterministic simulation.

use std::{fmt, time::Duration};

/// Deterministic clock that only moves when explicitly advanced.
///
/// Measured in nanoseconds since the start of the run; never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualTime {
    current_nanos: u64,
}

impl VirtualTime {
    /// Creates a new virtual time starting at 0.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_nanos(&self) -> u64 {
        self.current_nanos
    }

    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.current_nanos)
    }

    /// Advances time to the given absolute nanoseconds. Earlier targets are ignored.
    pub fn advance_to(&mut self, target_nanos: u64) {
        self.current_nanos = self.current_nanos.max(target_nanos);
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.current_nanos)
    }
}
