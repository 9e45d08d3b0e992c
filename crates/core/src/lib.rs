//! Synthetic ghost-exchange traffic for interconnect simulation.
//!
//! Each simulated rank sits on a 2D torus and repeatedly computes, then trades
//! halo data with its four neighbors. Message timing follows a
//! latency + size/bandwidth model, so whole runs are reproducible to the
//! nanosecond and can be checkpointed and resumed mid-flight.

/// Versioned snapshot encoding of ranks.
pub mod checkpoint;

/// Rank parameters, run files and command line arguments.
pub mod config;

/// Latency/bandwidth message cost model.
pub mod cost;

/// Tracing subscriber setup and per-component verbosity.
pub mod logging;

/// The INIT/COMPUTE/WAIT/DONE ghost-exchange state machine.
pub mod pattern;

/// Component type registry.
pub mod registry;

/// Deterministic event kernel and simulation driver.
pub mod simulation;

/// Torus neighbor resolution and rank mappings.
pub mod topology;

pub use config::{set_logger, BuildError, ConfigError, GhostConfig, RunConfig, SimArgs};
pub use pattern::{GhostPattern, PatternState, ProtocolViolation};
pub use registry::ComponentRegistry;
pub use simulation::{RunReport, SimError, Simulation};
