//! Deterministic discrete-event kernel for running ghost-exchange ranks.
//!
//! The kernel is single-threaded: every component handles one delivery at a
//! time, to completion, and the only suspension points are scheduled events.
//!
//! - **VirtualTime**: nanosecond clock that only advances with the event queue
//! - **Scheduler**: priority queue ordered by
//!   `(timestamp, destination endpoint, link, sequence number)`
//! - **Transport**: independent point-to-point links between rank endpoints
//! - **SimulationRng**: seeded RNG, used to shuffle component construction
//! - **Simulation**: ties the above together, records a trace and drives
//!   checkpoint/restore of individual ranks
//!
//! ```ignore
//! let run = RunConfig::load("torus.toml".as_ref())?;
//! let mut sim = Simulation::build(&run, ComponentRegistry::with_builtins())?;
//! sim.run_until(10_100)?;
//! let blobs = sim.checkpoint_all()?;
//! sim.restore_all(blobs)?;
//! let report = sim.run()?;
//! ```

mod driver;
mod kernel;
mod network;
mod rng;
mod scheduler;
mod time;

pub use driver::{ComponentSpec, RunReport, SimError, Simulation};
pub use kernel::{
    Component, Delivery, Kernel, LinkId, Port, RankSummary, Restored, TraceKind, TraceRecord,
};
pub use network::{InFlightMessage, NetworkStats, Transport};
pub use rng::SimulationRng;
pub use scheduler::{Event, EventId, EventType, Scheduler};
pub use time::VirtualTime;
