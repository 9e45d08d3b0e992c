//! The contract between simulated components and the event kernel.

use std::{cmp::Ordering, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{BufferedMessage, CheckpointError},
    config::ConfigError,
    pattern::{Message, PatternState, ProtocolViolation, SelfEvent},
    topology::{Direction, Rank},
};

/// Which side of an endpoint a link leaves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Port {
    /// Self-addressed events of the endpoint.
    Local,
    Out(Direction),
}

/// Identity of a point-to-point channel: the sending endpoint and its port.
///
/// Derived purely from configuration, so it is stable regardless of the order
/// in which components were built or links registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId {
    endpoint: u32,
    port: Port,
}

impl LinkId {
    pub(crate) fn new(endpoint: u32, port: Port) -> Self {
        Self { endpoint, port }
    }

    pub(crate) fn local(endpoint: u32) -> Self {
        Self::new(endpoint, Port::Local)
    }

    pub fn endpoint(&self) -> u32 {
        self.endpoint
    }

    pub fn port(&self) -> Port {
        self.port
    }
}

impl Ord for LinkId {
    fn cmp(&self, other: &Self) -> Ordering {
        // self events go ahead of arrivals scheduled for the same instant
        let key = |l: &LinkId| (matches!(l.port, Port::Out(_)), l.endpoint, l.port);
        key(self).cmp(&key(other))
    }
}

impl PartialOrd for LinkId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Port::Local => write!(f, "{}/local", self.endpoint),
            Port::Out(direction) => write!(f, "{}/{direction}", self.endpoint),
        }
    }
}

/// Something the kernel hands to a component.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Timer(SelfEvent),
    Message { link: LinkId, message: Message },
}

/// One observable step of a component, as reported through [`Kernel::record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceKind {
    Transition {
        from: PatternState,
        to: PatternState,
        round: u32,
    },
    Send {
        direction: Direction,
        to: Rank,
        bytes: u64,
        delay_ns: u64,
    },
    Receive {
        from: Rank,
        count: u32,
    },
    /// An exchange that arrived after the rank was done.
    Late {
        from: Rank,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub time: u64,
    pub rank: Rank,
    #[serde(flatten)]
    pub kind: TraceKind,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>12} rank {:>4} ", self.time, self.rank)?;
        match &self.kind {
            TraceKind::Transition { from, to, round } => {
                write!(f, "{from} -> {to} (round {round})")
            }
            TraceKind::Send {
                direction,
                to,
                bytes,
                delay_ns,
            } => write!(f, "send {bytes}B {direction} to {to}, arrives in {delay_ns}ns"),
            TraceKind::Receive { from, count } => write!(f, "recv from {from} ({count}/4)"),
            TraceKind::Late { from } => write!(f, "late exchange from {from}"),
        }
    }
}

/// Final per-rank state reported by a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankSummary {
    pub rank: Rank,
    pub state: PatternState,
    pub rounds: u32,
    pub receive_count: u32,
}

/// Services the kernel offers to the component currently handling an event.
///
/// Times are virtual nanoseconds.
pub trait Kernel {
    fn now(&self) -> u64;

    /// Delivers `event` back to the calling component after `delay`.
    fn schedule_self_event(&mut self, delay: Duration, event: SelfEvent);

    /// Opens (or looks up) the outgoing link towards `peer`.
    ///
    /// Registering the same direction again returns the same link.
    fn register_neighbor_link(
        &mut self,
        direction: Direction,
        peer: Rank,
    ) -> Result<LinkId, ConfigError>;

    fn send_message(&mut self, link: LinkId, message: Message, byte_len: u64, delay: Duration);

    fn record(&mut self, kind: TraceKind);
}

/// A simulated component driven by the kernel.
pub trait Component: Send {
    fn rank(&self) -> Rank;

    /// Handles one delivery to completion.
    fn handle_event(
        &mut self,
        delivery: Delivery,
        kernel: &mut dyn Kernel,
    ) -> Result<(), ProtocolViolation>;

    /// Serializes the component together with the deliveries the kernel drained
    /// for it, in delivery order.
    fn checkpoint(
        &self,
        now: u64,
        inbound: Vec<BufferedMessage>,
    ) -> Result<Vec<u8>, CheckpointError>;

    fn summary(&self) -> RankSummary;
}

/// A component rebuilt from a checkpoint, plus the deliveries to re-inject.
pub struct Restored {
    pub component: Box<dyn Component>,
    pub inbound: Vec<BufferedMessage>,
}

impl fmt::Debug for Restored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Restored")
            .field("rank", &self.component.rank())
            .field("inbound", &self.inbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_links_sort_first() {
        let local = LinkId::local(9);
        let out = LinkId::new(0, Port::Out(Direction::Right));
        assert!(local < out);
        assert!(LinkId::local(0) < local);
        assert!(
            LinkId::new(0, Port::Out(Direction::Up)) < LinkId::new(1, Port::Out(Direction::Right))
        );
        assert!(
            LinkId::new(1, Port::Out(Direction::Right)) < LinkId::new(1, Port::Out(Direction::Left))
        );
    }
}
