//! The per-rank ghost-exchange state machine.
//!
//! Every rank alternates between a compute phase and an exchange phase in which
//! it sends one message to each of its four torus neighbors and then waits for
//! one message from each of them:
//!
//! ```text
//! INIT --start--> COMPUTE --compute done / send x4--> WAIT --4th exchange--> COMPUTE
//!                                                          \--round limit--> DONE
//! ```
//!
//! Any other combination of state and event is a [`ProtocolViolation`].

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{self, BufferedMessage, CheckpointError, PendingTimer, Snapshot},
    config::{BuildError, GhostConfig, Params},
    cost::CostModel,
    logging::ComponentLog,
    simulation::{Component, Delivery, Kernel, LinkId, RankSummary, TraceKind},
    topology::{NeighborSet, Rank, NEIGHBOR_COUNT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternState {
    Init,
    Compute,
    Wait,
    Done,
}

impl PatternState {
    pub const ALL: [PatternState; 4] = [
        PatternState::Init,
        PatternState::Compute,
        PatternState::Wait,
        PatternState::Done,
    ];
}

impl fmt::Display for PatternState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatternState::Init => "INIT",
            PatternState::Compute => "COMPUTE",
            PatternState::Wait => "WAIT",
            PatternState::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Start,
    Exchange,
}

/// A message travelling between ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub sender: Rank,
    pub kind: MessageKind,
    /// Payload length in bytes.
    pub len: u64,
}

impl Message {
    pub fn exchange(sender: Rank, len: u64) -> Self {
        Self {
            sender,
            kind: MessageKind::Exchange,
            len,
        }
    }
}

/// Events a rank schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelfEvent {
    Start,
    ComputeDone,
}

/// Classification of a delivery, as seen by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    ComputeTimer,
    Exchange,
    /// A START that arrived over the network instead of from the rank itself.
    RemoteStart,
}

impl EventKind {
    pub fn of(delivery: &Delivery) -> Self {
        match delivery {
            Delivery::Timer(SelfEvent::Start) => EventKind::Start,
            Delivery::Timer(SelfEvent::ComputeDone) => EventKind::ComputeTimer,
            Delivery::Message { message, .. } => match message.kind {
                MessageKind::Start => EventKind::RemoteStart,
                MessageKind::Exchange => EventKind::Exchange,
            },
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Start => "START",
            EventKind::ComputeTimer => "compute timer",
            EventKind::Exchange => "EXCHANGE",
            EventKind::RemoteStart => "START over the network",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("rank {rank} received {event} while in {state}")]
    UnexpectedEvent {
        rank: Rank,
        state: PatternState,
        event: EventKind,
    },
    #[error("rank {rank} received a message from {sender}, which is not a neighbor (state {state})")]
    NonNeighbor {
        rank: Rank,
        sender: Rank,
        state: PatternState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedTimer {
    event: SelfEvent,
    /// Absolute virtual time at which the timer fires.
    due: u64,
}

/// A ghost-exchange rank.
pub struct GhostPattern {
    config: GhostConfig,
    cost: CostModel,
    neighbors: NeighborSet,
    links: [LinkId; NEIGHBOR_COUNT],
    state: PatternState,
    receive_count: u32,
    round_counter: u32,
    timer: Option<ArmedTimer>,
    log: ComponentLog,
}

impl GhostPattern {
    /// Binds a new rank to the kernel and enqueues its zero-delay START.
    pub fn new(config: GhostConfig, kernel: &mut dyn Kernel) -> Result<Self, BuildError> {
        let mut pattern = Self::bind(config, kernel)?;
        pattern.arm(kernel, SelfEvent::Start, Duration::ZERO);
        if pattern.log.enabled(1) {
            let _enter = pattern.log.span().enter();
            tracing::debug!(
                dims = %pattern.config.dims,
                neighbors = ?pattern.neighbors,
                "Ghost pattern initialized"
            );
        }
        Ok(pattern)
    }

    pub fn from_params(params: &Params, kernel: &mut dyn Kernel) -> Result<Self, BuildError> {
        Self::new(GhostConfig::from_params(params)?, kernel)
    }

    /// Rebuilds a rank out of a snapshot, re-arming its pending timer.
    ///
    /// Buffered inbound messages are not touched; re-injecting them is up to
    /// the caller.
    pub fn restore(snapshot: &Snapshot, kernel: &mut dyn Kernel) -> Result<Self, CheckpointError> {
        check_consistency(snapshot)?;
        let mut pattern = Self::bind(snapshot.config.clone(), kernel)?;
        pattern.state = snapshot.state;
        pattern.receive_count = snapshot.receive_count;
        pattern.round_counter = snapshot.round_counter;
        if let Some(timer) = snapshot.timer {
            pattern.arm(kernel, timer.event, Duration::from_nanos(timer.remaining_nanos));
        }
        if pattern.log.enabled(1) {
            let _enter = pattern.log.span().enter();
            tracing::debug!(
                state = %pattern.state,
                round = pattern.round_counter,
                received = pattern.receive_count,
                "Ghost pattern restored"
            );
        }
        Ok(pattern)
    }

    fn bind(config: GhostConfig, kernel: &mut dyn Kernel) -> Result<Self, BuildError> {
        config.validate()?;
        let cost = config.cost_model()?;
        let neighbors = config.dims.neighbors(config.rank)?;
        let mut links = [LinkId::local(0); NEIGHBOR_COUNT];
        for (slot, (direction, peer)) in links.iter_mut().zip(neighbors.iter()) {
            *slot = kernel.register_neighbor_link(direction, peer)?;
        }
        let log = ComponentLog::new(config.rank, config.debug);
        Ok(Self {
            config,
            cost,
            neighbors,
            links,
            state: PatternState::Init,
            receive_count: 0,
            round_counter: 0,
            timer: None,
            log,
        })
    }

    /// Captures the rank at virtual time `now`.
    pub fn snapshot(&self, now: u64, inbound: Vec<BufferedMessage>) -> Snapshot {
        Snapshot {
            config: self.config.clone(),
            state: self.state,
            receive_count: self.receive_count,
            round_counter: self.round_counter,
            timer: self.timer.map(|t| PendingTimer {
                event: t.event,
                remaining_nanos: t.due.saturating_sub(now),
            }),
            inbound,
        }
    }

    pub fn rank(&self) -> Rank {
        self.config.rank
    }

    pub fn state(&self) -> PatternState {
        self.state
    }

    pub fn receive_count(&self) -> u32 {
        self.receive_count
    }

    pub fn round_counter(&self) -> u32 {
        self.round_counter
    }

    pub fn handle(
        &mut self,
        delivery: Delivery,
        kernel: &mut dyn Kernel,
    ) -> Result<(), ProtocolViolation> {
        let span = self.log.span().clone();
        let _enter = span.enter();
        let event = EventKind::of(&delivery);

        match delivery {
            Delivery::Timer(fired) => {
                if self.timer.is_some_and(|t| t.event == fired) {
                    self.timer = None;
                }
                match (self.state, fired) {
                    (PatternState::Init, SelfEvent::Start) => {
                        self.begin_compute(kernel);
                        Ok(())
                    }
                    (PatternState::Compute, SelfEvent::ComputeDone) => {
                        self.exchange(kernel);
                        Ok(())
                    }
                    _ => Err(self.unexpected(event)),
                }
            }
            Delivery::Message { message, .. } => {
                if !self.neighbors.contains(message.sender) {
                    return Err(ProtocolViolation::NonNeighbor {
                        rank: self.rank(),
                        sender: message.sender,
                        state: self.state,
                    });
                }
                match (self.state, message.kind) {
                    (PatternState::Wait, MessageKind::Exchange) => {
                        self.receive(message.sender, kernel);
                        Ok(())
                    }
                    (PatternState::Done, MessageKind::Exchange) => {
                        tracing::warn!(
                            sender = %message.sender,
                            round = self.round_counter,
                            "Exchange arrived after the rank finished"
                        );
                        kernel.record(TraceKind::Late {
                            from: message.sender,
                        });
                        Ok(())
                    }
                    _ => Err(self.unexpected(event)),
                }
            }
        }
    }

    fn unexpected(&self, event: EventKind) -> ProtocolViolation {
        ProtocolViolation::UnexpectedEvent {
            rank: self.rank(),
            state: self.state,
            event,
        }
    }

    fn arm(&mut self, kernel: &mut dyn Kernel, event: SelfEvent, delay: Duration) {
        let due = kernel.now().saturating_add(delay.as_nanos() as u64);
        self.timer = Some(ArmedTimer { event, due });
        kernel.schedule_self_event(delay, event);
    }

    fn begin_compute(&mut self, kernel: &mut dyn Kernel) {
        let delay = self.config.compute_delay();
        self.arm(kernel, SelfEvent::ComputeDone, delay);
        self.transition(PatternState::Compute, kernel);
    }

    fn exchange(&mut self, kernel: &mut dyn Kernel) {
        let bytes = self.config.exchange_msg_len;
        let delay = self.cost.send_delay(bytes);
        for (link, (direction, peer)) in self.links.iter().zip(self.neighbors.iter()) {
            kernel.send_message(*link, Message::exchange(self.config.rank, bytes), bytes, delay);
            kernel.record(TraceKind::Send {
                direction,
                to: peer,
                bytes,
                delay_ns: delay.as_nanos() as u64,
            });
            if self.log.enabled(2) {
                tracing::debug!(%direction, %peer, bytes, ?delay, "Sent ghost exchange");
            }
        }
        self.receive_count = 0;
        self.transition(PatternState::Wait, kernel);
    }

    fn receive(&mut self, sender: Rank, kernel: &mut dyn Kernel) {
        self.receive_count += 1;
        kernel.record(TraceKind::Receive {
            from: sender,
            count: self.receive_count,
        });
        if self.log.enabled(2) {
            tracing::debug!(%sender, received = self.receive_count, "Received ghost exchange");
        }
        if self.receive_count as usize != NEIGHBOR_COUNT {
            return;
        }

        self.round_counter += 1;
        match self.config.rounds {
            Some(limit) if self.round_counter >= limit => {
                self.transition(PatternState::Done, kernel)
            }
            _ => self.begin_compute(kernel),
        }
    }

    fn transition(&mut self, to: PatternState, kernel: &mut dyn Kernel) {
        let from = self.state;
        kernel.record(TraceKind::Transition {
            from,
            to,
            round: self.round_counter,
        });
        if self.log.enabled(1) {
            tracing::debug!(%from, %to, round = self.round_counter, "State transition");
        }
        self.state = to;
    }
}

fn check_consistency(snapshot: &Snapshot) -> Result<(), CheckpointError> {
    let timer = snapshot.timer.map(|t| t.event);
    let expected = match snapshot.state {
        PatternState::Init => Some(SelfEvent::Start),
        PatternState::Compute => Some(SelfEvent::ComputeDone),
        PatternState::Wait | PatternState::Done => None,
    };
    if timer != expected {
        return Err(CheckpointError::Inconsistent(format!(
            "state {} with pending timer {timer:?}",
            snapshot.state
        )));
    }
    if snapshot.receive_count as usize >= NEIGHBOR_COUNT
        || (snapshot.state != PatternState::Wait && snapshot.receive_count != 0)
    {
        return Err(CheckpointError::Inconsistent(format!(
            "state {} with {} exchanges received",
            snapshot.state, snapshot.receive_count
        )));
    }
    Ok(())
}

impl Component for GhostPattern {
    fn rank(&self) -> Rank {
        self.config.rank
    }

    fn handle_event(
        &mut self,
        delivery: Delivery,
        kernel: &mut dyn Kernel,
    ) -> Result<(), ProtocolViolation> {
        GhostPattern::handle(self, delivery, kernel)
    }

    fn checkpoint(
        &self,
        now: u64,
        inbound: Vec<BufferedMessage>,
    ) -> Result<Vec<u8>, CheckpointError> {
        checkpoint::encode(&self.snapshot(now, inbound))
    }

    fn summary(&self) -> RankSummary {
        RankSummary {
            rank: self.config.rank,
            state: self.state,
            rounds: self.round_counter,
            receive_count: self.receive_count,
        }
    }
}

impl fmt::Debug for GhostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GhostPattern")
            .field("rank", &self.config.rank)
            .field("state", &self.state)
            .field("receive_count", &self.receive_count)
            .field("round_counter", &self.round_counter)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::ConfigError,
        simulation::Port,
        topology::{Direction, TorusDims},
    };

    /// Records every kernel call instead of scheduling anything.
    #[derive(Default)]
    pub(crate) struct MockKernel {
        pub now: u64,
        pub timers: Vec<(Duration, SelfEvent)>,
        pub links: Vec<(Direction, Rank)>,
        pub sent: Vec<(LinkId, Message, u64, Duration)>,
        pub trace: Vec<TraceKind>,
    }

    impl Kernel for MockKernel {
        fn now(&self) -> u64 {
            self.now
        }

        fn schedule_self_event(&mut self, delay: Duration, event: SelfEvent) {
            self.timers.push((delay, event));
        }

        fn register_neighbor_link(
            &mut self,
            direction: Direction,
            peer: Rank,
        ) -> Result<LinkId, ConfigError> {
            self.links.push((direction, peer));
            Ok(LinkId::new(peer.as_u32(), Port::Out(direction)))
        }

        fn send_message(&mut self, link: LinkId, message: Message, byte_len: u64, delay: Duration) {
            self.sent.push((link, message, byte_len, delay));
        }

        fn record(&mut self, kind: TraceKind) {
            self.trace.push(kind);
        }
    }

    pub(crate) fn config(rank: u32, rounds: Option<u32>) -> GhostConfig {
        GhostConfig {
            rank: Rank::new(rank),
            dims: TorusDims::new(4, 4).unwrap(),
            latency_ns: 50.0,
            bandwidth: 1e9,
            compute_time_ns: 10_000.0,
            exchange_msg_len: 128,
            debug: 2,
            rounds,
        }
    }

    fn from(rank: u32) -> Delivery {
        Delivery::Message {
            link: LinkId::local(rank),
            message: Message::exchange(Rank::new(rank), 128),
        }
    }

    fn in_state(state: PatternState, kernel: &mut MockKernel) -> GhostPattern {
        let timer = match state {
            PatternState::Init => Some(SelfEvent::Start),
            PatternState::Compute => Some(SelfEvent::ComputeDone),
            _ => None,
        };
        let snapshot = Snapshot {
            config: config(5, None),
            state,
            receive_count: 0,
            round_counter: 0,
            timer: timer.map(|event| PendingTimer {
                event,
                remaining_nanos: 0,
            }),
            inbound: Vec::new(),
        };
        GhostPattern::restore(&snapshot, kernel).unwrap()
    }

    #[test]
    fn test_new_schedules_start_and_registers_links() {
        let mut kernel = MockKernel::default();
        let pattern = GhostPattern::new(config(5, None), &mut kernel).unwrap();
        assert_eq!(pattern.state(), PatternState::Init);
        assert_eq!(kernel.timers, vec![(Duration::ZERO, SelfEvent::Start)]);
        assert_eq!(
            kernel.links,
            vec![
                (Direction::Right, Rank::new(6)),
                (Direction::Left, Rank::new(4)),
                (Direction::Down, Rank::new(9)),
                (Direction::Up, Rank::new(1)),
            ]
        );
    }

    #[test]
    fn test_full_round() {
        let mut kernel = MockKernel::default();
        let mut pattern = GhostPattern::new(config(5, Some(2)), &mut kernel).unwrap();

        pattern.handle(Delivery::Timer(SelfEvent::Start), &mut kernel).unwrap();
        assert_eq!(pattern.state(), PatternState::Compute);
        assert_eq!(
            kernel.timers.last(),
            Some(&(Duration::from_micros(10), SelfEvent::ComputeDone))
        );

        kernel.now = 10_000;
        pattern
            .handle(Delivery::Timer(SelfEvent::ComputeDone), &mut kernel)
            .unwrap();
        assert_eq!(pattern.state(), PatternState::Wait);
        let order: Vec<_> = kernel
            .sent
            .iter()
            .map(|(link, _, _, _)| match link.port() {
                Port::Out(direction) => direction,
                Port::Local => panic!("exchange sent on a local link"),
            })
            .collect();
        assert_eq!(order, Direction::ALL.to_vec());
        for (_, message, bytes, delay) in &kernel.sent {
            assert_eq!(message.sender, Rank::new(5));
            assert_eq!(message.kind, MessageKind::Exchange);
            assert_eq!(*bytes, 128);
            assert_eq!(*delay, Duration::from_nanos(178));
        }

        kernel.now = 10_178;
        for sender in [9, 1, 6, 4] {
            assert_eq!(pattern.state(), PatternState::Wait);
            pattern.handle(from(sender), &mut kernel).unwrap();
        }
        assert_eq!(pattern.state(), PatternState::Compute);
        assert_eq!(pattern.round_counter(), 1);
        assert_eq!(pattern.receive_count(), 4);
    }

    #[test]
    fn test_round_limit_reaches_done() {
        let mut kernel = MockKernel::default();
        let mut pattern = GhostPattern::new(config(5, Some(1)), &mut kernel).unwrap();
        pattern.handle(Delivery::Timer(SelfEvent::Start), &mut kernel).unwrap();
        pattern
            .handle(Delivery::Timer(SelfEvent::ComputeDone), &mut kernel)
            .unwrap();
        for sender in [6, 4, 9, 1] {
            pattern.handle(from(sender), &mut kernel).unwrap();
        }
        assert_eq!(pattern.state(), PatternState::Done);
        assert_eq!(pattern.round_counter(), 1);
        let timers = kernel.timers.len();

        // late arrivals are tolerated but issue nothing
        pattern.handle(from(6), &mut kernel).unwrap();
        assert_eq!(kernel.timers.len(), timers);
        assert_eq!(kernel.trace.last(), Some(&TraceKind::Late { from: Rank::new(6) }));
    }

    #[test]
    fn test_degenerate_torus_counts_messages() {
        // on a 1x1 torus every neighbor is the rank itself
        let mut kernel = MockKernel::default();
        let mut cfg = config(0, Some(1));
        cfg.dims = TorusDims::new(1, 1).unwrap();
        let mut pattern = GhostPattern::new(cfg, &mut kernel).unwrap();
        pattern.handle(Delivery::Timer(SelfEvent::Start), &mut kernel).unwrap();
        pattern
            .handle(Delivery::Timer(SelfEvent::ComputeDone), &mut kernel)
            .unwrap();
        for _ in 0..3 {
            pattern.handle(from(0), &mut kernel).unwrap();
            assert_eq!(pattern.state(), PatternState::Wait);
        }
        pattern.handle(from(0), &mut kernel).unwrap();
        assert_eq!(pattern.state(), PatternState::Done);
    }

    #[test]
    fn test_fifth_arrival_is_a_violation() {
        let mut kernel = MockKernel::default();
        let mut pattern = in_state(PatternState::Wait, &mut kernel);
        for sender in [6, 4, 9, 1] {
            pattern.handle(from(sender), &mut kernel).unwrap();
        }
        assert_eq!(
            pattern.handle(from(6), &mut kernel),
            Err(ProtocolViolation::UnexpectedEvent {
                rank: Rank::new(5),
                state: PatternState::Compute,
                event: EventKind::Exchange,
            })
        );
    }

    #[test]
    fn test_every_state_event_pair_is_defined() {
        let remote_start = Delivery::Message {
            link: LinkId::local(6),
            message: Message {
                sender: Rank::new(6),
                kind: MessageKind::Start,
                len: 0,
            },
        };
        let deliveries = [
            Delivery::Timer(SelfEvent::Start),
            Delivery::Timer(SelfEvent::ComputeDone),
            from(6),
            remote_start,
        ];

        for state in PatternState::ALL {
            for delivery in &deliveries {
                let mut kernel = MockKernel::default();
                let mut pattern = in_state(state, &mut kernel);
                let event = EventKind::of(delivery);
                let result = pattern.handle(delivery.clone(), &mut kernel);

                let allowed = matches!(
                    (state, event),
                    (PatternState::Init, EventKind::Start)
                        | (PatternState::Compute, EventKind::ComputeTimer)
                        | (PatternState::Wait, EventKind::Exchange)
                        | (PatternState::Done, EventKind::Exchange)
                );
                if allowed {
                    assert_eq!(result, Ok(()), "{state} + {event}");
                } else {
                    assert_eq!(
                        result,
                        Err(ProtocolViolation::UnexpectedEvent {
                            rank: Rank::new(5),
                            state,
                            event,
                        }),
                        "{state} + {event}"
                    );
                }
            }

            let mut kernel = MockKernel::default();
            let mut pattern = in_state(state, &mut kernel);
            assert_eq!(
                pattern.handle(from(7), &mut kernel),
                Err(ProtocolViolation::NonNeighbor {
                    rank: Rank::new(5),
                    sender: Rank::new(7),
                    state,
                })
            );
        }
    }

    #[test]
    fn test_snapshot_tracks_remaining_timer() {
        let mut kernel = MockKernel::default();
        let mut pattern = GhostPattern::new(config(5, None), &mut kernel).unwrap();
        pattern.handle(Delivery::Timer(SelfEvent::Start), &mut kernel).unwrap();

        let snapshot = pattern.snapshot(4_000, Vec::new());
        assert_eq!(snapshot.state, PatternState::Compute);
        assert_eq!(
            snapshot.timer,
            Some(PendingTimer {
                event: SelfEvent::ComputeDone,
                remaining_nanos: 6_000,
            })
        );

        let mut other = MockKernel {
            now: 4_000,
            ..Default::default()
        };
        let restored = GhostPattern::restore(&snapshot, &mut other).unwrap();
        assert_eq!(restored.state(), PatternState::Compute);
        assert_eq!(
            other.timers,
            vec![(Duration::from_nanos(6_000), SelfEvent::ComputeDone)]
        );
        assert!(other.trace.is_empty());
        assert_eq!(restored.snapshot(4_000, Vec::new()), snapshot);
    }

    #[test]
    fn test_restore_rejects_inconsistent_snapshot() {
        let mut kernel = MockKernel::default();
        let pattern = GhostPattern::new(config(5, None), &mut kernel).unwrap();
        let mut snapshot = pattern.snapshot(0, Vec::new());
        snapshot.state = PatternState::Wait;
        assert!(matches!(
            GhostPattern::restore(&snapshot, &mut kernel),
            Err(CheckpointError::Inconsistent(_))
        ));

        snapshot.timer = None;
        snapshot.receive_count = 4;
        assert!(matches!(
            GhostPattern::restore(&snapshot, &mut kernel),
            Err(CheckpointError::Inconsistent(_))
        ));
    }
}
