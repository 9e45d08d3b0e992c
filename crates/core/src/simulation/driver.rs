use std::{collections::BTreeMap, fmt, time::Duration};

use serde::Serialize;

use super::{
    kernel::{Component, Delivery, Kernel, LinkId, RankSummary, TraceKind, TraceRecord},
    network::{InFlightMessage, NetworkStats, Transport},
    rng::SimulationRng,
    scheduler::{Event, EventType, Scheduler},
};
use crate::{
    checkpoint::{BufferedMessage, CheckpointError},
    config::{BuildError, ConfigError, Params, RunConfig, GHOST_COMPONENT},
    pattern::{Message, ProtocolViolation, SelfEvent},
    registry::ComponentRegistry,
    topology::{Direction, Rank, RankMap, TorusDims},
};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("rank {0} is detached for checkpointing")]
    Detached(Rank),
    #[error("rank {0} must be checkpointed before it can be restored")]
    Attached(Rank),
    #[error("rank {0} is not part of the simulation")]
    UnknownRank(Rank),
    #[error("no rank is reachable at endpoint {0}")]
    UnknownEndpoint(u32),
    #[error("checkpoint of rank {found} cannot be restored as rank {expected}")]
    WrongRank { expected: Rank, found: Rank },
}

impl From<ConfigError> for SimError {
    fn from(err: ConfigError) -> Self {
        SimError::Build(err.into())
    }
}

/// One component to instantiate: its registered type and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    pub kind: String,
    pub params: Params,
}

impl ComponentSpec {
    pub fn new(kind: impl Into<String>, params: Params) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

/// Summary of a finished (or interrupted) run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub dims: TorusDims,
    pub end_time_ns: u64,
    pub events: u64,
    pub ranks: Vec<RankSummary>,
    pub network: NetworkStats,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "torus {} (seed {})", self.dims, self.seed)?;
        writeln!(
            f,
            "finished at {}ns after {} events",
            self.end_time_ns, self.events
        )?;
        writeln!(f, "{:>6}  {:<8} {:>6}", "rank", "state", "rounds")?;
        for rank in &self.ranks {
            writeln!(
                f,
                "{:>6}  {:<8} {:>6}",
                rank.rank.to_string(),
                rank.state.to_string(),
                rank.rounds
            )?;
        }
        write!(
            f,
            "messages: {} sent, {} delivered, {} bytes, average delay {:?}",
            self.network.messages_sent,
            self.network.messages_delivered,
            self.network.bytes_sent,
            self.network.average_latency()
        )
    }
}

struct Slot {
    kind: String,
    endpoint: u32,
    /// `None` while the rank is checkpointed and awaiting restore.
    component: Option<Box<dyn Component>>,
}

/// The kernel as seen by one rank while it handles an event.
struct RankContext<'a> {
    rank: Rank,
    endpoint: u32,
    scheduler: &'a mut Scheduler,
    transport: &'a mut Transport,
    trace: &'a mut Vec<TraceRecord>,
}

impl Kernel for RankContext<'_> {
    fn now(&self) -> u64 {
        self.scheduler.now()
    }

    fn schedule_self_event(&mut self, delay: Duration, event: SelfEvent) {
        self.scheduler.schedule_after(
            delay,
            EventType::Timer {
                endpoint: self.endpoint,
                event,
            },
        );
    }

    fn register_neighbor_link(
        &mut self,
        direction: Direction,
        peer: Rank,
    ) -> Result<LinkId, ConfigError> {
        self.transport.register(self.rank, direction, peer)
    }

    fn send_message(&mut self, link: LinkId, message: Message, byte_len: u64, delay: Duration) {
        if link.endpoint() != self.endpoint {
            tracing::warn!(rank = %self.rank, %link, "Rank is sending on a link it does not own");
        }
        self.transport
            .send(self.scheduler, link, message, byte_len, delay);
    }

    fn record(&mut self, kind: TraceKind) {
        self.trace.push(TraceRecord {
            time: self.scheduler.now(),
            rank: self.rank,
            kind,
        });
    }
}

/// Single-threaded discrete-event simulation of a torus of components.
pub struct Simulation {
    dims: TorusDims,
    rng: SimulationRng,
    scheduler: Scheduler,
    transport: Transport,
    registry: ComponentRegistry,
    slots: BTreeMap<Rank, Slot>,
    ranks_by_endpoint: BTreeMap<u32, Rank>,
    trace: Vec<TraceRecord>,
}

impl Simulation {
    /// Builds one ghost-exchange rank per torus position out of a run description.
    pub fn build(run: &RunConfig, registry: ComponentRegistry) -> Result<Self, SimError> {
        let dims = run.dims()?;
        let specs = run
            .rank_params()?
            .into_iter()
            .map(|params| ComponentSpec::new(GHOST_COMPONENT, params))
            .collect();
        Self::from_params(run.seed, dims, run.rank_map()?, specs, registry)
    }

    /// Builds a simulation with one component per spec.
    ///
    /// Specs must cover every rank of `dims` exactly once. Components are
    /// constructed in an order shuffled by `seed`.
    pub fn from_params(
        seed: u64,
        dims: TorusDims,
        endpoints: RankMap,
        specs: Vec<ComponentSpec>,
        registry: ComponentRegistry,
    ) -> Result<Self, SimError> {
        if specs.len() != dims.size() as usize {
            return Err(ConfigError::RankCountMismatch {
                dims,
                expected: dims.size(),
                actual: specs.len(),
            }
            .into());
        }

        let mut sim = Self {
            dims,
            rng: SimulationRng::new(seed),
            scheduler: Scheduler::new(),
            transport: Transport::new(endpoints),
            registry,
            slots: BTreeMap::new(),
            ranks_by_endpoint: BTreeMap::new(),
            trace: Vec::new(),
        };

        let mut placed = Vec::with_capacity(specs.len());
        for spec in specs {
            let rank = placement(&spec.params, dims)?;
            let endpoint = sim.transport.endpoint(rank)?;
            if sim.slots.contains_key(&rank) {
                return Err(ConfigError::DuplicateRank(rank).into());
            }
            if let Some(other) = sim.ranks_by_endpoint.insert(endpoint, rank) {
                return Err(ConfigError::InvalidMapping(format!(
                    "ranks {other} and {rank} share endpoint {endpoint}"
                ))
                .into());
            }
            sim.slots.insert(
                rank,
                Slot {
                    kind: spec.kind.clone(),
                    endpoint,
                    component: None,
                },
            );
            placed.push((rank, spec));
        }

        sim.rng.shuffle(&mut placed);
        for (rank, spec) in placed {
            let factory = *sim.registry.get(&spec.kind)?;
            let Self {
                scheduler,
                transport,
                slots,
                trace,
                ..
            } = &mut sim;
            let slot = slots.get_mut(&rank).ok_or(SimError::UnknownRank(rank))?;
            let mut ctx = RankContext {
                rank,
                endpoint: slot.endpoint,
                scheduler,
                transport,
                trace,
            };
            slot.component = Some((factory.build)(&spec.params, &mut ctx)?);
        }

        tracing::info!(
            %dims,
            seed,
            links = sim.transport.link_count(),
            "Simulation built"
        );
        Ok(sim)
    }

    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    pub fn dims(&self) -> TorusDims {
        self.dims
    }

    pub fn pending_events(&self) -> usize {
        self.scheduler.pending_count()
    }

    pub fn trace(&self) -> &[TraceRecord] {
        &self.trace
    }

    pub fn network_stats(&self) -> &NetworkStats {
        self.transport.stats()
    }

    /// Summaries of all attached ranks, in rank order.
    pub fn summaries(&self) -> Vec<RankSummary> {
        self.slots
            .values()
            .filter_map(|slot| slot.component.as_ref().map(|c| c.summary()))
            .collect()
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            seed: self.seed(),
            dims: self.dims,
            end_time_ns: self.now(),
            events: self.scheduler.processed_count(),
            ranks: self.summaries(),
            network: self.transport.stats().clone(),
        }
    }

    /// Delivers the next pending event. Returns `false` once nothing is left.
    ///
    /// A protocol violation invalidates the run and is returned as an error.
    /// An event addressed to a detached rank stays queued and the clock stays
    /// put, so the step can be retried once the rank is restored.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let Some(next) = self.scheduler.peek() else {
            return Ok(false);
        };
        let destination = next.event_type.destination();
        let rank = *self
            .ranks_by_endpoint
            .get(&destination)
            .ok_or(SimError::UnknownEndpoint(destination))?;
        let attached = self
            .slots
            .get(&rank)
            .ok_or(SimError::UnknownRank(rank))?
            .component
            .is_some();
        if !attached {
            tracing::warn!(
                %rank,
                time = next.timestamp,
                "Next event is addressed to a detached rank"
            );
            return Err(SimError::Detached(rank));
        }

        let Some(event) = self.scheduler.step() else {
            return Ok(false);
        };
        let delivery = match event.event_type {
            EventType::Timer { event, .. } => Delivery::Timer(event),
            EventType::MessageDelivery { link, message, .. } => {
                self.transport.process_delivery(event.id, event.timestamp);
                Delivery::Message { link, message }
            }
        };

        let Self {
            scheduler,
            transport,
            slots,
            trace,
            ..
        } = self;
        let slot = slots.get_mut(&rank).ok_or(SimError::UnknownRank(rank))?;
        let component = slot.component.as_mut().ok_or(SimError::Detached(rank))?;
        let mut ctx = RankContext {
            rank,
            endpoint: slot.endpoint,
            scheduler,
            transport,
            trace,
        };
        if let Err(violation) = component.handle_event(delivery, &mut ctx) {
            tracing::error!(%rank, time = ctx.now(), %violation, "Run invalidated");
            return Err(violation.into());
        }
        Ok(true)
    }

    /// Runs until no events are left.
    ///
    /// Ghost ranks only run out of events when a round limit is configured.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        while self.step()? {}
        tracing::info!(end_time = self.now(), "Simulation finished");
        Ok(self.report())
    }

    /// Processes every event up to and including `time`, then moves the clock there.
    pub fn run_until(&mut self, time: u64) -> Result<(), SimError> {
        while self.scheduler.next_event_time().is_some_and(|next| next <= time) {
            self.step()?;
        }
        self.scheduler.advance_to(time);
        Ok(())
    }

    /// Snapshots a rank and detaches it until [`Simulation::restore_rank`].
    ///
    /// Messages in flight towards the rank are drained into the checkpoint.
    /// The rank's own pending timers are dropped from the queue; capturing
    /// them is up to the component.
    pub fn checkpoint_rank(&mut self, rank: Rank) -> Result<Vec<u8>, SimError> {
        let now = self.scheduler.now();
        let slot = self.slots.get_mut(&rank).ok_or(SimError::UnknownRank(rank))?;
        let component = slot.component.as_ref().ok_or(SimError::Detached(rank))?;

        let drained = self.scheduler.drain_for(slot.endpoint);
        let mut tracked: Vec<(Event, Option<InFlightMessage>)> = Vec::with_capacity(drained.len());
        let mut inbound = Vec::new();
        for event in drained {
            if let EventType::MessageDelivery {
                link,
                message,
                byte_len,
                ..
            } = event.event_type
            {
                inbound.push(BufferedMessage {
                    remaining_nanos: event.timestamp.saturating_sub(now),
                    link,
                    message,
                    byte_len,
                });
            }
            let in_flight = self.transport.forget(event.id);
            tracked.push((event, in_flight));
        }

        match component.checkpoint(now, inbound) {
            Ok(blob) => {
                slot.component = None;
                tracing::debug!(%rank, bytes = blob.len(), "Rank checkpointed");
                Ok(blob)
            }
            Err(err) => {
                // put the queue back the way it was
                for (event, in_flight) in tracked {
                    let id = self.scheduler.schedule_at(event.timestamp, event.event_type);
                    if let Some(in_flight) = in_flight {
                        self.transport.track(id, in_flight);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Rebuilds a detached rank from its checkpoint and re-injects its buffered messages.
    pub fn restore_rank(&mut self, rank: Rank, blob: &[u8]) -> Result<(), SimError> {
        let Self {
            scheduler,
            transport,
            slots,
            trace,
            registry,
            ..
        } = self;
        let slot = slots.get_mut(&rank).ok_or(SimError::UnknownRank(rank))?;
        if slot.component.is_some() {
            return Err(SimError::Attached(rank));
        }
        let factory = registry.get(&slot.kind)?;

        let mut ctx = RankContext {
            rank,
            endpoint: slot.endpoint,
            scheduler: &mut *scheduler,
            transport: &mut *transport,
            trace,
        };
        let restored = (factory.restore)(blob, &mut ctx)?;
        let found = restored.component.rank();
        if found != rank {
            scheduler.cancel_timers(slot.endpoint);
            return Err(SimError::WrongRank {
                expected: rank,
                found,
            });
        }

        for message in &restored.inbound {
            transport.reinject(scheduler, slot.endpoint, message);
        }
        slot.component = Some(restored.component);
        tracing::debug!(%rank, now = scheduler.now(), "Rank restored");
        Ok(())
    }

    /// Checkpoints every attached rank, in rank order.
    pub fn checkpoint_all(&mut self) -> Result<Vec<(Rank, Vec<u8>)>, SimError> {
        let ranks: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.component.is_some())
            .map(|(rank, _)| *rank)
            .collect();
        ranks
            .into_iter()
            .map(|rank| Ok((rank, self.checkpoint_rank(rank)?)))
            .collect()
    }

    pub fn restore_all(&mut self, blobs: Vec<(Rank, Vec<u8>)>) -> Result<(), SimError> {
        for (rank, blob) in blobs {
            self.restore_rank(rank, &blob)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("dims", &self.dims)
            .field("seed", &self.rng.seed())
            .field("scheduler", &self.scheduler)
            .field("ranks", &self.slots.len())
            .finish()
    }
}

/// Rank a component is placed at, checked against the run's torus.
fn placement(params: &Params, dims: TorusDims) -> Result<Rank, ConfigError> {
    let int = |name: &'static str| -> Result<Option<i64>, ConfigError> {
        params
            .get(name)
            .map(|value| {
                value
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| ConfigError::InvalidValue {
                        name: name.to_owned(),
                        value: value.clone(),
                        reason: e.to_string(),
                    })
            })
            .transpose()
    };

    let rank = int("rank")?.ok_or(ConfigError::MissingParameter("rank"))?;
    if let (Some(x_dim), Some(y_dim)) = (int("x_dim")?, int("y_dim")?) {
        let found = TorusDims::new(x_dim, y_dim)?;
        if found != dims {
            return Err(ConfigError::InconsistentDims {
                rank: Rank::new(u32::try_from(rank).unwrap_or(u32::MAX)),
                expected: dims,
                found,
            });
        }
    }
    dims.rank(rank)
}
