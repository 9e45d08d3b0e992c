//! Deterministic event scheduler for simulation.
//!
//! The scheduler processes events in a deterministic order based on:
//! 1. Event timestamp (earlier first)
//! 2. Destination endpoint (for same timestamp)
//! 3. Link the event travels on, self events first
//! 4. Event ID (for complete tie-breaking)

use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

use super::{kernel::LinkId, time::VirtualTime};
use crate::pattern::{Message, SelfEvent};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Types of events that can be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// A self-scheduled timer of an endpoint.
    Timer { endpoint: u32, event: SelfEvent },
    /// A message arriving over a link.
    MessageDelivery {
        link: LinkId,
        to: u32,
        message: Message,
        byte_len: u64,
    },
}

impl EventType {
    /// Endpoint the event is delivered to.
    pub fn destination(&self) -> u32 {
        match self {
            EventType::Timer { endpoint, .. } => *endpoint,
            EventType::MessageDelivery { to, .. } => *to,
        }
    }

    pub fn link(&self) -> LinkId {
        match self {
            EventType::Timer { endpoint, .. } => LinkId::local(*endpoint),
            EventType::MessageDelivery { link, .. } => *link,
        }
    }
}

/// A scheduled event in the simulation.
#[derive(Debug, Clone)]
pub struct Event {
    /// When this event should be processed (virtual nanos)
    pub timestamp: u64,
    /// Unique identifier for ordering ties
    pub id: EventId,
    pub event_type: EventType,
}

impl Event {
    fn key(&self) -> (u64, u32, LinkId, EventId) {
        (
            self.timestamp,
            self.event_type.destination(),
            self.event_type.link(),
            self.id,
        )
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse ordering so the smallest key comes first
        other.key().cmp(&self.key())
    }
}

/// Deterministic event scheduler for simulation.
///
/// Processes events in timestamp order with deterministic tie-breaking.
pub struct Scheduler {
    time: VirtualTime,
    pending_events: BinaryHeap<Event>,
    next_event_id: u64,
    processed: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            time: VirtualTime::new(),
            pending_events: BinaryHeap::new(),
            next_event_id: 0,
            processed: 0,
        }
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.time.now_nanos()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_events.len()
    }

    /// Number of events handed out by [`Scheduler::step`] so far.
    pub fn processed_count(&self) -> u64 {
        self.processed
    }

    /// Schedules an event at the given absolute timestamp.
    pub fn schedule_at(&mut self, timestamp: u64, event_type: EventType) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.pending_events.push(Event {
            timestamp,
            id,
            event_type,
        });
        id
    }

    /// Schedules an event after the given delay from now.
    pub fn schedule_after(&mut self, delay: Duration, event_type: EventType) -> EventId {
        let timestamp = self.now().saturating_add(delay.as_nanos() as u64);
        self.schedule_at(timestamp, event_type)
    }

    /// Returns the timestamp of the next pending event, if any.
    pub fn next_event_time(&self) -> Option<u64> {
        self.peek().map(|e| e.timestamp)
    }

    /// The event [`Scheduler::step`] would hand out next, left in the queue.
    pub fn peek(&self) -> Option<&Event> {
        self.pending_events.peek()
    }

    /// Pops the next pending event, advancing time to its timestamp.
    pub fn step(&mut self) -> Option<Event> {
        let event = self.pending_events.pop()?;
        self.time.advance_to(event.timestamp);
        self.processed += 1;
        tracing::trace!(
            timestamp = event.timestamp,
            id = event.id.0,
            ?event.event_type,
            "Processing event"
        );
        Some(event)
    }

    /// Moves time forward to `target` without processing anything.
    ///
    /// Time never moves past a pending event.
    pub fn advance_to(&mut self, target: u64) {
        let target = self.next_event_time().map_or(target, |next| next.min(target));
        self.time.advance_to(target);
    }

    /// Removes every pending event addressed to `endpoint`, in the order they
    /// would have been processed.
    pub fn drain_for(&mut self, endpoint: u32) -> Vec<Event> {
        let (mut drained, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_events)
            .into_vec()
            .into_iter()
            .partition(|e| e.event_type.destination() == endpoint);
        self.pending_events = BinaryHeap::from(kept);
        // reversed Ord: the greatest event is the earliest
        drained.sort_by(|a, b| b.cmp(a));
        drained
    }

    /// Drops the pending timers of `endpoint`, returning how many there were.
    pub fn cancel_timers(&mut self, endpoint: u32) -> usize {
        let mut events = std::mem::take(&mut self.pending_events).into_vec();
        let original_len = events.len();
        events.retain(|e| {
            !matches!(e.event_type, EventType::Timer { endpoint: target, .. } if target == endpoint)
        });
        let cancelled = original_len - events.len();
        self.pending_events = BinaryHeap::from(events);
        cancelled
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now())
            .field("pending_count", &self.pending_count())
            .field("processed", &self.processed)
            .finish()
    }
}
