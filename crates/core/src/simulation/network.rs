//! Point-to-point link transport with deterministic message delivery.
//!
//! Every link is an independent channel: a message takes exactly the delay
//! its sender computed, with no contention between links.

use std::{collections::BTreeMap, time::Duration};

use serde::Serialize;

use super::{
    kernel::{LinkId, Port},
    scheduler::{EventId, EventType, Scheduler},
};
use crate::{
    checkpoint::BufferedMessage,
    config::ConfigError,
    pattern::Message,
    topology::{Direction, Rank, RankMap},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    from: Rank,
    to: Rank,
    to_endpoint: u32,
}

/// Message in transit through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightMessage {
    pub link: LinkId,
    /// Destination endpoint.
    pub to: u32,
    /// Scheduled delivery time (virtual nanos)
    pub delivery_time: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub bytes_sent: u64,
    /// Sum of the delays of all sent messages (nanoseconds)
    pub total_latency_nanos: u64,
    /// Messages taken out by a checkpoint and scheduled again on restore.
    pub messages_reinjected: u64,
    /// Sends on links that were never registered.
    pub messages_misrouted: u64,
}

impl NetworkStats {
    /// Returns average delay per sent message.
    pub fn average_latency(&self) -> Duration {
        if self.messages_sent == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_latency_nanos / self.messages_sent)
        }
    }
}

/// Links between rank endpoints, delivering through the scheduler.
#[derive(Debug)]
pub struct Transport {
    endpoints: RankMap,
    links: BTreeMap<LinkId, Link>,
    /// BTreeMap keeps iteration deterministic.
    in_flight: BTreeMap<EventId, InFlightMessage>,
    stats: NetworkStats,
}

impl Transport {
    pub fn new(endpoints: RankMap) -> Self {
        Self {
            endpoints,
            links: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            stats: NetworkStats::default(),
        }
    }

    /// Endpoint id a rank is reachable at.
    pub fn endpoint(&self, rank: Rank) -> Result<u32, ConfigError> {
        self.endpoints
            .map(rank.as_u32())
            .ok_or(ConfigError::Unmapped(rank))
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Opens the link leaving `from` in `direction`; re-registering it is a no-op.
    pub fn register(
        &mut self,
        from: Rank,
        direction: Direction,
        peer: Rank,
    ) -> Result<LinkId, ConfigError> {
        let id = LinkId::new(self.endpoint(from)?, Port::Out(direction));
        let link = Link {
            from,
            to: peer,
            to_endpoint: self.endpoint(peer)?,
        };
        match self.links.get(&id) {
            Some(existing) if *existing != link => Err(ConfigError::InvalidMapping(format!(
                "link {id} already leads to rank {}",
                existing.to
            ))),
            Some(_) => Ok(id),
            None => {
                self.links.insert(id, link);
                Ok(id)
            }
        }
    }

    /// Schedules `message` for delivery at the far end of `link`.
    ///
    /// Returns None if the link is unknown.
    pub fn send(
        &mut self,
        scheduler: &mut Scheduler,
        link: LinkId,
        message: Message,
        byte_len: u64,
        delay: Duration,
    ) -> Option<EventId> {
        let Some(target) = self.links.get(&link).copied() else {
            tracing::error!(%link, sender = %message.sender, "Message sent on an unregistered link");
            self.stats.messages_misrouted += 1;
            return None;
        };

        let event_id = self.schedule(scheduler, link, target.to_endpoint, message, byte_len, delay);
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += byte_len;
        self.stats.total_latency_nanos += delay.as_nanos() as u64;
        tracing::trace!(
            from = %target.from,
            to = %target.to,
            ?delay,
            event_id = event_id.as_u64(),
            "Message scheduled for delivery"
        );
        Some(event_id)
    }

    /// Schedules a message that was drained by a checkpoint again.
    pub fn reinject(
        &mut self,
        scheduler: &mut Scheduler,
        to: u32,
        buffered: &BufferedMessage,
    ) -> EventId {
        self.stats.messages_reinjected += 1;
        self.schedule(
            scheduler,
            buffered.link,
            to,
            buffered.message,
            buffered.byte_len,
            Duration::from_nanos(buffered.remaining_nanos),
        )
    }

    fn schedule(
        &mut self,
        scheduler: &mut Scheduler,
        link: LinkId,
        to: u32,
        message: Message,
        byte_len: u64,
        delay: Duration,
    ) -> EventId {
        let event_id = scheduler.schedule_after(
            delay,
            EventType::MessageDelivery {
                link,
                to,
                message,
                byte_len,
            },
        );
        self.in_flight.insert(
            event_id,
            InFlightMessage {
                link,
                to,
                delivery_time: scheduler.now().saturating_add(delay.as_nanos() as u64),
            },
        );
        event_id
    }

    /// Should be called when the scheduler processes a MessageDelivery event at `now`.
    pub fn process_delivery(&mut self, event_id: EventId, now: u64) {
        let Some(message) = self.in_flight.remove(&event_id) else {
            tracing::warn!(
                event_id = event_id.as_u64(),
                "Delivered a message that was not in flight"
            );
            return;
        };
        debug_assert_eq!(
            message.delivery_time, now,
            "message on {} delivered off schedule",
            message.link
        );
        self.stats.messages_delivered += 1;
        tracing::trace!(
            link = %message.link,
            to = message.to,
            delivery_time = message.delivery_time,
            "Message delivered"
        );
    }

    /// Stops tracking messages the scheduler handed out for a checkpoint.
    pub fn forget(&mut self, event_id: EventId) -> Option<InFlightMessage> {
        self.in_flight.remove(&event_id)
    }

    /// Tracks a message that was put back into the scheduler under a new id.
    pub fn track(&mut self, event_id: EventId, message: InFlightMessage) {
        self.in_flight.insert(event_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Transport {
        Transport::new(RankMap::identity_of(4))
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut net = transport();
        let a = net.register(Rank::new(0), Direction::Right, Rank::new(1)).unwrap();
        let b = net.register(Rank::new(0), Direction::Right, Rank::new(1)).unwrap();
        assert_eq!(a, b);
        assert_eq!(net.link_count(), 1);
        assert!(net.register(Rank::new(0), Direction::Right, Rank::new(2)).is_err());
    }

    #[test]
    fn test_link_identity_ignores_registration_order() {
        let mut first = transport();
        let mut second = transport();
        let a = first.register(Rank::new(0), Direction::Right, Rank::new(1)).unwrap();
        second.register(Rank::new(3), Direction::Left, Rank::new(2)).unwrap();
        let b = second.register(Rank::new(0), Direction::Right, Rank::new(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unmapped_rank() {
        let mut net = Transport::new(RankMap::identity_of(2));
        assert_eq!(
            net.register(Rank::new(0), Direction::Down, Rank::new(3)),
            Err(ConfigError::Unmapped(Rank::new(3)))
        );
    }

    #[test]
    fn test_send_and_deliver() {
        let mut scheduler = Scheduler::new();
        let mut net = transport();
        let link = net.register(Rank::new(0), Direction::Right, Rank::new(1)).unwrap();

        let id = net
            .send(
                &mut scheduler,
                link,
                Message::exchange(Rank::new(0), 128),
                128,
                Duration::from_nanos(178),
            )
            .unwrap();
        assert_eq!(net.in_flight_count(), 1);

        let event = scheduler.step().unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.timestamp, 178);
        assert_eq!(event.event_type.destination(), 1);
        net.process_delivery(event.id, event.timestamp);
        // a second delivery of the same event is not counted again
        net.process_delivery(event.id, event.timestamp);

        assert_eq!(net.in_flight_count(), 0);
        let stats = net.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_delivered, 1);
        assert_eq!(stats.bytes_sent, 128);
        assert_eq!(stats.average_latency(), Duration::from_nanos(178));
    }

    #[test]
    fn test_unregistered_link_is_counted() {
        let mut scheduler = Scheduler::new();
        let mut net = transport();
        let bogus = LinkId::new(2, Port::Out(Direction::Up));
        assert!(net
            .send(
                &mut scheduler,
                bogus,
                Message::exchange(Rank::new(2), 8),
                8,
                Duration::ZERO
            )
            .is_none());
        assert_eq!(net.stats().messages_misrouted, 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_reinject_uses_remaining_delay() {
        let mut scheduler = Scheduler::new();
        scheduler.advance_to(1_000);
        let mut net = transport();
        let buffered = BufferedMessage {
            remaining_nanos: 78,
            link: LinkId::new(0, Port::Out(Direction::Right)),
            message: Message::exchange(Rank::new(0), 128),
            byte_len: 128,
        };
        net.reinject(&mut scheduler, 1, &buffered);
        assert_eq!(scheduler.next_event_time(), Some(1_078));
        assert_eq!(net.stats().messages_reinjected, 1);
        assert_eq!(net.stats().messages_sent, 0);
    }

    #[test]
    fn test_failed_checkpoint_requeue_keeps_schedule() {
        let mut scheduler = Scheduler::new();
        let mut net = transport();
        let link = net.register(Rank::new(2), Direction::Left, Rank::new(1)).unwrap();
        let id = net
            .send(
                &mut scheduler,
                link,
                Message::exchange(Rank::new(2), 64),
                64,
                Duration::from_nanos(114),
            )
            .unwrap();

        let drained = scheduler.drain_for(1);
        let in_flight = net.forget(id).unwrap();
        assert_eq!(in_flight.delivery_time, 114);
        assert_eq!(net.in_flight_count(), 0);

        let event = &drained[0];
        let requeued = scheduler.schedule_at(event.timestamp, event.event_type.clone());
        net.track(requeued, in_flight);
        let event = scheduler.step().unwrap();
        net.process_delivery(event.id, event.timestamp);
        assert_eq!(net.stats().messages_delivered, 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "delivered off schedule")]
    fn test_off_schedule_delivery_is_caught() {
        let mut scheduler = Scheduler::new();
        let mut net = transport();
        let link = net.register(Rank::new(0), Direction::Down, Rank::new(2)).unwrap();
        let id = net
            .send(
                &mut scheduler,
                link,
                Message::exchange(Rank::new(0), 8),
                8,
                Duration::from_nanos(58),
            )
            .unwrap();
        net.process_delivery(id, 57);
    }
}
