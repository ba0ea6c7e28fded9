//! Topic-based best-effort fan-out between agents.
//!
//! Subscribers poll a bounded per-agent inbox. Publication never blocks:
//! when a subscriber's inbox is full the event is dropped for that
//! subscriber and counted. Ordering is per-topic for a single publisher.

use crate::domain_types::{AgentId, Timestamp, TopicName};
use crate::observability::{Tracer, metrics};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// An event delivered through the bus.
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// Topic the event was published on.
    pub topic: TopicName,
    /// The publishing agent.
    pub publisher: AgentId,
    /// Opaque payload.
    pub payload: Bytes,
    /// Publication time.
    pub published_at: Timestamp,
}

/// Topic pub/sub with bounded per-subscriber inboxes.
pub struct BroadcastBus {
    subscriptions: DashMap<TopicName, HashSet<AgentId>>,
    inboxes: DashMap<AgentId, VecDeque<BroadcastEvent>>,
    capacity: usize,
    tracer: Arc<dyn Tracer>,
}

impl BroadcastBus {
    /// Creates a bus with the given per-subscriber inbox capacity.
    #[must_use]
    pub fn new(capacity: usize, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            inboxes: DashMap::new(),
            capacity,
            tracer,
        }
    }

    /// Subscribes an agent to a topic. Idempotent.
    pub fn subscribe(&self, agent: &AgentId, topic: &TopicName) {
        self.subscriptions
            .entry(topic.clone())
            .or_default()
            .insert(agent.clone());
        self.inboxes.entry(agent.clone()).or_default();
        debug!(agent = %agent, topic = %topic, "subscribed");
    }

    /// Unsubscribes an agent from a topic. Best-effort: unknown pairs are
    /// ignored.
    pub fn unsubscribe(&self, agent: &AgentId, topic: &TopicName) {
        if let Some(mut subscribers) = self.subscriptions.get_mut(topic) {
            subscribers.remove(agent);
        }
    }

    /// Publishes an event to every subscriber of the topic. Returns the
    /// number of subscribers that received it; slow subscribers with full
    /// inboxes are skipped.
    pub fn publish(&self, topic: &TopicName, publisher: &AgentId, payload: Bytes) -> usize {
        let Some(subscribers) = self.subscriptions.get(topic) else {
            return 0;
        };

        let event = BroadcastEvent {
            topic: topic.clone(),
            publisher: publisher.clone(),
            payload,
            published_at: Timestamp::now(),
        };

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            // The publisher does not receive its own events.
            if subscriber == publisher {
                continue;
            }
            let mut inbox = self.inboxes.entry(subscriber.clone()).or_default();
            if inbox.len() >= self.capacity {
                self.tracer.record_metric(metrics::BROADCAST_DROPPED, 1.0);
                continue;
            }
            inbox.push_back(event.clone());
            delivered += 1;
        }
        delivered
    }

    /// Drains and returns every event buffered for the agent, in arrival
    /// order.
    #[must_use]
    pub fn poll(&self, agent: &AgentId) -> Vec<BroadcastEvent> {
        self.inboxes
            .get_mut(agent)
            .map(|mut inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Topics the agent is currently subscribed to.
    #[must_use]
    pub fn topics_for(&self, agent: &AgentId) -> Vec<TopicName> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().contains(agent))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopTracer;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id.to_string()).unwrap()
    }

    fn topic(name: &str) -> TopicName {
        TopicName::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn test_should_fan_out_event_when_multiple_subscribers_present() {
        let bus = BroadcastBus::new(10, Arc::new(NoopTracer));
        let findings = topic("findings");
        bus.subscribe(&agent("a"), &findings);
        bus.subscribe(&agent("b"), &findings);

        let delivered = bus.publish(&findings, &agent("publisher"), Bytes::from_static(b"x"));
        assert_eq!(delivered, 2);

        assert_eq!(bus.poll(&agent("a")).len(), 1);
        assert_eq!(bus.poll(&agent("b")).len(), 1);
        // Poll drains.
        assert!(bus.poll(&agent("a")).is_empty());
    }

    #[test]
    fn test_should_skip_publisher_when_self_subscribed() {
        let bus = BroadcastBus::new(10, Arc::new(NoopTracer));
        let findings = topic("findings");
        bus.subscribe(&agent("a"), &findings);

        let delivered = bus.publish(&findings, &agent("a"), Bytes::from_static(b"echo"));
        assert_eq!(delivered, 0);
        assert!(bus.poll(&agent("a")).is_empty());
    }

    #[test]
    fn test_should_drop_events_when_subscriber_inbox_full() {
        let bus = BroadcastBus::new(2, Arc::new(NoopTracer));
        let findings = topic("findings");
        bus.subscribe(&agent("slow"), &findings);

        for n in 0..5 {
            bus.publish(
                &findings,
                &agent("publisher"),
                Bytes::from(format!("e{n}")),
            );
        }

        let events = bus.poll(&agent("slow"));
        assert_eq!(events.len(), 2);
        // The oldest two survive; later ones were dropped.
        assert_eq!(events[0].payload, Bytes::from_static(b"e0"));
        assert_eq!(events[1].payload, Bytes::from_static(b"e1"));
    }

    #[test]
    fn test_should_preserve_publisher_order_when_polled() {
        let bus = BroadcastBus::new(100, Arc::new(NoopTracer));
        let findings = topic("findings");
        bus.subscribe(&agent("a"), &findings);

        for n in 0..10 {
            bus.publish(
                &findings,
                &agent("publisher"),
                Bytes::from(format!("e{n}")),
            );
        }

        let events = bus.poll(&agent("a"));
        let payloads: Vec<_> = events.iter().map(|e| e.payload.clone()).collect();
        let expected: Vec<_> = (0..10).map(|n| Bytes::from(format!("e{n}"))).collect();
        assert_eq!(payloads, expected);
    }

    #[test]
    fn test_should_be_idempotent_when_subscribing_twice() {
        let bus = BroadcastBus::new(10, Arc::new(NoopTracer));
        let findings = topic("findings");
        bus.subscribe(&agent("a"), &findings);
        bus.subscribe(&agent("a"), &findings);

        bus.publish(&findings, &agent("publisher"), Bytes::from_static(b"once"));
        assert_eq!(bus.poll(&agent("a")).len(), 1);

        bus.unsubscribe(&agent("a"), &findings);
        bus.publish(&findings, &agent("publisher"), Bytes::from_static(b"gone"));
        assert!(bus.poll(&agent("a")).is_empty());
        // Unsubscribing an unknown pair is a no-op.
        bus.unsubscribe(&agent("ghost"), &findings);
    }
}
