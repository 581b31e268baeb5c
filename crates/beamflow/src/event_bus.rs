//! In-process event bus (spec.md §2 item 2, §6, §9)
//!
//! A topic-keyed concurrent map of subscriber lists. Delivery is
//! best-effort and fire-and-forget: publishing snapshots the subscriber
//! list under the map's lock, then sends outside of it, so a slow or
//! dropped subscriber never blocks the publisher (spec.md §9: "publishing
//! iterates a snapshot to avoid holding locks across callbacks").

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

/// A message delivered to a topic subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

/// Well-known topic name helpers (spec.md §6).
pub fn workflow_topic(workflow_id: &str) -> String {
    format!("workflows:{workflow_id}")
}

pub const ALL_WORKFLOWS_TOPIC: &str = "workflows:*";
pub const CHAOS_EVENTS_TOPIC: &str = "chaos:events";
pub const DLQ_UPDATES_TOPIC: &str = "dlq:updates";

/// Topic-keyed concurrent map of subscriber channels.
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic`, returning a receiver for future publishes.
    pub fn subscribe(&self, topic: impl Into<String>) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(topic.into()).or_default().push(tx);
        rx
    }

    /// Publish to `topic` and, always, to the all-workflows firehose when
    /// `topic` starts with `workflows:` and isn't the firehose itself.
    /// Failed sends (dropped receivers) are swallowed — bus delivery is
    /// best-effort per spec.md §7.
    pub fn publish(&self, topic: &str, payload: Value) {
        self.publish_one(topic, payload.clone());
        if topic.starts_with("workflows:") && topic != ALL_WORKFLOWS_TOPIC {
            self.publish_one(ALL_WORKFLOWS_TOPIC, payload);
        }
    }

    fn publish_one(&self, topic: &str, payload: Value) {
        let Some(senders) = self.subscribers.get(topic) else {
            return;
        };
        // Snapshot under the entry lock, then send without holding it.
        let snapshot: Vec<_> = senders.clone();
        drop(senders);
        for tx in snapshot {
            let _ = tx.send(BusMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_topic_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(workflow_topic("wf-1"));
        bus.publish(&workflow_topic("wf-1"), serde_json::json!({"x": 1}));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "workflows:wf-1");
        assert_eq!(msg.payload, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn publish_also_reaches_firehose() {
        let bus = EventBus::new();
        let mut firehose = bus.subscribe(ALL_WORKFLOWS_TOPIC);
        bus.publish(&workflow_topic("wf-2"), serde_json::json!(null));

        let msg = firehose.recv().await.unwrap();
        assert_eq!(msg.topic, "workflows:wf-2");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish("dlq:updates", serde_json::json!(null));
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_publish() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe("chaos:events");
        } // receiver dropped
        bus.publish("chaos:events", serde_json::json!(null));
    }
}
