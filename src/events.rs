//! In-process publish/subscribe event bus.
//!
//! A single broadcast channel with a bounded per-subscriber buffer
//! (capacity 1000). Delivery is best-effort and ordered per subscriber;
//! within one ingestion, `node_added` events precede the `edges_added`
//! summary that references those nodes. A subscriber that falls behind
//! loses the oldest events and observes the gap as a `dropped` marker in
//! the stream layer.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

/// Default bound on each subscriber's buffered backlog.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GraphEvent {
    NodeAdded {
        id: String,
        label: String,
        name: String,
        namespace: String,
    },
    EdgesAdded {
        count: u64,
        doc_id: String,
        namespace: String,
    },
    IndexRunCompleted {
        run_id: String,
        status: String,
        namespace: String,
    },
}

impl GraphEvent {
    /// Topic name, also used as the SSE event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeAdded { .. } => "node_added",
            Self::EdgesAdded { .. } => "edges_added",
            Self::IndexRunCompleted { .. } => "index_run_completed",
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::NodeAdded { namespace, .. }
            | Self::EdgesAdded { namespace, .. }
            | Self::IndexRunCompleted { namespace, .. } => namespace,
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<GraphEvent>,
    subscribers: AtomicUsize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            subscribers: AtomicUsize::new(0),
        }
    }

    /// Publish an event to all current subscribers. Publishing with no
    /// subscribers is a no-op, not an error.
    pub fn publish(&self, event: GraphEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
        self.tx.subscribe()
    }

    /// Called by stream handlers when a subscriber disconnects.
    pub fn unsubscribe(&self) {
        self.subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_added(id: &str) -> GraphEvent {
        GraphEvent::NodeAdded {
            id: id.to_string(),
            label: "Entity".to_string(),
            name: id.to_string(),
            namespace: "public".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(node_added("a"));
        bus.publish(GraphEvent::EdgesAdded {
            count: 3,
            doc_id: "d1".to_string(),
            namespace: "public".to_string(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "node_added");
        assert_eq!(second.kind(), "edges_added");
    }

    #[tokio::test]
    async fn test_lagged_subscriber_sees_gap() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.publish(node_added(&format!("n{}", i)));
        }
        // The first recv reports how many events were dropped.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 6),
            other => panic!("expected Lagged, got {:?}", other),
        }
        // Subsequent receives resume with the newest retained events.
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(node_added("solo"));
    }
}
