//! In-process relay for tests and demos.
//!
//! A [`RelayHub`] is the bus; each endpoint gets a [`MemoryRelay`] transport
//! handle plus the receiving half of its message stream. Delivery is
//! per-topic FIFO and excludes the publisher, mirroring how a real relay
//! fans a topic out to its other subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use wcp_crypto::Topic;

use crate::transport::{RelayError, RelayMessage, RelayTransport, SubscriptionId};

struct Endpoint {
    sender: mpsc::UnboundedSender<RelayMessage>,
    // subscription id -> topic, so unsubscribe can drop exactly one interest
    subscriptions: HashMap<u64, Topic>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<u64, Endpoint>,
}

/// Shared in-memory message bus.
#[derive(Clone, Default)]
pub struct RelayHub {
    state: Arc<RwLock<HubState>>,
    next_endpoint: Arc<AtomicU64>,
    next_subscription: Arc<AtomicU64>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint; returns its transport handle and the stream of
    /// messages delivered to it.
    pub async fn endpoint(&self) -> (MemoryRelay, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        self.state.write().await.endpoints.insert(
            id,
            Endpoint { sender: tx, subscriptions: HashMap::new() },
        );
        (MemoryRelay { hub: self.clone(), endpoint_id: id }, rx)
    }
}

/// One endpoint's transport handle onto a [`RelayHub`].
#[derive(Clone)]
pub struct MemoryRelay {
    hub: RelayHub,
    endpoint_id: u64,
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn publish(&self, topic: Topic, message: Bytes) -> Result<(), RelayError> {
        let state = self.hub.state.read().await;
        for (&id, endpoint) in &state.endpoints {
            if id == self.endpoint_id {
                continue;
            }
            if endpoint.subscriptions.values().any(|t| *t == topic) {
                // A receiver that has gone away is not a publish failure.
                let _ = endpoint.sender.send(RelayMessage { topic, message: message.clone() });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<SubscriptionId, RelayError> {
        let id = self.hub.next_subscription.fetch_add(1, Ordering::Relaxed);
        let mut state = self.hub.state.write().await;
        let endpoint = state
            .endpoints
            .get_mut(&self.endpoint_id)
            .ok_or_else(|| RelayError::TransportUnavailable("endpoint detached".into()))?;
        endpoint.subscriptions.insert(id, topic);
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), RelayError> {
        let mut state = self.hub.state.write().await;
        if let Some(endpoint) = state.endpoints.get_mut(&self.endpoint_id) {
            endpoint.subscriptions.remove(&id.0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_other_subscribers_only() {
        let hub = RelayHub::new();
        let (a, mut a_rx) = hub.endpoint().await;
        let (b, mut b_rx) = hub.endpoint().await;

        let topic = Topic::generate();
        a.subscribe(topic).await.unwrap();
        b.subscribe(topic).await.unwrap();

        a.publish(topic, Bytes::from_static(b"hello")).await.unwrap();

        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.topic, topic);
        assert_eq!(got.message.as_ref(), b"hello");
        // The publisher must not hear its own message.
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = RelayHub::new();
        let (a, _a_rx) = hub.endpoint().await;
        let (b, mut b_rx) = hub.endpoint().await;

        let topic = Topic::generate();
        let sub = b.subscribe(topic).await.unwrap();
        b.unsubscribe(sub).await.unwrap();

        a.publish(topic, Bytes::from_static(b"gone")).await.unwrap();
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_topic_order_is_preserved() {
        let hub = RelayHub::new();
        let (a, _a_rx) = hub.endpoint().await;
        let (b, mut b_rx) = hub.endpoint().await;

        let topic = Topic::generate();
        b.subscribe(topic).await.unwrap();

        for i in 0..10u8 {
            a.publish(topic, Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b_rx.recv().await.unwrap().message.as_ref(), &[i]);
        }
    }
}
