//! Encrypting pub/sub client over a [`RelayTransport`].
//!
//! The client owns three pieces of bookkeeping the protocol core relies on:
//! the topic -> decryption key map for inbound traffic, the outstanding
//! request-id -> waker map for response correlation, and the per-topic
//! duplicate-id window. A hostile or flaky relay can at worst make us drop a
//! message; nothing that arrives on the wire can error past this module.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use wcp_crypto::{envelope, SymmetricKey, Topic};
use wcp_rpc::{Payload, Request, RequestId, Response};

use crate::dedup::DedupWindow;
use crate::transport::{RelayError, RelayMessage, RelayTransport, SubscriptionId};

/// Default deadline for awaited JSON-RPC round trips.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// A decrypted inbound JSON-RPC request, handed to the protocol core.
#[derive(Debug)]
pub struct InboundRequest {
    pub topic: Topic,
    pub request: Request,
}

struct SubscriptionEntry {
    id: SubscriptionId,
    key: Option<SymmetricKey>,
}

pub struct RelayClient {
    transport: Arc<dyn RelayTransport>,
    subscriptions: DashMap<Topic, SubscriptionEntry>,
    pending: DashMap<RequestId, oneshot::Sender<Response>>,
    dedup: DashMap<Topic, DedupWindow>,
    inbound_tx: mpsc::UnboundedSender<InboundRequest>,
    rpc_timeout: Duration,
}

impl RelayClient {
    /// Wrap a transport. Returns the client and the stream of inbound
    /// requests the caller must drain.
    pub fn new(
        transport: Arc<dyn RelayTransport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundRequest>) {
        Self::with_timeout(transport, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(
        transport: Arc<dyn RelayTransport>,
        rpc_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundRequest>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            transport,
            subscriptions: DashMap::new(),
            pending: DashMap::new(),
            dedup: DashMap::new(),
            inbound_tx,
            rpc_timeout,
        });
        (client, inbound_rx)
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Spawn the inbound pump over the transport's message stream.
    pub fn start(
        self: &Arc<Self>,
        mut messages: mpsc::UnboundedReceiver<RelayMessage>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                client.handle_message(msg);
            }
        })
    }

    /// Register interest in a topic, remembering the key inbound envelopes
    /// on it decrypt under (`None` for pre-settle proposal topics).
    pub async fn subscribe(
        &self,
        topic: Topic,
        key: Option<SymmetricKey>,
    ) -> Result<SubscriptionId, RelayError> {
        let id = self.transport.subscribe(topic).await?;
        self.subscriptions.insert(topic, SubscriptionEntry { id, key });
        Ok(id)
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.subscriptions.contains_key(topic)
    }

    /// The key a topic's subscription decrypts under, if any. Outbound
    /// traffic on a subscribed topic seals under the same key.
    pub fn key_for(&self, topic: &Topic) -> Option<SymmetricKey> {
        self.subscriptions.get(topic).and_then(|e| e.key.clone())
    }

    pub async fn unsubscribe(&self, topic: Topic) -> Result<(), RelayError> {
        if let Some((_, entry)) = self.subscriptions.remove(&topic) {
            self.transport.unsubscribe(entry.id).await?;
        }
        self.dedup.remove(&topic);
        Ok(())
    }

    /// Serialize and publish a payload, sealing when a key is supplied.
    pub async fn publish(
        &self,
        topic: Topic,
        payload: &Payload,
        key: Option<&SymmetricKey>,
    ) -> Result<(), RelayError> {
        let plaintext = payload.to_json();
        let framed = match key {
            Some(key) => envelope::seal(key, &plaintext).map_err(|_| RelayError::Seal)?,
            None => envelope::seal_plain(&plaintext),
        };
        self.transport.publish(topic, framed.into()).await
    }

    /// Publish a request and await the matching response by id.
    ///
    /// Exactly one waker exists per outstanding id; it is dropped on
    /// timeout, on publish failure, and on resolution.
    pub async fn request(
        &self,
        topic: Topic,
        request: Request,
        key: Option<&SymmetricKey>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RelayError> {
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.publish(topic, &Payload::Request(request), key).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let deadline = timeout.unwrap_or(self.rpc_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => response.into_result().map_err(RelayError::Rpc),
            Ok(Err(_)) => Err(RelayError::TransportUnavailable("relay client stopped".into())),
            Err(_) => {
                self.pending.remove(&id);
                Err(RelayError::RpcTimeout)
            }
        }
    }

    /// Publish a response for a previously delivered inbound request.
    pub async fn respond(
        &self,
        topic: Topic,
        response: Response,
        key: Option<&SymmetricKey>,
    ) -> Result<(), RelayError> {
        self.publish(topic, &Payload::Response(response), key).await
    }

    fn handle_message(&self, msg: RelayMessage) {
        let Some(entry) = self.subscriptions.get(&msg.topic) else {
            debug!(topic = %msg.topic, "message on unknown topic, dropping");
            return;
        };

        let plaintext = match envelope::open(entry.key.as_ref(), &msg.message) {
            Ok(pt) => pt,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "undecryptable envelope, dropping");
                return;
            }
        };
        drop(entry);

        let payload = match Payload::from_json(&plaintext) {
            Ok(p) => p,
            Err(e) => {
                warn!(topic = %msg.topic, error = %e, "malformed payload, dropping");
                return;
            }
        };

        match payload {
            Payload::Response(response) => {
                match self.pending.remove(&response.id()) {
                    Some((_, waker)) => {
                        let _ = waker.send(response);
                    }
                    None => {
                        debug!(id = %response.id(), "unsolicited response, dropping");
                    }
                }
            }
            Payload::Request(request) => {
                let fresh = self
                    .dedup
                    .entry(msg.topic)
                    .or_default()
                    .insert(request.id);
                if !fresh {
                    debug!(id = %request.id, topic = %msg.topic, "duplicate request id, ignoring");
                    return;
                }
                let _ = self.inbound_tx.send(InboundRequest { topic: msg.topic, request });
            }
        }
    }
}
