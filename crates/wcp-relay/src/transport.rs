//! The transport seam the embedder provides.

use async_trait::async_trait;
use bytes::Bytes;

use wcp_crypto::Topic;
use wcp_rpc::ErrorObject;

/// Handle for an active topic subscription at the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// One message delivered by the relay. The payload is an opaque envelope;
/// the relay never sees plaintext.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub topic: Topic,
    pub message: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The relay did not acknowledge, or the connection is down.
    #[error("relay transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No matching response arrived within the deadline.
    #[error("rpc request timed out")]
    RpcTimeout,

    /// The peer answered with a JSON-RPC error.
    #[error("peer returned rpc error {}: {}", .0.code, .0.message)]
    Rpc(ErrorObject),

    /// Outbound payload could not be sealed.
    #[error("payload could not be sealed")]
    Seal,
}

/// Publish/subscribe by topic against an opaque message bus.
///
/// Implementations must resolve `publish` only once the relay has accepted
/// the message, and must preserve delivery order within a topic. No ordering
/// is required across topics.
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    async fn publish(&self, topic: Topic, message: Bytes) -> Result<(), RelayError>;

    async fn subscribe(&self, topic: Topic) -> Result<SubscriptionId, RelayError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), RelayError>;
}
