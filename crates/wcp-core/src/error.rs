//! Error taxonomy for client-facing operations.
//!
//! Recoverable wire-level faults (undecryptable envelopes, duplicate ids,
//! unknown methods) never surface here; they are absorbed at the dispatch
//! boundary. Everything a caller initiates resolves to `Ok` or one of these.

use wcp_crypto::Topic;
use wcp_relay::RelayError;
use wcp_rpc::ErrorObject;

use crate::types::Reason;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The relay did not acknowledge a publish or is unreachable. Retrying
    /// is appropriate.
    #[error("relay transport unavailable: {0}")]
    TransportUnavailable(String),

    /// No peer response arrived within the deadline.
    #[error("rpc request timed out")]
    RpcTimeout,

    /// Lookup against a topic with no settled record.
    #[error("no matching topic: {0}")]
    NoMatchingTopic(Topic),

    /// A second respond attempt lost the per-topic race.
    #[error("proposal has already been responded to")]
    ProposalAlreadyResponded,

    /// Method not admitted by the sequence's permissions.
    #[error("unauthorized json-rpc method: {0}")]
    UnauthorizedRpcMethod(String),

    /// Update or upgrade attempted by the non-controller side.
    #[error("unauthorized update: caller is not the controller")]
    UnauthorizedUpdate,

    /// Notification type not admitted by the session's permissions.
    #[error("unauthorized notification type: {0}")]
    UnauthorizedNotificationType(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// Proposal permissions failed local validation, e.g. an empty method
    /// set for a session.
    #[error("invalid permissions: {0}")]
    InvalidPermissions(String),

    /// A pairing proposal went unanswered or could not settle.
    #[error("pairing failed: {0}")]
    PairFailed(String),

    /// The peer rejected the proposal.
    #[error("proposal rejected: {}", .0.message)]
    Rejected(Reason),

    /// Record is past its TTL.
    #[error("record expired")]
    Expired,

    /// Persistence failed; the in-memory change was rolled back.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The peer answered with a JSON-RPC error.
    #[error("peer rpc error {}: {}", .0.code, .0.message)]
    Rpc(ErrorObject),
}

impl From<RelayError> for ClientError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::TransportUnavailable(msg) => ClientError::TransportUnavailable(msg),
            RelayError::RpcTimeout => ClientError::RpcTimeout,
            RelayError::Rpc(err) => ClientError::Rpc(err),
            RelayError::Seal => ClientError::TransportUnavailable("payload sealing failed".into()),
        }
    }
}
