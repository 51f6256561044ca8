//! Shared protocol records: participants, permissions, settled and pending
//! sequence state. Everything here serializes to the camelCase canonical
//! JSON that goes into storage.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use wcp_crypto::{KeyPair, PublicKey, SymmetricKey, Topic};

/// Current UTC time in whole seconds. Expiries are absolute seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The two sequence kinds the client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceKind {
    Pairing,
    Session,
}

impl SequenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SequenceKind::Pairing => "pairing",
            SequenceKind::Session => "session",
        }
    }
}

/// Application self-description shared with the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppMetadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

/// One side of a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub public_key: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// Proposer description inside a proposal: the participant plus their
/// controller claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposerInfo {
    pub public_key: PublicKey,
    pub controller: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

impl ProposerInfo {
    pub fn participant(&self) -> Participant {
        Participant { public_key: self.public_key, metadata: self.metadata.clone() }
    }
}

/// Relay descriptor carried in proposals and the pairing URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayProtocol {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Default for RelayProtocol {
    fn default() -> Self {
        Self { protocol: "waku".to_owned(), params: None }
    }
}

/// Reason attached to rejects, deletes, and failure events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    pub code: i64,
    pub message: String,
}

impl Reason {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn user_rejected() -> Self {
        Self::new(5000, "User rejected")
    }

    pub fn expired() -> Self {
        Self::new(5001, "Expired")
    }

    pub fn cancelled() -> Self {
        Self::new(5002, "cancelled")
    }

    pub fn timeout() -> Self {
        Self::new(5003, "Response timeout")
    }

    pub fn user_disconnected() -> Self {
        Self::new(5900, "User disconnected")
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JsonRpcPermissions {
    pub methods: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlockchainPermissions {
    pub chains: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotificationPermissions {
    pub types: BTreeSet<String>,
}

/// What may traverse a settled pairing. Defaults to the session-proposal
/// method and nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPermissions {
    pub jsonrpc: JsonRpcPermissions,
}

impl Default for PairingPermissions {
    fn default() -> Self {
        let mut methods = BTreeSet::new();
        methods.insert(wcp_rpc::methods::session::PROPOSE.to_owned());
        Self { jsonrpc: JsonRpcPermissions { methods } }
    }
}

/// The capability set an application asks a wallet for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionPermissions {
    pub blockchain: BlockchainPermissions,
    pub jsonrpc: JsonRpcPermissions,
    pub notifications: NotificationPermissions,
}

/// Typed session notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Sequence-specific mutable state
// ---------------------------------------------------------------------------

/// Pairing state: the controller's metadata, learned via update after settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PairingState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AppMetadata>,
}

/// Session state: the accounts the wallet exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionState {
    pub accounts: Vec<String>,
}

// ---------------------------------------------------------------------------
// Settled and pending records
// ---------------------------------------------------------------------------

/// A settled sequence record, generic over the kind's permission and state
/// shapes. The shared key is persisted so subscriptions can be
/// re-established on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct Settled<P, S>
where
    P: Serialize + DeserializeOwned,
    S: Serialize + DeserializeOwned,
{
    pub topic: Topic,
    pub relay: RelayProtocol,
    #[serde(rename = "self")]
    pub self_participant: Participant,
    pub peer: Participant,
    pub permissions: P,
    pub expiry: u64,
    pub state: S,
    pub shared_key: SymmetricKey,
    /// Whether the local side holds the controller role (proposer by
    /// convention).
    pub controller: bool,
}

/// Status of a pending record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum PendingStatus {
    /// Created locally, awaiting the peer's response.
    Proposed,
    /// Peer's proposal received and answered, awaiting settle
    /// acknowledgement.
    Responded { approved: bool },
    /// Terminal.
    Failed { reason: Reason },
}

/// A pending record, keyed by its proposal topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct Pending<Prop>
where
    Prop: Serialize + DeserializeOwned,
{
    #[serde(flatten)]
    pub status: PendingStatus,
    pub topic: Topic,
    pub relay: RelayProtocol,
    pub self_keypair: KeyPair,
    pub proposal: Prop,
    pub expiry: u64,
    /// True when we authored the proposal.
    pub proposer: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_permissions_default_to_session_propose() {
        let p = PairingPermissions::default();
        assert!(p.jsonrpc.methods.contains("wc_sessionPropose"));
        assert_eq!(p.jsonrpc.methods.len(), 1);
    }

    #[test]
    fn settled_record_serializes_with_self_field() {
        let kp = KeyPair::generate();
        let peer = KeyPair::generate();
        let key = SymmetricKey::from_bytes([9u8; 32]);
        let record: Settled<SessionPermissions, SessionState> = Settled {
            topic: Topic::from_key(&key),
            relay: RelayProtocol::default(),
            self_participant: Participant { public_key: kp.public_key(), metadata: None },
            peer: Participant { public_key: peer.public_key(), metadata: None },
            permissions: SessionPermissions::default(),
            expiry: 42,
            state: SessionState { accounts: vec!["eip155:1:0xab".into()] },
            shared_key: key,
            controller: true,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("self").is_some());
        assert!(json.get("sharedKey").is_some());

        let back: Settled<SessionPermissions, SessionState> =
            serde_json::from_value(json).unwrap();
        assert_eq!(back.topic, record.topic);
        assert_eq!(back.state, record.state);
    }

    #[test]
    fn pending_status_tags_inline() {
        let json = serde_json::to_value(PendingStatus::Responded { approved: true }).unwrap();
        assert_eq!(json["status"], "responded");
        assert_eq!(json["approved"], true);
    }
}
