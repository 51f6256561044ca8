//! Pairing: the long-lived trust channel established from a shared URI.
//!
//! The URI topic is the public rendezvous; the proposer (URI creator) holds
//! the controller role. A settled pairing admits only session-management
//! JSON-RPC, by default just the session-proposal method.

use serde::{Deserialize, Serialize};

use wcp_crypto::{PublicKey, Topic};
use wcp_rpc::methods;

use crate::error::ClientError;
use crate::event::ClientEvent;
use crate::sequence::{Engine, SequenceSpec, SettledRecord};
use crate::types::{
    AppMetadata, Notification, PairingPermissions, PairingState, Participant, ProposerInfo,
    Reason, RelayProtocol, SequenceKind,
};
use crate::uri::PairingUri;

/// Seconds a pairing proposal stays answerable.
pub const PAIRING_PROPOSAL_TTL: u64 = 30 * 60;
/// Seconds a settled pairing lives.
pub const PAIRING_SETTLED_TTL: u64 = 30 * 24 * 60 * 60;

/// Where a pairing proposal is announced: out of band, as a URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "lowercase")]
pub enum PairingSignal {
    Uri { uri: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingProposal {
    pub topic: Topic,
    pub relay: RelayProtocol,
    pub proposer: ProposerInfo,
    pub signal: PairingSignal,
    pub permissions: PairingPermissions,
    pub expiry: u64,
}

impl PairingProposal {
    /// Reconstruct the proposal a URI describes, the way the responder sees
    /// it. Permissions are the protocol defaults; the URI carries none.
    pub fn from_uri(uri: &PairingUri) -> Self {
        Self {
            topic: uri.topic,
            relay: uri.relay.clone(),
            proposer: ProposerInfo {
                public_key: uri.public_key,
                controller: uri.controller,
                metadata: None,
            },
            signal: PairingSignal::Uri { uri: uri.format() },
            permissions: PairingPermissions::default(),
            expiry: crate::types::now_unix() + PAIRING_PROPOSAL_TTL,
        }
    }

    pub fn uri(&self) -> &str {
        match &self.signal {
            PairingSignal::Uri { uri } => uri,
        }
    }
}

/// Engine inputs for a new pairing proposal.
pub struct PairingProposeParams {
    pub relay: RelayProtocol,
    pub metadata: Option<AppMetadata>,
}

pub struct PairingSequence;

pub type PairingEngine = Engine<PairingSequence>;
pub type SettledPairing = SettledRecord<PairingSequence>;

impl SequenceSpec for PairingSequence {
    type Permissions = PairingPermissions;
    type State = PairingState;
    type Update = PairingState;
    type Proposal = PairingProposal;
    type ProposeParams = PairingProposeParams;

    const KIND: SequenceKind = SequenceKind::Pairing;
    const METHODS: methods::MethodTable = methods::PAIRING;
    const PROPOSAL_TTL: u64 = PAIRING_PROPOSAL_TTL;
    const SETTLED_TTL: u64 = PAIRING_SETTLED_TTL;
    const OWNS_PROPOSAL_TOPIC: bool = true;

    fn build_proposal(
        params: &Self::ProposeParams,
        public_key: PublicKey,
        expiry: u64,
    ) -> (Topic, RelayProtocol, Self::Proposal) {
        let topic = Topic::generate();
        let uri = PairingUri::new(topic, public_key, true, params.relay.clone()).format();
        let proposal = PairingProposal {
            topic,
            relay: params.relay.clone(),
            proposer: ProposerInfo {
                public_key,
                controller: true,
                metadata: params.metadata.clone(),
            },
            signal: PairingSignal::Uri { uri },
            permissions: PairingPermissions::default(),
            expiry,
        };
        (topic, params.relay.clone(), proposal)
    }

    fn proposal_topic(proposal: &Self::Proposal) -> Topic {
        proposal.topic
    }

    fn proposal_relay(proposal: &Self::Proposal) -> RelayProtocol {
        proposal.relay.clone()
    }

    fn proposal_proposer(proposal: &Self::Proposal) -> Participant {
        proposal.proposer.participant()
    }

    fn proposal_permissions(proposal: &Self::Proposal) -> Self::Permissions {
        proposal.permissions.clone()
    }

    fn proposal_expiry(proposal: &Self::Proposal) -> u64 {
        proposal.expiry
    }

    fn validate_proposal(proposal: &Self::Proposal) -> Result<(), ClientError> {
        if proposal.permissions.jsonrpc.methods.is_empty() {
            return Err(ClientError::InvalidPermissions(
                "pairing permissions admit no methods".into(),
            ));
        }
        Ok(())
    }

    fn payload_permitted(permissions: &Self::Permissions, method: &str) -> bool {
        permissions.jsonrpc.methods.contains(method)
    }

    fn notification_permitted(
        _permissions: &Self::Permissions,
        kind: &str,
    ) -> Result<(), ClientError> {
        // Pairings carry no notifications.
        Err(ClientError::UnauthorizedNotificationType(kind.to_owned()))
    }

    fn apply_update(record: &mut SettledRecord<Self>, update: &Self::Update) {
        record.state = update.clone();
        // The update carries the controller's metadata; mirror it onto the
        // right participant on each side.
        if record.controller {
            record.self_participant.metadata = update.metadata.clone();
        } else {
            record.peer.metadata = update.metadata.clone();
        }
    }

    fn merge_permissions(permissions: &mut Self::Permissions, upgrade: &Self::Permissions) {
        permissions
            .jsonrpc
            .methods
            .extend(upgrade.jsonrpc.methods.iter().cloned());
    }

    fn proposal_event(proposal: &Self::Proposal) -> ClientEvent {
        ClientEvent::PairingProposal {
            proposal: proposal.clone(),
            uri: proposal.uri().to_owned(),
        }
    }

    fn created_event(settled: &SettledRecord<Self>) -> ClientEvent {
        ClientEvent::PairingCreated { pairing: settled.clone() }
    }

    fn updated_event(settled: &SettledRecord<Self>) -> ClientEvent {
        ClientEvent::PairingUpdated { pairing: settled.clone() }
    }

    fn deleted_event(topic: Topic, reason: Reason) -> ClientEvent {
        ClientEvent::PairingDeleted { topic, reason }
    }

    fn payload_event(
        _topic: Topic,
        _request: wcp_rpc::Request,
        _chain_id: Option<String>,
    ) -> Option<ClientEvent> {
        // Pairing payloads are internal plumbing (session proposals); the
        // facade surfaces them as session events.
        None
    }

    fn notification_event(_topic: Topic, _notification: Notification) -> Option<ClientEvent> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wcp_crypto::KeyPair;

    #[test]
    fn proposal_from_uri_mirrors_the_fields() {
        let uri = PairingUri::new(
            Topic::generate(),
            KeyPair::generate().public_key(),
            true,
            RelayProtocol::default(),
        );
        let proposal = PairingProposal::from_uri(&uri);

        assert_eq!(proposal.topic, uri.topic);
        assert_eq!(proposal.proposer.public_key, uri.public_key);
        assert!(proposal.proposer.controller);
        assert_eq!(proposal.uri(), uri.format());
        assert!(proposal.permissions.jsonrpc.methods.contains(methods::session::PROPOSE));
    }

    #[test]
    fn signal_serializes_tagged() {
        let signal = PairingSignal::Uri { uri: "wc:ab@2?x=1".into() };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "uri");
        assert_eq!(json["params"]["uri"], "wc:ab@2?x=1");
    }

    #[test]
    fn update_on_responder_side_enriches_peer() {
        let proposer = KeyPair::generate();
        let responder = KeyPair::generate();
        let key = wcp_crypto::SymmetricKey::from_bytes([4u8; 32]);
        let mut record: SettledPairing = crate::types::Settled {
            topic: Topic::from_key(&key),
            relay: RelayProtocol::default(),
            self_participant: Participant {
                public_key: responder.public_key(),
                metadata: None,
            },
            peer: Participant { public_key: proposer.public_key(), metadata: None },
            permissions: PairingPermissions::default(),
            expiry: u64::MAX,
            state: PairingState::default(),
            shared_key: key,
            controller: false,
        };

        let metadata = AppMetadata { name: "app".into(), ..Default::default() };
        PairingSequence::apply_update(
            &mut record,
            &PairingState { metadata: Some(metadata.clone()) },
        );
        assert_eq!(record.peer.metadata, Some(metadata.clone()));
        assert_eq!(record.state.metadata, Some(metadata));
        assert!(record.self_participant.metadata.is_none());
    }
}
