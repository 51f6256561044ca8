//! Session: the authorization context created over a settled pairing.
//!
//! A session proposal is signalled through its parent pairing and scoped by
//! permissions: blockchain chains, JSON-RPC methods, and notification
//! types. The proposer holds the controller role. Settled sessions carry
//! arbitrary application JSON-RPC bidirectionally.

use serde::{Deserialize, Serialize};

use wcp_crypto::{PublicKey, Topic};
use wcp_rpc::methods;

use crate::error::ClientError;
use crate::event::ClientEvent;
use crate::sequence::{Engine, SequenceSpec, SettledRecord};
use crate::types::{
    AppMetadata, Notification, Participant, ProposerInfo, Reason, RelayProtocol, SequenceKind,
    SessionPermissions, SessionState,
};

/// Seconds a session proposal stays answerable.
pub const SESSION_PROPOSAL_TTL: u64 = 300;
/// Seconds a settled session lives.
pub const SESSION_SETTLED_TTL: u64 = 7 * 24 * 60 * 60;

/// Where a session proposal is announced: over a settled pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "lowercase")]
pub enum SessionSignal {
    Pairing { topic: Topic },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposal {
    /// The parent pairing's settled topic; the proposal travels on it.
    pub topic: Topic,
    pub relay: RelayProtocol,
    pub proposer: ProposerInfo,
    pub signal: SessionSignal,
    pub permissions: SessionPermissions,
    pub expiry: u64,
}

/// Engine inputs for a new session proposal.
pub struct SessionProposeParams {
    /// Settled pairing the proposal is signalled through.
    pub signal_topic: Topic,
    pub relay: RelayProtocol,
    pub permissions: SessionPermissions,
    pub metadata: Option<AppMetadata>,
}

pub struct SessionSequence;

pub type SessionEngine = Engine<SessionSequence>;
pub type SettledSession = SettledRecord<SessionSequence>;

impl SequenceSpec for SessionSequence {
    type Permissions = SessionPermissions;
    type State = SessionState;
    type Update = SessionState;
    type Proposal = SessionProposal;
    type ProposeParams = SessionProposeParams;

    const KIND: SequenceKind = SequenceKind::Session;
    const METHODS: methods::MethodTable = methods::SESSION;
    const PROPOSAL_TTL: u64 = SESSION_PROPOSAL_TTL;
    const SETTLED_TTL: u64 = SESSION_SETTLED_TTL;
    // The parent pairing already holds the proposal topic's subscription.
    const OWNS_PROPOSAL_TOPIC: bool = false;

    fn build_proposal(
        params: &Self::ProposeParams,
        public_key: PublicKey,
        expiry: u64,
    ) -> (Topic, RelayProtocol, Self::Proposal) {
        let proposal = SessionProposal {
            topic: params.signal_topic,
            relay: params.relay.clone(),
            proposer: ProposerInfo {
                public_key,
                controller: true,
                metadata: params.metadata.clone(),
            },
            signal: SessionSignal::Pairing { topic: params.signal_topic },
            permissions: params.permissions.clone(),
            expiry,
        };
        (params.signal_topic, params.relay.clone(), proposal)
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
                "session permissions admit no methods".into(),
            ));
        }
        let SessionSignal::Pairing { topic } = &proposal.signal;
        if *topic != proposal.topic {
            return Err(ClientError::InvalidPermissions(
                "session signal does not match the proposal topic".into(),
            ));
        }
        Ok(())
    }

    fn payload_permitted(permissions: &Self::Permissions, method: &str) -> bool {
        permissions.jsonrpc.methods.contains(method)
    }

    fn notification_permitted(
        permissions: &Self::Permissions,
        kind: &str,
    ) -> Result<(), ClientError> {
        if permissions.notifications.types.contains(kind) {
            Ok(())
        } else {
            Err(ClientError::UnauthorizedNotificationType(kind.to_owned()))
        }
    }

    fn apply_update(record: &mut SettledRecord<Self>, update: &Self::Update) {
        record.state = update.clone();
    }

    fn merge_permissions(permissions: &mut Self::Permissions, upgrade: &Self::Permissions) {
        permissions
            .blockchain
            .chains
            .extend(upgrade.blockchain.chains.iter().cloned());
        permissions
            .jsonrpc
            .methods
            .extend(upgrade.jsonrpc.methods.iter().cloned());
        permissions
            .notifications
            .types
            .extend(upgrade.notifications.types.iter().cloned());
    }

    fn proposal_event(proposal: &Self::Proposal) -> ClientEvent {
        ClientEvent::SessionProposal { proposal: proposal.clone() }
    }

    fn created_event(settled: &SettledRecord<Self>) -> ClientEvent {
        ClientEvent::SessionCreated { session: settled.clone() }
    }

    fn updated_event(settled: &SettledRecord<Self>) -> ClientEvent {
        ClientEvent::SessionUpdated { session: settled.clone() }
    }

    fn deleted_event(topic: Topic, reason: Reason) -> ClientEvent {
        ClientEvent::SessionDeleted { topic, reason }
    }

    fn payload_event(
        topic: Topic,
        request: wcp_rpc::Request,
        chain_id: Option<String>,
    ) -> Option<ClientEvent> {
        Some(ClientEvent::SessionPayload { topic, request, chain_id })
    }

    fn notification_event(topic: Topic, notification: Notification) -> Option<ClientEvent> {
        Some(ClientEvent::SessionNotification { topic, notification })
    }
}
