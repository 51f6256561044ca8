//! Typed lifecycle events.
//!
//! Controllers publish onto one broadcast channel; the facade hands out
//! receivers. Event names are stable wire-facing identifiers.

use tokio::sync::broadcast;

use wcp_crypto::Topic;
use wcp_rpc::Request;

use crate::pairing::{PairingProposal, SettledPairing};
use crate::session::{SessionProposal, SettledSession};
use crate::types::{Notification, Reason};

/// Capacity of the client event channel. Slow subscribers lag rather than
/// block the protocol.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    PairingProposal { proposal: PairingProposal, uri: String },
    PairingCreated { pairing: SettledPairing },
    PairingUpdated { pairing: SettledPairing },
    PairingDeleted { topic: Topic, reason: Reason },

    SessionProposal { proposal: SessionProposal },
    SessionCreated { session: SettledSession },
    SessionUpdated { session: SettledSession },
    SessionDeleted { topic: Topic, reason: Reason },
    SessionPayload { topic: Topic, request: Request, chain_id: Option<String> },
    SessionNotification { topic: Topic, notification: Notification },
}

impl ClientEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::PairingProposal { .. } => "pairing.proposal",
            ClientEvent::PairingCreated { .. } => "pairing.created",
            ClientEvent::PairingUpdated { .. } => "pairing.updated",
            ClientEvent::PairingDeleted { .. } => "pairing.deleted",
            ClientEvent::SessionProposal { .. } => "session.proposal",
            ClientEvent::SessionCreated { .. } => "session.created",
            ClientEvent::SessionUpdated { .. } => "session.updated",
            ClientEvent::SessionDeleted { .. } => "session.deleted",
            ClientEvent::SessionPayload { .. } => "session.payload",
            ClientEvent::SessionNotification { .. } => "session.notification",
        }
    }
}

/// Shared event sink handed to both controllers.
#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<ClientEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Emit; nobody listening is not an error.
    pub fn emit(&self, event: ClientEvent) {
        tracing::debug!(event = event.name(), "emitting");
        let _ = self.sender.send(event);
    }
}
