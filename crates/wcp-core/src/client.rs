//! The client facade.
//!
//! Thin aggregation of the two sequence controllers plus the plumbing
//! tasks: the inbound dispatcher, the expiry sweeper, and the relay pump.
//! The only non-trivial logic here is `connect`'s pairing bootstrap and the
//! cross-wiring of session proposals that arrive through a pairing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use wcp_crypto::Topic;
use wcp_relay::{InboundRequest, RelayClient, RelayMessage, RelayTransport};
use wcp_rpc::methods::{session as session_methods, PAIRING};
use wcp_rpc::{error_codes, ErrorObject, Request, RequestId, Response};

use crate::error::ClientError;
use crate::event::{ClientEvent, EventSink};
use crate::pairing::{PairingEngine, PairingProposeParams, PairingSequence, SettledPairing};
use crate::sequence::{Engine, PayloadParams, RespondParams, SequenceContext};
use crate::session::{
    SessionEngine, SessionProposal, SessionProposeParams, SessionSequence, SettledSession,
};
use crate::store::{KvStore, MemoryKvStore, SequenceStore};
use crate::subscription::{SubscriptionRegistry, SWEEP_INTERVAL_MS};
use crate::types::{
    now_unix, AppMetadata, Notification, PairingState, Reason, RelayProtocol, SequenceKind,
    SessionPermissions, SessionState,
};
use crate::uri::PairingUri;

/// Client construction options.
pub struct ClientConfig {
    /// This application's self-description, shared with peers.
    pub metadata: AppMetadata,
    /// Relay transport implementation.
    pub transport: Arc<dyn RelayTransport>,
    /// The transport's inbound message stream.
    pub messages: mpsc::UnboundedReceiver<RelayMessage>,
    /// Persistence; in-memory when absent.
    pub storage: Option<Arc<dyn KvStore>>,
    /// Replaces the `client` context segment of storage keys.
    pub override_context: Option<String>,
    /// Deadline for awaited JSON-RPC round trips.
    pub rpc_timeout: Option<Duration>,
    /// Log filter directive (e.g. `"wcp_core=debug"`). When set, a global
    /// subscriber is installed best-effort; hosts that already installed
    /// one keep theirs.
    pub logger: Option<String>,
}

/// Input to [`Client::connect`].
pub struct ConnectParams {
    /// Reuse this settled pairing; absence means establish a new one.
    pub pairing_topic: Option<Topic>,
    pub permissions: SessionPermissions,
}

/// Input to [`Client::request`].
pub struct RequestParams {
    pub topic: Topic,
    pub method: String,
    pub params: serde_json::Value,
    pub chain_id: Option<String>,
    pub timeout: Option<Duration>,
}

pub struct Client {
    pairing: Arc<PairingEngine>,
    session: Arc<SessionEngine>,
    registry: Arc<SubscriptionRegistry>,
    events: EventSink,
    metadata: AppMetadata,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub async fn new(config: ClientConfig) -> Result<Arc<Self>, ClientError> {
        if let Some(directive) = &config.logger {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_new(directive)
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .try_init();
        }

        let timeout = config.rpc_timeout.unwrap_or(wcp_relay::client::DEFAULT_RPC_TIMEOUT);
        let (relay, inbound) = RelayClient::with_timeout(config.transport, timeout);
        let pump = relay.start(config.messages);

        let storage: Arc<dyn KvStore> = match config.storage {
            Some(storage) => storage,
            None => MemoryKvStore::new_shared(),
        };
        let store = SequenceStore::new(storage, config.override_context);
        let registry = Arc::new(SubscriptionRegistry::new());
        let events = EventSink::new();

        let ctx = SequenceContext {
            relay: Arc::clone(&relay),
            store,
            registry: Arc::clone(&registry),
            events: events.clone(),
        };
        let pairing = Engine::<PairingSequence>::new(ctx.clone());
        let session = Engine::<SessionSequence>::new(ctx);

        pairing.init().await?;
        session.init().await?;

        let dispatcher = Dispatcher {
            relay: Arc::clone(&relay),
            registry: Arc::clone(&registry),
            pairing: Arc::clone(&pairing),
            session: Arc::clone(&session),
            events: events.clone(),
        };
        let dispatch_task = tokio::spawn(dispatcher.run(inbound));
        let sweep_task = tokio::spawn(sweeper(Arc::clone(&pairing), Arc::clone(&session)));

        Ok(Arc::new(Self {
            pairing,
            session,
            registry,
            events,
            metadata: config.metadata,
            tasks: vec![pump, dispatch_task, sweep_task],
        }))
    }

    /// Lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Establish a session, bootstrapping a pairing first when none is
    /// named. Returns only after the session settles.
    pub async fn connect(&self, params: ConnectParams) -> Result<SettledSession, ClientError> {
        // Validate before any pairing work: a session with no callable
        // methods must fail fast, not after a pairing handshake.
        if params.permissions.jsonrpc.methods.is_empty() {
            return Err(ClientError::InvalidPermissions(
                "session permissions admit no methods".into(),
            ));
        }

        // Absence of a pairing topic is explicitly the new-pairing case.
        let pairing_topic = match params.pairing_topic {
            Some(topic) => {
                self.pairing.get(topic)?;
                topic
            }
            None => {
                let (_proposal, settlement) = self
                    .pairing
                    .propose(PairingProposeParams {
                        relay: RelayProtocol::default(),
                        metadata: None,
                    })
                    .await?;
                let settled: SettledPairing = settlement
                    .await
                    .map_err(|_| ClientError::PairFailed("pairing abandoned".into()))?
                    .map_err(|e| ClientError::PairFailed(e.to_string()))?;

                // Share our metadata over the fresh pairing; the peer only
                // has the URI's bare public key so far.
                if let Err(e) = self
                    .pairing
                    .update(
                        settled.topic,
                        PairingState { metadata: Some(self.metadata.clone()) },
                    )
                    .await
                {
                    warn!(error = %e, "pairing metadata share failed");
                }
                settled.topic
            }
        };

        // The requested notification types are preserved verbatim.
        let (_proposal, settlement) = self
            .session
            .propose(SessionProposeParams {
                signal_topic: pairing_topic,
                relay: RelayProtocol::default(),
                permissions: params.permissions,
                metadata: Some(self.metadata.clone()),
            })
            .await?;

        settlement.await.map_err(|_| ClientError::RpcTimeout)?
    }

    /// Respond to a pairing URI: settle the pairing it describes.
    pub async fn pair(&self, uri: &str) -> Result<SettledPairing, ClientError> {
        let parsed = PairingUri::parse(uri)?;
        let proposal = crate::pairing::PairingProposal::from_uri(&parsed);

        let settled = self
            .pairing
            .respond(RespondParams {
                approved: true,
                proposal,
                state: PairingState::default(),
                metadata: Some(self.metadata.clone()),
                reason: None,
            })
            .await
            .map_err(|e| match e {
                // A proposer that never acknowledges is a failed pair, not a
                // generic timeout.
                ClientError::RpcTimeout => {
                    ClientError::PairFailed("proposer did not acknowledge".into())
                }
                other => other,
            })?;

        settled.ok_or_else(|| ClientError::PairFailed("pairing was not approved".into()))
    }

    /// Approve a session proposal with the given state (e.g. accounts).
    pub async fn approve(
        &self,
        proposal: SessionProposal,
        state: SessionState,
    ) -> Result<SettledSession, ClientError> {
        let settled = self
            .session
            .respond(RespondParams {
                approved: true,
                proposal,
                state,
                metadata: Some(self.metadata.clone()),
                reason: None,
            })
            .await?;
        settled.ok_or(ClientError::Rejected(Reason::user_rejected()))
    }

    /// Reject a session proposal.
    pub async fn reject(
        &self,
        proposal: SessionProposal,
        reason: Option<Reason>,
    ) -> Result<(), ClientError> {
        self.session
            .respond(RespondParams {
                approved: false,
                proposal,
                state: SessionState::default(),
                metadata: None,
                reason,
            })
            .await?;
        Ok(())
    }

    /// Controller-side session state update.
    pub async fn update(
        &self,
        topic: Topic,
        state: SessionState,
    ) -> Result<SettledSession, ClientError> {
        self.session.update(topic, state).await
    }

    /// Controller-side session permission upgrade.
    pub async fn upgrade(
        &self,
        topic: Topic,
        permissions: SessionPermissions,
    ) -> Result<SettledSession, ClientError> {
        self.session.upgrade(topic, permissions).await
    }

    /// Send a typed notification over a session.
    pub async fn notify(
        &self,
        topic: Topic,
        notification: Notification,
    ) -> Result<(), ClientError> {
        self.session.notify(topic, notification).await
    }

    /// Route an application JSON-RPC request over a settled session.
    pub async fn request(&self, params: RequestParams) -> Result<serde_json::Value, ClientError> {
        self.session
            .request_payload(
                params.topic,
                &params.method,
                params.params,
                params.chain_id,
                params.timeout,
            )
            .await
    }

    /// Answer a previously delivered session payload.
    pub async fn respond(&self, topic: Topic, response: Response) -> Result<(), ClientError> {
        self.session.respond_rpc(topic, response).await
    }

    /// Liveness probe; resolves the sequence kind from the topic.
    pub async fn ping(&self, topic: Topic) -> Result<(), ClientError> {
        if self.session.get(topic).is_ok() {
            self.session.ping(topic).await
        } else if self.pairing.get(topic).is_ok() {
            self.pairing.ping(topic).await
        } else {
            Err(ClientError::NoMatchingTopic(topic))
        }
    }

    /// Tear down the sequence on `topic`. Idempotent.
    pub async fn disconnect(
        &self,
        topic: Topic,
        reason: Option<Reason>,
    ) -> Result<(), ClientError> {
        let reason = reason.unwrap_or_else(Reason::user_disconnected);
        if self.session.get(topic).is_ok() {
            self.session.delete(topic, reason).await
        } else {
            self.pairing.delete(topic, reason).await
        }
    }

    pub fn session_of(&self, topic: Topic) -> Result<SettledSession, ClientError> {
        self.session.get(topic)
    }

    pub fn pairing_of(&self, topic: Topic) -> Result<SettledPairing, ClientError> {
        self.pairing.get(topic)
    }

    pub fn session_topics(&self) -> Vec<Topic> {
        self.session.settled_topics()
    }

    pub fn pairing_topics(&self) -> Vec<Topic> {
        self.pairing.settled_topics()
    }

    pub fn metadata(&self) -> &AppMetadata {
        &self.metadata
    }

    /// Active subscription count, for diagnostics.
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn sweeper(pairing: Arc<PairingEngine>, session: Arc<SessionEngine>) {
    let mut interval = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = now_unix();
        pairing.sweep(now).await;
        session.sweep(now).await;
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

struct Dispatcher {
    relay: Arc<RelayClient>,
    registry: Arc<SubscriptionRegistry>,
    pairing: Arc<PairingEngine>,
    session: Arc<SessionEngine>,
    events: EventSink,
}

impl Dispatcher {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<InboundRequest>) {
        while let Some(InboundRequest { topic, request }) = inbound.recv().await {
            self.dispatch(topic, request).await;
        }
    }

    async fn dispatch(&self, topic: Topic, mut request: Request) {
        let Some(kind) = self.registry.kind_of(&topic) else {
            debug!(topic = %topic, method = %request.method, "request on unregistered topic, dropping");
            return;
        };

        match kind {
            SequenceKind::Session => self.session.handle_inbound(topic, request).await,
            SequenceKind::Pairing => {
                // A pairing payload is a wrapper; unwrap once and treat the
                // inner request as if it had arrived bare, under the outer
                // request's id.
                if request.method == PAIRING.payload {
                    match serde_json::from_value::<PayloadParams>(request.params.clone()) {
                        Ok(wrapped) => {
                            let method = wrapped
                                .request
                                .get("method")
                                .and_then(|m| m.as_str())
                                .unwrap_or_default()
                                .to_owned();
                            request = Request {
                                jsonrpc: request.jsonrpc,
                                id: request.id,
                                method,
                                params: wrapped
                                    .request
                                    .get("params")
                                    .cloned()
                                    .unwrap_or_default(),
                            };
                        }
                        Err(e) => {
                            self.nack(
                                topic,
                                request.id,
                                ErrorObject {
                                    code: error_codes::INVALID_PARAMS,
                                    message: e.to_string(),
                                },
                            )
                            .await;
                            return;
                        }
                    }
                }

                let method = request.method.clone();
                if method == session_methods::APPROVE || method == session_methods::REJECT {
                    // Session handshake traffic rides the pairing topic.
                    self.session.handle_inbound(topic, request).await;
                } else if method == session_methods::PROPOSE {
                    self.on_session_proposal(topic, request).await;
                } else if PAIRING.is_control(&method) {
                    self.pairing.handle_inbound(topic, request).await;
                } else {
                    // Not admitted through a pairing; wire-level rejection,
                    // no state change, no event.
                    self.nack(topic, request.id, ErrorObject::method_not_found(&method)).await;
                }
            }
        }
    }

    /// Cross-wiring: a session proposal arriving through a pairing is
    /// surfaced as `session.proposal` so the holder may approve or reject.
    async fn on_session_proposal(&self, topic: Topic, request: Request) {
        let permitted = self
            .pairing
            .get(topic)
            .map(|rec| rec.permissions.jsonrpc.methods.contains(session_methods::PROPOSE))
            .unwrap_or(false);
        if !permitted {
            self.nack(
                topic,
                request.id,
                ErrorObject::method_not_found(session_methods::PROPOSE),
            )
            .await;
            return;
        }

        match serde_json::from_value::<SessionProposal>(request.params.clone()) {
            Ok(proposal) => {
                if proposal.topic != topic {
                    self.nack(
                        topic,
                        request.id,
                        ErrorObject {
                            code: error_codes::INVALID_REQUEST,
                            message: "proposal topic does not match the pairing".into(),
                        },
                    )
                    .await;
                    return;
                }
                self.ack(topic, request.id).await;
                self.events.emit(ClientEvent::SessionProposal { proposal });
            }
            Err(e) => {
                self.nack(
                    topic,
                    request.id,
                    ErrorObject { code: error_codes::INVALID_PARAMS, message: e.to_string() },
                )
                .await;
            }
        }
    }

    async fn ack(&self, topic: Topic, id: RequestId) {
        let key = self.relay.key_for(&topic);
        if let Err(e) = self
            .relay
            .respond(topic, Response::ok(id, serde_json::json!(true)), key.as_ref())
            .await
        {
            warn!(topic = %topic, error = %e, "ack failed");
        }
    }

    async fn nack(&self, topic: Topic, id: RequestId, error: ErrorObject) {
        let key = self.relay.key_for(&topic);
        if let Err(e) = self.relay.respond(topic, Response::err(id, error), key.as_ref()).await {
            warn!(topic = %topic, error = %e, "error response failed");
        }
    }
}
