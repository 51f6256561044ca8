//! The generic sequence engine.
//!
//! One state machine drives both pairings and sessions through the
//! proposal -> pending -> settled -> updated -> deleted lifecycle. The two
//! kinds differ only in constants and validation hooks, captured by
//! [`SequenceSpec`]; the engine is instantiated once per kind.
//!
//! Concurrency discipline: every state-mutating path takes the per-topic
//! lock first, so the per-topic state machine is serialisable while distinct
//! topics proceed in parallel. `respond` holds its proposal-topic lock
//! across the peer round trip, which is what makes a double-response race
//! resolvable: the loser fails fast instead of double-settling.

use std::fmt::Debug;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use wcp_crypto::{derive_symmetric, KeyPair, Topic};
use wcp_relay::RelayClient;
use wcp_rpc::methods::MethodTable;
use wcp_rpc::{error_codes, ErrorObject, Request, RequestId, Response};

use crate::error::ClientError;
use crate::event::{ClientEvent, EventSink};
use crate::store::{SequenceStore, Table};
use crate::subscription::SubscriptionRegistry;
use crate::types::{
    now_unix, Notification, Participant, Pending, PendingStatus, Reason, RelayProtocol,
    SequenceKind, Settled,
};

/// Everything a controller needs from its surroundings, passed in at
/// construction. Controllers never reach back into the facade.
#[derive(Clone)]
pub struct SequenceContext {
    pub relay: Arc<RelayClient>,
    pub store: SequenceStore,
    pub registry: Arc<SubscriptionRegistry>,
    pub events: EventSink,
}

/// Settled record shape for a sequence kind.
pub type SettledRecord<S> =
    Settled<<S as SequenceSpec>::Permissions, <S as SequenceSpec>::State>;

/// Pending record shape for a sequence kind.
pub type PendingRecord<S> = Pending<<S as SequenceSpec>::Proposal>;

/// Constants and hooks distinguishing pairing from session.
pub trait SequenceSpec: Sized + Send + Sync + 'static {
    type Permissions: Clone + Debug + Serialize + DeserializeOwned + Send + Sync;
    type State: Clone + Debug + Default + Serialize + DeserializeOwned + Send + Sync;
    /// Partial-state shape carried by update messages.
    type Update: Clone + Debug + Serialize + DeserializeOwned + Send + Sync;
    type Proposal: Clone + Debug + Serialize + DeserializeOwned + Send + Sync;
    type ProposeParams: Send;

    const KIND: SequenceKind;
    const METHODS: MethodTable;
    /// Seconds a proposal stays answerable.
    const PROPOSAL_TTL: u64;
    /// Seconds a settled record lives.
    const SETTLED_TTL: u64;
    /// Whether this kind subscribes to its own proposal topics. Pairings
    /// own their URI topic; session proposals ride the parent pairing's
    /// settled topic, which the pairing already holds.
    const OWNS_PROPOSAL_TOPIC: bool;

    fn build_proposal(
        params: &Self::ProposeParams,
        public_key: wcp_crypto::PublicKey,
        expiry: u64,
    ) -> (Topic, RelayProtocol, Self::Proposal);

    fn proposal_topic(proposal: &Self::Proposal) -> Topic;
    fn proposal_relay(proposal: &Self::Proposal) -> RelayProtocol;
    fn proposal_proposer(proposal: &Self::Proposal) -> Participant;
    fn proposal_permissions(proposal: &Self::Proposal) -> Self::Permissions;
    fn proposal_expiry(proposal: &Self::Proposal) -> u64;

    /// Local validation at propose and respond time.
    fn validate_proposal(proposal: &Self::Proposal) -> Result<(), ClientError>;

    /// Whether `method` may traverse a settled record of this kind.
    fn payload_permitted(permissions: &Self::Permissions, method: &str) -> bool;

    /// Whether `kind` is an admissible notification type.
    fn notification_permitted(
        permissions: &Self::Permissions,
        kind: &str,
    ) -> Result<(), ClientError>;

    /// Merge an update into a settled record. Last writer wins per field.
    fn apply_update(record: &mut SettledRecord<Self>, update: &Self::Update);

    /// Widen permissions with an upgrade.
    fn merge_permissions(permissions: &mut Self::Permissions, upgrade: &Self::Permissions);

    fn proposal_event(proposal: &Self::Proposal) -> ClientEvent;
    fn created_event(settled: &SettledRecord<Self>) -> ClientEvent;
    fn updated_event(settled: &SettledRecord<Self>) -> ClientEvent;
    fn deleted_event(topic: Topic, reason: Reason) -> ClientEvent;
    fn payload_event(topic: Topic, request: Request, chain_id: Option<String>)
        -> Option<ClientEvent>;
    fn notification_event(topic: Topic, notification: Notification) -> Option<ClientEvent>;
}

// ---------------------------------------------------------------------------
// Wire parameter shapes shared by both kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct ApproveParams<St>
where
    St: Serialize + DeserializeOwned,
{
    pub relay: RelayProtocol,
    pub responder: Participant,
    pub expiry: u64,
    pub state: St,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectParams {
    pub reason: Reason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct UpdateParams<U>
where
    U: Serialize + DeserializeOwned,
{
    pub state: U,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct UpgradeParams<P>
where
    P: Serialize + DeserializeOwned,
{
    pub permissions: P,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteParams {
    pub reason: Reason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadParams {
    pub request: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
}

/// Caller input to `respond`.
pub struct RespondParams<S: SequenceSpec> {
    pub approved: bool,
    pub proposal: S::Proposal,
    /// State the responder settles with (e.g. session accounts).
    pub state: S::State,
    /// Responder metadata shared with the peer.
    pub metadata: Option<crate::types::AppMetadata>,
    /// Reason attached to a rejection.
    pub reason: Option<Reason>,
}

// ---------------------------------------------------------------------------
// Per-topic locks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TopicLocks {
    map: DashMap<Topic, Arc<Mutex<()>>>,
}

impl TopicLocks {
    fn handle(&self, topic: Topic) -> Arc<Mutex<()>> {
        self.map.entry(topic).or_default().clone()
    }

    async fn lock(&self, topic: Topic) -> OwnedMutexGuard<()> {
        self.handle(topic).lock_owned().await
    }

    fn try_lock(&self, topic: Topic) -> Option<OwnedMutexGuard<()>> {
        self.handle(topic).try_lock_owned().ok()
    }

    fn release(&self, topic: &Topic) {
        // Drop the map entry once nothing else holds the handle.
        if let Some(entry) = self.map.get(topic) {
            if Arc::strong_count(entry.value()) == 1 {
                drop(entry);
                self.map.remove_if(topic, |_, v| Arc::strong_count(v) == 1);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

type Waiter<S> = oneshot::Sender<Result<SettledRecord<S>, ClientError>>;

pub struct Engine<S: SequenceSpec> {
    ctx: SequenceContext,
    pending: DashMap<Topic, PendingRecord<S>>,
    settled: DashMap<Topic, SettledRecord<S>>,
    locks: TopicLocks,
    /// Proposals already answered, keyed by proposal topic and proposer key
    /// (session proposals share their pairing's topic, so the topic alone
    /// does not identify one). Kept until the proposal would have expired;
    /// a late second respond fails instead of double-settling.
    responded: DashMap<(Topic, wcp_crypto::PublicKey), u64>,
    /// Local settlement waiters keyed by proposal topic.
    waiters: DashMap<Topic, Waiter<S>>,
}

impl<S: SequenceSpec> Engine<S> {
    pub fn new(ctx: SequenceContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            pending: DashMap::new(),
            settled: DashMap::new(),
            locks: TopicLocks::default(),
            responded: DashMap::new(),
            waiters: DashMap::new(),
        })
    }

    /// Rehydrate tables from storage, drop what expired, and re-establish
    /// subscriptions for everything that survived.
    pub async fn init(&self) -> Result<(), ClientError> {
        let now = now_unix();

        let stored: Vec<SettledRecord<S>> = self.ctx.store.load(S::KIND, Table::Settled).await?;
        for record in stored {
            if record.expiry <= now {
                debug!(kind = S::KIND.as_str(), topic = %record.topic, "dropping expired settled record");
                continue;
            }
            let id = self
                .ctx
                .relay
                .subscribe(record.topic, Some(record.shared_key.clone()))
                .await?;
            self.ctx.registry.register(record.topic, id, S::KIND, record.expiry);
            self.settled.insert(record.topic, record);
        }

        let stored: Vec<PendingRecord<S>> = self.ctx.store.load(S::KIND, Table::Pending).await?;
        for record in stored {
            // Only our own unanswered proposals can resume; a half-finished
            // response cannot be completed after a restart.
            let proposed = matches!(record.status, PendingStatus::Proposed);
            if record.expiry <= now || !proposed || !record.proposer {
                continue;
            }
            if S::OWNS_PROPOSAL_TOPIC {
                let id = self.ctx.relay.subscribe(record.topic, None).await?;
                self.ctx.registry.register(record.topic, id, S::KIND, record.expiry);
            }
            self.pending.insert(record.topic, record);
        }

        self.persist_settled().await?;
        self.persist_pending().await?;
        Ok(())
    }

    // -- public contract ----------------------------------------------------

    /// Create a proposal: generate a keypair, subscribe the proposal topic
    /// when this kind owns it, announce the proposal over the signal
    /// channel, insert into pending, and emit `proposed`. The returned
    /// receiver resolves when the proposal settles, is rejected, or fails;
    /// it is registered before the proposal becomes visible to anyone.
    pub async fn propose(
        self: &Arc<Self>,
        params: S::ProposeParams,
    ) -> Result<
        (S::Proposal, oneshot::Receiver<Result<SettledRecord<S>, ClientError>>),
        ClientError,
    > {
        let keypair = KeyPair::generate();
        let expiry = now_unix() + S::PROPOSAL_TTL;
        let (topic, relay, proposal) = S::build_proposal(&params, keypair.public_key(), expiry);
        S::validate_proposal(&proposal)?;

        let _guard = self.locks.lock(topic).await;

        if S::OWNS_PROPOSAL_TOPIC {
            let id = self.ctx.relay.subscribe(topic, None).await?;
            self.ctx.registry.register(topic, id, S::KIND, expiry);
        } else if !self.ctx.relay.is_subscribed(&topic) {
            // The signal channel must already exist (a settled parent).
            return Err(ClientError::NoMatchingTopic(topic));
        }

        let record = Pending {
            status: PendingStatus::Proposed,
            topic,
            relay,
            self_keypair: keypair,
            proposal: proposal.clone(),
            expiry,
            proposer: true,
        };
        self.pending.insert(topic, record);
        if let Err(e) = self.persist_pending().await {
            self.pending.remove(&topic);
            if S::OWNS_PROPOSAL_TOPIC {
                self.ctx.registry.remove(&topic);
                let _ = self.ctx.relay.unsubscribe(topic).await;
            }
            return Err(e);
        }

        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.waiters.insert(topic, waiter_tx);

        if !S::OWNS_PROPOSAL_TOPIC {
            // Announce over the live parent channel; the ack only confirms
            // delivery, settlement still arrives as an approve request.
            let request = Request::new(
                S::METHODS.propose,
                serde_json::to_value(&proposal).unwrap_or_default(),
            );
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let key = engine.ctx.relay.key_for(&topic);
                if let Err(e) = engine.ctx.relay.request(topic, request, key.as_ref(), None).await
                {
                    warn!(kind = S::KIND.as_str(), topic = %topic, error = %e, "proposal delivery failed");
                    engine.fail_pending(topic, Reason::timeout()).await;
                }
            });
        }

        self.ctx.events.emit(S::proposal_event(&proposal));
        Ok((proposal, waiter_rx))
    }

    /// Answer a peer's proposal. On approval this derives the settled key
    /// and topic, publishes the approve request, and settles once the peer
    /// acknowledges; the proposal-topic lock is held across the round trip.
    pub async fn respond(
        &self,
        params: RespondParams<S>,
    ) -> Result<Option<SettledRecord<S>>, ClientError> {
        let topic = S::proposal_topic(&params.proposal);
        let proposer = S::proposal_proposer(&params.proposal);
        let marker = (topic, proposer.public_key);

        // A concurrent respond holds the lock: that is the double-response
        // race. A completed respond leaves its marker: the proposal is gone.
        let Some(_guard) = self.locks.try_lock(topic) else {
            return Err(ClientError::ProposalAlreadyResponded);
        };
        if self.responded.contains_key(&marker) {
            return Err(ClientError::NoMatchingTopic(topic));
        }

        let now = now_unix();
        if S::proposal_expiry(&params.proposal) <= now {
            return Err(ClientError::Expired);
        }
        S::validate_proposal(&params.proposal)?;

        let relay_desc = S::proposal_relay(&params.proposal);

        // The response travels on the proposal topic, so we must be able to
        // hear the proposer's acknowledgement there. Session responders
        // already are, through the parent pairing; a pairing responder takes
        // a temporary interest for the duration of the handshake.
        let temporary_sub = if self.ctx.relay.is_subscribed(&topic) {
            None
        } else {
            Some(self.ctx.relay.subscribe(topic, None).await?)
        };
        let publish_key = self.ctx.relay.key_for(&topic);

        if !params.approved {
            let reason = params.reason.unwrap_or_else(Reason::user_rejected);
            let reject = Request::new(
                S::METHODS.reject,
                json!(RejectParams { reason: reason.clone() }),
            );
            let published = self
                .ctx
                .relay
                .publish(topic, &wcp_rpc::Payload::Request(reject), publish_key.as_ref())
                .await;
            if temporary_sub.is_some() {
                let _ = self.ctx.relay.unsubscribe(topic).await;
            }
            published?;
            self.responded.insert(marker, S::proposal_expiry(&params.proposal));
            self.ctx.events.emit(S::deleted_event(topic, reason));
            return Ok(None);
        }

        let mut keypair = KeyPair::generate();
        while keypair.public_key() == proposer.public_key {
            keypair = KeyPair::generate();
        }

        let shared = derive_symmetric(&keypair, &proposer.public_key);
        let settled_topic = Topic::from_key(&shared);
        let settled_expiry = now + S::SETTLED_TTL;

        let id = self.ctx.relay.subscribe(settled_topic, Some(shared.clone())).await?;
        self.ctx.registry.register(settled_topic, id, S::KIND, settled_expiry);

        let record = Pending {
            status: PendingStatus::Responded { approved: true },
            topic,
            relay: relay_desc.clone(),
            self_keypair: keypair.clone(),
            proposal: params.proposal.clone(),
            expiry: S::proposal_expiry(&params.proposal),
            proposer: false,
        };
        self.pending.insert(topic, record);
        if let Err(e) = self.persist_pending().await {
            self.pending.remove(&topic);
            self.ctx.registry.remove(&settled_topic);
            let _ = self.ctx.relay.unsubscribe(settled_topic).await;
            if temporary_sub.is_some() {
                let _ = self.ctx.relay.unsubscribe(topic).await;
            }
            return Err(e);
        }

        let responder = Participant {
            public_key: keypair.public_key(),
            metadata: params.metadata.clone(),
        };
        let approve = ApproveParams::<S::State> {
            relay: relay_desc.clone(),
            responder: responder.clone(),
            expiry: settled_expiry,
            state: params.state.clone(),
        };
        let request = Request::new(
            S::METHODS.approve,
            serde_json::to_value(&approve).unwrap_or_default(),
        );

        let outcome = self.ctx.relay.request(topic, request, publish_key.as_ref(), None).await;
        if temporary_sub.is_some() {
            let _ = self.ctx.relay.unsubscribe(topic).await;
        }

        match outcome {
            Ok(_ack) => {
                self.responded.insert(marker, S::proposal_expiry(&params.proposal));
                let settled = Settled {
                    topic: settled_topic,
                    relay: relay_desc,
                    self_participant: responder,
                    peer: proposer,
                    permissions: S::proposal_permissions(&params.proposal),
                    expiry: settled_expiry,
                    state: params.state,
                    shared_key: shared,
                    controller: false,
                };
                self.settle(topic, settled).await.map(Some)
            }
            Err(e) => {
                // Unwind the half-built settled side.
                self.ctx.registry.remove(&settled_topic);
                let _ = self.ctx.relay.unsubscribe(settled_topic).await;
                self.pending.remove(&topic);
                let _ = self.persist_pending().await;
                Err(e.into())
            }
        }
    }

    /// Promote pending to settled: swap tables, persist, notify, emit.
    async fn settle(
        &self,
        pending_topic: Topic,
        settled: SettledRecord<S>,
    ) -> Result<SettledRecord<S>, ClientError> {
        let previous = self.pending.remove(&pending_topic);
        self.settled.insert(settled.topic, settled.clone());

        let persisted = match self.persist_settled().await {
            Ok(()) => self.persist_pending().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            // Roll the swap back; the peer's view will expire on its own.
            self.settled.remove(&settled.topic);
            if let Some((topic, record)) = previous {
                self.pending.insert(topic, record);
            }
            return Err(e);
        }

        self.ctx.events.emit(S::created_event(&settled));
        if let Some((_, waiter)) = self.waiters.remove(&pending_topic) {
            let _ = waiter.send(Ok(settled.clone()));
        }
        Ok(settled)
    }

    /// Controller-side update. The in-memory and stored change is reverted
    /// when the peer round trip fails.
    pub async fn update(
        &self,
        topic: Topic,
        update: S::Update,
    ) -> Result<SettledRecord<S>, ClientError> {
        let _guard = self.locks.lock(topic).await;

        let old = self
            .settled
            .get(&topic)
            .map(|r| r.value().clone())
            .ok_or(ClientError::NoMatchingTopic(topic))?;
        if !old.controller {
            return Err(ClientError::UnauthorizedUpdate);
        }

        let mut updated = old.clone();
        S::apply_update(&mut updated, &update);
        self.settled.insert(topic, updated.clone());
        if let Err(e) = self.persist_settled().await {
            self.settled.insert(topic, old);
            return Err(e);
        }

        let request = Request::new(
            S::METHODS.update,
            json!(UpdateParams::<S::Update> { state: update }),
        );
        let key = self.ctx.relay.key_for(&topic);
        if let Err(e) = self.ctx.relay.request(topic, request, key.as_ref(), None).await {
            self.settled.insert(topic, old);
            let _ = self.persist_settled().await;
            return Err(e.into());
        }

        self.ctx.events.emit(S::updated_event(&updated));
        Ok(updated)
    }

    /// Controller-side permission upgrade. Session only; the pairing family
    /// has no upgrade method.
    pub async fn upgrade(
        &self,
        topic: Topic,
        permissions: S::Permissions,
    ) -> Result<SettledRecord<S>, ClientError> {
        let Some(method) = S::METHODS.upgrade else {
            return Err(ClientError::UnauthorizedRpcMethod("upgrade".into()));
        };
        let _guard = self.locks.lock(topic).await;

        let old = self
            .settled
            .get(&topic)
            .map(|r| r.value().clone())
            .ok_or(ClientError::NoMatchingTopic(topic))?;
        if !old.controller {
            return Err(ClientError::UnauthorizedUpdate);
        }

        let mut updated = old.clone();
        S::merge_permissions(&mut updated.permissions, &permissions);
        self.settled.insert(topic, updated.clone());
        if let Err(e) = self.persist_settled().await {
            self.settled.insert(topic, old);
            return Err(e);
        }

        let request = Request::new(
            method,
            json!(UpgradeParams::<S::Permissions> { permissions }),
        );
        let key = self.ctx.relay.key_for(&topic);
        if let Err(e) = self.ctx.relay.request(topic, request, key.as_ref(), None).await {
            self.settled.insert(topic, old);
            let _ = self.persist_settled().await;
            return Err(e.into());
        }

        self.ctx.events.emit(S::updated_event(&updated));
        Ok(updated)
    }

    /// Send a typed notification. Fails unless the type is permitted.
    pub async fn notify(
        &self,
        topic: Topic,
        notification: Notification,
    ) -> Result<(), ClientError> {
        let Some(method) = S::METHODS.notification else {
            return Err(ClientError::UnauthorizedRpcMethod("notification".into()));
        };
        let record = self
            .settled
            .get(&topic)
            .map(|r| r.value().clone())
            .ok_or(ClientError::NoMatchingTopic(topic))?;
        S::notification_permitted(&record.permissions, &notification.kind)?;

        let request = Request::new(method, json!(notification));
        let key = self.ctx.relay.key_for(&topic);
        self.ctx.relay.request(topic, request, key.as_ref(), None).await?;
        Ok(())
    }

    /// Liveness probe on a settled topic.
    pub async fn ping(&self, topic: Topic) -> Result<(), ClientError> {
        if !self.settled.contains_key(&topic) {
            return Err(ClientError::NoMatchingTopic(topic));
        }
        let request = Request::new(S::METHODS.ping, json!({}));
        let key = self.ctx.relay.key_for(&topic);
        self.ctx.relay.request(topic, request, key.as_ref(), None).await?;
        Ok(())
    }

    /// Tear down a settled record. Idempotent: deleting an unknown topic is
    /// a no-op. The wire delete is best effort.
    pub async fn delete(&self, topic: Topic, reason: Reason) -> Result<(), ClientError> {
        let guard = self.locks.lock(topic).await;

        let Some((_, record)) = self.settled.remove(&topic) else {
            return Ok(());
        };

        let request = Request::new(
            S::METHODS.delete,
            json!(DeleteParams { reason: reason.clone() }),
        );
        let key = self.ctx.relay.key_for(&topic);
        if let Err(e) = self
            .ctx
            .relay
            .publish(topic, &wcp_rpc::Payload::Request(request), key.as_ref())
            .await
        {
            warn!(kind = S::KIND.as_str(), topic = %topic, error = %e, "delete notification failed");
        }

        self.ctx.registry.remove(&topic);
        let _ = self.ctx.relay.unsubscribe(topic).await;
        if let Err(e) = self.persist_settled().await {
            self.settled.insert(topic, record);
            return Err(e);
        }
        self.ctx.events.emit(S::deleted_event(topic, reason));
        drop(guard);
        self.locks.release(&topic);
        Ok(())
    }

    /// Route an application payload over a settled record of this kind.
    pub async fn request_payload(
        &self,
        topic: Topic,
        method: &str,
        params: serde_json::Value,
        chain_id: Option<String>,
        timeout: Option<std::time::Duration>,
    ) -> Result<serde_json::Value, ClientError> {
        let record = self
            .settled
            .get(&topic)
            .map(|r| r.value().clone())
            .ok_or(ClientError::NoMatchingTopic(topic))?;
        if !S::payload_permitted(&record.permissions, method) {
            return Err(ClientError::UnauthorizedRpcMethod(method.to_owned()));
        }

        let payload = PayloadParams {
            request: json!({ "method": method, "params": params }),
            chain_id,
        };
        let request = Request::new(S::METHODS.payload, json!(payload));
        let key = self.ctx.relay.key_for(&topic);
        Ok(self.ctx.relay.request(topic, request, key.as_ref(), timeout).await?)
    }

    /// Write a JSON-RPC response for a previously delivered inbound payload.
    pub async fn respond_rpc(&self, topic: Topic, response: Response) -> Result<(), ClientError> {
        if !self.settled.contains_key(&topic) {
            return Err(ClientError::NoMatchingTopic(topic));
        }
        let key = self.ctx.relay.key_for(&topic);
        self.ctx.relay.respond(topic, response, key.as_ref()).await?;
        Ok(())
    }

    /// Settled lookup.
    pub fn get(&self, topic: Topic) -> Result<SettledRecord<S>, ClientError> {
        self.settled
            .get(&topic)
            .map(|r| r.value().clone())
            .ok_or(ClientError::NoMatchingTopic(topic))
    }

    pub fn settled_topics(&self) -> Vec<Topic> {
        self.settled.iter().map(|e| *e.key()).collect()
    }

    pub fn has_pending(&self, topic: &Topic) -> bool {
        self.pending.contains_key(topic)
    }

    // -- inbound ------------------------------------------------------------

    /// Dispatch an inbound control request for this kind. All mutation runs
    /// under the topic lock; anything malformed is answered on the wire and
    /// absorbed.
    pub async fn handle_inbound(&self, topic: Topic, request: Request) {
        let _guard = self.locks.lock(topic).await;
        let method = request.method.clone();

        if method == S::METHODS.approve {
            self.on_approve(topic, request).await;
        } else if method == S::METHODS.reject {
            self.on_reject(topic, request).await;
        } else if method == S::METHODS.update {
            self.on_update(topic, request).await;
        } else if Some(method.as_str()) == S::METHODS.upgrade {
            self.on_upgrade(topic, request).await;
        } else if method == S::METHODS.delete {
            self.on_delete(topic, request).await;
        } else if method == S::METHODS.ping {
            self.on_ping(topic, request).await;
        } else if Some(method.as_str()) == S::METHODS.notification {
            self.on_notification(topic, request).await;
        } else if method == S::METHODS.payload {
            self.on_payload(topic, request).await;
        } else {
            self.nack(topic, request.id, ErrorObject::method_not_found(&method)).await;
        }
    }

    async fn on_approve(&self, topic: Topic, request: Request) {
        let Some(record) = self.pending.get(&topic).map(|r| r.value().clone()) else {
            self.nack(topic, request.id, invalid("no pending proposal on topic")).await;
            return;
        };
        if !record.proposer || !matches!(record.status, PendingStatus::Proposed) {
            self.nack(topic, request.id, invalid("proposal is not awaiting approval")).await;
            return;
        }
        let params: ApproveParams<S::State> = match serde_json::from_value(request.params.clone())
        {
            Ok(p) => p,
            Err(e) => {
                self.nack(topic, request.id, invalid_params(&e)).await;
                return;
            }
        };

        if record.expiry <= now_unix() {
            self.fail_pending(topic, Reason::expired()).await;
            self.nack(topic, request.id, invalid("proposal expired")).await;
            return;
        }
        if params.responder.public_key == record.self_keypair.public_key() {
            self.nack(topic, request.id, invalid("responder key equals proposer key")).await;
            return;
        }

        let shared = derive_symmetric(&record.self_keypair, &params.responder.public_key);
        let settled_topic = Topic::from_key(&shared);

        let sub = self.ctx.relay.subscribe(settled_topic, Some(shared.clone())).await;
        let Ok(id) = sub else {
            self.nack(topic, request.id, invalid("settled subscription failed")).await;
            return;
        };
        self.ctx.registry.register(settled_topic, id, S::KIND, params.expiry);

        let settled = Settled {
            topic: settled_topic,
            relay: params.relay,
            self_participant: S::proposal_proposer(&record.proposal),
            peer: params.responder,
            permissions: S::proposal_permissions(&record.proposal),
            expiry: params.expiry,
            state: params.state,
            shared_key: shared,
            controller: true,
        };

        if S::OWNS_PROPOSAL_TOPIC {
            self.ctx.registry.remove(&topic);
            let _ = self.ctx.relay.unsubscribe(topic).await;
        }

        match self.settle(topic, settled).await {
            Ok(_) => self.ack(topic, request.id).await,
            Err(e) => {
                warn!(kind = S::KIND.as_str(), topic = %topic, error = %e, "settle failed");
                self.ctx.registry.remove(&settled_topic);
                let _ = self.ctx.relay.unsubscribe(settled_topic).await;
                self.nack(topic, request.id, invalid("settlement failed")).await;
            }
        }
    }

    async fn on_reject(&self, topic: Topic, request: Request) {
        let reason = serde_json::from_value::<RejectParams>(request.params.clone())
            .map(|p| p.reason)
            .unwrap_or_else(|_| Reason::user_rejected());

        if self.pending.remove(&topic).is_some() {
            let _ = self.persist_pending().await;
            if S::OWNS_PROPOSAL_TOPIC {
                self.ctx.registry.remove(&topic);
                let _ = self.ctx.relay.unsubscribe(topic).await;
            }
            self.ctx.events.emit(S::deleted_event(topic, reason.clone()));
            if let Some((_, waiter)) = self.waiters.remove(&topic) {
                let _ = waiter.send(Err(ClientError::Rejected(reason)));
            }
        }
        self.ack(topic, request.id).await;
    }

    async fn on_update(&self, topic: Topic, request: Request) {
        let Some(old) = self.settled.get(&topic).map(|r| r.value().clone()) else {
            self.nack(topic, request.id, invalid("no matching topic")).await;
            return;
        };
        // Updates flow from the controller to us.
        if old.controller {
            self.nack(topic, request.id, unauthorized("update from non-controller")).await;
            return;
        }
        let params: UpdateParams<S::Update> = match serde_json::from_value(request.params.clone())
        {
            Ok(p) => p,
            Err(e) => {
                self.nack(topic, request.id, invalid_params(&e)).await;
                return;
            }
        };

        let mut updated = old.clone();
        S::apply_update(&mut updated, &params.state);
        self.settled.insert(topic, updated.clone());
        if self.persist_settled().await.is_err() {
            self.settled.insert(topic, old);
            self.nack(topic, request.id, invalid("persistence failed")).await;
            return;
        }

        self.ack(topic, request.id).await;
        self.ctx.events.emit(S::updated_event(&updated));
    }

    async fn on_upgrade(&self, topic: Topic, request: Request) {
        let Some(old) = self.settled.get(&topic).map(|r| r.value().clone()) else {
            self.nack(topic, request.id, invalid("no matching topic")).await;
            return;
        };
        if old.controller {
            self.nack(topic, request.id, unauthorized("upgrade from non-controller")).await;
            return;
        }
        let params: UpgradeParams<S::Permissions> =
            match serde_json::from_value(request.params.clone()) {
                Ok(p) => p,
                Err(e) => {
                    self.nack(topic, request.id, invalid_params(&e)).await;
                    return;
                }
            };

        let mut updated = old.clone();
        S::merge_permissions(&mut updated.permissions, &params.permissions);
        self.settled.insert(topic, updated.clone());
        if self.persist_settled().await.is_err() {
            self.settled.insert(topic, old);
            self.nack(topic, request.id, invalid("persistence failed")).await;
            return;
        }

        self.ack(topic, request.id).await;
        self.ctx.events.emit(S::updated_event(&updated));
    }

    async fn on_delete(&self, topic: Topic, request: Request) {
        let reason = serde_json::from_value::<DeleteParams>(request.params.clone())
            .map(|p| p.reason)
            .unwrap_or_else(|_| Reason::user_disconnected());

        // Ack before tearing the subscription down so the response can
        // still travel on the topic.
        self.ack(topic, request.id).await;

        if self.settled.remove(&topic).is_some() {
            self.ctx.registry.remove(&topic);
            let _ = self.ctx.relay.unsubscribe(topic).await;
            let _ = self.persist_settled().await;
            self.ctx.events.emit(S::deleted_event(topic, reason));
        }
    }

    async fn on_ping(&self, topic: Topic, request: Request) {
        if self.settled.contains_key(&topic) || self.pending.contains_key(&topic) {
            self.ack(topic, request.id).await;
        } else {
            self.nack(topic, request.id, invalid("no matching topic")).await;
        }
    }

    async fn on_notification(&self, topic: Topic, request: Request) {
        let Some(record) = self.settled.get(&topic).map(|r| r.value().clone()) else {
            self.nack(topic, request.id, invalid("no matching topic")).await;
            return;
        };
        let notification: Notification = match serde_json::from_value(request.params.clone()) {
            Ok(n) => n,
            Err(e) => {
                self.nack(topic, request.id, invalid_params(&e)).await;
                return;
            }
        };
        if S::notification_permitted(&record.permissions, &notification.kind).is_err() {
            self.nack(
                topic,
                request.id,
                unauthorized(&format!("notification type: {}", notification.kind)),
            )
            .await;
            return;
        }
        self.ack(topic, request.id).await;
        if let Some(event) = S::notification_event(topic, notification) {
            self.ctx.events.emit(event);
        }
    }

    async fn on_payload(&self, topic: Topic, request: Request) {
        let Some(record) = self.settled.get(&topic).map(|r| r.value().clone()) else {
            self.nack(topic, request.id, invalid("no matching topic")).await;
            return;
        };
        let params: PayloadParams = match serde_json::from_value(request.params.clone()) {
            Ok(p) => p,
            Err(e) => {
                self.nack(topic, request.id, invalid_params(&e)).await;
                return;
            }
        };
        let method = params
            .request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_owned();

        if !S::payload_permitted(&record.permissions, &method) {
            self.nack(topic, request.id, ErrorObject::method_not_found(&method)).await;
            return;
        }

        let inner = Request {
            jsonrpc: request.jsonrpc,
            id: request.id,
            method,
            params: params.request.get("params").cloned().unwrap_or_default(),
        };
        if let Some(event) = S::payload_event(topic, inner, params.chain_id) {
            self.ctx.events.emit(event);
        }
        // No ack here: the application answers through `respond_rpc`.
    }

    // -- sweeping -----------------------------------------------------------

    /// Drop everything past its TTL. Runs on the sweeper cadence; topics
    /// whose lock is busy are picked up on the next tick.
    pub async fn sweep(&self, now: u64) {
        let expired_settled: Vec<Topic> = self
            .settled
            .iter()
            .filter(|e| e.value().expiry <= now)
            .map(|e| *e.key())
            .collect();
        for topic in expired_settled {
            let Some(_guard) = self.locks.try_lock(topic) else { continue };
            if self.settled.remove(&topic).is_some() {
                self.ctx.registry.remove(&topic);
                let _ = self.ctx.relay.unsubscribe(topic).await;
                let _ = self.persist_settled().await;
                self.ctx.events.emit(S::deleted_event(topic, Reason::expired()));
                debug!(kind = S::KIND.as_str(), topic = %topic, "settled record expired");
            }
        }

        let expired_pending: Vec<Topic> = self
            .pending
            .iter()
            .filter(|e| e.value().expiry <= now)
            .map(|e| *e.key())
            .collect();
        for topic in expired_pending {
            let Some(_guard) = self.locks.try_lock(topic) else { continue };
            self.fail_pending(topic, Reason::expired()).await;
        }

        self.responded.retain(|_, expiry| *expiry > now);
    }

    /// Transition a pending record to failed and drop it.
    async fn fail_pending(&self, topic: Topic, reason: Reason) {
        if self.pending.remove(&topic).is_none() {
            return;
        }
        let _ = self.persist_pending().await;
        if S::OWNS_PROPOSAL_TOPIC {
            self.ctx.registry.remove(&topic);
            let _ = self.ctx.relay.unsubscribe(topic).await;
        }
        self.ctx.events.emit(S::deleted_event(topic, reason.clone()));
        if let Some((_, waiter)) = self.waiters.remove(&topic) {
            let error = if reason == Reason::expired() {
                ClientError::Expired
            } else {
                ClientError::RpcTimeout
            };
            let _ = waiter.send(Err(error));
        }
    }

    // -- helpers ------------------------------------------------------------

    async fn ack(&self, topic: Topic, id: RequestId) {
        let key = self.ctx.relay.key_for(&topic);
        if let Err(e) = self
            .ctx
            .relay
            .respond(topic, Response::ok(id, json!(true)), key.as_ref())
            .await
        {
            warn!(topic = %topic, error = %e, "ack failed");
        }
    }

    async fn nack(&self, topic: Topic, id: RequestId, error: ErrorObject) {
        let key = self.ctx.relay.key_for(&topic);
        if let Err(e) = self
            .ctx
            .relay
            .respond(topic, Response::err(id, error), key.as_ref())
            .await
        {
            warn!(topic = %topic, error = %e, "error response failed");
        }
    }

    async fn persist_settled(&self) -> Result<(), ClientError> {
        let records: Vec<SettledRecord<S>> =
            self.settled.iter().map(|e| e.value().clone()).collect();
        self.ctx
            .store
            .save(S::KIND, Table::Settled, &records)
            .await
            .map_err(Into::into)
    }

    async fn persist_pending(&self) -> Result<(), ClientError> {
        let records: Vec<PendingRecord<S>> =
            self.pending.iter().map(|e| e.value().clone()).collect();
        self.ctx
            .store
            .save(S::KIND, Table::Pending, &records)
            .await
            .map_err(Into::into)
    }
}

fn invalid(message: &str) -> ErrorObject {
    ErrorObject { code: error_codes::INVALID_REQUEST, message: message.to_owned() }
}

fn invalid_params(error: &serde_json::Error) -> ErrorObject {
    ErrorObject { code: error_codes::INVALID_PARAMS, message: error.to_string() }
}

fn unauthorized(message: &str) -> ErrorObject {
    ErrorObject { code: error_codes::INVALID_REQUEST, message: format!("unauthorized {message}") }
}
