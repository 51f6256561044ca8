//! End-to-end flows between two clients over the in-memory relay.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use wcp_core::client::{Client, ClientConfig, ConnectParams, RequestParams};
use wcp_core::error::ClientError;
use wcp_core::event::ClientEvent;
use wcp_core::session::SessionProposal;
use wcp_core::store::{KvStore, MemoryKvStore};
use wcp_core::types::{
    AppMetadata, JsonRpcPermissions, Notification, NotificationPermissions, Reason,
    SessionPermissions, SessionState,
};
use wcp_relay::RelayHub;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn metadata(name: &str) -> AppMetadata {
    AppMetadata {
        name: name.to_owned(),
        description: format!("{name} test peer"),
        url: format!("https://{name}.example"),
        icons: vec![],
    }
}

fn permissions(methods: &[&str]) -> SessionPermissions {
    SessionPermissions {
        jsonrpc: JsonRpcPermissions {
            methods: methods.iter().map(|m| (*m).to_owned()).collect(),
        },
        ..Default::default()
    }
}

async fn client_on(
    hub: &RelayHub,
    name: &str,
    storage: Option<Arc<dyn KvStore>>,
) -> Arc<Client> {
    let (transport, messages) = hub.endpoint().await;
    Client::new(ClientConfig {
        metadata: metadata(name),
        transport: Arc::new(transport),
        messages,
        storage,
        override_context: None,
        rpc_timeout: Some(Duration::from_secs(2)),
        logger: None,
    })
    .await
    .expect("client construction")
}

async fn two_clients() -> (RelayHub, Arc<Client>, Arc<Client>) {
    init_tracing();
    let hub = RelayHub::new();
    let app = client_on(&hub, "app", None).await;
    let wallet = client_on(&hub, "wallet", None).await;
    (hub, app, wallet)
}

/// Wait for the first event the filter accepts, with a deadline.
async fn next_event<T>(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut filter: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if let Some(found) = filter(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drive the full pair + connect handshake, returning the settled session
/// from both ends.
async fn establish_session(
    app: &Arc<Client>,
    wallet: &Arc<Client>,
    perms: SessionPermissions,
    accounts: Vec<String>,
) -> (wcp_core::SettledSession, wcp_core::SettledSession) {
    let mut app_events = app.subscribe();
    let mut wallet_events = wallet.subscribe();

    let connecting = {
        let app = Arc::clone(app);
        tokio::spawn(async move {
            app.connect(ConnectParams { pairing_topic: None, permissions: perms }).await
        })
    };

    let uri = next_event(&mut app_events, |e| match e {
        ClientEvent::PairingProposal { uri, .. } => Some(uri),
        _ => None,
    })
    .await;

    wallet.pair(&uri).await.expect("pair");

    let proposal = next_event(&mut wallet_events, |e| match e {
        ClientEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;

    let wallet_session = wallet
        .approve(proposal, SessionState { accounts })
        .await
        .expect("approve");
    let app_session = connecting.await.expect("join").expect("connect");

    (app_session, wallet_session)
}

#[tokio::test]
async fn happy_path_pair_and_connect() {
    let (_hub, app, wallet) = two_clients().await;
    let mut app_events = app.subscribe();
    let mut wallet_events = wallet.subscribe();

    let (app_session, wallet_session) = establish_session(
        &app,
        &wallet,
        permissions(&["eth_sign"]),
        vec!["eip155:1:0xab".into()],
    )
    .await;

    // Both sides settled the same topic with the accounts the wallet chose.
    assert_eq!(app_session.topic, wallet_session.topic);
    assert_eq!(app_session.state.accounts, vec!["eip155:1:0xab".to_owned()]);
    assert!(app_session.controller);
    assert!(!wallet_session.controller);

    // Key material is asymmetric across the two participants.
    assert_ne!(
        app_session.self_participant.public_key,
        app_session.peer.public_key
    );

    // Both emitted pairing.created and session.created.
    next_event(&mut app_events, |e| {
        matches!(e, ClientEvent::PairingCreated { .. }).then_some(())
    })
    .await;
    next_event(&mut wallet_events, |e| {
        matches!(e, ClientEvent::PairingCreated { .. }).then_some(())
    })
    .await;
    let created_topic = next_event(&mut app_events, |e| match e {
        ClientEvent::SessionCreated { session } => Some(session.topic),
        _ => None,
    })
    .await;
    assert_eq!(created_topic, app_session.topic);
    next_event(&mut wallet_events, |e| {
        matches!(e, ClientEvent::SessionCreated { .. }).then_some(())
    })
    .await;

    // The session topic is disjoint from its parent pairing's topic.
    let pairing_topic = app.pairing_topics()[0];
    assert_ne!(pairing_topic, app_session.topic);

    // Each side holds exactly its settled subscriptions: pairing + session.
    assert_eq!(app.subscription_count(), 2);
    assert_eq!(wallet.subscription_count(), 2);

    // Pairing metadata enrichment reached the wallet.
    let wallet_pairing = wallet.pairing_of(pairing_topic).expect("pairing");
    assert_eq!(
        wallet_pairing.peer.metadata.as_ref().map(|m| m.name.as_str()),
        Some("app")
    );
}

#[tokio::test]
async fn reject_session_fails_connect_with_reason() {
    let (_hub, app, wallet) = two_clients().await;
    let mut app_events = app.subscribe();
    let mut wallet_events = wallet.subscribe();

    let connecting = {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            app.connect(ConnectParams {
                pairing_topic: None,
                permissions: permissions(&["eth_sign"]),
            })
            .await
        })
    };

    let uri = next_event(&mut app_events, |e| match e {
        ClientEvent::PairingProposal { uri, .. } => Some(uri),
        _ => None,
    })
    .await;
    wallet.pair(&uri).await.expect("pair");

    let proposal = next_event(&mut wallet_events, |e| match e {
        ClientEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;

    wallet.reject(proposal.clone(), None).await.expect("reject");

    // Both sides observe session.deleted carrying "User rejected".
    let reason = next_event(&mut wallet_events, |e| match e {
        ClientEvent::SessionDeleted { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason.message, "User rejected");
    let reason = next_event(&mut app_events, |e| match e {
        ClientEvent::SessionDeleted { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason.message, "User rejected");

    let err = connecting.await.expect("join").expect_err("connect must fail");
    assert!(matches!(err, ClientError::Rejected(_)), "got {err:?}");

    // Approving afterwards finds nothing to approve.
    let err = wallet
        .approve(proposal, SessionState::default())
        .await
        .expect_err("approve after reject");
    assert!(matches!(err, ClientError::NoMatchingTopic(_)), "got {err:?}");
}

#[tokio::test]
async fn unauthorized_method_is_rejected_on_the_wire() {
    let (hub, app, wallet) = two_clients().await;
    let (app_session, _wallet_session) = establish_session(
        &app,
        &wallet,
        permissions(&["eth_sign"]),
        vec!["eip155:1:0xab".into()],
    )
    .await;
    let mut wallet_events = wallet.subscribe();

    // The sender-side gate refuses a method outside the permission set.
    let err = app
        .request(RequestParams {
            topic: app_session.topic,
            method: "eth_sendTransaction".into(),
            params: json!([]),
            chain_id: None,
            timeout: None,
        })
        .await
        .expect_err("local permission gate");
    assert!(matches!(err, ClientError::UnauthorizedRpcMethod(_)));

    // A peer that skips its local gate gets a wire-level method-not-found.
    // Simulate it with a raw relay client holding the session key.
    let (transport, messages) = hub.endpoint().await;
    let (rogue, _inbound) =
        wcp_relay::RelayClient::with_timeout(Arc::new(transport), Duration::from_secs(2));
    rogue.start(messages);
    rogue
        .subscribe(app_session.topic, Some(app_session.shared_key.clone()))
        .await
        .expect("subscribe");

    let err = rogue
        .request(
            app_session.topic,
            wcp_rpc::Request::new(
                wcp_rpc::methods::session::PAYLOAD,
                json!({ "request": { "method": "eth_sendTransaction", "params": [] } }),
            ),
            Some(&app_session.shared_key),
            None,
        )
        .await
        .expect_err("wire rejection");
    match err {
        wcp_relay::RelayError::Rpc(e) => {
            assert_eq!(e.code, wcp_rpc::error_codes::METHOD_NOT_FOUND);
        }
        other => panic!("expected rpc error, got {other:?}"),
    }

    // No session.payload event leaked out of the rejected request.
    assert!(matches!(
        wallet_events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn permitted_request_roundtrips_through_the_wallet() {
    let (_hub, app, wallet) = two_clients().await;
    let (app_session, _) = establish_session(
        &app,
        &wallet,
        permissions(&["eth_sign"]),
        vec!["eip155:1:0xab".into()],
    )
    .await;

    // Wallet-side application loop: answer payloads as they arrive.
    let mut wallet_events = wallet.subscribe();
    let responder = Arc::clone(&wallet);
    tokio::spawn(async move {
        loop {
            if let Ok(ClientEvent::SessionPayload { topic, request, .. }) =
                wallet_events.recv().await
            {
                assert_eq!(request.method, "eth_sign");
                responder
                    .respond(topic, wcp_rpc::Response::ok(request.id, json!("0xsigned")))
                    .await
                    .expect("respond");
            }
        }
    });

    let result = app
        .request(RequestParams {
            topic: app_session.topic,
            method: "eth_sign".into(),
            params: json!(["0xdeadbeef"]),
            chain_id: Some("eip155:1".into()),
            timeout: None,
        })
        .await
        .expect("request");
    assert_eq!(result, json!("0xsigned"));
}

#[tokio::test]
async fn request_timeout_leaves_session_settled() {
    let (_hub, app, wallet) = two_clients().await;
    let (app_session, _) = establish_session(
        &app,
        &wallet,
        permissions(&["eth_sign"]),
        vec![],
    )
    .await;
    let mut app_events = app.subscribe();

    // Nobody answers on the wallet side.
    let err = app
        .request(RequestParams {
            topic: app_session.topic,
            method: "eth_sign".into(),
            params: json!([]),
            chain_id: None,
            timeout: Some(Duration::from_millis(200)),
        })
        .await
        .expect_err("must time out");
    assert!(matches!(err, ClientError::RpcTimeout), "got {err:?}");

    // The session survives the timeout.
    assert!(app.session_of(app_session.topic).is_ok());
    assert!(matches!(
        app_events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    // And the channel still works.
    app.ping(app_session.topic).await.expect("ping");
}

#[tokio::test]
async fn expired_record_is_swept_and_forgotten() {
    use wcp_core::store::SequenceStore;
    use wcp_core::types::{
        now_unix, PairingPermissions, PairingState, Participant, SequenceKind, Settled,
    };

    let hub = RelayHub::new();
    let storage: Arc<dyn KvStore> = MemoryKvStore::new_shared();

    // Seed storage with a settled pairing about to expire.
    let key = wcp_crypto::SymmetricKey::from_bytes([7u8; 32]);
    let topic = wcp_crypto::Topic::from_key(&key);
    let record: wcp_core::SettledPairing = Settled {
        topic,
        relay: wcp_core::RelayProtocol::default(),
        self_participant: Participant {
            public_key: wcp_crypto::KeyPair::generate().public_key(),
            metadata: None,
        },
        peer: Participant {
            public_key: wcp_crypto::KeyPair::generate().public_key(),
            metadata: None,
        },
        permissions: PairingPermissions::default(),
        expiry: now_unix() + 1,
        state: PairingState::default(),
        shared_key: key,
        controller: true,
    };
    let store = SequenceStore::new(Arc::clone(&storage), None);
    store
        .save(SequenceKind::Pairing, wcp_core::store::Table::Settled, &[record])
        .await
        .expect("seed");

    let client = client_on(&hub, "app", Some(storage)).await;
    let mut events = client.subscribe();

    // Rehydration picked the record up.
    assert!(client.pairing_of(topic).is_ok());
    assert_eq!(client.subscription_count(), 1);

    // Within two seconds the sweeper expires it.
    let (deleted_topic, reason) = next_event(&mut events, |e| match e {
        ClientEvent::PairingDeleted { topic, reason } => Some((topic, reason)),
        _ => None,
    })
    .await;
    assert_eq!(deleted_topic, topic);
    assert_eq!(reason, Reason::expired());

    assert!(matches!(
        client.pairing_of(topic),
        Err(ClientError::NoMatchingTopic(_))
    ));
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn double_respond_race_settles_exactly_once() {
    let (_hub, app, wallet) = two_clients().await;
    let mut app_events = app.subscribe();
    let mut wallet_events = wallet.subscribe();

    let connecting = {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            app.connect(ConnectParams {
                pairing_topic: None,
                permissions: permissions(&["eth_sign"]),
            })
            .await
        })
    };
    let uri = next_event(&mut app_events, |e| match e {
        ClientEvent::PairingProposal { uri, .. } => Some(uri),
        _ => None,
    })
    .await;

    // Two concurrent responses to the same proposal.
    let (first, second) = tokio::join!(wallet.pair(&uri), wallet.pair(&uri));

    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1, "exactly one wins");
    let loser = if outcomes[0] { second } else { first };
    assert!(
        matches!(loser, Err(ClientError::ProposalAlreadyResponded)),
        "got {loser:?}"
    );

    // Exactly one pairing.created on the wallet; count until the session
    // proposal arrives, which is strictly after any settlement event.
    let mut created = 0;
    let proposal = next_event(&mut wallet_events, |e| match e {
        ClientEvent::PairingCreated { .. } => {
            created += 1;
            None
        }
        ClientEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;
    assert_eq!(created, 1);
    wallet
        .approve(proposal, SessionState::default())
        .await
        .expect("approve");
    connecting.await.expect("join").expect("connect");
}

#[tokio::test]
async fn update_and_upgrade_flow_from_controller_only() {
    let (_hub, app, wallet) = two_clients().await;
    let (app_session, wallet_session) = establish_session(
        &app,
        &wallet,
        permissions(&["eth_sign"]),
        vec!["eip155:1:0xab".into()],
    )
    .await;
    let mut wallet_events = wallet.subscribe();
    let topic = app_session.topic;

    // Non-controller update is refused locally.
    let err = wallet
        .update(topic, SessionState { accounts: vec!["eip155:1:0xcd".into()] })
        .await
        .expect_err("non-controller update");
    assert!(matches!(err, ClientError::UnauthorizedUpdate));
    assert_eq!(
        wallet.session_of(topic).expect("session").state,
        wallet_session.state
    );

    // Controller update propagates.
    app.update(topic, SessionState { accounts: vec!["eip155:1:0xcd".into()] })
        .await
        .expect("update");
    let updated = next_event(&mut wallet_events, |e| match e {
        ClientEvent::SessionUpdated { session } => Some(session),
        _ => None,
    })
    .await;
    assert_eq!(updated.state.accounts, vec!["eip155:1:0xcd".to_owned()]);

    // Controller upgrade widens the peer's permission view.
    app.upgrade(topic, permissions(&["eth_sendTransaction"])).await.expect("upgrade");
    let upgraded = next_event(&mut wallet_events, |e| match e {
        ClientEvent::SessionUpdated { session } => Some(session),
        _ => None,
    })
    .await;
    assert!(upgraded.permissions.jsonrpc.methods.contains("eth_sign"));
    assert!(upgraded.permissions.jsonrpc.methods.contains("eth_sendTransaction"));
}

#[tokio::test]
async fn notifications_respect_the_permitted_types() {
    let (_hub, app, wallet) = two_clients().await;
    let mut perms = permissions(&["eth_sign"]);
    perms.notifications = NotificationPermissions {
        types: BTreeSet::from(["accountsChanged".to_owned()]),
    };
    let (app_session, _) =
        establish_session(&app, &wallet, perms, vec!["eip155:1:0xab".into()]).await;
    let mut app_events = app.subscribe();
    let topic = app_session.topic;

    // A type outside the set fails before anything is sent.
    let err = wallet
        .notify(
            topic,
            Notification { kind: "chainChanged".into(), data: json!({}) },
        )
        .await
        .expect_err("unauthorized type");
    assert!(matches!(err, ClientError::UnauthorizedNotificationType(_)));

    // A permitted type is delivered as session.notification.
    wallet
        .notify(
            topic,
            Notification { kind: "accountsChanged".into(), data: json!(["0xcd"]) },
        )
        .await
        .expect("notify");
    let delivered = next_event(&mut app_events, |e| match e {
        ClientEvent::SessionNotification { notification, .. } => Some(notification),
        _ => None,
    })
    .await;
    assert_eq!(delivered.kind, "accountsChanged");
    assert_eq!(delivered.data, json!(["0xcd"]));
}

#[tokio::test]
async fn disconnect_is_idempotent_and_notifies_the_peer() {
    let (_hub, app, wallet) = two_clients().await;
    let (app_session, _) =
        establish_session(&app, &wallet, permissions(&["eth_sign"]), vec![]).await;
    let mut wallet_events = wallet.subscribe();
    let topic = app_session.topic;

    app.disconnect(topic, None).await.expect("disconnect");
    let reason = next_event(&mut wallet_events, |e| match e {
        ClientEvent::SessionDeleted { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert_eq!(reason, Reason::user_disconnected());

    assert!(matches!(
        app.session_of(topic),
        Err(ClientError::NoMatchingTopic(_))
    ));
    assert!(matches!(
        wallet.session_of(topic),
        Err(ClientError::NoMatchingTopic(_))
    ));

    // Second delete is a silent no-op.
    app.disconnect(topic, None).await.expect("idempotent disconnect");
}

#[tokio::test]
async fn settled_state_survives_a_restart() {
    let hub = RelayHub::new();
    let storage: Arc<dyn KvStore> = MemoryKvStore::new_shared();
    let app = client_on(&hub, "app", Some(Arc::clone(&storage))).await;
    let wallet = client_on(&hub, "wallet", None).await;

    let (app_session, _) =
        establish_session(&app, &wallet, permissions(&["eth_sign"]), vec![]).await;
    let topic = app_session.topic;

    // Storage reflects the settlement before we tear the client down.
    let settled_bytes = storage
        .get("wc@2:client//session:settled")
        .await
        .expect("read")
        .expect("settled table exists");
    assert!(String::from_utf8_lossy(&settled_bytes).contains(&topic.to_string()));

    drop(app);

    // A fresh client over the same storage rehydrates and resumes.
    let revived = client_on(&hub, "app", Some(storage)).await;
    let session = revived.session_of(topic).expect("rehydrated session");
    assert_eq!(session.topic, topic);
    assert!(session.controller);

    revived.ping(topic).await.expect("ping over rehydrated subscription");
}

#[tokio::test]
async fn connect_with_unknown_pairing_topic_fails() {
    let (_hub, app, _wallet) = two_clients().await;
    let err = app
        .connect(ConnectParams {
            pairing_topic: Some(wcp_crypto::Topic::generate()),
            permissions: permissions(&["eth_sign"]),
        })
        .await
        .expect_err("unknown pairing");
    assert!(matches!(err, ClientError::NoMatchingTopic(_)));
}

#[tokio::test]
async fn connect_requires_a_nonempty_method_set() {
    let (_hub, app, _wallet) = two_clients().await;
    let err = app
        .connect(ConnectParams { pairing_topic: None, permissions: permissions(&[]) })
        .await
        .expect_err("empty methods");
    assert!(matches!(err, ClientError::InvalidPermissions(_)), "got {err:?}");
}

#[tokio::test]
async fn second_session_over_the_same_pairing() {
    let (_hub, app, wallet) = two_clients().await;
    let (first, _) =
        establish_session(&app, &wallet, permissions(&["eth_sign"]), vec![]).await;
    let mut wallet_events = wallet.subscribe();

    let pairing_topic = app.pairing_topics()[0];
    let connecting = {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            app.connect(ConnectParams {
                pairing_topic: Some(pairing_topic),
                permissions: permissions(&["personal_sign"]),
            })
            .await
        })
    };

    let proposal: SessionProposal = next_event(&mut wallet_events, |e| match e {
        ClientEvent::SessionProposal { proposal } => Some(proposal),
        _ => None,
    })
    .await;
    assert!(proposal.permissions.jsonrpc.methods.contains("personal_sign"));
    let wallet_second = wallet
        .approve(proposal, SessionState::default())
        .await
        .expect("approve second");
    let app_second = connecting.await.expect("join").expect("connect");

    assert_eq!(app_second.topic, wallet_second.topic);
    assert_ne!(app_second.topic, first.topic);
    // Both sessions and the pairing stay live side by side.
    assert!(app.session_of(first.topic).is_ok());
    assert!(app.session_of(app_second.topic).is_ok());
}
