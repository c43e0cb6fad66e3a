//! Integration tests for the sync service event pipeline.
//!
//! These drive `SyncService` exactly as the gateway does (connect, message,
//! disconnect) with in-memory collaborators, and read fan-out through the
//! channel transport.

use std::sync::Arc;

use collab_sync::auth::{AccessValidator, Identity, StaticAuthorizer, StaticIdentityService};
use collab_sync::config::ServerConfig;
use collab_sync::error::EventStatus;
use collab_sync::protocol::{AwarenessMessage, AwarenessState, Cursor, Envelope};
use collab_sync::registry::{unix_millis, ConnectionRegistry, DocumentKey};
use collab_sync::replica::{Replica, YrsReplica};
use collab_sync::router::MessageOutcome;
use collab_sync::service::SyncService;
use collab_sync::storage::MemoryPersistence;
use tokio::sync::mpsc;
use tokio::time::Duration;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, WriteTxn};

type Outbound = mpsc::Receiver<Arc<Vec<u8>>>;

fn identity(principal: &str, tenant: &str, ttl_ms: i64) -> Identity {
    Identity {
        principal_id: principal.into(),
        tenant_id: tenant.into(),
        role: "editor".into(),
        display_name: Some(principal.to_uppercase()),
        expires_at: (unix_millis() as i64 + ttl_ms) as u64,
    }
}

fn validator() -> AccessValidator {
    AccessValidator::new(
        Arc::new(
            StaticIdentityService::new()
                .with_token("alice", identity("alice", "tenantX", 3_600_000))
                .with_token("bob", identity("bob", "tenantX", 3_600_000))
                .with_token("carol", identity("carol", "tenantX", 3_600_000))
                .with_token("mallory", identity("mallory", "tenantY", 3_600_000))
                .with_token("expired", identity("alice", "tenantX", -60_000)),
        ),
        Arc::new(
            StaticAuthorizer::new()
                .allow("alice", "tenantX", "doc-1")
                .allow("bob", "tenantX", "doc-1")
                .allow("carol", "tenantX", "doc-2")
                .allow("mallory", "tenantY", "doc-1"),
        ),
    )
}

fn doc1() -> DocumentKey {
    DocumentKey::new("tenantX", "doc-1")
}

struct Fixture {
    service: SyncService,
    persistence: Arc<MemoryPersistence>,
}

fn fixture(config: ServerConfig) -> Fixture {
    let persistence = Arc::new(MemoryPersistence::new());
    let service = SyncService::new(
        config,
        validator(),
        ConnectionRegistry::in_memory(),
        persistence.clone(),
    );
    Fixture {
        service,
        persistence,
    }
}

/// Connect `token` to `document`, returning the handle and its outbound queue.
async fn connect(service: &SyncService, token: &str, document: &str) -> (Uuid, Outbound) {
    let id = Uuid::new_v4();
    let rx = service.transport().open(id).await;
    service
        .handle_connect(id, Some(token), document)
        .await
        .expect("connect should succeed");
    (id, rx)
}

/// Insert text into a client-side doc and return the incremental update.
fn edit(doc: &Doc, content: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.len(&txn);
        text.insert(&mut txn, len, content);
    }
    doc.transact().encode_diff_v1(&before)
}

fn text_of(doc: &Doc) -> String {
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

fn merge_into(doc: &Doc, update: &[u8]) {
    let update = yrs::Update::decode_v1(update).unwrap();
    doc.transact_mut().apply_update(update).unwrap();
}

fn drain(rx: &mut Outbound) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame.to_vec());
    }
    frames
}

fn awareness(frame: &[u8]) -> AwarenessMessage {
    match Envelope::decode(frame).unwrap() {
        Envelope::Presence(payload) => AwarenessMessage::decode(&payload).unwrap(),
        other => panic!("expected PRESENCE frame, got {other:?}"),
    }
}

// ─── Example scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn test_connect_creates_session_and_presence() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;

    let session = f.service.registry().get(a).await.unwrap().unwrap();
    assert_eq!(session.tenant_id, "tenantX");
    assert_eq!(session.principal_id, "alice");

    let presence = f.service.list_presence(&doc1()).await;
    assert_eq!(presence.len(), 1);
    assert_eq!(presence[0].principal_id, "alice");
    assert_eq!(presence[0].display_name, "ALICE");
}

#[tokio::test]
async fn test_sync_request_returns_state_written_by_peer() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (b, _rx_b) = connect(&f.service, "bob", "doc-1").await;

    let doc_b = Doc::new();
    let update = edit(&doc_b, "written by B");
    let status = f
        .service
        .message_status(b, &Envelope::Update(update).encode())
        .await;
    assert_eq!(status, EventStatus::Ok);

    let outcome = f
        .service
        .handle_message(a, &Envelope::SyncRequest(Vec::new()).encode())
        .await
        .unwrap();
    let MessageOutcome::Reply(reply) = outcome else {
        panic!("expected reply, got {outcome:?}");
    };
    let Envelope::SyncFull(state) = Envelope::decode(&reply).unwrap() else {
        panic!("expected SYNC_FULL");
    };

    let doc_a = Doc::new();
    merge_into(&doc_a, &state);
    assert_eq!(text_of(&doc_a), text_of(&doc_b));
    assert_eq!(
        doc_a.transact().state_vector(),
        doc_b.transact().state_vector()
    );
}

#[tokio::test(start_paused = true)]
async fn test_update_persisted_after_debounce() {
    let config = ServerConfig {
        debounce: Duration::from_secs(30),
        ..ServerConfig::for_testing()
    };
    let f = fixture(config);
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;

    let client = Doc::new();
    let frame = Envelope::Update(edit(&client, "u1")).encode();
    assert_eq!(f.service.message_status(a, &frame).await, EventStatus::Ok);
    assert!(f.persistence.get(&doc1()).is_none());

    tokio::time::sleep(Duration::from_secs(31)).await;

    let row = f.persistence.get(&doc1()).expect("state persisted");
    assert_eq!((row.tenant_id.as_str(), row.document_id.as_str()), ("tenantX", "doc-1"));
    let mut replica = YrsReplica::new();
    replica.merge(&row.encoded_state).unwrap();
    assert_eq!(replica.text("content"), "u1");
    assert_eq!(f.persistence.save_count(), 1);
}

#[tokio::test]
async fn test_disconnect_removes_presence_keeps_document() {
    let f = fixture(ServerConfig::for_testing());
    let (_a, mut rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (b, _rx_b) = connect(&f.service, "bob", "doc-1").await;
    drain(&mut rx_a);

    assert_eq!(f.service.disconnect_status(b).await, EventStatus::Ok);

    let presence = f.service.list_presence(&doc1()).await;
    assert_eq!(presence.len(), 1);
    assert!(presence.iter().all(|p| p.connection_id != b));
    assert!(f.service.cache().contains(&doc1()).await);

    let frames = drain(&mut rx_a);
    assert_eq!(frames.len(), 1);
    match awareness(&frames[0]) {
        AwarenessMessage::Left {
            connection_id,
            principal_id,
        } => {
            assert_eq!(connection_id, b);
            assert_eq!(principal_id, "bob");
        }
        other => panic!("expected Left, got {other:?}"),
    }
}

#[tokio::test]
async fn test_expired_credential_rejected_without_side_effects() {
    let f = fixture(ServerConfig::for_testing());
    let id = Uuid::new_v4();

    let status = f.service.connect_status(id, Some("expired"), "doc-1").await;
    assert_eq!(status, EventStatus::Unauthorized);
    assert!(f.service.registry().get(id).await.unwrap().is_none());
    assert_eq!(f.persistence.load_count(), 0);
    assert!(f.service.list_presence(&doc1()).await.is_empty());
}

#[tokio::test]
async fn test_unknown_tag_rejected_without_mutation() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;
    let before = f.service.cache().encode_state(&doc1()).await.unwrap();

    let status = f.service.message_status(a, &[0xAB, 0x01, 0x02]).await;
    assert_eq!(status, EventStatus::BadRequest);
    assert_eq!(f.service.cache().encode_state(&doc1()).await.unwrap(), before);
    assert!(!f.service.cache().has_pending_flush(&doc1()).await);
}

// ─── Properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_fan_out_scoped_to_document() {
    let f = fixture(ServerConfig::for_testing());
    let (a, mut rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (_b, mut rx_b) = connect(&f.service, "bob", "doc-1").await;
    let (_c, mut rx_c) = connect(&f.service, "carol", "doc-2").await;
    drain(&mut rx_a);
    drain(&mut rx_b);
    drain(&mut rx_c);

    let frame = Envelope::Update(edit(&Doc::new(), "scoped")).encode();
    f.service.handle_message(a, &frame).await.unwrap();

    assert_eq!(drain(&mut rx_b), vec![frame]);
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_c).is_empty());
}

#[tokio::test]
async fn test_tenant_isolation() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (m, mut rx_m) = connect(&f.service, "mallory", "doc-1").await;
    drain(&mut rx_m);

    f.service
        .handle_message(a, &Envelope::Update(edit(&Doc::new(), "secret")).encode())
        .await
        .unwrap();
    assert!(drain(&mut rx_m).is_empty());

    // Same document id, other tenant: mallory sees an empty document.
    let outcome = f
        .service
        .handle_message(m, &Envelope::SyncRequest(Vec::new()).encode())
        .await
        .unwrap();
    let MessageOutcome::Reply(reply) = outcome else {
        panic!("expected reply");
    };
    let Envelope::SyncFull(state) = Envelope::decode(&reply).unwrap() else {
        panic!("expected SYNC_FULL");
    };
    let doc = Doc::new();
    merge_into(&doc, &state);
    assert_eq!(text_of(&doc), "");

    // Cross-tenant authorization is refused outright.
    let id = Uuid::new_v4();
    assert_eq!(
        f.service.connect_status(id, Some("mallory"), "doc-2").await,
        EventStatus::Forbidden
    );
    assert!(f.service.registry().get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let f = fixture(ServerConfig::for_testing());
    let (a, mut rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (b, mut rx_b) = connect(&f.service, "bob", "doc-1").await;
    drain(&mut rx_a);

    let doc_a = Doc::with_client_id(1);
    let doc_b = Doc::with_client_id(2);
    let ua = edit(&doc_a, "from A");
    let ub = edit(&doc_b, "from B");

    // Both edits were made before either saw the other.
    f.service
        .handle_message(a, &Envelope::Update(ua).encode())
        .await
        .unwrap();
    f.service
        .handle_message(b, &Envelope::Update(ub).encode())
        .await
        .unwrap();

    for frame in drain(&mut rx_a) {
        if let Envelope::Update(update) = Envelope::decode(&frame).unwrap() {
            merge_into(&doc_a, &update);
        }
    }
    for frame in drain(&mut rx_b) {
        if let Envelope::Update(update) = Envelope::decode(&frame).unwrap() {
            merge_into(&doc_b, &update);
        }
    }

    let server_state = f.service.cache().encode_state(&doc1()).await.unwrap();
    let server = Doc::new();
    merge_into(&server, &server_state);

    assert_eq!(text_of(&doc_a), text_of(&doc_b));
    assert_eq!(text_of(&doc_a), text_of(&server));
    assert_eq!(text_of(&doc_a).len(), "from Afrom B".len());
}

#[tokio::test]
async fn test_duplicate_update_is_idempotent() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;
    let frame = Envelope::SyncFull(edit(&Doc::new(), "once")).encode();

    f.service.handle_message(a, &frame).await.unwrap();
    let after_first = f.service.cache().digest(&doc1()).await.unwrap();
    f.service.handle_message(a, &frame).await.unwrap();

    assert_eq!(f.service.cache().digest(&doc1()).await.unwrap(), after_first);
    let state = f.service.cache().encode_state(&doc1()).await.unwrap();
    let doc = Doc::new();
    merge_into(&doc, &state);
    assert_eq!(text_of(&doc), "once");
}

#[tokio::test]
async fn test_sync_request_with_digest_returns_only_missing() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;
    let client = Doc::new();
    f.service
        .handle_message(a, &Envelope::Update(edit(&client, "known")).encode())
        .await
        .unwrap();

    // A peer that already has "known" asks for what it lacks.
    let peer = Doc::new();
    merge_into(&peer, &client.transact().encode_state_as_update_v1(&StateVector::default()));
    f.service
        .handle_message(a, &Envelope::Update(edit(&client, " new")).encode())
        .await
        .unwrap();

    let digest = peer.transact().state_vector().encode_v1();
    let MessageOutcome::Reply(reply) = f
        .service
        .handle_message(a, &Envelope::SyncRequest(digest).encode())
        .await
        .unwrap()
    else {
        panic!("expected reply");
    };
    let Envelope::SyncFull(missing) = Envelope::decode(&reply).unwrap() else {
        panic!("expected SYNC_FULL");
    };
    merge_into(&peer, &missing);
    assert_eq!(text_of(&peer), "known new");
}

#[tokio::test]
async fn test_presence_cursor_broadcast() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (_b, mut rx_b) = connect(&f.service, "bob", "doc-1").await;
    drain(&mut rx_b);

    let blob = AwarenessState {
        cursor: Some(Cursor { anchor: 2, head: 5 }),
    }
    .encode()
    .unwrap();
    assert_eq!(
        f.service
            .message_status(a, &Envelope::Presence(blob).encode())
            .await,
        EventStatus::Ok
    );

    let frames = drain(&mut rx_b);
    assert_eq!(frames.len(), 1);
    let AwarenessMessage::Updated(peer) = awareness(&frames[0]) else {
        panic!("expected Updated");
    };
    assert_eq!(peer.connection_id, a);
    assert_eq!(peer.principal_id, "alice");
    assert_eq!(peer.cursor, Some(Cursor { anchor: 2, head: 5 }));

    let listed = f.service.list_presence(&doc1()).await;
    let alice = listed.iter().find(|p| p.connection_id == a).unwrap();
    assert_eq!(alice.cursor, Some(Cursor { anchor: 2, head: 5 }));
}

#[tokio::test]
async fn test_join_announced_to_existing_peers() {
    let f = fixture(ServerConfig::for_testing());
    let (_a, mut rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (b, _rx_b) = connect(&f.service, "bob", "doc-1").await;

    let frames = drain(&mut rx_a);
    assert_eq!(frames.len(), 1);
    let AwarenessMessage::Joined(peer) = awareness(&frames[0]) else {
        panic!("expected Joined");
    };
    assert_eq!(peer.connection_id, b);
    assert_eq!(peer.display_name, "BOB");
}

#[tokio::test]
async fn test_message_after_disconnect_is_404() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;
    f.service.handle_disconnect(a).await;

    let status = f
        .service
        .message_status(a, &Envelope::SyncRequest(Vec::new()).encode())
        .await;
    assert_eq!(status, EventStatus::NotFound);
}

#[tokio::test]
async fn test_malformed_update_is_400() {
    let f = fixture(ServerConfig::for_testing());
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;
    assert_eq!(f.service.message_status(a, &[]).await, EventStatus::BadRequest);
    assert_eq!(
        f.service
            .message_status(a, &Envelope::Update(vec![0xff, 0xff, 0xff]).encode())
            .await,
        EventStatus::BadRequest
    );
}

#[tokio::test]
async fn test_disconnect_flushes_immediately() {
    let f = fixture(ServerConfig {
        debounce: Duration::from_secs(3600),
        ..ServerConfig::for_testing()
    });
    let (a, _rx) = connect(&f.service, "alice", "doc-1").await;
    f.service
        .handle_message(a, &Envelope::Update(edit(&Doc::new(), "saved")).encode())
        .await
        .unwrap();
    assert_eq!(f.persistence.save_count(), 0);

    f.service.handle_disconnect(a).await;
    assert_eq!(f.persistence.save_count(), 1);
    assert!(!f.service.cache().has_pending_flush(&doc1()).await);
}

#[tokio::test]
async fn test_shutdown_flushes_everything() {
    let f = fixture(ServerConfig {
        debounce: Duration::from_secs(3600),
        ..ServerConfig::for_testing()
    });
    let (a, _rx_a) = connect(&f.service, "alice", "doc-1").await;
    let (c, _rx_c) = connect(&f.service, "carol", "doc-2").await;
    for (id, text) in [(a, "one"), (c, "two")] {
        f.service
            .handle_message(id, &Envelope::Update(edit(&Doc::new(), text)).encode())
            .await
            .unwrap();
    }

    assert_eq!(f.service.shutdown().await, 2);
    assert!(f.persistence.get(&doc1()).is_some());
    assert!(f
        .persistence
        .get(&DocumentKey::new("tenantX", "doc-2"))
        .is_some());
}
