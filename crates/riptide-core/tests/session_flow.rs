//! End-to-end session behavior over in-memory transports: ordered patch
//! delivery, detach and resume with replay, resync fallbacks, panic
//! containment and restore through the persistence bridge.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use riptide_core::manager::{ConnectKind, ResumeClaim};
use riptide_core::session::Phase;
use riptide_core::store::MemorySessionStore;

use common::{
    engine_config, harness, harness_with_store, open, open_with_capacity, wait_for,
};

#[test_timeout::tokio_timeout_test]
async fn fresh_connect_acks_then_streams_ordered_patches() {
    let h = harness(engine_config());
    let (connected, client) = open(&h.manager, 1, None).await;
    assert_eq!(connected.kind, ConnectKind::Created);
    assert_eq!(connected.base_seq, 0);

    // ack always lands before any patch
    let ack = client.recv().await;
    assert_eq!(ack["type"], "handshake_ack");
    assert_eq!(ack["session_id"], connected.session.id());
    assert_eq!(ack["resumed"], false);
    assert_eq!(ack["base_seq"], 0);

    let (seq, payload) = client.recv_patch().await;
    assert_eq!(seq, 1);
    assert_eq!(payload["full"], true);
    assert_eq!(payload["count"], 0);

    for expect in 1..=4u64 {
        client.send_event("counter", "inc", json!({})).await;
        let (seq, payload) = client.recv_patch().await;
        assert_eq!(seq, expect + 1);
        assert_eq!(payload["count"], expect);
        assert_eq!(payload["full"], false);
    }
    assert_eq!(connected.session.seq(), 5);
    assert_eq!(connected.session.get_data("events_handled"), Some(json!(4)));
}

#[test_timeout::tokio_timeout_test]
async fn keepalive_ping_draws_a_pong_and_refreshes_liveness() {
    let h = harness(engine_config());
    let (connected, client) = open(&h.manager, 1, None).await;
    let session = connected.session.clone();
    client.recv().await; // ack
    client.recv_patch().await; // seq 1

    let before = session.last_active();
    tokio::time::sleep(Duration::from_millis(25)).await;
    client.send_ping().await;
    let frame = client.recv().await;
    assert_eq!(frame["type"], "pong");
    assert!(session.last_active() > before);
    // A keepalive never produces a patch.
    assert_eq!(session.seq(), 1);

    // The client's own pong replies count as liveness too.
    let before = session.last_active();
    tokio::time::sleep(Duration::from_millis(25)).await;
    client.send_raw(json!({ "type": "pong" })).await;
    wait_for("pong to refresh liveness", || session.last_active() > before).await;
    assert!(matches!(session.phase(), Phase::Active));
}

#[test_timeout::tokio_timeout_test]
async fn resume_replays_only_the_missing_patches() {
    let h = harness(engine_config());
    let (connected, client) = open(&h.manager, 1, None).await;
    let session = connected.session.clone();
    client.recv().await;
    client.recv_patch().await; // seq 1
    for _ in 0..4 {
        client.send_event("counter", "inc", json!({})).await;
        client.recv_patch().await; // seq 2..=5
    }
    client.shutdown();
    wait_for("detach", || matches!(session.phase(), Phase::Detached { .. })).await;

    // the client crashed after applying seq 3
    let claim = ResumeClaim { session_id: session.id().to_string(), last_ack: 3 };
    let (reconnected, client) = open(&h.manager, 1, Some(claim)).await;
    assert_eq!(reconnected.kind, ConnectKind::Resumed { replayed: 2 });
    assert_eq!(reconnected.base_seq, 3);
    assert!(Arc::ptr_eq(&reconnected.session, &session));

    let ack = client.recv().await;
    assert_eq!(ack["resumed"], true);
    assert_eq!(ack["base_seq"], 3);
    assert_eq!(ack["replayed"], 2);

    let (seq, payload) = client.recv_patch().await;
    assert_eq!(seq, 4);
    assert_eq!(payload["count"], 3);
    let (seq, payload) = client.recv_patch().await;
    assert_eq!(seq, 5);
    assert_eq!(payload["count"], 4);

    // live patches continue where the replay left off
    client.send_event("counter", "inc", json!({})).await;
    let (seq, payload) = client.recv_patch().await;
    assert_eq!(seq, 6);
    assert_eq!(payload["count"], 5);

    // the same view served the whole session
    assert_eq!(h.views.created().len(), 1);
    assert_eq!(h.views.last().resyncs(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn resume_outside_history_window_forces_resync() {
    let mut config = engine_config();
    config.patch_history_capacity = 4;
    let h = harness(config);
    let (connected, client) = open(&h.manager, 1, None).await;
    let session = connected.session.clone();
    client.recv().await;
    client.recv_patch().await; // seq 1
    for _ in 0..6 {
        client.send_event("counter", "inc", json!({})).await;
        client.recv_patch().await; // up to seq 7; ring now holds 4..=7
    }
    client.shutdown();
    wait_for("detach", || matches!(session.phase(), Phase::Detached { .. })).await;

    let claim = ResumeClaim { session_id: session.id().to_string(), last_ack: 1 };
    let (reconnected, client) = open(&h.manager, 1, Some(claim)).await;
    assert_eq!(reconnected.kind, ConnectKind::Resynced);
    assert_eq!(reconnected.base_seq, 7);

    let ack = client.recv().await;
    assert_eq!(ack["resumed"], true);
    assert_eq!(ack["base_seq"], 7);
    assert_eq!(ack["replayed"], 0);

    assert_eq!(h.views.last().resyncs(), 1);
    let (seq, payload) = client.recv_patch().await;
    assert_eq!(seq, 8);
    assert_eq!(payload["full"], true);
}

#[test_timeout::tokio_timeout_test]
async fn ack_ahead_of_server_forces_resync() {
    let h = harness(engine_config());
    let (connected, client) = open(&h.manager, 1, None).await;
    let session = connected.session.clone();
    client.recv().await;
    client.recv_patch().await; // seq 1
    client.shutdown();
    wait_for("detach", || matches!(session.phase(), Phase::Detached { .. })).await;

    // an ack the server never issued cannot be trusted
    let claim = ResumeClaim { session_id: session.id().to_string(), last_ack: 99 };
    let (reconnected, client) = open(&h.manager, 1, Some(claim)).await;
    assert_eq!(reconnected.kind, ConnectKind::Resynced);
    assert_eq!(reconnected.base_seq, 1);
    let ack = client.recv().await;
    assert_eq!(ack["base_seq"], 1);
    assert_eq!(h.views.last().resyncs(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn handler_panic_is_contained() {
    let h = harness(engine_config());
    let (connected, client) = open(&h.manager, 1, None).await;
    client.recv().await;
    client.recv_patch().await; // seq 1
    h.views.last().panic_on("boom");

    client.send_event("counter", "boom", json!({})).await;
    client.send_event("counter", "inc", json!({})).await;
    let (seq, payload) = client.recv_patch().await;
    assert_eq!(seq, 2);
    assert_eq!(payload["count"], 1);
    assert!(matches!(connected.session.phase(), Phase::Active));
}

#[test_timeout::tokio_timeout_test]
async fn stalled_client_is_detached_on_write_timeout() {
    let mut config = engine_config();
    config.write_timeout = Duration::from_millis(100);
    let h = harness(config);
    // capacity 1: a single undrained frame stalls the link
    let (connected, client) = open_with_capacity(&h.manager, 1, None, 1).await;
    client.recv().await; // ack
    // stop reading: the initial patch fills the buffer and the next write
    // hits the deadline
    client.send_event("counter", "inc", json!({})).await;
    wait_for("write-timeout detach", || {
        matches!(connected.session.phase(), Phase::Detached { .. })
    })
    .await;
}

#[test_timeout::tokio_timeout_test]
async fn detached_session_restores_from_store_after_registry_loss() {
    let store = Arc::new(MemorySessionStore::new(16));
    let config = engine_config();
    let h = harness_with_store(config.clone(), Some(store.clone()));
    let (connected, client) = open(&h.manager, 1, None).await;
    let session = connected.session.clone();
    let id = session.id().to_string();
    client.recv().await;
    client.recv_patch().await; // seq 1
    for _ in 0..2 {
        client.send_event("counter", "inc", json!({})).await;
        client.recv_patch().await; // seq 2, 3
    }
    client.shutdown();
    wait_for("detach persisted", || store.len() == 1).await;

    // the first manager drops the session entirely
    assert_eq!(h.manager.evict_lru(1), 1);
    wait_for("evicted", || session.is_closed()).await;

    // a new manager sharing the store rebuilds it from the record
    let h2 = harness_with_store(config, Some(store.clone()));
    let claim = ResumeClaim { session_id: id.clone(), last_ack: 3 };
    let (restored, client) = open(&h2.manager, 1, Some(claim)).await;
    assert_eq!(restored.kind, ConnectKind::Restored);
    assert_eq!(restored.session.id(), id);
    assert_eq!(restored.base_seq, 3);

    let ack = client.recv().await;
    assert_eq!(ack["resumed"], true);
    assert_eq!(ack["base_seq"], 3);
    assert_eq!(ack["replayed"], 0);

    // kv data survived; the sequence continues past the persisted point,
    // and the replay buffer did not survive, so the client gets a full
    // document regardless of its ack
    assert_eq!(restored.session.get_data("events_handled"), Some(json!(2)));
    assert_eq!(h2.views.last().resyncs(), 1);
    let (seq, payload) = client.recv_patch().await;
    assert_eq!(seq, 4);
    assert_eq!(payload["full"], true);

    client.send_event("counter", "inc", json!({})).await;
    let (seq, _) = client.recv_patch().await;
    assert_eq!(seq, 5);
}
