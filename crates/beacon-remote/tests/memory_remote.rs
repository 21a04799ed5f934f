//! Behavior tests for the in-process remote store: write/update/get
//! semantics, sentinel substitution, replay-then-live subscriptions, and
//! fault injection.

use std::time::Duration;

use serde_json::{json, Map, Value};

use beacon_remote::{
    wire, MemoryRemote, RemoteError, RemoteEvent, RemotePath, RemoteStore, Subscription,
    WireMessage, WireStatus,
};

async fn next_event(sub: &mut Subscription) -> RemoteEvent {
    tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("timed out waiting for remote event")
        .expect("subscription closed unexpectedly")
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

// ── Write / get ────────────────────────────────────────────────────────────

#[tokio::test]
async fn write_then_get_round_trips_records_and_collections() {
    let remote = MemoryRemote::new();
    let conv = RemotePath::conversation("a_b");

    remote
        .write(&conv, json!({ "id": "a_b", "isGroup": false }))
        .await
        .unwrap();

    let record = remote.get(&conv).await.unwrap().unwrap();
    assert_eq!(record["id"], json!("a_b"));

    let collection = remote.get(&RemotePath::Conversations).await.unwrap().unwrap();
    assert_eq!(collection["a_b"]["isGroup"], json!(false));

    // A location never written reads as absent.
    assert!(remote
        .get(&RemotePath::conversation("nope"))
        .await
        .unwrap()
        .is_none());
    assert!(remote
        .get(&RemotePath::conversation_messages("nope"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn write_rejects_collection_paths() {
    let remote = MemoryRemote::new();
    let err = remote
        .write(&RemotePath::Conversations, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::InvalidPath(_)));
}

#[tokio::test]
async fn sentinels_are_substituted_at_commit() {
    let remote = MemoryRemote::new();
    let messages = RemotePath::conversation_messages("a_b");

    for (n, id) in ["m1", "m2"].iter().enumerate() {
        let value = WireMessage::outgoing(id, "a_b", "a", "hello", WireStatus::Sent);
        remote
            .write(&messages.child(id).unwrap(), value)
            .await
            .unwrap();

        let stored = remote
            .get(&messages.child(id).unwrap())
            .await
            .unwrap()
            .unwrap();
        let decoded = WireMessage::from_value(&stored).unwrap();
        assert!(decoded.server_timestamp > 0, "timestamp was substituted");
        assert_eq!(decoded.sequence_number, Some(n as i64 + 1));
    }
}

// ── Update ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn update_merges_fields_and_preserves_the_rest() {
    let remote = MemoryRemote::new();
    let msg = RemotePath::message("a_b", "m1");
    remote
        .write(&msg, json!({ "id": "m1", "text": "hi", "status": "sent" }))
        .await
        .unwrap();

    remote
        .update(&msg, fields(&[("status", json!("delivered"))]))
        .await
        .unwrap();

    let stored = remote.get(&msg).await.unwrap().unwrap();
    assert_eq!(stored["status"], json!("delivered"));
    assert_eq!(stored["text"], json!("hi"));
}

#[tokio::test]
async fn update_on_a_missing_record_upserts() {
    let remote = MemoryRemote::new();
    let msg = RemotePath::message("a_b", "ghost");
    remote
        .update(&msg, fields(&[("status", json!("read"))]))
        .await
        .unwrap();
    let stored = remote.get(&msg).await.unwrap().unwrap();
    assert_eq!(stored, json!({ "status": "read" }));
}

// ── Subscriptions ──────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_replays_existing_children_then_goes_live() {
    let remote = MemoryRemote::new();
    let messages = RemotePath::conversation_messages("a_b");
    remote
        .write(&messages.child("m1").unwrap(), json!({ "text": "first" }))
        .await
        .unwrap();
    remote
        .write(&messages.child("m2").unwrap(), json!({ "text": "second" }))
        .await
        .unwrap();

    let mut sub = remote.subscribe(&messages).await.unwrap();

    // Replay, in key order.
    match next_event(&mut sub).await {
        RemoteEvent::ChildAdded { key, value } => {
            assert_eq!(key, "m1");
            assert_eq!(value["text"], json!("first"));
        }
        other => panic!("expected replay of m1, got {other:?}"),
    }
    match next_event(&mut sub).await {
        RemoteEvent::ChildAdded { key, .. } => assert_eq!(key, "m2"),
        other => panic!("expected replay of m2, got {other:?}"),
    }

    // Live: a fresh child arrives as ChildAdded, an overwrite as ChildChanged.
    remote
        .write(&messages.child("m3").unwrap(), json!({ "text": "third" }))
        .await
        .unwrap();
    match next_event(&mut sub).await {
        RemoteEvent::ChildAdded { key, .. } => assert_eq!(key, "m3"),
        other => panic!("expected live add of m3, got {other:?}"),
    }

    remote
        .update(
            &messages.child("m1").unwrap(),
            fields(&[("text", json!("edited"))]),
        )
        .await
        .unwrap();
    match next_event(&mut sub).await {
        RemoteEvent::ChildChanged { key, value } => {
            assert_eq!(key, "m1");
            assert_eq!(value["text"], json!("edited"));
        }
        other => panic!("expected live change of m1, got {other:?}"),
    }
}

#[tokio::test]
async fn subscribe_rejects_record_paths() {
    let remote = MemoryRemote::new();
    let err = remote
        .subscribe(&RemotePath::conversation("a_b"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::InvalidPath(_)));
}

#[tokio::test]
async fn dropping_the_subscription_unregisters_the_watcher() {
    let remote = MemoryRemote::new();
    let messages = RemotePath::conversation_messages("a_b");

    let sub = remote.subscribe(&messages).await.unwrap();
    assert_eq!(remote.watcher_count(&messages), 1);

    drop(sub);
    assert_eq!(remote.watcher_count(&messages), 0);
}

#[tokio::test]
async fn cancellation_delivers_a_final_event_then_closes() {
    let remote = MemoryRemote::new();
    let messages = RemotePath::conversation_messages("a_b");
    let mut sub = remote.subscribe(&messages).await.unwrap();

    remote.cancel_subscriptions(&messages, "permission revoked");

    match next_event(&mut sub).await {
        RemoteEvent::Cancelled { reason } => assert_eq!(reason, "permission revoked"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(sub.recv().await.is_none(), "feed closes after cancellation");
    assert_eq!(remote.watcher_count(&messages), 0);
}

#[tokio::test]
async fn independent_collections_do_not_cross_talk() {
    let remote = MemoryRemote::new();
    let a = RemotePath::conversation_messages("a_b");
    let b = RemotePath::conversation_messages("b_c");
    let mut sub_a = remote.subscribe(&a).await.unwrap();

    remote
        .write(&b.child("m1").unwrap(), json!({ "text": "elsewhere" }))
        .await
        .unwrap();
    remote
        .write(&a.child("m2").unwrap(), json!({ "text": "here" }))
        .await
        .unwrap();

    match next_event(&mut sub_a).await {
        RemoteEvent::ChildAdded { key, .. } => assert_eq!(key, "m2"),
        other => panic!("expected only this collection's child, got {other:?}"),
    }
}

// ── Fault injection ────────────────────────────────────────────────────────

#[tokio::test]
async fn offline_gates_every_operation_until_cleared() {
    let remote = MemoryRemote::new();
    let conv = RemotePath::conversation("a_b");
    remote.set_offline(true);

    let err = remote.write(&conv, json!({ "id": "a_b" })).await.unwrap_err();
    assert!(matches!(err, RemoteError::Offline));
    assert!(err.is_transient());
    assert!(matches!(
        remote.get(&conv).await.unwrap_err(),
        RemoteError::Offline
    ));
    assert!(matches!(
        remote
            .update(&conv, fields(&[("updatedAt", json!(1))]))
            .await
            .unwrap_err(),
        RemoteError::Offline
    ));
    assert!(matches!(
        remote.subscribe(&RemotePath::Conversations).await.unwrap_err(),
        RemoteError::Offline
    ));

    remote.set_offline(false);
    remote.write(&conv, json!({ "id": "a_b" })).await.unwrap();
    assert!(remote.get(&conv).await.unwrap().is_some());
}

#[tokio::test]
async fn snapshot_and_subscription_overlap_rather_than_gap() {
    let remote = MemoryRemote::new();
    let messages = RemotePath::conversation_messages("a_b");
    remote
        .write(
            &messages.child("m1").unwrap(),
            WireMessage::outgoing("m1", "a_b", "a", "hi", WireStatus::Sent),
        )
        .await
        .unwrap();

    // The attach pattern used by sync: snapshot first, then subscribe. The
    // record present in the snapshot shows up again in the replay, so a
    // writer racing the attach can never fall between the two.
    let snapshot = remote.get(&messages).await.unwrap().unwrap();
    assert!(snapshot.as_object().unwrap().contains_key("m1"));

    let mut sub = remote.subscribe(&messages).await.unwrap();
    match next_event(&mut sub).await {
        RemoteEvent::ChildAdded { key, .. } => assert_eq!(key, "m1"),
        other => panic!("expected overlap replay, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_writers_converge_on_one_record() {
    let remote = MemoryRemote::new();
    let conv = RemotePath::conversation("a_b");
    let record = json!({
        "id": "a_b",
        "participantIds": ["a", "b"],
        "isGroup": false,
        "createdAt": wire::timestamp_sentinel(),
        "updatedAt": wire::timestamp_sentinel(),
    });

    let (left, right) = tokio::join!(
        remote.write(&conv, record.clone()),
        remote.write(&conv, record.clone())
    );
    left.unwrap();
    right.unwrap();

    let stored = remote.get(&RemotePath::Conversations).await.unwrap().unwrap();
    assert_eq!(stored.as_object().unwrap().len(), 1);
}
