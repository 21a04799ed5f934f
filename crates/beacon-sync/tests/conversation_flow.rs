//! Integration tests for conversation resolution.
//!
//! Real `SQLite` replicas and a shared in-memory remote store — no mocking.
//! Each engine plays one device; several engines sharing a [`MemoryRemote`]
//! play several users.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_remote::{MemoryRemote, RemotePath, RemoteStore};
use beacon_sync::{
    create_pool, AllowAll, NullNotifier, RecipientPolicy, StaticIdentity, SyncConfig, SyncEngine,
    SyncError, SyncStatus, ValidationError,
};
use serde_json::json;

/// Opt-in log output: `RUST_LOG=beacon_sync=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn engine_for(user: &str, remote: &MemoryRemote) -> SyncEngine {
    init_tracing();
    let pool = create_pool(":memory:").await.expect("in-memory SQLite").pool;
    SyncEngine::new(
        SyncConfig::fast(),
        pool,
        Arc::new(remote.clone()),
        Arc::new(StaticIdentity::signed_in(user)),
        Arc::new(AllowAll),
        Arc::new(NullNotifier),
    )
}

/// Poll until the local record reaches the given sync state.
async fn wait_for_conversation_sync(engine: &SyncEngine, id: &str, status: SyncStatus) -> bool {
    for _ in 0..300 {
        if let Ok(Some(conv)) = engine.conversation(id).await {
            if conv.sync_status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ── Deterministic identity ───────────────────────────────────────────

#[tokio::test]
async fn both_sides_resolve_the_same_conversation() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;
    let bob = engine_for("bob", &remote).await;

    let a = alice.create_or_get_conversation("bob").await.unwrap();
    let b = bob.create_or_get_conversation("alice").await.unwrap();

    assert_eq!(a.id, b.id);
    assert_eq!(a.id, "alice_bob");
    assert_eq!(a.participant_ids, vec!["alice", "bob"]);
    assert!(!a.is_group);
}

#[tokio::test]
async fn create_reaches_the_remote_store() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    let conv = alice.create_or_get_conversation("bob").await.unwrap();
    assert_eq!(conv.sync_status, SyncStatus::Pending);

    assert!(
        wait_for_conversation_sync(&alice, &conv.id, SyncStatus::Synced).await,
        "conversation should sync"
    );
    let value = remote
        .get(&RemotePath::conversation(&conv.id))
        .await
        .unwrap()
        .expect("remote record should exist");
    assert_eq!(value["id"], json!(conv.id));
    assert_eq!(value["participantIds"], json!(["alice", "bob"]));
    assert_eq!(value["isGroup"], json!(false));
    // Presentation state never travels.
    assert!(value.get("isPinned").is_none());
    assert!(value.get("unreadCount").is_none());
}

#[tokio::test]
async fn repeated_create_returns_the_existing_record() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    let first = alice.create_or_get_conversation("bob").await.unwrap();
    wait_for_conversation_sync(&alice, &first.id, SyncStatus::Synced).await;
    let second = alice.create_or_get_conversation("bob").await.unwrap();

    assert_eq!(first.id, second.id);
    let all = alice.conversations(true).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn create_adopts_an_existing_remote_record() {
    let remote = MemoryRemote::default();
    remote
        .write(
            &RemotePath::conversation("alice_bob"),
            json!({
                "id": "alice_bob",
                "participantIds": ["alice", "bob"],
                "isGroup": false,
                "displayName": "Seeded",
                "createdAt": 1_000,
                "updatedAt": 1_000,
            }),
        )
        .await
        .unwrap();

    let alice = engine_for("alice", &remote).await;
    let conv = alice.create_or_get_conversation("bob").await.unwrap();

    // Adopted, not recreated: synced immediately, remote fields kept.
    assert_eq!(conv.sync_status, SyncStatus::Synced);
    assert_eq!(conv.display_name.as_deref(), Some("Seeded"));
    assert_eq!(conv.created_at, 1_000);
}

#[tokio::test]
async fn concurrent_creation_converges_on_one_record() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;
    let bob = engine_for("bob", &remote).await;

    let (a, b) = tokio::join!(
        alice.create_or_get_conversation("bob"),
        bob.create_or_get_conversation("alice"),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.id, b.id);

    assert!(wait_for_conversation_sync(&alice, &a.id, SyncStatus::Synced).await);
    assert!(wait_for_conversation_sync(&bob, &b.id, SyncStatus::Synced).await);

    let collection = remote
        .get(&RemotePath::Conversations)
        .await
        .unwrap()
        .expect("collection should exist");
    assert_eq!(collection.as_object().unwrap().len(), 1);
}

// ── Validation ───────────────────────────────────────────────────────

#[tokio::test]
async fn create_without_identity_writes_nothing() {
    let remote = MemoryRemote::default();
    let pool = create_pool(":memory:").await.unwrap().pool;
    let engine = SyncEngine::new(
        SyncConfig::fast(),
        pool,
        Arc::new(remote.clone()),
        Arc::new(StaticIdentity::signed_out()),
        Arc::new(AllowAll),
        Arc::new(NullNotifier),
    );

    let err = engine.create_or_get_conversation("bob").await.unwrap_err();
    assert!(matches!(err, SyncError::NoIdentity));

    assert!(engine.conversations(true).await.unwrap().is_empty());
    assert!(remote.get(&RemotePath::Conversations).await.unwrap().is_none());
}

struct DenyEverything;

#[async_trait]
impl RecipientPolicy for DenyEverything {
    async fn check(&self, _sender: &str, _recipients: &[String]) -> Result<(), ValidationError> {
        Err(ValidationError::PolicyDenied("denied by test policy".into()))
    }
}

#[tokio::test]
async fn policy_denial_writes_nothing() {
    let remote = MemoryRemote::default();
    let pool = create_pool(":memory:").await.unwrap().pool;
    let engine = SyncEngine::new(
        SyncConfig::fast(),
        pool,
        Arc::new(remote.clone()),
        Arc::new(StaticIdentity::signed_in("alice")),
        Arc::new(DenyEverything),
        Arc::new(NullNotifier),
    );

    let err = engine.create_or_get_conversation("bob").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(ValidationError::PolicyDenied(_))
    ));

    assert!(engine.conversations(true).await.unwrap().is_empty());
    assert!(remote.get(&RemotePath::Conversations).await.unwrap().is_none());
}

#[tokio::test]
async fn conversation_with_oneself_is_rejected() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    let err = alice.create_or_get_conversation("alice").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(ValidationError::SelfMessage)
    ));
}

#[tokio::test]
async fn blank_recipient_is_rejected() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    let err = alice.create_or_get_conversation("   ").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(ValidationError::UnknownRecipient(_))
    ));
}

// ── Groups ───────────────────────────────────────────────────────────

#[tokio::test]
async fn group_create_round_trips() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    let conv = alice
        .create_group_conversation(
            &["carol".to_string(), "bob".to_string()],
            Some("Trip".to_string()),
        )
        .await
        .unwrap();

    assert!(conv.is_group);
    assert_eq!(conv.participant_ids, vec!["alice", "bob", "carol"]);
    assert_eq!(conv.display_name.as_deref(), Some("Trip"));

    assert!(wait_for_conversation_sync(&alice, &conv.id, SyncStatus::Synced).await);
    let value = remote
        .get(&RemotePath::conversation(&conv.id))
        .await
        .unwrap()
        .expect("remote record should exist");
    assert_eq!(value["isGroup"], json!(true));
    assert_eq!(value["displayName"], json!("Trip"));
}

#[tokio::test]
async fn group_without_other_members_is_rejected() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    // Own id and blanks do not count as members.
    let err = alice
        .create_group_conversation(&["alice".to_string(), "  ".to_string()], None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Validation(ValidationError::NoParticipants)
    ));
}

// ── Presentation state ───────────────────────────────────────────────

#[tokio::test]
async fn pin_and_archive_stay_local() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;
    let conv = alice.create_or_get_conversation("bob").await.unwrap();
    assert!(wait_for_conversation_sync(&alice, &conv.id, SyncStatus::Synced).await);

    alice.set_pinned(&conv.id, true).await.unwrap();
    alice.set_archived(&conv.id, true).await.unwrap();

    let local = alice.conversation(&conv.id).await.unwrap().unwrap();
    assert!(local.is_pinned);
    assert!(local.is_archived);

    // Archived conversations drop out of the default listing.
    assert!(alice.conversations(false).await.unwrap().is_empty());
    assert_eq!(alice.conversations(true).await.unwrap().len(), 1);

    // The remote record never saw any of it.
    let value = remote
        .get(&RemotePath::conversation(&conv.id))
        .await
        .unwrap()
        .unwrap();
    assert!(value.get("isPinned").is_none());
    assert!(value.get("isArchived").is_none());
}

#[tokio::test]
async fn pinned_conversations_list_first() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    let older = alice.create_or_get_conversation("bob").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = alice.create_or_get_conversation("carol").await.unwrap();

    let listed = alice.conversations(false).await.unwrap();
    assert_eq!(listed[0].id, newer.id, "most recent first");

    alice.set_pinned(&older.id, true).await.unwrap();
    let listed = alice.conversations(false).await.unwrap();
    assert_eq!(listed[0].id, older.id, "pinned outranks recency");
}

#[tokio::test]
async fn presentation_updates_on_unknown_conversations_error() {
    let remote = MemoryRemote::default();
    let alice = engine_for("alice", &remote).await;

    let err = alice.set_pinned("missing", true).await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownConversation(_)));
    let err = alice.set_archived("missing", true).await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownConversation(_)));
}
