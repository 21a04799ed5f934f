//! Local replica records: conversations, messages, and queued mutations.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_remote::{WireConversation, WireMessage, WireStatus};

use crate::status::DeliveryStatus;

/// Lifecycle of a locally-created record relative to the remote store.
///
/// Independent of [`DeliveryStatus`]: a message can be `Synced` while still
/// only `Sent`, and `Failed` here means the local write never reached the
/// remote, not that delivery failed downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Parse the database representation; unknown text reads as `Pending`
    /// (the conservative state — it only ever causes a redundant sync).
    pub fn parse(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Canonically sorted; immutable after creation for two-party
    /// conversations.
    pub participant_ids: Vec<String>,
    pub is_group: bool,
    pub display_name: Option<String>,
    pub photo_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Denormalized preview of the most recent message.
    pub last_message_text: Option<String>,
    pub last_message_at: Option<i64>,
    pub sync_status: SyncStatus,
    /// Local presentation state; never written to the remote record.
    pub is_pinned: bool,
    pub is_archived: bool,
    pub unread_count: u32,
}

impl Conversation {
    /// A fresh two-party conversation awaiting its remote write.
    pub fn direct(me: &str, other: &str, now: i64) -> Self {
        Self {
            id: direct_conversation_id(me, other),
            participant_ids: canonical_participants(me, [other.to_string()]),
            is_group: false,
            display_name: None,
            photo_ref: None,
            created_at: now,
            updated_at: now,
            last_message_text: None,
            last_message_at: None,
            sync_status: SyncStatus::Pending,
            is_pinned: false,
            is_archived: false,
            unread_count: 0,
        }
    }

    /// A fresh group conversation awaiting its remote write.
    pub fn group(me: &str, others: Vec<String>, display_name: Option<String>, now: i64) -> Self {
        Self {
            id: new_conversation_id(),
            participant_ids: canonical_participants(me, others),
            is_group: true,
            display_name,
            photo_ref: None,
            created_at: now,
            updated_at: now,
            last_message_text: None,
            last_message_at: None,
            sync_status: SyncStatus::Pending,
            is_pinned: false,
            is_archived: false,
            unread_count: 0,
        }
    }

    /// A conversation adopted from a remote record. Presentation state
    /// starts at its defaults; those fields are local-only.
    pub fn from_wire(wire: WireConversation) -> Self {
        Self {
            id: wire.id,
            participant_ids: wire.participant_ids,
            is_group: wire.is_group,
            display_name: wire.display_name,
            photo_ref: wire.photo_ref,
            created_at: wire.created_at,
            updated_at: wire.updated_at,
            last_message_text: wire.last_message,
            last_message_at: wire.last_message_timestamp,
            sync_status: SyncStatus::Synced,
            is_pinned: false,
            is_archived: false,
            unread_count: 0,
        }
    }

    /// The remote representation of this record. Presentation fields stay
    /// behind.
    pub fn to_wire(&self) -> WireConversation {
        WireConversation {
            id: self.id.clone(),
            participant_ids: self.participant_ids.clone(),
            is_group: self.is_group,
            display_name: self.display_name.clone(),
            photo_ref: self.photo_ref.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_message: self.last_message_text.clone(),
            last_message_timestamp: self.last_message_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Client-generated, globally unique, immutable. The idempotency key
    /// every merge is keyed on.
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    /// Client clock at creation; display ordering until the server
    /// timestamp arrives.
    pub local_created_at: i64,
    /// Authoritative once assigned by the remote store.
    pub server_timestamp: Option<i64>,
    pub sequence_number: Option<i64>,
    pub status: DeliveryStatus,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub last_sync_attempt: Option<i64>,
    pub sync_error: Option<String>,
}

impl Message {
    /// An optimistic local write: visible immediately, queued for delivery.
    pub fn outgoing(conversation_id: &str, sender_id: &str, text: &str, now: i64) -> Self {
        Self {
            id: new_message_id(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            local_created_at: now,
            server_timestamp: None,
            sequence_number: None,
            status: DeliveryStatus::Pending,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_sync_attempt: None,
            sync_error: None,
        }
    }

    /// A message first seen via the remote store.
    pub fn from_wire(wire: WireMessage) -> Self {
        Self {
            id: wire.id,
            conversation_id: wire.conversation_id,
            sender_id: wire.sender_id,
            text: wire.text,
            local_created_at: wire.server_timestamp,
            server_timestamp: Some(wire.server_timestamp),
            sequence_number: wire.sequence_number,
            status: DeliveryStatus::from_wire(wire.status),
            sync_status: SyncStatus::Synced,
            retry_count: 0,
            last_sync_attempt: None,
            sync_error: None,
        }
    }
}

/// A durably queued remote mutation, replayed in FIFO order per
/// conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMutation {
    /// Rowid; doubles as the FIFO position.
    pub id: i64,
    pub conversation_id: String,
    pub payload: MutationPayload,
    pub attempt: u32,
    pub next_retry_at: i64,
    pub created_at: i64,
}

/// What a queued mutation does when it reaches the remote store.
///
/// Payloads carry record ids, not record bodies: the replica rows are the
/// source of truth at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "data")]
pub enum MutationPayload {
    CreateConversation { conversation_id: String },
    SendMessage { message_id: String },
    UpdateStatus { message_id: String, status: WireStatus },
}

impl MutationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateConversation { .. } => "create_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::UpdateStatus { .. } => "update_status",
        }
    }
}

/// Deterministic id for a two-party conversation: the sorted participant
/// pair joined with an underscore. Both parties compute the same id with no
/// coordination, which is what collapses concurrent creation into one
/// record.
pub fn direct_conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}_{hi}")
}

/// Sorted, deduplicated participant list including the current user.
pub fn canonical_participants(me: &str, others: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut ids: Vec<String> = others.into_iter().collect();
    ids.push(me.to_string());
    ids.sort();
    ids.dedup();
    ids
}

/// Fresh client-generated message id.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fresh opaque id for a group conversation.
pub fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_id_is_order_independent() {
        assert_eq!(direct_conversation_id("alice", "bob"), "alice_bob");
        assert_eq!(
            direct_conversation_id("alice", "bob"),
            direct_conversation_id("bob", "alice")
        );
    }

    #[test]
    fn direct_id_is_stable_across_calls() {
        let first = direct_conversation_id("u9", "u10");
        let second = direct_conversation_id("u10", "u9");
        assert_eq!(first, second);
        // Lexicographic, not numeric: "u10" sorts before "u9".
        assert_eq!(first, "u10_u9");
    }

    #[test]
    fn canonical_participants_sort_and_dedup() {
        let ids = canonical_participants("carol", ["bob".into(), "alice".into(), "carol".into()]);
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(new_message_id(), new_message_id());
        assert_ne!(new_conversation_id(), new_conversation_id());
    }

    #[test]
    fn wire_round_trip_keeps_record_fields_and_resets_presentation() {
        let mut conv = Conversation::direct("a", "b", 5);
        conv.is_pinned = true;
        conv.unread_count = 3;
        let adopted = Conversation::from_wire(conv.to_wire());
        assert_eq!(adopted.id, conv.id);
        assert_eq!(adopted.participant_ids, conv.participant_ids);
        assert_eq!(adopted.sync_status, SyncStatus::Synced);
        assert!(!adopted.is_pinned);
        assert_eq!(adopted.unread_count, 0);
    }
}
