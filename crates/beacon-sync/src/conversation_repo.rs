//! Conversation persistence helpers.
//!
//! Pure `rusqlite` functions that encapsulate SQL for the `conversations`
//! table. Callers wrap these in `db_call` or `db_fire` as appropriate.
//! Mutations are targeted field-level UPDATEs; nothing here overwrites a
//! whole record.

use beacon_remote::WireConversation;

use crate::db::{get_bool, get_i64, get_i64_opt, get_str, get_str_opt, json_to_sql_err};
use crate::model::{Conversation, SyncStatus};

/// Insert a conversation record. Fails on duplicate id.
pub fn insert(conn: &rusqlite::Connection, conv: &Conversation) -> Result<(), rusqlite::Error> {
    let participants = serde_json::to_string(&conv.participant_ids).map_err(json_to_sql_err)?;
    conn.execute(
        "INSERT INTO conversations (id, participant_ids, is_group, display_name, photo_ref, \
         created_at, updated_at, last_message_text, last_message_at, sync_status, is_pinned, \
         is_archived, unread_count) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            conv.id,
            participants,
            conv.is_group,
            conv.display_name,
            conv.photo_ref,
            conv.created_at,
            conv.updated_at,
            conv.last_message_text,
            conv.last_message_at,
            conv.sync_status.as_str(),
            conv.is_pinned,
            conv.is_archived,
            i64::from(conv.unread_count),
        ],
    )?;
    Ok(())
}

/// Fetch a single conversation by id.
pub fn get(conn: &rusqlite::Connection, id: &str) -> Result<Option<Conversation>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT * FROM conversations WHERE id = ?")?;
    let mut rows = stmt.query_map(rusqlite::params![id], row_to_conversation)?;
    rows.next().transpose()
}

/// List conversations for display: pinned first, then most recent activity.
pub fn list(
    conn: &rusqlite::Connection,
    include_archived: bool,
) -> Result<Vec<Conversation>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM conversations WHERE (?1 OR is_archived = 0) \
         ORDER BY is_pinned DESC, COALESCE(last_message_at, updated_at) DESC, id",
    )?;
    let rows = stmt.query_map(rusqlite::params![include_archived], row_to_conversation)?;
    rows.collect()
}

/// Set the sync lifecycle state.
pub fn set_sync_status(
    conn: &rusqlite::Connection,
    id: &str,
    status: SyncStatus,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE conversations SET sync_status = ?2 WHERE id = ?1 AND sync_status != ?2",
        rusqlite::params![id, status.as_str()],
    )
}

/// Merge a newer remote record into an existing local one.
///
/// Record fields follow the remote when its `updated_at` is newer; the
/// local-only presentation columns are untouched. Returns whether anything
/// changed.
pub fn apply_remote(
    conn: &rusqlite::Connection,
    wire: &WireConversation,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE conversations SET display_name = ?2, photo_ref = ?3, updated_at = ?4, \
         last_message_text = ?5, last_message_at = ?6, sync_status = 'synced' \
         WHERE id = ?1 AND updated_at < ?4",
        rusqlite::params![
            wire.id,
            wire.display_name,
            wire.photo_ref,
            wire.updated_at,
            wire.last_message,
            wire.last_message_timestamp,
        ],
    )?;
    Ok(changed > 0)
}

/// Update the denormalized last-message preview.
pub fn set_preview(
    conn: &rusqlite::Connection,
    id: &str,
    text: &str,
    at: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE conversations SET last_message_text = ?2, last_message_at = ?3, \
         updated_at = MAX(updated_at, ?3) \
         WHERE id = ?1 AND COALESCE(last_message_at, 0) <= ?3",
        rusqlite::params![id, text, at],
    )?;
    Ok(())
}

pub fn set_pinned(
    conn: &rusqlite::Connection,
    id: &str,
    pinned: bool,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE conversations SET is_pinned = ?2 WHERE id = ?1",
        rusqlite::params![id, pinned],
    )
}

pub fn set_archived(
    conn: &rusqlite::Connection,
    id: &str,
    archived: bool,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE conversations SET is_archived = ?2 WHERE id = ?1",
        rusqlite::params![id, archived],
    )
}

/// Zero the unread counter. Returns the number of rows that actually
/// changed, so callers can skip events when this was already zero.
pub fn reset_unread(conn: &rusqlite::Connection, id: &str) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE conversations SET unread_count = 0 WHERE id = ?1 AND unread_count != 0",
        rusqlite::params![id],
    )
}

/// Increment the unread counter, returning the new value.
pub fn bump_unread(conn: &rusqlite::Connection, id: &str) -> Result<u32, rusqlite::Error> {
    conn.execute(
        "UPDATE conversations SET unread_count = unread_count + 1 WHERE id = ?1",
        rusqlite::params![id],
    )?;
    let count: i64 = conn.query_row(
        "SELECT unread_count FROM conversations WHERE id = ?1",
        rusqlite::params![id],
        |row| row.get(0),
    )?;
    Ok(u32::try_from(count).unwrap_or(0))
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, rusqlite::Error> {
    let participant_ids: Vec<String> =
        serde_json::from_str(&get_str(row, "participant_ids")).unwrap_or_default();
    Ok(Conversation {
        id: get_str(row, "id"),
        participant_ids,
        is_group: get_bool(row, "is_group"),
        display_name: get_str_opt(row, "display_name"),
        photo_ref: get_str_opt(row, "photo_ref"),
        created_at: get_i64(row, "created_at"),
        updated_at: get_i64(row, "updated_at"),
        last_message_text: get_str_opt(row, "last_message_text"),
        last_message_at: get_i64_opt(row, "last_message_at"),
        sync_status: SyncStatus::parse(&get_str(row, "sync_status")),
        is_pinned: get_bool(row, "is_pinned"),
        is_archived: get_bool(row, "is_archived"),
        unread_count: u32::try_from(get_i64(row, "unread_count")).unwrap_or(0),
    })
}
