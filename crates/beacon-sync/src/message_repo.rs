//! Message persistence helpers.
//!
//! Pure `rusqlite` functions that encapsulate SQL for the `messages` table.
//! Callers wrap these in `db_call` or `db_fire` as appropriate. Each mutation
//! here is a guarded single-statement check-and-set, so composing them inside
//! one `DbPool::call` closure yields an atomic merge step.

use crate::db::{get_i64, get_i64_opt, get_str, get_str_opt};
use crate::model::{Message, SyncStatus};
use crate::status::{self, DeliveryStatus};

/// Insert a message record. Fails on duplicate id.
pub fn insert(conn: &rusqlite::Connection, msg: &Message) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, text, local_created_at, \
         server_timestamp, sequence_number, status, sync_status, retry_count, \
         last_sync_attempt, sync_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            msg.id,
            msg.conversation_id,
            msg.sender_id,
            msg.text,
            msg.local_created_at,
            msg.server_timestamp,
            msg.sequence_number,
            msg.status.as_str(),
            msg.sync_status.as_str(),
            i64::from(msg.retry_count),
            msg.last_sync_attempt,
            msg.sync_error,
        ],
    )?;
    Ok(())
}

/// Fetch a single message by id.
pub fn get(conn: &rusqlite::Connection, id: &str) -> Result<Option<Message>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT * FROM messages WHERE id = ?")?;
    let mut rows = stmt.query_map(rusqlite::params![id], row_to_message)?;
    rows.next().transpose()
}

/// Full history of a conversation in display order: authoritative server
/// time first, falling back to local creation time for unsynced messages.
pub fn history(
    conn: &rusqlite::Connection,
    conversation_id: &str,
) -> Result<Vec<Message>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM messages WHERE conversation_id = ? \
         ORDER BY COALESCE(server_timestamp, local_created_at) ASC, \
         COALESCE(sequence_number, 0) ASC, local_created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![conversation_id], row_to_message)?;
    rows.collect()
}

/// Messages that exhausted their send attempts, oldest first.
pub fn failed(
    conn: &rusqlite::Connection,
    conversation_id: &str,
) -> Result<Vec<Message>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT * FROM messages WHERE conversation_id = ? AND status = 'failed' \
         ORDER BY local_created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![conversation_id], row_to_message)?;
    rows.collect()
}

/// Ids of incoming messages the local user has not read-acknowledged yet.
pub fn unacked_read_ids(
    conn: &rusqlite::Connection,
    conversation_id: &str,
    own_user_id: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id FROM messages WHERE conversation_id = ?1 AND sender_id != ?2 \
         AND status IN ('sent', 'delivered') ORDER BY id",
    )?;
    let rows = stmt.query_map(rusqlite::params![conversation_id, own_user_id], |row| {
        row.get::<_, String>(0)
    })?;
    rows.collect()
}

/// Record the start of a send attempt.
pub fn record_attempt(
    conn: &rusqlite::Connection,
    id: &str,
    now: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE messages SET retry_count = retry_count + 1, last_sync_attempt = ?2 WHERE id = ?1",
        rusqlite::params![id, now],
    )?;
    Ok(())
}

/// Mark a message accepted by the remote store. Delivery status advances
/// `pending` → `sent`; any later status already merged from the remote is
/// left alone.
pub fn mark_acked(conn: &rusqlite::Connection, id: &str, now: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE messages SET \
         status = CASE WHEN status = 'pending' THEN 'sent' ELSE status END, \
         sync_status = 'synced', sync_error = NULL, last_sync_attempt = ?2 \
         WHERE id = ?1",
        rusqlite::params![id, now],
    )?;
    Ok(())
}

/// Mark a message permanently failed after exhausting retries. If an echo
/// already confirmed the write (any status past `pending`), the delivery
/// status is left alone and only the sync bookkeeping records the error.
pub fn mark_failed(
    conn: &rusqlite::Connection,
    id: &str,
    error: &str,
    now: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE messages SET \
         status = CASE WHEN status = 'pending' THEN 'failed' ELSE status END, \
         sync_status = 'failed', sync_error = ?2, last_sync_attempt = ?3 \
         WHERE id = ?1",
        rusqlite::params![id, error, now],
    )?;
    Ok(())
}

/// Adopt the authoritative fields from the remote echo of a locally-sent
/// message. Keyed on `server_timestamp IS NULL` so it fires exactly once and
/// never rewrites server-assigned fields; also clears any failure left by an
/// ambiguous send, since the echo proves the write landed. Returns the
/// number of rows updated (0 or 1).
pub fn adopt_server_fields(
    conn: &rusqlite::Connection,
    id: &str,
    server_timestamp: i64,
    sequence_number: Option<i64>,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE messages SET server_timestamp = ?2, sequence_number = ?3, \
         sync_status = 'synced', sync_error = NULL \
         WHERE id = ?1 AND server_timestamp IS NULL",
        rusqlite::params![id, server_timestamp, sequence_number],
    )
}

/// Apply a remote delivery-status observation through the monotonic guard.
/// Returns the new status when it advanced, `None` when the update was a
/// duplicate or a regression.
pub fn apply_status(
    conn: &rusqlite::Connection,
    id: &str,
    incoming: DeliveryStatus,
) -> Result<Option<DeliveryStatus>, rusqlite::Error> {
    let current: String = conn.query_row(
        "SELECT status FROM messages WHERE id = ?",
        rusqlite::params![id],
        |row| row.get(0),
    )?;
    let Some(next) = status::advance(DeliveryStatus::parse(&current), incoming) else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE messages SET status = ?2 WHERE id = ?1",
        rusqlite::params![id, next.as_str()],
    )?;
    Ok(Some(next))
}

/// Reset a failed message for a fresh send. Only applies to messages in the
/// `failed` state; returns the number of rows updated (0 or 1).
pub fn reset_for_retry(conn: &rusqlite::Connection, id: &str) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE messages SET status = 'pending', sync_status = 'pending', retry_count = 0, \
         last_sync_attempt = NULL, sync_error = NULL \
         WHERE id = ?1 AND status = 'failed'",
        rusqlite::params![id],
    )
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, rusqlite::Error> {
    Ok(Message {
        id: get_str(row, "id"),
        conversation_id: get_str(row, "conversation_id"),
        sender_id: get_str(row, "sender_id"),
        text: get_str(row, "text"),
        local_created_at: get_i64(row, "local_created_at"),
        server_timestamp: get_i64_opt(row, "server_timestamp"),
        sequence_number: get_i64_opt(row, "sequence_number"),
        status: DeliveryStatus::parse(&get_str(row, "status")),
        sync_status: SyncStatus::parse(&get_str(row, "sync_status")),
        retry_count: u32::try_from(get_i64(row, "retry_count")).unwrap_or(0),
        last_sync_attempt: get_i64_opt(row, "last_sync_attempt"),
        sync_error: get_str_opt(row, "sync_error"),
    })
}
