//! Outbound mutation queue persistence helpers.
//!
//! Pure `rusqlite` functions for the `outbox` table. A mutation is enqueued
//! in the same transaction as the local write it mirrors, and deleted only
//! after the remote store acknowledges it. `AUTOINCREMENT` row ids double as
//! the FIFO order within each conversation.

use crate::db::{get_i64, get_str, json_to_sql_err};
use crate::model::{MutationPayload, OutboundMutation};

/// Append a mutation. Returns the queue row id.
pub fn enqueue(
    conn: &rusqlite::Connection,
    conversation_id: &str,
    payload: &MutationPayload,
    now: i64,
) -> Result<i64, rusqlite::Error> {
    let body = serde_json::to_string(payload).map_err(json_to_sql_err)?;
    conn.execute(
        "INSERT INTO outbox (conversation_id, kind, payload, attempt, next_retry_at, created_at) \
         VALUES (?, ?, ?, 0, ?, ?)",
        rusqlite::params![conversation_id, payload.kind(), body, now, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The oldest mutation of every conversation whose retry time has come.
/// Younger mutations stay invisible until their conversation's head clears,
/// which is what keeps delivery FIFO per conversation.
pub fn due_heads(
    conn: &rusqlite::Connection,
    now: i64,
) -> Result<Vec<OutboundMutation>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, payload, attempt, next_retry_at, created_at FROM outbox o \
         WHERE o.id = (SELECT MIN(id) FROM outbox WHERE conversation_id = o.conversation_id) \
         AND o.next_retry_at <= ?1 ORDER BY o.id",
    )?;
    let rows = stmt.query_map(rusqlite::params![now], row_to_mutation)?;
    rows.collect()
}

/// Remove an acknowledged (or abandoned) mutation.
pub fn delete(conn: &rusqlite::Connection, id: i64) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM outbox WHERE id = ?", rusqlite::params![id])
}

/// Record a failed attempt and schedule the next one.
pub fn bump(
    conn: &rusqlite::Connection,
    id: i64,
    attempt: u32,
    next_retry_at: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE outbox SET attempt = ?2, next_retry_at = ?3 WHERE id = ?1",
        rusqlite::params![id, attempt, next_retry_at],
    )?;
    Ok(())
}

fn row_to_mutation(row: &rusqlite::Row<'_>) -> Result<OutboundMutation, rusqlite::Error> {
    let body = get_str(row, "payload");
    let payload: MutationPayload = serde_json::from_str(&body).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(OutboundMutation {
        id: get_i64(row, "id"),
        conversation_id: get_str(row, "conversation_id"),
        payload,
        attempt: u32::try_from(get_i64(row, "attempt")).unwrap_or(0),
        next_retry_at: get_i64(row, "next_retry_at"),
        created_at: get_i64(row, "created_at"),
    })
}
