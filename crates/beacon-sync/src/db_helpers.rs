//! Thin async wrappers around `tokio_rusqlite::Connection::call()`.
//!
//! Every DB access in the crate goes through one of these helpers — no raw
//! `pool.call()` in service logic.
//!
//! * [`db_call`] — standard path, propagates errors
//! * [`db_call_or_default`] — graceful degradation (existence checks, counts)
//! * [`db_fire`] — fire-and-forget writes where failure is non-fatal but logged

use crate::db::DbPool;
use crate::error::SyncError;

/// Standard async DB call — runs `f` on the connection's background thread
/// and maps failures into [`SyncError::Store`].
pub async fn db_call<T, F>(pool: &DbPool, f: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
{
    pool.call(move |conn| f(conn).map_err(tokio_rusqlite::Error::from))
        .await
        .map_err(SyncError::from)
}

/// Async DB call that returns `T::default()` on *any* failure (query error,
/// connection closed, thread panic).
pub async fn db_call_or_default<T, F>(pool: &DbPool, f: F) -> T
where
    T: Send + Default + 'static,
    F: FnOnce(&mut rusqlite::Connection) -> Result<T, rusqlite::Error> + Send + 'static,
{
    pool.call(move |conn| f(conn).map_err(tokio_rusqlite::Error::from))
        .await
        .unwrap_or_default()
}

/// Fire-and-forget DB operation — spawns a task, logs errors, never blocks
/// the caller.
pub fn db_fire<F>(pool: &DbPool, context: &'static str, f: F)
where
    F: FnOnce(&mut rusqlite::Connection) -> Result<(), rusqlite::Error> + Send + 'static,
{
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = pool
            .call(move |conn| f(conn).map_err(tokio_rusqlite::Error::from))
            .await
        {
            tracing::warn!(context, error = %e, "fire-and-forget DB operation failed");
        }
    });
}
