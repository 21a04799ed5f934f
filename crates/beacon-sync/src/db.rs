use rusqlite::Connection;

use crate::error::SyncError;

/// Async database handle backed by a dedicated background thread.
///
/// [`tokio_rusqlite::Connection`] wraps a single [`rusqlite::Connection`] on
/// a background thread and exposes an async `call()` API. It is Clone +
/// Send + Sync, and because every closure runs to completion on that one
/// thread, each `call` is a serialized check-and-set against the replica —
/// the engine's per-record concurrency guarantee rests on this.
pub type DbPool = tokio_rusqlite::Connection;

/// Bump this every time `001_init.sql` changes. On mismatch the entire
/// database is wiped and recreated from the schema — the replica is a cache
/// of the remote store, so this loses nothing that cannot be re-synced.
const SCHEMA_VERSION: i64 = 1;

/// Result of opening the database, with a flag indicating whether the
/// schema was recreated from scratch.
pub struct DbOpenResult {
    pub pool: DbPool,
    /// `true` when the schema version changed and all tables were dropped
    /// and recreated. Callers should expect a full re-sync.
    pub schema_reset: bool,
}

/// Open (or create) a `SQLite` database at `db_path` and run the initial
/// schema migration. `":memory:"` opens a private in-memory database.
pub async fn create_pool(db_path: &str) -> Result<DbOpenResult, SyncError> {
    let pool = tokio_rusqlite::Connection::open(db_path.to_string())
        .await
        .map_err(|e| SyncError::Store(format!("failed to open database: {e}")))?;

    let schema_reset = pool
        .call(|conn| {
            configure(conn)?;
            migrate(conn).map_err(tokio_rusqlite::Error::from)
        })
        .await
        .map_err(|e| SyncError::Store(format!("failed to initialize database: {e}")))?;

    Ok(DbOpenResult { pool, schema_reset })
}

/// Connection PRAGMAs applied on every open.
fn configure(conn: &Connection) -> Result<(), rusqlite::Error> {
    // WAL for better concurrent-read performance.
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    // Foreign key enforcement is off by default in SQLite.
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Check the schema version — wipe and recreate on mismatch. Returns
/// whether a reset happened.
fn migrate(conn: &Connection) -> Result<bool, rusqlite::Error> {
    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    let schema_reset = current != SCHEMA_VERSION;

    if schema_reset {
        if current != 0 {
            tracing::info!(
                old = current,
                new = SCHEMA_VERSION,
                "schema version mismatch — recreating database"
            );
        }
        drop_all_tables(conn)?;
        conn.execute_batch(include_str!("../migrations/001_init.sql"))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(schema_reset)
}

/// Drop every user table so the schema can be cleanly re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Must disable FK checks while dropping to avoid ordering issues.
    conn.execute_batch("PRAGMA foreign_keys=OFF;")?;

    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(std::result::Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
    }

    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    Ok(())
}

/// Extract a `String` column by name, returning `""` on any failure.
pub fn get_str(row: &rusqlite::Row<'_>, col: &str) -> String {
    row.get::<_, String>(col).unwrap_or_default()
}

/// Extract an optional `String` column by name.
pub fn get_str_opt(row: &rusqlite::Row<'_>, col: &str) -> Option<String> {
    row.get::<_, Option<String>>(col).ok().flatten()
}

/// Extract an `i64` column by name, returning `0` on any failure.
pub fn get_i64(row: &rusqlite::Row<'_>, col: &str) -> i64 {
    row.get::<_, i64>(col).unwrap_or_default()
}

/// Extract an optional `i64` column by name.
pub fn get_i64_opt(row: &rusqlite::Row<'_>, col: &str) -> Option<i64> {
    row.get::<_, Option<i64>>(col).ok().flatten()
}

/// Extract a boolean column by name (stored as 0/1), `false` on failure.
pub fn get_bool(row: &rusqlite::Row<'_>, col: &str) -> bool {
    row.get::<_, bool>(col).unwrap_or_default()
}

/// Adapt a JSON (de)serialization failure to a `rusqlite` error so repo
/// functions can keep a single error type.
pub fn json_to_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

/// Current UNIX timestamp in milliseconds.
pub fn timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}
