use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;

/// Open (or create) the operator database at `path`.
///
/// The pool is capped at a single connection: SQLite is a single-writer
/// store and every component in the process shares this pool, so the cap
/// serializes writes without an explicit mutex. Read-only analysis may open
/// its own pool against the same file.
pub async fn connect(path: &Path) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    build_pool(options).await
}

/// An in-memory database for tests.
pub async fn connect_memory() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| StoreError::Storage(e.to_string()))?;
    build_pool(options).await
}

async fn build_pool(options: SqliteConnectOptions) -> Result<SqlitePool, StoreError> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))
}
