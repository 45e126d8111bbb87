use sqlx::SqlitePool;

use crate::error::StoreError;

/// Idempotent schema setup for tickets, campaigns, and trials.
///
/// The partial unique index on `violation_key` enforces the one-open-ticket
/// invariant at the storage layer; `open_or_update` relies on it to detect
/// races.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    let statements = [
        r"
        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            violation_key TEXT NOT NULL,
            invariant TEXT NOT NULL,
            entity_id TEXT,
            status TEXT NOT NULL DEFAULT 'open',
            held INTEGER NOT NULL DEFAULT 0,
            batch_key TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL DEFAULT 1,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            snapshot TEXT NOT NULL DEFAULT 'null',
            diagnosis TEXT,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            resolved_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_open_key
            ON tickets(violation_key) WHERE status != 'resolved'
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_tickets_key_resolved
            ON tickets(violation_key, resolved_at)
        ",
        r"
        CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            config_json TEXT NOT NULL
        )
        ",
        r"
        CREATE TABLE IF NOT EXISTS trials (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            chaos_type TEXT NOT NULL,
            chaos_params_json TEXT NOT NULL DEFAULT 'null',
            status TEXT NOT NULL DEFAULT 'pending',
            started_at TEXT,
            chaos_injected_at TEXT,
            ended_at TEXT,
            chaos_metadata_json TEXT NOT NULL DEFAULT 'null',
            final_state_json TEXT NOT NULL DEFAULT 'null',
            agent_session_id TEXT,
            ticket_ids_json TEXT NOT NULL DEFAULT '[]',
            error TEXT
        )
        ",
        r"
        CREATE INDEX IF NOT EXISTS idx_trials_campaign
            ON trials(campaign_id, status)
        ",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
    }
    Ok(())
}
