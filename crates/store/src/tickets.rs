use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use vigil_core::{InvariantViolation, Severity, Ticket, TicketStatus};

use crate::error::StoreError;

/// Tuning for the ticket store's flap annotation.
#[derive(Debug, Clone)]
pub struct TicketStoreConfig {
    /// Whether recurring resolutions annotate new tickets as flapping.
    pub flap_enabled: bool,
    /// Look-back window for counting resolutions of the same key.
    pub flap_window: Duration,
    /// Resolutions within the window at which a key counts as flapping.
    pub flap_threshold: u32,
}

impl Default for TicketStoreConfig {
    fn default() -> Self {
        Self {
            flap_enabled: true,
            flap_window: Duration::from_secs(300),
            flap_threshold: 3,
        }
    }
}

/// Persistent, deduplicated violation log.
///
/// At most one non-resolved ticket exists per violation key, enforced by a
/// partial unique index; `open_or_update` is transactional and survives the
/// race where two writers insert the same key concurrently.
pub struct TicketStore {
    pool: SqlitePool,
    config: TicketStoreConfig,
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: i64,
    violation_key: String,
    invariant: String,
    entity_id: Option<String>,
    status: String,
    held: bool,
    batch_key: String,
    occurrence_count: i64,
    severity: String,
    message: String,
    snapshot: String,
    diagnosis: Option<String>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TicketRow> for Ticket {
    fn from(row: TicketRow) -> Self {
        Self {
            id: row.id,
            violation_key: row.violation_key,
            invariant: row.invariant,
            entity_id: row.entity_id,
            status: TicketStatus::parse(&row.status).unwrap_or(TicketStatus::Open),
            held: row.held,
            batch_key: row.batch_key,
            occurrence_count: row.occurrence_count,
            severity: parse_severity(&row.severity),
            message: row.message,
            snapshot: serde_json::from_str(&row.snapshot).unwrap_or(serde_json::Value::Null),
            diagnosis: row.diagnosis,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "critical" => Severity::Critical,
        "info" => Severity::Info,
        _ => Severity::Warning,
    }
}

impl TicketStore {
    /// Wrap an already-migrated pool.
    #[must_use]
    pub fn new(pool: SqlitePool, config: TicketStoreConfig) -> Self {
        Self { pool, config }
    }

    /// Atomic upsert for one violation sighting.
    ///
    /// An existing open ticket for the key gets its occurrence count bumped
    /// and its last-seen/message/snapshot refreshed; otherwise a new row is
    /// inserted. A unique-index collision (two writers inserting the same
    /// key) is retried once by falling through to the update branch.
    pub async fn open_or_update(
        &self,
        violation: &InvariantViolation,
        batch_key: &str,
        snapshot: &serde_json::Value,
    ) -> Result<Ticket, StoreError> {
        match self
            .try_open_or_update(violation, batch_key, snapshot)
            .await
        {
            Err(StoreError::Storage(msg)) if msg.contains("UNIQUE") => {
                debug!(key = %violation.key(), "open ticket raced; retrying as update");
                self.try_open_or_update(violation, batch_key, snapshot)
                    .await
            }
            other => other,
        }
    }

    async fn try_open_or_update(
        &self,
        violation: &InvariantViolation,
        batch_key: &str,
        snapshot: &serde_json::Value,
    ) -> Result<Ticket, StoreError> {
        let key = violation.key();
        let now = Utc::now();
        let snapshot_json = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, TicketRow>(
            "SELECT * FROM tickets WHERE violation_key = ? AND status != 'resolved'",
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let ticket = if let Some(row) = existing {
            sqlx::query(
                r"
                UPDATE tickets SET
                    occurrence_count = occurrence_count + 1,
                    last_seen = ?,
                    message = ?,
                    snapshot = ?,
                    batch_key = ?,
                    updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(violation.last_seen)
            .bind(&violation.message)
            .bind(&snapshot_json)
            .bind(batch_key)
            .bind(now)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;

            sqlx::query_as::<_, TicketRow>("SELECT * FROM tickets WHERE id = ?")
                .bind(row.id)
                .fetch_one(&mut *tx)
                .await?
        } else {
            let message = self
                .annotate_flapping(&mut tx, &key, &violation.message, now)
                .await?;

            let id = sqlx::query(
                r"
                INSERT INTO tickets (
                    violation_key, invariant, entity_id, status, held, batch_key,
                    occurrence_count, severity, message, snapshot, diagnosis,
                    first_seen, last_seen, resolved_at, created_at, updated_at
                ) VALUES (?, ?, ?, 'open', 0, ?, 1, ?, ?, ?, NULL, ?, ?, NULL, ?, ?)
                ",
            )
            .bind(&key)
            .bind(&violation.invariant)
            .bind(&violation.entity_id)
            .bind(batch_key)
            .bind(violation.severity.to_string())
            .bind(&message)
            .bind(&snapshot_json)
            .bind(violation.first_seen)
            .bind(violation.last_seen)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            sqlx::query_as::<_, TicketRow>("SELECT * FROM tickets WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?
        };

        tx.commit().await?;
        Ok(ticket.into())
    }

    /// Count recent resolutions of `key` and annotate the message when the
    /// key is flapping.
    async fn annotate_flapping(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        key: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        if !self.config.flap_enabled {
            return Ok(message.to_owned());
        }
        let window_start = now
            - chrono::Duration::from_std(self.config.flap_window)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let resolutions: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tickets WHERE violation_key = ? AND resolved_at >= ?",
        )
        .bind(key)
        .bind(window_start)
        .fetch_one(&mut **tx)
        .await?;

        if resolutions >= i64::from(self.config.flap_threshold) {
            let minutes = self.config.flap_window.as_secs() / 60;
            Ok(format!(
                "{message} (flapping: {resolutions} resolutions in last {minutes}m)"
            ))
        } else {
            Ok(message.to_owned())
        }
    }

    /// Violation keys with a non-resolved ticket.
    pub async fn open_keys(&self) -> Result<Vec<String>, StoreError> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT violation_key FROM tickets WHERE status != 'resolved' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    /// Resolve every listed key that is not held. Keys resolve
    /// independently; a held ticket is silently skipped.
    pub async fn auto_resolve(&self, absent_keys: &[String]) -> Result<Vec<i64>, StoreError> {
        let now = Utc::now();
        let mut resolved = Vec::new();
        for key in absent_keys {
            let id: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM tickets WHERE violation_key = ? AND status != 'resolved' AND held = 0",
            )
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
            let Some(id) = id else { continue };
            sqlx::query(
                "UPDATE tickets SET status = 'resolved', resolved_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            debug!(ticket = id, key = %key, "auto-resolved");
            resolved.push(id);
        }
        Ok(resolved)
    }

    /// List tickets, optionally filtered by status, newest first.
    pub async fn list(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, TicketRow>(
                    "SELECT * FROM tickets WHERE status = ? ORDER BY id DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TicketRow>("SELECT * FROM tickets ORDER BY id DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Tickets created or updated by one monitor tick.
    pub async fn by_batch(&self, batch_key: &str) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query_as::<_, TicketRow>(
            "SELECT * FROM tickets WHERE batch_key = ? ORDER BY id",
        )
        .bind(batch_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Tickets whose creation falls inside `[from, to]`.
    pub async fn created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Ticket>, StoreError> {
        let rows = sqlx::query_as::<_, TicketRow>(
            "SELECT * FROM tickets WHERE created_at >= ? AND created_at <= ? ORDER BY id",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get(&self, id: i64) -> Result<Ticket, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>("SELECT * FROM tickets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::TicketNotFound(id))?;
        Ok(row.into())
    }

    /// Explicit resolve: clears the hold and terminates the ticket.
    pub async fn resolve(&self, id: i64) -> Result<Ticket, StoreError> {
        let now = Utc::now();
        let affected = sqlx::query(
            r"
            UPDATE tickets SET status = 'resolved', held = 0, resolved_at = ?, updated_at = ?
            WHERE id = ? AND status != 'resolved'
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            warn!(ticket = id, "resolve was a no-op (missing or already resolved)");
        }
        self.get(id).await
    }

    /// Acknowledge an open ticket. Later statuses are never downgraded.
    pub async fn acknowledge(&self, id: i64) -> Result<Ticket, StoreError> {
        sqlx::query(
            "UPDATE tickets SET status = 'acknowledged', updated_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }

    /// Suppress auto-resolution for this ticket.
    pub async fn hold(&self, id: i64) -> Result<Ticket, StoreError> {
        sqlx::query(
            "UPDATE tickets SET held = 1, updated_at = ? WHERE id = ? AND status != 'resolved'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }

    /// Allow auto-resolution again.
    pub async fn unhold(&self, id: i64) -> Result<Ticket, StoreError> {
        sqlx::query("UPDATE tickets SET held = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.get(id).await
    }

    /// Attach opaque diagnosis text; upgrades open/acknowledged tickets to
    /// `diagnosed`.
    pub async fn attach_diagnosis(&self, id: i64, text: &str) -> Result<Ticket, StoreError> {
        let now = Utc::now();
        sqlx::query(
            r"
            UPDATE tickets SET
                diagnosis = ?,
                status = CASE WHEN status IN ('open', 'acknowledged') THEN 'diagnosed' ELSE status END,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(text)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use crate::pool::connect_memory;

    use vigil_core::Severity;

    async fn store() -> TicketStore {
        let pool = connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        TicketStore::new(pool, TicketStoreConfig::default())
    }

    fn violation(entity: Option<&str>) -> InvariantViolation {
        let now = Utc::now();
        InvariantViolation {
            invariant: "entity_unreachable".into(),
            entity_id: entity.map(Into::into),
            severity: Severity::Critical,
            message: "node is Down".into(),
            first_seen: now,
            last_seen: now,
        }
    }

    #[tokio::test]
    async fn first_sighting_opens_a_ticket() {
        let store = store().await;
        let ticket = store
            .open_or_update(&violation(Some("n1")), "t1", &serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(ticket.violation_key, "entity_unreachable:n1");
        assert_eq!(ticket.occurrence_count, 1);
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(ticket.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn recurrence_updates_in_place() {
        let store = store().await;
        let v = violation(Some("n1"));
        let first = store
            .open_or_update(&v, "t1", &serde_json::Value::Null)
            .await
            .unwrap();
        let second = store
            .open_or_update(&v, "t2", &serde_json::Value::Null)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.occurrence_count, 2);
        assert_eq!(second.batch_key, "t2");
    }

    #[tokio::test]
    async fn auto_resolve_skips_held_tickets() {
        let store = store().await;
        let ticket = store
            .open_or_update(&violation(Some("n1")), "t1", &serde_json::Value::Null)
            .await
            .unwrap();
        store.hold(ticket.id).await.unwrap();

        let resolved = store
            .auto_resolve(&["entity_unreachable:n1".to_owned()])
            .await
            .unwrap();
        assert!(resolved.is_empty());

        let still = store.get(ticket.id).await.unwrap();
        assert_eq!(still.status, TicketStatus::Open);
        assert!(still.held);

        // Unheld, the next pass terminates it.
        store.unhold(ticket.id).await.unwrap();
        let resolved = store
            .auto_resolve(&["entity_unreachable:n1".to_owned()])
            .await
            .unwrap();
        assert_eq!(resolved, vec![ticket.id]);
        let done = store.get(ticket.id).await.unwrap();
        assert_eq!(done.status, TicketStatus::Resolved);
        assert!(done.resolved_at.is_some());
    }

    #[tokio::test]
    async fn resolution_allows_a_fresh_ticket() {
        let store = store().await;
        let v = violation(Some("n1"));
        let first = store
            .open_or_update(&v, "t1", &serde_json::Value::Null)
            .await
            .unwrap();
        store.resolve(first.id).await.unwrap();

        let second = store
            .open_or_update(&v, "t3", &serde_json::Value::Null)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.occurrence_count, 1);
    }

    #[tokio::test]
    async fn flapping_key_is_annotated() {
        let store = store().await;
        let v = violation(Some("n1"));
        for batch in ["t1", "t2", "t3"] {
            let t = store
                .open_or_update(&v, batch, &serde_json::Value::Null)
                .await
                .unwrap();
            store.resolve(t.id).await.unwrap();
        }

        let flapping = store
            .open_or_update(&v, "t4", &serde_json::Value::Null)
            .await
            .unwrap();
        assert!(flapping.message.contains("flapping"), "{}", flapping.message);
    }

    #[tokio::test]
    async fn diagnosis_upgrades_status() {
        let store = store().await;
        let ticket = store
            .open_or_update(&violation(None), "t1", &serde_json::Value::Null)
            .await
            .unwrap();

        let diagnosed = store
            .attach_diagnosis(ticket.id, "redis evicted the counters")
            .await
            .unwrap();
        assert_eq!(diagnosed.status, TicketStatus::Diagnosed);
        assert_eq!(
            diagnosed.diagnosis.as_deref(),
            Some("redis evicted the counters")
        );

        // Terminal status is not overwritten by a later diagnosis.
        store.resolve(ticket.id).await.unwrap();
        let after = store.attach_diagnosis(ticket.id, "more detail").await.unwrap();
        assert_eq!(after.status, TicketStatus::Resolved);
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = store().await;
        let open = store
            .open_or_update(&violation(Some("n1")), "t1", &serde_json::Value::Null)
            .await
            .unwrap();
        let resolved = store
            .open_or_update(&violation(Some("n2")), "t1", &serde_json::Value::Null)
            .await
            .unwrap();
        store.resolve(resolved.id).await.unwrap();

        let open_list = store.list(Some(TicketStatus::Open)).await.unwrap();
        assert_eq!(open_list.len(), 1);
        assert_eq!(open_list[0].id, open.id);
        assert_eq!(store.list(None).await.unwrap().len(), 2);
        assert_eq!(store.open_keys().await.unwrap(), vec!["entity_unreachable:n1"]);
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let store = store().await;
        let snapshot = serde_json::json!({"entities": {"n1": "down"}});
        let ticket = store
            .open_or_update(&violation(Some("n1")), "t1", &snapshot)
            .await
            .unwrap();
        assert_eq!(ticket.snapshot, snapshot);
    }
}
