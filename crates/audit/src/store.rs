use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::AuditError;
use crate::record::{AuditEntry, AuditSession, EntryKind, EntryRole};
use crate::redact::Redactor;

/// Append-only audit store over the shared operator database.
///
/// Entries are keyed `(session_id, seq)`; seq is assigned here, inside the
/// insert transaction, so concurrent sessions each get a gapless sequence.
/// Every payload passes through the [`Redactor`] before it is serialized.
pub struct AuditStore {
    pool: SqlitePool,
    redactor: Redactor,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    outcome: Option<String>,
}

impl From<SessionRow> for AuditSession {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            outcome: row.outcome,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    session_id: String,
    seq: i64,
    ts: DateTime<Utc>,
    role: String,
    kind: String,
    payload_json: String,
    tool_name: Option<String>,
    tool_params_json: Option<String>,
    tool_result_json: Option<String>,
}

impl From<EntryRow> for AuditEntry {
    fn from(row: EntryRow) -> Self {
        let decode = |s: &str| serde_json::from_str(s).unwrap_or(serde_json::Value::Null);
        Self {
            session_id: row.session_id,
            seq: row.seq,
            ts: row.ts,
            role: EntryRole::parse(&row.role).unwrap_or(EntryRole::System),
            kind: EntryKind::parse(&row.kind).unwrap_or(EntryKind::Message),
            payload: decode(&row.payload_json),
            tool_name: row.tool_name,
            tool_params: row.tool_params_json.as_deref().map(decode),
            tool_result: row.tool_result_json.as_deref().map(decode),
        }
    }
}

impl AuditStore {
    /// Wrap a pool, running the audit-specific migrations.
    pub async fn new(pool: SqlitePool) -> Result<Self, AuditError> {
        let statements = [
            r"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                outcome TEXT
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS audit_entries (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                ts TEXT NOT NULL,
                role TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                tool_name TEXT,
                tool_params_json TEXT,
                tool_result_json TEXT,
                PRIMARY KEY (session_id, seq)
            )
            ",
        ];
        for statement in statements {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            redactor: Redactor::new(),
        })
    }

    /// Open a session row.
    pub async fn begin_session(&self, id: &str) -> Result<AuditSession, AuditError> {
        let started_at = Utc::now();
        sqlx::query("INSERT INTO sessions (id, started_at) VALUES (?, ?)")
            .bind(id)
            .bind(started_at)
            .execute(&self.pool)
            .await?;
        Ok(AuditSession {
            id: id.to_owned(),
            started_at,
            ended_at: None,
            outcome: None,
        })
    }

    /// Seal a session with its outcome label. Sessions are never mutated
    /// after this.
    pub async fn end_session(&self, id: &str, outcome: &str) -> Result<(), AuditError> {
        let affected = sqlx::query(
            "UPDATE sessions SET ended_at = ?, outcome = ? WHERE id = ? AND ended_at IS NULL",
        )
        .bind(Utc::now())
        .bind(outcome)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(AuditError::SessionNotFound(id.to_owned()));
        }
        debug!(session = id, outcome, "session sealed");
        Ok(())
    }

    /// Append one entry, assigning the next seq and redacting every JSON
    /// column before the write.
    pub async fn append(&self, entry: AuditEntry) -> Result<AuditEntry, AuditError> {
        let payload = self.redactor.redacted(entry.payload);
        let tool_params = entry.tool_params.map(|v| self.redactor.redacted(v));
        let tool_result = entry.tool_result.map(|v| self.redactor.redacted(v));

        let encode = |v: &serde_json::Value| -> Result<String, AuditError> {
            serde_json::to_string(v).map_err(|e| AuditError::Serialization(e.to_string()))
        };
        let payload_json = encode(&payload)?;
        let tool_params_json = tool_params.as_ref().map(encode).transpose()?;
        let tool_result_json = tool_result.as_ref().map(encode).transpose()?;

        let mut tx = self.pool.begin().await?;
        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_entries WHERE session_id = ?",
        )
        .bind(&entry.session_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r"
            INSERT INTO audit_entries (
                session_id, seq, ts, role, kind,
                payload_json, tool_name, tool_params_json, tool_result_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&entry.session_id)
        .bind(seq)
        .bind(entry.ts)
        .bind(entry.role.as_str())
        .bind(entry.kind.as_str())
        .bind(&payload_json)
        .bind(&entry.tool_name)
        .bind(&tool_params_json)
        .bind(&tool_result_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(AuditEntry {
            seq,
            payload,
            tool_params,
            tool_result,
            ..entry
        })
    }

    /// Sessions, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<AuditSession>, AuditError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions ORDER BY started_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get_session(&self, id: &str) -> Result<AuditSession, AuditError> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AuditError::SessionNotFound(id.to_owned()))?;
        Ok(row.into())
    }

    /// Every entry of a session in seq order.
    pub async fn entries(&self, session_id: &str) -> Result<Vec<AuditEntry>, AuditError> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT * FROM audit_entries WHERE session_id = ? ORDER BY seq",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// The last `n` entries of a session in seq order, for live display.
    pub async fn tail(&self, session_id: &str, n: u32) -> Result<Vec<AuditEntry>, AuditError> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r"
            SELECT * FROM (
                SELECT * FROM audit_entries WHERE session_id = ? ORDER BY seq DESC LIMIT ?
            ) ORDER BY seq
            ",
        )
        .bind(session_id)
        .bind(i64::from(n))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
