use thiserror::Error;

/// Failure writing or reading the audit trail.
///
/// Write failures are fatal to the session that hit them: the agent runtime
/// terminates rather than let tool execution diverge from recorded history.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("audit serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
