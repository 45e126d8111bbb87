use thiserror::Error;

/// Failure inside the evaluation harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("campaign configuration error: {0}")]
    Config(String),

    #[error("container manager error: {0}")]
    Docker(String),

    #[error("chaos injection error: {0}")]
    Chaos(String),

    #[error("subject error: {0}")]
    Subject(String),

    #[error(transparent)]
    Store(#[from] vigil_store::StoreError),

    #[error(transparent)]
    Audit(#[from] vigil_audit::AuditError),

    #[error("agent error: {0}")]
    Agent(String),
}
