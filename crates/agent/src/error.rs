use thiserror::Error;

/// Failure talking to the chat-completions provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level or throttling failure worth retrying.
    #[error("provider transport error: {0}")]
    Transport(String),

    /// The API rejected the request; retrying the same request is pointless.
    #[error("provider API error: {0}")]
    Api(String),

    #[error("provider response parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Failure running the shell tool.
///
/// Non-zero exit codes are payload, not errors; only failing to spawn or
/// reap the subprocess lands here, and either fails the session.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    #[error("failed to reap shell subprocess: {0}")]
    Reap(String),
}

/// Terminal failure of an agent session.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provider unreachable after retries: {0}")]
    ProviderUnreachable(String),

    #[error(transparent)]
    Shell(#[from] ShellError),

    /// Audit writes must succeed; a failed write aborts the session so the
    /// recorded history never diverges from what actually ran.
    #[error("audit write failed: {0}")]
    Audit(#[from] vigil_audit::AuditError),
}
