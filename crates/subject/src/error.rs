use thiserror::Error;

/// Failure observing a subject.
///
/// The transient/fatal split drives monitor behavior: transient failures
/// become a synthetic `control_plane_down` violation and the tick continues;
/// fatal failures terminate the operation.
#[derive(Debug, Error)]
pub enum ObserveError {
    /// Network-level failure that may heal on its own (connect, timeout, 5xx).
    #[error("transient observe failure: {0}")]
    Transient(String),

    /// Configuration, DNS, or auth failure; retrying will not help.
    #[error("fatal observe failure: {0}")]
    Fatal(String),
}

impl ObserveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure executing a subject action.
///
/// Remote rejection text is propagated verbatim so agent reasoning sees the
/// subject's own words.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("unknown action `{0}`")]
    UnknownAction(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("remote rejected action: {0}")]
    RemoteRejected(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Failure evaluating a single invariant against an observation.
#[derive(Debug, Error)]
#[error("invariant check failed: {0}")]
pub struct CheckError(pub String);

/// Failure constructing a subject from the registry.
#[derive(Debug, Error)]
pub enum SubjectError {
    #[error("unknown subject `{0}`")]
    UnknownSubject(String),

    #[error("subject configuration error: {0}")]
    Configuration(String),
}
