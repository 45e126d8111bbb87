use thiserror::Error;

/// Top-level error type for the Vigil operator.
///
/// Component crates define richer error enums; this type is the common
/// denominator surfaced at composition boundaries (monitor run, trial run).
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("subject error: {0}")]
    Subject(String),

    #[error("invariant error: {0}")]
    Invariant(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("audit error: {0}")]
    Audit(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("harness error: {0}")]
    Harness(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}
