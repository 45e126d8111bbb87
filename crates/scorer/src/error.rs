use thiserror::Error;

/// Failure deriving a score.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("command classification failed: {0}")]
    Classification(String),
}
