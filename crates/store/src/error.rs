use thiserror::Error;

/// Failure talking to the embedded database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("ticket {0} not found")]
    TicketNotFound(i64),

    #[error("trial {0} not found")]
    TrialNotFound(String),

    #[error("campaign {0} not found")]
    CampaignNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
