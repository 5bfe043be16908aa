use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Every acquisition attempt failed; `source` is the last driver error.
    #[error("Get transaction failed after {attempts} attempts: {source}")]
    TransactionAcquisition {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Publish to {exchange}/{routing_key} failed: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },
    #[error("Acknowledging batch failed for {failed} of {total} messages")]
    BatchAcknowledge { failed: usize, total: usize },
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
