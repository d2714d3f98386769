use crate::ShardIndex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Empty ring, unknown shard index, closed manager or invalid settings.
    /// Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Shard unreachable: connect failure, closed pool or timeout.
    #[error("Connectivity error on shard {shard}: {message}")]
    Connectivity { shard: String, message: String },

    /// Every failover candidate for the key was excluded or failed.
    #[error("No shard available for key '{key}' (attempted: {attempted:?})")]
    ShardUnavailable {
        key: String,
        attempted: Vec<ShardIndex>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connectivity(shard: impl Into<String>, message: impl ToString) -> Self {
        Self::Connectivity {
            shard: shard.into(),
            message: message.to_string(),
        }
    }

    /// Whether the router may try another shard after this error. Errors the
    /// database itself reported (bad SQL, constraint violations) would fail
    /// the same way everywhere, so only connectivity failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
