use thiserror::Error;

/// Errors returned by the store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or rejected the command.
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    /// A record was read but could not be decoded.
    #[error("Malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// A record could not be encoded for writing.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A retried operation was abandoned because its worker is stopping.
    #[error("Store operation {operation} abandoned on shutdown")]
    Cancelled { operation: String },
}

impl StoreError {
    pub fn malformed(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        StoreError::Malformed {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled { .. })
    }
}
