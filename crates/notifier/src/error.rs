use std::time::Duration;

use thiserror::Error;

use herald_common::error::StoreError;

use crate::sender::SenderError;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("No sender registered for contact type '{0}'")]
    UnknownSender(String),

    #[error("Sender settings carry no 'type'")]
    MissingSenderType,

    #[error("Failed to initialize sender '{sender_type}': {source}")]
    SenderInit {
        sender_type: String,
        #[source]
        source: SenderError,
    },

    #[error("Sender '{sender_type}' failed: {source}")]
    Delivery {
        sender_type: String,
        #[source]
        source: SenderError,
    },

    #[error("Sender '{sender_type}' timed out after {timeout:?}")]
    Timeout {
        sender_type: String,
        timeout: Duration,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
