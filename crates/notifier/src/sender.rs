//! Delivery backend contract.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::{ContactData, NotificationEvent, TriggerData};

/// Errors reported by a sender.
#[derive(Debug, Error)]
pub enum SenderError {
    /// Settings are missing or invalid; the backend cannot be used.
    #[error("Invalid sender settings: {0}")]
    Config(String),

    /// The backend rejected or failed the delivery.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A delivery backend for one contact type.
///
/// `init` is called once, before the sender is shared; `send_events` may be
/// called concurrently for different contacts.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn init(&mut self, settings: &HashMap<String, String>) -> Result<(), SenderError>;

    /// Deliver `events` of `trigger` to `contact` as one message.
    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
    ) -> Result<(), SenderError>;
}
