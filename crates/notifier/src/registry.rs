//! Sender registry: contact type to initialized sender.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::NotifierError;
use crate::sender::Sender;

/// Settings key holding the contact type a sender serves.
pub const SENDER_TYPE_KEY: &str = "type";

/// Initialized senders, keyed by contact type. Read-only once the workers
/// start.
#[derive(Default)]
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize `sender` with `settings` and serve `settings["type"]` with
    /// it. A failure leaves the registry unchanged.
    pub async fn register(
        &mut self,
        settings: &HashMap<String, String>,
        mut sender: Box<dyn Sender>,
    ) -> Result<(), NotifierError> {
        let sender_type = settings
            .get(SENDER_TYPE_KEY)
            .filter(|t| !t.is_empty())
            .cloned()
            .ok_or(NotifierError::MissingSenderType)?;

        sender
            .init(settings)
            .await
            .map_err(|source| NotifierError::SenderInit {
                sender_type: sender_type.clone(),
                source,
            })?;

        if self
            .senders
            .insert(sender_type.clone(), Arc::from(sender))
            .is_some()
        {
            tracing::warn!(sender_type = %sender_type, "Replaced previously registered sender");
        }
        tracing::info!(sender_type = %sender_type, "Sender registered");
        Ok(())
    }

    pub fn lookup(&self, sender_type: &str) -> Option<Arc<dyn Sender>> {
        self.senders.get(sender_type).cloned()
    }

    pub fn sender_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.senders.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
