//! Sender that writes notifications to the service log.

use std::collections::HashMap;

use async_trait::async_trait;

use herald_common::types::{ContactData, NotificationEvent, TriggerData};

use crate::sender::{Sender, SenderError};

#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl Sender for LogSender {
    async fn init(&mut self, _settings: &HashMap<String, String>) -> Result<(), SenderError> {
        Ok(())
    }

    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
    ) -> Result<(), SenderError> {
        for event in events {
            tracing::info!(
                contact_id = %contact.id,
                contact = %contact.value,
                trigger_id = %trigger.id,
                trigger = %trigger.name,
                metric = %event.metric,
                old_state = %event.old_state,
                state = %event.state,
                timestamp = event.timestamp,
                message = event.message.as_deref().unwrap_or(""),
                throttled,
                "Alert"
            );
        }
        Ok(())
    }
}
