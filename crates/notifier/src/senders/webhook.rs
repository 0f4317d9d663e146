//! Sender that POSTs a JSON document per package to an HTTP endpoint.
//!
//! Settings: `url` (required), `token` (optional bearer token).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use herald_common::types::{ContactData, NotificationEvent, TriggerData};

use crate::sender::{Sender, SenderError};

#[derive(Debug, Default)]
pub struct WebhookSender {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    trigger: TriggerRef<'a>,
    contact: &'a ContactData,
    events: &'a [NotificationEvent],
    throttled: bool,
}

#[derive(Debug, Serialize)]
struct TriggerRef<'a> {
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
}

impl WebhookSender {
    fn payload<'a>(
        events: &'a [NotificationEvent],
        contact: &'a ContactData,
        trigger: &'a TriggerData,
        throttled: bool,
    ) -> WebhookPayload<'a> {
        WebhookPayload {
            trigger: TriggerRef {
                id: &trigger.id,
                name: &trigger.name,
                tags: &trigger.tags,
            },
            contact,
            events,
            throttled,
        }
    }
}

#[async_trait]
impl Sender for WebhookSender {
    async fn init(&mut self, settings: &HashMap<String, String>) -> Result<(), SenderError> {
        let url = settings
            .get("url")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SenderError::Config("webhook sender requires 'url'".to_string()))?;
        reqwest::Url::parse(url)
            .map_err(|e| SenderError::Config(format!("invalid webhook url '{}': {}", url, e)))?;

        self.url = url.clone();
        self.token = settings.get("token").filter(|t| !t.is_empty()).cloned();
        Ok(())
    }

    async fn send_events(
        &self,
        events: &[NotificationEvent],
        contact: &ContactData,
        trigger: &TriggerData,
        throttled: bool,
    ) -> Result<(), SenderError> {
        let payload = Self::payload(events, contact, trigger, throttled);

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!(url = %self.url, trigger_id = %trigger.id, "Webhook delivered");
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response body".to_string());
        Err(SenderError::Delivery(format!(
            "webhook returned {}: {}",
            status, body
        )))
    }
}
