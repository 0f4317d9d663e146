//! Event processing pipeline.
//!
//! Receives trigger state-change events from the event queue and:
//! 1. Loads the trigger and dates the event
//! 2. Matches it against subscriptions (via `AlertMatcher`)
//! 3. Runs the throttling policy per (subscription, contact)
//! 4. Pushes one `ScheduledNotification` per contact

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use herald_common::error::StoreError;
use herald_common::store::{NotifierStore, with_retry};
use herald_common::types::{
    NotificationEvent, ScheduledNotification, SubscriptionData, TriggerData,
};

use crate::matcher::AlertMatcher;
use crate::throttling::ThrottlingPolicy;

/// Errors that drop a single event.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Unknown trigger: {0}")]
    UnknownTrigger(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    /// The event was abandoned mid-way because the worker is stopping.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Store(e) if e.is_cancelled())
    }
}

/// Central event processor that orchestrates the scheduling pipeline.
pub struct EventProcessor {
    store: Arc<dyn NotifierStore>,
    matcher: AlertMatcher,
    policy: ThrottlingPolicy,
    retry_delay: Duration,
}

impl EventProcessor {
    pub fn new(
        store: Arc<dyn NotifierStore>,
        policy: ThrottlingPolicy,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            matcher: AlertMatcher::new(),
            policy,
            retry_delay,
        }
    }

    /// Process one event through the full pipeline.
    ///
    /// Returns the number of notifications scheduled. Store outages are
    /// retried in place until `cancel` fires, which surfaces as
    /// [`StoreError::Cancelled`]. A contact that cannot be read or scheduled
    /// is logged and skipped; the other contacts are still notified.
    pub async fn process_event(
        &self,
        mut event: NotificationEvent,
        cancel: &CancellationToken,
    ) -> Result<u32, IngestError> {
        let store = self.store.as_ref();
        let delay = self.retry_delay;

        let trigger = with_retry("get_trigger", delay, cancel, || {
            store.get_trigger(&event.trigger_id)
        })
        .await?
        .ok_or_else(|| IngestError::UnknownTrigger(event.trigger_id.clone()))?;

        if event.timestamp == 0 {
            event.timestamp = self.resolve_timestamp(&event, cancel).await?;
        }

        let subscriptions = with_retry("get_subscriptions_by_tags", delay, cancel, || {
            self.matcher.find_matching_subscriptions(&trigger, store)
        })
        .await?;

        if subscriptions.is_empty() {
            tracing::debug!(trigger_id = %trigger.id, "No subscriptions for trigger");
            return Ok(0);
        }

        let mut notified: HashSet<String> = HashSet::new();
        let mut scheduled = 0u32;

        for subscription in &subscriptions {
            if AlertMatcher::is_ignored(subscription, &event) {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    state = %event.state,
                    old_state = %event.old_state,
                    "Transition ignored by subscription"
                );
                continue;
            }

            for contact_id in &subscription.contacts {
                if notified.contains(contact_id) {
                    continue;
                }

                match self
                    .schedule_for_contact(subscription, &trigger, &event, contact_id, cancel)
                    .await
                {
                    Ok(true) => {
                        notified.insert(contact_id.clone());
                        scheduled += 1;
                    }
                    Ok(false) => {}
                    Err(e) if e.is_cancelled() => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(
                            trigger_id = %trigger.id,
                            subscription_id = %subscription.id,
                            contact_id = %contact_id,
                            error = %e,
                            "Skipping contact"
                        );
                    }
                }
            }
        }

        Ok(scheduled)
    }

    /// Run the throttling policy for one contact and push its notification.
    /// Returns whether a notification was scheduled.
    async fn schedule_for_contact(
        &self,
        subscription: &SubscriptionData,
        trigger: &TriggerData,
        event: &NotificationEvent,
        contact_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        let store = self.store.as_ref();
        let delay = self.retry_delay;

        let Some(contact) =
            with_retry("get_contact", delay, cancel, || store.get_contact(contact_id)).await?
        else {
            tracing::warn!(
                subscription_id = %subscription.id,
                contact_id = %contact_id,
                "Subscription references a missing contact"
            );
            return Ok(false);
        };

        let previous = with_retry("get_throttle_state", delay, cancel, || {
            store.get_throttle_state(&trigger.id, &contact.id)
        })
        .await?;

        let decision = self.policy.decide(subscription, trigger, previous, event);
        if !decision.send {
            return Ok(false);
        }

        let notification = ScheduledNotification::new(
            event.clone(),
            trigger.clone(),
            contact.clone(),
            decision.send_after,
            decision.throttled,
        );
        with_retry("push_notification", delay, cancel, || {
            store.push_notification(&notification)
        })
        .await?;

        if let Some(next) = decision.next_state.filter(|n| Some(*n) != previous) {
            with_retry("set_throttle_state", delay, cancel, || {
                store.set_throttle_state(&trigger.id, &contact.id, &next)
            })
            .await?;
        }

        tracing::info!(
            notification_id = %notification.id,
            trigger_id = %trigger.id,
            contact_id = %contact.id,
            subscription_id = %subscription.id,
            state = %event.state,
            send_after = decision.send_after,
            throttled = decision.throttled,
            "Notification scheduled"
        );
        Ok(true)
    }

    /// Date an event the checker left undated: the metric's last event time,
    /// falling back to when the metric was last observed.
    async fn resolve_timestamp(
        &self,
        event: &NotificationEvent,
        cancel: &CancellationToken,
    ) -> Result<i64, IngestError> {
        let store = self.store.as_ref();
        let now = Utc::now().timestamp();
        let check = with_retry("get_check_data", self.retry_delay, cancel, || {
            store.get_check_data(&event.trigger_id)
        })
        .await?;

        Ok(match check {
            Some(check) => check.get_metric_state(&event.metric, now).get_event_timestamp(),
            None => now,
        })
    }
}
