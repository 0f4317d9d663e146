//! Store contract shared by the ingestion and delivery workers.
//!
//! The store is the only shared mutable resource in the pipeline. Every queue
//! mutation is a single atomic operation in the backing store, so any number
//! of workers may pop from the same queue without seeing an entry twice.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::types::{
    CheckData, ContactData, NotificationEvent, ScheduledNotification, SubscriptionData,
    ThrottleState, TriggerData,
};

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Number of events kept in the recent-events feed.
pub const RECENT_EVENTS_LIMIT: usize = 100;

#[async_trait]
pub trait NotifierStore: Send + Sync {
    /// Append an event to the event queue. With `ack_immediately` the event
    /// is also recorded in the recent-events feed at push time.
    async fn push_event(
        &self,
        event: &NotificationEvent,
        ack_immediately: bool,
    ) -> Result<(), StoreError>;

    /// Pop the oldest event, waiting a bounded time for one to arrive.
    ///
    /// Returns `Ok(None)` when the wait elapsed without an event. An entry
    /// that cannot be decoded is removed from the queue and reported as
    /// [`StoreError::Malformed`].
    async fn fetch_event(&self) -> Result<Option<NotificationEvent>, StoreError>;

    /// Put a fetched event back at the head of the event queue, so it is the
    /// next one popped.
    async fn requeue_event(&self, event: &NotificationEvent) -> Result<(), StoreError>;

    /// Most recent events pushed with `ack_immediately`, newest first.
    async fn recent_events(&self, limit: usize) -> Result<Vec<NotificationEvent>, StoreError>;

    async fn push_notification(
        &self,
        notification: &ScheduledNotification,
    ) -> Result<(), StoreError>;

    /// Atomically remove and return up to `limit` notifications whose
    /// `send_after <= now`, ordered by `send_after`.
    async fn fetch_due_notifications(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledNotification>, StoreError>;

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerData>, StoreError>;

    async fn save_trigger(&self, trigger: &TriggerData) -> Result<(), StoreError>;

    async fn get_check_data(&self, trigger_id: &str) -> Result<Option<CheckData>, StoreError>;

    /// Subscriptions sharing at least one tag with `tags`, plus every
    /// subscription that matches any tags. Disabled subscriptions are
    /// included; callers filter them.
    async fn get_subscriptions_by_tags(
        &self,
        tags: &[String],
    ) -> Result<Vec<SubscriptionData>, StoreError>;

    async fn save_subscription(&self, subscription: &SubscriptionData) -> Result<(), StoreError>;

    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactData>, StoreError>;

    async fn save_contact(&self, contact: &ContactData) -> Result<(), StoreError>;

    async fn get_throttle_state(
        &self,
        trigger_id: &str,
        contact_id: &str,
    ) -> Result<Option<ThrottleState>, StoreError>;

    async fn set_throttle_state(
        &self,
        trigger_id: &str,
        contact_id: &str,
        state: &ThrottleState,
    ) -> Result<(), StoreError>;
}

/// Run a store operation until it succeeds or fails with a non-transient
/// error, sleeping `delay` between attempts while the store is unavailable.
///
/// The operation is always attempted once. Once `cancel` fires, a transient
/// failure ends the loop with [`StoreError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                attempt += 1;
                if cancel.is_cancelled() {
                    tracing::warn!(operation, attempt, error = %e, "Store unavailable, giving up on shutdown");
                    return Err(StoreError::Cancelled {
                        operation: operation.to_string(),
                    });
                }
                tracing::warn!(
                    operation,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store unavailable, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
            other => return other,
        }
    }
}
