//! In-process store for tests and local runs.
//!
//! All state sits behind one lock, which gives the same atomicity the Redis
//! adapter gets from `BRPOP` and its pop script.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::StoreError;
use crate::store::{NotifierStore, RECENT_EVENTS_LIMIT};
use crate::types::{
    CheckData, ContactData, NotificationEvent, ScheduledNotification, SubscriptionData,
    ThrottleState, TriggerData,
};

const EVENTS_KEY: &str = "memory:events";

#[derive(Default)]
struct Inner {
    /// Encoded events, so undecodable entries behave as they do in Redis
    events: VecDeque<String>,
    recent_events: VecDeque<NotificationEvent>,
    /// Kept sorted by `send_after`, insertion order within equal keys
    notifications: Vec<ScheduledNotification>,
    triggers: HashMap<String, TriggerData>,
    check_data: HashMap<String, CheckData>,
    subscriptions: HashMap<String, SubscriptionData>,
    contacts: HashMap<String, ContactData>,
    throttle: HashMap<(String, String), ThrottleState>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    event_ready: Notify,
    fetch_timeout: Duration,
    available: AtomicBool,
    /// Operations failing as if the store were down
    failing: RwLock<HashSet<&'static str>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_fetch_timeout(Duration::from_millis(200))
    }

    /// `fetch_timeout` bounds how long `fetch_event` waits for an event.
    pub fn with_fetch_timeout(fetch_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            event_ready: Notify::new(),
            fetch_timeout,
            available: AtomicBool::new(true),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate an outage of a single operation, named after its
    /// [`NotifierStore`] method.
    pub fn set_operation_available(&self, operation: &'static str, available: bool) {
        let mut failing = self.failing.write().unwrap_or_else(PoisonError::into_inner);
        if available {
            failing.remove(operation);
        } else {
            failing.insert(operation);
        }
    }

    /// Queue an arbitrary payload as if a misbehaving producer wrote it.
    pub async fn push_raw_event(&self, raw: &str) {
        self.inner.lock().await.events.push_back(raw.to_string());
        self.event_ready.notify_one();
    }

    pub async fn save_check_data(&self, trigger_id: &str, check: CheckData) {
        self.inner
            .lock()
            .await
            .check_data
            .insert(trigger_id.to_string(), check);
    }

    pub async fn pending_events(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Snapshot of the notification queue without removing anything.
    pub async fn queued_notifications(&self) -> Vec<ScheduledNotification> {
        self.inner.lock().await.notifications.clone()
    }

    fn check_available(&self, operation: &'static str) -> Result<(), StoreError> {
        let failing = self
            .failing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(operation);
        if self.available.load(Ordering::SeqCst) && !failing {
            Ok(())
        } else {
            Err(StoreError::Unavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "memory store marked unavailable",
            ))))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotifierStore for MemoryStore {
    async fn push_event(
        &self,
        event: &NotificationEvent,
        ack_immediately: bool,
    ) -> Result<(), StoreError> {
        self.check_available("push_event")?;
        let payload = serde_json::to_string(event)?;
        {
            let mut inner = self.inner.lock().await;
            inner.events.push_back(payload);
            if ack_immediately {
                inner.recent_events.push_front(event.clone());
                inner.recent_events.truncate(RECENT_EVENTS_LIMIT);
            }
        }
        self.event_ready.notify_one();
        Ok(())
    }

    async fn fetch_event(&self) -> Result<Option<NotificationEvent>, StoreError> {
        let deadline = tokio::time::Instant::now() + self.fetch_timeout;
        loop {
            self.check_available("fetch_event")?;
            let notified = self.event_ready.notified();
            if let Some(raw) = self.inner.lock().await.events.pop_front() {
                return serde_json::from_str(&raw)
                    .map(Some)
                    .map_err(|e| StoreError::malformed(EVENTS_KEY, e));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn requeue_event(&self, event: &NotificationEvent) -> Result<(), StoreError> {
        self.check_available("requeue_event")?;
        let payload = serde_json::to_string(event)?;
        self.inner.lock().await.events.push_front(payload);
        self.event_ready.notify_one();
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<NotificationEvent>, StoreError> {
        self.check_available("recent_events")?;
        let inner = self.inner.lock().await;
        Ok(inner.recent_events.iter().take(limit).cloned().collect())
    }

    async fn push_notification(
        &self,
        notification: &ScheduledNotification,
    ) -> Result<(), StoreError> {
        self.check_available("push_notification")?;
        let mut inner = self.inner.lock().await;
        let position = inner
            .notifications
            .partition_point(|n| n.send_after <= notification.send_after);
        inner.notifications.insert(position, notification.clone());
        Ok(())
    }

    async fn fetch_due_notifications(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledNotification>, StoreError> {
        self.check_available("fetch_due_notifications")?;
        let mut inner = self.inner.lock().await;
        let due = inner
            .notifications
            .partition_point(|n| n.send_after <= now)
            .min(limit);
        Ok(inner.notifications.drain(..due).collect())
    }

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerData>, StoreError> {
        self.check_available("get_trigger")?;
        Ok(self.inner.lock().await.triggers.get(trigger_id).cloned())
    }

    async fn save_trigger(&self, trigger: &TriggerData) -> Result<(), StoreError> {
        self.check_available("save_trigger")?;
        self.inner
            .lock()
            .await
            .triggers
            .insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn get_check_data(&self, trigger_id: &str) -> Result<Option<CheckData>, StoreError> {
        self.check_available("get_check_data")?;
        Ok(self.inner.lock().await.check_data.get(trigger_id).cloned())
    }

    async fn get_subscriptions_by_tags(
        &self,
        tags: &[String],
    ) -> Result<Vec<SubscriptionData>, StoreError> {
        self.check_available("get_subscriptions_by_tags")?;
        let wanted: HashSet<&String> = tags.iter().collect();
        let inner = self.inner.lock().await;
        let mut matching: Vec<SubscriptionData> = inner
            .subscriptions
            .values()
            .filter(|s| s.any_tags || s.tags.iter().any(|t| wanted.contains(t)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matching)
    }

    async fn save_subscription(&self, subscription: &SubscriptionData) -> Result<(), StoreError> {
        self.check_available("save_subscription")?;
        self.inner
            .lock()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactData>, StoreError> {
        self.check_available("get_contact")?;
        Ok(self.inner.lock().await.contacts.get(contact_id).cloned())
    }

    async fn save_contact(&self, contact: &ContactData) -> Result<(), StoreError> {
        self.check_available("save_contact")?;
        self.inner
            .lock()
            .await
            .contacts
            .insert(contact.id.clone(), contact.clone());
        Ok(())
    }

    async fn get_throttle_state(
        &self,
        trigger_id: &str,
        contact_id: &str,
    ) -> Result<Option<ThrottleState>, StoreError> {
        self.check_available("get_throttle_state")?;
        let key = (trigger_id.to_string(), contact_id.to_string());
        Ok(self.inner.lock().await.throttle.get(&key).copied())
    }

    async fn set_throttle_state(
        &self,
        trigger_id: &str,
        contact_id: &str,
        state: &ThrottleState,
    ) -> Result<(), StoreError> {
        self.check_available("set_throttle_state")?;
        let key = (trigger_id.to_string(), contact_id.to_string());
        self.inner.lock().await.throttle.insert(key, *state);
        Ok(())
    }
}
