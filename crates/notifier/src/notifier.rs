//! Delivery of grouped notifications through the registered senders.
//!
//! A package is every due notification of one trigger for one contact. Each
//! package is one sender call, bounded by the sending timeout. Failed
//! packages are requeued until their notifications outlive the resending
//! timeout, then dropped with an error log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use herald_common::config::NotifierConfig;
use herald_common::store::{NotifierStore, with_retry};
use herald_common::types::{ContactData, NotificationEvent, ScheduledNotification, TriggerData};

use crate::error::NotifierError;
use crate::registry::SenderRegistry;
use crate::sender::Sender;

/// Notifications of one trigger for one contact, delivered as one message.
#[derive(Debug, Clone)]
pub struct NotificationPackage {
    pub contact: ContactData,
    pub trigger: TriggerData,
    pub notifications: Vec<ScheduledNotification>,
}

impl NotificationPackage {
    /// Group notifications by (contact, trigger). Packages and the
    /// notifications inside them keep the order of `notifications`.
    pub fn group(notifications: Vec<ScheduledNotification>) -> Vec<NotificationPackage> {
        let mut packages: Vec<NotificationPackage> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for notification in notifications {
            let key = (notification.contact.id.clone(), notification.trigger.id.clone());
            match index.get(&key) {
                Some(&i) => packages[i].notifications.push(notification),
                None => {
                    index.insert(key, packages.len());
                    packages.push(NotificationPackage {
                        contact: notification.contact.clone(),
                        trigger: notification.trigger.clone(),
                        notifications: vec![notification],
                    });
                }
            }
        }

        packages
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.notifications.iter().map(|n| n.event.clone()).collect()
    }

    /// A package is throttled if any of its notifications was.
    pub fn throttled(&self) -> bool {
        self.notifications.iter().any(|n| n.throttled)
    }
}

pub struct Notifier {
    registry: SenderRegistry,
    store: Arc<dyn NotifierStore>,
    config: NotifierConfig,
    retry_delay: Duration,
    permits: Semaphore,
    /// Serializes deliveries to the same contact.
    contact_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Notifier {
    pub fn new(store: Arc<dyn NotifierStore>, config: NotifierConfig, retry_delay: Duration) -> Self {
        let permits = Semaphore::new(config.max_parallel_sends.max(1));
        Self {
            registry: SenderRegistry::new(),
            store,
            config,
            retry_delay,
            permits,
            contact_locks: DashMap::new(),
        }
    }

    /// Register a sender for `settings["type"]`. Must happen before the
    /// notifier is shared with the delivery workers.
    pub async fn register_sender(
        &mut self,
        settings: &HashMap<String, String>,
        sender: Box<dyn Sender>,
    ) -> Result<(), NotifierError> {
        self.registry.register(settings, sender).await
    }

    pub fn sender_types(&self) -> Vec<&str> {
        self.registry.sender_types()
    }

    /// Deliver one package.
    ///
    /// On a sender failure or timeout the package's notifications are
    /// requeued (or dropped past the resending timeout) before the error is
    /// returned. A package whose contact type has no sender is dropped.
    /// Requeueing retries while the store is down until `cancel` fires.
    pub async fn send(
        &self,
        package: &NotificationPackage,
        cancel: &CancellationToken,
    ) -> Result<(), NotifierError> {
        let result = {
            let lock = self.contact_lock(&package.contact.id);
            let _guard = lock.lock().await;
            let _permit = self.permits.acquire().await.ok();
            self.deliver(package).await
        };
        self.contact_locks
            .remove_if(&package.contact.id, |_, lock| Arc::strong_count(lock) == 1);

        match &result {
            Ok(()) => {
                tracing::info!(
                    trigger_id = %package.trigger.id,
                    contact_id = %package.contact.id,
                    contact_type = %package.contact.contact_type,
                    events = package.notifications.len(),
                    throttled = package.throttled(),
                    "Notification package sent"
                );
            }
            Err(NotifierError::UnknownSender(sender_type)) => {
                tracing::error!(
                    trigger_id = %package.trigger.id,
                    contact_id = %package.contact.id,
                    contact_type = %sender_type,
                    events = package.notifications.len(),
                    "No sender for contact type, dropping notifications"
                );
            }
            Err(e) => {
                tracing::warn!(
                    trigger_id = %package.trigger.id,
                    contact_id = %package.contact.id,
                    error = %e,
                    "Failed to send notification package"
                );
                self.resend(package, e, cancel).await;
            }
        }

        result
    }

    fn contact_lock(&self, contact_id: &str) -> Arc<Mutex<()>> {
        self.contact_locks
            .entry(contact_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn deliver(&self, package: &NotificationPackage) -> Result<(), NotifierError> {
        let sender_type = &package.contact.contact_type;
        let sender = self
            .registry
            .lookup(sender_type)
            .ok_or_else(|| NotifierError::UnknownSender(sender_type.clone()))?;

        let events = package.events();
        let timeout = self.config.sending_timeout;
        let call = sender.send_events(
            &events,
            &package.contact,
            &package.trigger,
            package.throttled(),
        );

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(NotifierError::Delivery {
                sender_type: sender_type.clone(),
                source,
            }),
            Err(_) => Err(NotifierError::Timeout {
                sender_type: sender_type.clone(),
                timeout,
            }),
        }
    }

    async fn resend(
        &self,
        package: &NotificationPackage,
        error: &NotifierError,
        cancel: &CancellationToken,
    ) {
        let now = Utc::now();
        let send_after = now.timestamp() + self.config.resend_delay.as_secs() as i64;

        for notification in &package.notifications {
            let age = (now - notification.created_at).to_std().unwrap_or_default();
            if age > self.config.resending_timeout {
                tracing::error!(
                    notification_id = %notification.id,
                    trigger_id = %notification.trigger.id,
                    contact_id = %notification.contact.id,
                    attempts = notification.attempts + 1,
                    error = %error,
                    "Dropping notification, resending timeout exceeded"
                );
                continue;
            }

            let mut retry = notification.clone();
            retry.attempts += 1;
            retry.send_after = send_after;

            let store = self.store.as_ref();
            if let Err(e) = with_retry("push_notification", self.retry_delay, cancel, || {
                store.push_notification(&retry)
            })
            .await
            {
                let message = if e.is_cancelled() {
                    "Notification lost on shutdown"
                } else {
                    "Failed to requeue notification"
                };
                tracing::error!(
                    notification_id = %retry.id,
                    trigger_id = %retry.trigger.id,
                    contact_id = %retry.contact.id,
                    attempts = retry.attempts,
                    error = %e,
                    "{message}"
                );
                continue;
            }

            tracing::debug!(
                notification_id = %retry.id,
                attempts = retry.attempts,
                send_after,
                "Notification requeued"
            );
        }
    }
}
