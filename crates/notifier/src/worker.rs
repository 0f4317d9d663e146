//! Delivery worker: polls due notifications and hands them to the
//! [`Notifier`] grouped per contact and trigger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use herald_common::config::NotifierConfig;
use herald_common::error::StoreError;
use herald_common::store::{NotifierStore, with_retry};
use herald_common::types::ScheduledNotification;
use herald_common::worker::WorkerLifecycle;

use crate::notifier::{NotificationPackage, Notifier};

pub struct FetchNotificationsWorker {
    store: Arc<dyn NotifierStore>,
    notifier: Arc<Notifier>,
    config: NotifierConfig,
    retry_delay: Duration,
    lifecycle: WorkerLifecycle,
}

impl FetchNotificationsWorker {
    pub fn new(
        store: Arc<dyn NotifierStore>,
        notifier: Arc<Notifier>,
        config: NotifierConfig,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
            retry_delay,
            lifecycle: WorkerLifecycle::new("fetch-notifications"),
        }
    }

    pub async fn start(&self) {
        let delivery = Delivery {
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            config: self.config.clone(),
            retry_delay: self.retry_delay,
        };
        self.lifecycle
            .start(move |token| delivery.run(token))
            .await;
    }

    /// Stop polling; returns once the batch in flight is handled. Retries
    /// against an unavailable store are abandoned.
    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

struct Delivery {
    store: Arc<dyn NotifierStore>,
    notifier: Arc<Notifier>,
    config: NotifierConfig,
    retry_delay: Duration,
}

impl Delivery {
    async fn run(self, token: CancellationToken) {
        while !token.is_cancelled() {
            let due = match self.fetch_batch().await {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Failed to fetch due notifications"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_delay) => {}
                        _ = token.cancelled() => {}
                    }
                    continue;
                }
            };

            if due.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = token.cancelled() => {}
                }
                continue;
            }

            self.deliver(due, &token).await;
        }

        tracing::info!("Notification delivery loop finished");
    }

    /// Pop due notifications. With a batch window, wait once for more to
    /// become due so they can share a package.
    async fn fetch_batch(&self) -> Result<Vec<ScheduledNotification>, StoreError> {
        let limit = self.config.fetch_limit;
        let mut due = self
            .store
            .fetch_due_notifications(Utc::now().timestamp(), limit)
            .await?;

        if due.is_empty() || self.config.batch_window.is_zero() || due.len() >= limit {
            return Ok(due);
        }

        tokio::time::sleep(self.config.batch_window).await;
        match self
            .store
            .fetch_due_notifications(Utc::now().timestamp(), limit - due.len())
            .await
        {
            Ok(more) => due.extend(more),
            // The first pop already removed entries; deliver those.
            Err(e) => tracing::warn!(error = %e, "Failed to extend notification batch"),
        }
        Ok(due)
    }

    /// Deliver one batch: contacts in parallel, each contact's packages in
    /// due order. Returns once every package has been handled.
    async fn deliver(&self, due: Vec<ScheduledNotification>, token: &CancellationToken) {
        let total = due.len();
        let mut per_contact: Vec<Vec<NotificationPackage>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for package in NotificationPackage::group(due) {
            match index.get(&package.contact.id) {
                Some(&i) => per_contact[i].push(package),
                None => {
                    index.insert(package.contact.id.clone(), per_contact.len());
                    per_contact.push(vec![package]);
                }
            }
        }

        tracing::debug!(notifications = total, contacts = per_contact.len(), "Delivering batch");

        let mut tasks = JoinSet::new();
        for packages in per_contact {
            let store = Arc::clone(&self.store);
            let notifier = Arc::clone(&self.notifier);
            let retry_delay = self.retry_delay;
            let token = token.clone();
            tasks.spawn(async move {
                for package in packages {
                    let Some(package) =
                        refresh_contact(store.as_ref(), package, retry_delay, &token).await
                    else {
                        continue;
                    };
                    if let Err(e) = notifier.send(&package, &token).await {
                        tracing::debug!(
                            contact_id = %package.contact.id,
                            error = %e,
                            "Package not delivered"
                        );
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Delivery task failed");
            }
        }
    }
}

/// Use the contact as currently stored. Contacts deleted since scheduling
/// drop the package; an unreadable contact keeps the scheduled snapshot.
async fn refresh_contact(
    store: &dyn NotifierStore,
    mut package: NotificationPackage,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> Option<NotificationPackage> {
    let contact_id = package.contact.id.clone();
    match with_retry("get_contact", retry_delay, cancel, || store.get_contact(&contact_id)).await {
        Ok(Some(contact)) => {
            package.contact = contact;
            Some(package)
        }
        Ok(None) => {
            tracing::warn!(
                contact_id = %contact_id,
                trigger_id = %package.trigger.id,
                events = package.notifications.len(),
                "Contact removed since scheduling, dropping notifications"
            );
            None
        }
        Err(e) => {
            tracing::warn!(contact_id = %contact_id, error = %e, "Failed to reload contact");
            Some(package)
        }
    }
}
