//! Event ingestion worker: drains the event queue into the notification
//! queue.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_common::store::NotifierStore;
use herald_common::worker::WorkerLifecycle;

use crate::processor::EventProcessor;

/// Long-running loop around [`EventProcessor`].
pub struct FetchEventsWorker {
    store: Arc<dyn NotifierStore>,
    processor: Arc<EventProcessor>,
    retry_delay: Duration,
    lifecycle: WorkerLifecycle,
}

impl FetchEventsWorker {
    pub fn new(
        store: Arc<dyn NotifierStore>,
        processor: Arc<EventProcessor>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            processor,
            retry_delay,
            lifecycle: WorkerLifecycle::new("fetch-events"),
        }
    }

    pub async fn start(&self) {
        let store = Arc::clone(&self.store);
        let processor = Arc::clone(&self.processor);
        let retry_delay = self.retry_delay;
        self.lifecycle
            .start(move |token| run(store, processor, retry_delay, token))
            .await;
    }

    /// Stop pulling events; returns once the event in flight is processed,
    /// or handed back to the queue if the store is down.
    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

async fn run(
    store: Arc<dyn NotifierStore>,
    processor: Arc<EventProcessor>,
    retry_delay: Duration,
    token: CancellationToken,
) {
    // The fetch itself is not raced against the token: a pop that already
    // removed an event must be allowed to hand it over. The store bounds the
    // wait, so cancellation is observed within one fetch timeout.
    while !token.is_cancelled() {
        let event = match store.fetch_event().await {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) if e.is_transient() => {
                tracing::error!(
                    error = %e,
                    retry_in_ms = retry_delay.as_millis() as u64,
                    "Failed to fetch event"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = token.cancelled() => {}
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed event");
                continue;
            }
        };

        let trigger_id = event.trigger_id.clone();
        let metric = event.metric.clone();
        match processor.process_event(event.clone(), &token).await {
            Ok(scheduled) => {
                tracing::debug!(trigger_id = %trigger_id, metric = %metric, scheduled, "Event processed");
            }
            Err(e) if e.is_cancelled() => {
                // Stopping during an outage: the event left the queue with
                // BRPOP, so hand it back for the next run.
                match store.requeue_event(&event).await {
                    Ok(()) => tracing::info!(
                        trigger_id = %trigger_id,
                        metric = %metric,
                        "Event returned to the queue on shutdown"
                    ),
                    Err(requeue_error) => tracing::error!(
                        trigger_id = %trigger_id,
                        metric = %metric,
                        state = %event.state,
                        old_state = %event.old_state,
                        timestamp = event.timestamp,
                        error = %requeue_error,
                        "Event lost on shutdown"
                    ),
                }
            }
            Err(e) => {
                tracing::warn!(
                    trigger_id = %trigger_id,
                    metric = %metric,
                    error = %e,
                    "Dropping event"
                );
            }
        }
    }

    tracing::info!("Event ingestion loop finished");
}
