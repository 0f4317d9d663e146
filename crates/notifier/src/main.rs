use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_common::redis_pool::connect_store;
use herald_common::store::NotifierStore;
use herald_engine::processor::EventProcessor;
use herald_engine::throttling::ThrottlingPolicy;
use herald_engine::worker::FetchEventsWorker;
use herald_notifier::notifier::Notifier;
use herald_notifier::registry::SENDER_TYPE_KEY;
use herald_notifier::senders;
use herald_notifier::worker::FetchNotificationsWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "herald_notifier=info,herald_engine=info,herald_common=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    let store: Arc<dyn NotifierStore> = Arc::new(connect_store(&config.redis_url).await?);

    let mut notifier = Notifier::new(
        Arc::clone(&store),
        config.notifier.clone(),
        config.store_retry_delay,
    );
    for settings in &config.senders {
        let sender_type = settings
            .get(SENDER_TYPE_KEY)
            .map(String::as_str)
            .unwrap_or_default();
        let Some(sender) = senders::builtin(sender_type) else {
            tracing::error!(sender_type = %sender_type, "Unknown sender type, skipping");
            continue;
        };
        if let Err(e) = notifier.register_sender(settings, sender).await {
            tracing::error!(error = %e, "Sender disabled");
        }
    }
    if notifier.sender_types().is_empty() {
        tracing::warn!("No senders registered; every notification will be dropped");
    }

    let processor = EventProcessor::new(
        Arc::clone(&store),
        ThrottlingPolicy::new(config.throttling.clone()),
        config.store_retry_delay,
    );
    let events_worker = FetchEventsWorker::new(
        Arc::clone(&store),
        Arc::new(processor),
        config.store_retry_delay,
    );
    let notifications_worker = FetchNotificationsWorker::new(
        Arc::clone(&store),
        Arc::new(notifier),
        config.notifier.clone(),
        config.store_retry_delay,
    );

    events_worker.start().await;
    notifications_worker.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    events_worker.stop().await;
    notifications_worker.stop().await;

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
