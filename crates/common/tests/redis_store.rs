//! Integration tests for the Redis store.
//!
//! These tests require a running Redis and the `REDIS_URL` environment
//! variable to be set. They flush the selected database. Run with:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379/15" cargo test -p herald-common --test redis_store -- --ignored --nocapture
//! ```

use herald_common::redis_pool::connect_store;
use herald_common::store::{NotifierStore, RedisStore};
use herald_common::types::{
    ContactData, NotificationEvent, ScheduledNotification, State, SubscriptionData, ThrottleState,
    TriggerData,
};

async fn setup() -> RedisStore {
    let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let mut flush = redis::Client::open(url.as_str())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap();
    let _: () = redis::cmd("FLUSHDB").query_async(&mut flush).await.unwrap();

    connect_store(&url).await.unwrap()
}

fn event(metric: &str) -> NotificationEvent {
    NotificationEvent {
        trigger_id: "T1".to_string(),
        metric: metric.to_string(),
        state: State::Error,
        old_state: State::Ok,
        timestamp: 1_700_000_000,
        message: None,
    }
}

fn notification(metric: &str, send_after: i64) -> ScheduledNotification {
    ScheduledNotification::new(
        event(metric),
        TriggerData {
            id: "T1".to_string(),
            ..Default::default()
        },
        ContactData {
            id: "C1".to_string(),
            contact_type: "log".to_string(),
            value: "ops".to_string(),
        },
        send_after,
        false,
    )
}

#[tokio::test]
#[ignore] // Requires REDIS_URL, run explicitly with --ignored
async fn test_event_queue_is_fifo() {
    let store = setup().await;

    store.push_event(&event("first"), true).await.unwrap();
    store.push_event(&event("second"), false).await.unwrap();

    assert_eq!(store.fetch_event().await.unwrap().unwrap().metric, "first");
    assert_eq!(store.fetch_event().await.unwrap().unwrap().metric, "second");
    assert!(store.fetch_event().await.unwrap().is_none());

    let recent = store.recent_events(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].metric, "first");
}

#[tokio::test]
#[ignore] // Requires REDIS_URL, run explicitly with --ignored
async fn test_requeued_event_is_popped_next() {
    let store = setup().await;

    store.push_event(&event("queued"), false).await.unwrap();
    store.requeue_event(&event("returned")).await.unwrap();

    assert_eq!(store.fetch_event().await.unwrap().unwrap().metric, "returned");
    assert_eq!(store.fetch_event().await.unwrap().unwrap().metric, "queued");
}

#[tokio::test]
#[ignore] // Requires REDIS_URL, run explicitly with --ignored
async fn test_due_notifications_are_popped_once_in_order() {
    let store = setup().await;

    store.push_notification(&notification("late", 300)).await.unwrap();
    store.push_notification(&notification("early", 100)).await.unwrap();
    store.push_notification(&notification("future", 900)).await.unwrap();

    let due = store.fetch_due_notifications(500, 10).await.unwrap();
    let metrics: Vec<&str> = due.iter().map(|n| n.event.metric.as_str()).collect();
    assert_eq!(metrics, vec!["early", "late"]);

    assert!(store.fetch_due_notifications(500, 10).await.unwrap().is_empty());
    assert_eq!(store.fetch_due_notifications(1_000, 10).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore] // Requires REDIS_URL, run explicitly with --ignored
async fn test_subscription_tag_index_follows_updates() {
    let store = setup().await;

    let mut subscription = SubscriptionData {
        id: "S1".to_string(),
        enabled: true,
        tags: vec!["db".to_string()],
        contacts: vec!["C1".to_string()],
        throttling_enabled: false,
        schedule: None,
        any_tags: false,
        ignore_warnings: false,
        ignore_recoverings: false,
    };
    store.save_subscription(&subscription).await.unwrap();
    assert_eq!(
        store.get_subscriptions_by_tags(&["db".to_string()]).await.unwrap().len(),
        1
    );

    subscription.tags = vec!["web".to_string()];
    store.save_subscription(&subscription).await.unwrap();
    assert!(store
        .get_subscriptions_by_tags(&["db".to_string()])
        .await
        .unwrap()
        .is_empty());

    subscription.any_tags = true;
    store.save_subscription(&subscription).await.unwrap();
    assert_eq!(
        store.get_subscriptions_by_tags(&["db".to_string()]).await.unwrap().len(),
        1
    );
}

#[tokio::test]
#[ignore] // Requires REDIS_URL, run explicitly with --ignored
async fn test_records_round_trip() {
    let store = setup().await;

    let trigger = TriggerData {
        id: "T1".to_string(),
        name: "disk".to_string(),
        tags: vec!["db".to_string()],
        ttl: Some(600),
        ..Default::default()
    };
    store.save_trigger(&trigger).await.unwrap();
    assert_eq!(store.get_trigger("T1").await.unwrap(), Some(trigger));
    assert!(store.get_trigger("missing").await.unwrap().is_none());

    let state = ThrottleState {
        last_sent: 1_700_000_060,
        tier: 2,
    };
    store.set_throttle_state("T1", "C1", &state).await.unwrap();
    assert_eq!(store.get_throttle_state("T1", "C1").await.unwrap(), Some(state));
    assert!(store.get_throttle_state("T1", "C2").await.unwrap().is_none());
}
