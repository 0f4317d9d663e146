//! Redis-backed store.
//!
//! Layout:
//! - event queue: list, `LPUSH` by the checker, `BRPOP` by ingestion
//! - notification queue: sorted set scored by `send_after`, popped by a Lua
//!   script so the range read and the removal are one atomic step
//! - records: JSON strings under `herald-<kind>:<id>`
//! - subscription tag index: one set of subscription ids per tag

use std::collections::HashSet;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{NotifierStore, RECENT_EVENTS_LIMIT};
use crate::types::{
    CheckData, ContactData, NotificationEvent, ScheduleData, ScheduledNotification, State,
    SubscriptionData, ThrottleState, TriggerData,
};

const EVENTS_KEY: &str = "herald-trigger-events";
const RECENT_EVENTS_KEY: &str = "herald-trigger-events-recent";
const NOTIFICATIONS_KEY: &str = "herald-notifier-notifications";
const ANY_TAGS_SUBSCRIPTIONS_KEY: &str = "herald-any-tags-subscriptions";

/// Seconds `BRPOP` waits before `fetch_event` returns `None`.
const FETCH_EVENT_TIMEOUT_SECS: f64 = 1.0;

const FETCH_DUE_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #items > 0 then
    redis.call('ZREM', KEYS[1], unpack(items))
end
return items
"#;

fn trigger_key(id: &str) -> String {
    format!("herald-trigger:{}", id)
}

fn last_check_key(id: &str) -> String {
    format!("herald-trigger-last-check:{}", id)
}

fn subscription_key(id: &str) -> String {
    format!("herald-subscription:{}", id)
}

fn tag_subscriptions_key(tag: &str) -> String {
    format!("herald-tag-subscriptions:{}", tag)
}

fn contact_key(id: &str) -> String {
    format!("herald-contact:{}", id)
}

fn throttle_key(trigger_id: &str, contact_id: &str) -> String {
    format!("herald-notifier-throttling:{}:{}", trigger_id, contact_id)
}

/// Stored shape of a trigger. TTL is kept as a decimal string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerStorageElement {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub warn_value: Option<f64>,
    #[serde(default)]
    pub error_value: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_state: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sched: Option<ScheduleData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub is_simple_trigger: bool,
    #[serde(default)]
    pub ttl: Option<String>,
}

impl From<&TriggerData> for TriggerStorageElement {
    fn from(trigger: &TriggerData) -> Self {
        Self {
            id: trigger.id.clone(),
            name: trigger.name.clone(),
            desc: trigger.description.clone(),
            targets: trigger.targets.clone(),
            warn_value: trigger.warn_value,
            error_value: trigger.error_value,
            tags: trigger.tags.clone(),
            ttl_state: trigger.ttl_state,
            sched: trigger.schedule.clone(),
            expression: trigger.expression.clone(),
            patterns: trigger.patterns.clone(),
            is_simple_trigger: trigger.is_simple_trigger,
            ttl: trigger.ttl.map(|ttl| ttl.to_string()),
        }
    }
}

impl TriggerStorageElement {
    /// Rebuild the trigger stored under `trigger_id`.
    pub fn into_trigger(self, trigger_id: &str) -> Result<TriggerData, StoreError> {
        let ttl = match self.ttl {
            None => None,
            Some(raw) => Some(raw.parse::<i64>().map_err(|e| {
                StoreError::malformed(trigger_key(trigger_id), format!("ttl '{}': {}", raw, e))
            })?),
        };

        Ok(TriggerData {
            id: trigger_id.to_string(),
            name: self.name,
            description: self.desc,
            targets: self.targets,
            warn_value: self.warn_value,
            error_value: self.error_value,
            tags: self.tags,
            ttl_state: self.ttl_state,
            ttl,
            schedule: self.sched,
            expression: self.expression,
            patterns: self.patterns,
            is_simple_trigger: self.is_simple_trigger,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::malformed(key, e))
}

/// Redis implementation of [`NotifierStore`].
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    /// Connection reserved for `BRPOP`
    blocking_conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, blocking_conn: ConnectionManager) -> Self {
        Self {
            conn,
            blocking_conn,
        }
    }

    /// Save the checker's last aggregate state for a trigger.
    pub async fn save_check_data(
        &self,
        trigger_id: &str,
        check: &CheckData,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(last_check_key(trigger_id), serde_json::to_string(check)?)
            .await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|raw| decode(key, &raw)).transpose()
    }
}

#[async_trait]
impl NotifierStore for RedisStore {
    async fn push_event(
        &self,
        event: &NotificationEvent,
        ack_immediately: bool,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().lpush(EVENTS_KEY, &payload).ignore();
        if ack_immediately {
            pipe.lpush(RECENT_EVENTS_KEY, &payload)
                .ignore()
                .ltrim(RECENT_EVENTS_KEY, 0, RECENT_EVENTS_LIMIT as isize - 1)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn fetch_event(&self) -> Result<Option<NotificationEvent>, StoreError> {
        let mut conn = self.blocking_conn.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(EVENTS_KEY)
            .arg(FETCH_EVENT_TIMEOUT_SECS)
            .query_async(&mut conn)
            .await?;

        match popped {
            None => Ok(None),
            Some((_, raw)) => decode(EVENTS_KEY, &raw).map(Some),
        }
    }

    async fn requeue_event(&self, event: &NotificationEvent) -> Result<(), StoreError> {
        // BRPOP takes from the right end.
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(EVENTS_KEY, serde_json::to_string(event)?).await?;
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<NotificationEvent>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(RECENT_EVENTS_KEY, 0, limit as isize - 1)
            .await?;
        raw.iter().map(|r| decode(RECENT_EVENTS_KEY, r)).collect()
    }

    async fn push_notification(
        &self,
        notification: &ScheduledNotification,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(
                NOTIFICATIONS_KEY,
                serde_json::to_string(notification)?,
                notification.send_after,
            )
            .await?;
        Ok(())
    }

    async fn fetch_due_notifications(
        &self,
        now: i64,
        limit: usize,
    ) -> Result<Vec<ScheduledNotification>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::Script::new(FETCH_DUE_SCRIPT)
            .key(NOTIFICATIONS_KEY)
            .arg(now)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        // Entries are already removed; a broken one is logged and skipped so
        // it cannot hold back the rest of the batch.
        let mut due = Vec::with_capacity(raw.len());
        for entry in raw {
            match decode::<ScheduledNotification>(NOTIFICATIONS_KEY, &entry) {
                Ok(notification) => due.push(notification),
                Err(e) => tracing::warn!(error = %e, "Dropping undecodable notification"),
            }
        }
        Ok(due)
    }

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerData>, StoreError> {
        let element: Option<TriggerStorageElement> =
            self.get_json(&trigger_key(trigger_id)).await?;
        element.map(|e| e.into_trigger(trigger_id)).transpose()
    }

    async fn save_trigger(&self, trigger: &TriggerData) -> Result<(), StoreError> {
        let element = TriggerStorageElement::from(trigger);
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(trigger_key(&trigger.id), serde_json::to_string(&element)?)
            .await?;
        Ok(())
    }

    async fn get_check_data(&self, trigger_id: &str) -> Result<Option<CheckData>, StoreError> {
        self.get_json(&last_check_key(trigger_id)).await
    }

    async fn get_subscriptions_by_tags(
        &self,
        tags: &[String],
    ) -> Result<Vec<SubscriptionData>, StoreError> {
        let mut index_keys: Vec<String> = tags.iter().map(|t| tag_subscriptions_key(t)).collect();
        index_keys.push(ANY_TAGS_SUBSCRIPTIONS_KEY.to_string());

        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.sunion(&index_keys).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();

        let keys: Vec<String> = ids.iter().map(|id| subscription_key(id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut subscriptions = Vec::with_capacity(raw.len());
        for (key, entry) in keys.iter().zip(raw) {
            // Index entries can outlive a deleted subscription.
            let Some(entry) = entry else { continue };
            match decode::<SubscriptionData>(key, &entry) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable subscription"),
            }
        }
        Ok(subscriptions)
    }

    async fn save_subscription(&self, subscription: &SubscriptionData) -> Result<(), StoreError> {
        let key = subscription_key(&subscription.id);
        let previous: Option<SubscriptionData> = self.get_json(&key).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(previous) = previous {
            let current: HashSet<&String> = subscription.tags.iter().collect();
            for tag in previous.tags.iter().filter(|t| !current.contains(t)) {
                pipe.srem(tag_subscriptions_key(tag), &subscription.id).ignore();
            }
        }
        for tag in &subscription.tags {
            pipe.sadd(tag_subscriptions_key(tag), &subscription.id).ignore();
        }
        if subscription.any_tags {
            pipe.sadd(ANY_TAGS_SUBSCRIPTIONS_KEY, &subscription.id).ignore();
        } else {
            pipe.srem(ANY_TAGS_SUBSCRIPTIONS_KEY, &subscription.id).ignore();
        }
        pipe.set(&key, serde_json::to_string(subscription)?).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactData>, StoreError> {
        self.get_json(&contact_key(contact_id)).await
    }

    async fn save_contact(&self, contact: &ContactData) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(contact_key(&contact.id), serde_json::to_string(contact)?)
            .await?;
        Ok(())
    }

    async fn get_throttle_state(
        &self,
        trigger_id: &str,
        contact_id: &str,
    ) -> Result<Option<ThrottleState>, StoreError> {
        self.get_json(&throttle_key(trigger_id, contact_id)).await
    }

    async fn set_throttle_state(
        &self,
        trigger_id: &str,
        contact_id: &str,
        state: &ThrottleState,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(
                throttle_key(trigger_id, contact_id),
                serde_json::to_string(state)?,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(ttl: Option<i64>) -> TriggerData {
        TriggerData {
            id: "trigger-1".to_string(),
            name: "disk usage".to_string(),
            description: Some("root volume".to_string()),
            targets: vec!["servers.*.disk.root".to_string()],
            warn_value: Some(80.0),
            error_value: Some(95.0),
            tags: vec!["db".to_string(), "disk".to_string()],
            ttl_state: Some(State::Nodata),
            ttl,
            schedule: None,
            expression: None,
            patterns: vec!["servers.*.disk.root".to_string()],
            is_simple_trigger: true,
        }
    }

    fn round_trip(original: &TriggerData) -> TriggerData {
        let json = serde_json::to_string(&TriggerStorageElement::from(original)).unwrap();
        let element: TriggerStorageElement = serde_json::from_str(&json).unwrap();
        element.into_trigger(&original.id).unwrap()
    }

    #[test]
    fn test_trigger_round_trip_with_ttl() {
        let original = trigger(Some(600));
        let json = serde_json::to_value(TriggerStorageElement::from(&original)).unwrap();
        assert_eq!(json["ttl"], "600");
        assert_eq!(round_trip(&original), original);
    }

    #[test]
    fn test_trigger_round_trip_without_ttl() {
        let original = trigger(None);
        let restored = round_trip(&original);
        assert_eq!(restored.ttl, None);
        assert_eq!(restored, original);
    }

    #[test]
    fn test_trigger_id_comes_from_key() {
        let element: TriggerStorageElement =
            serde_json::from_str(r#"{"id":"","name":"n","ttl":"30"}"#).unwrap();
        let restored = element.into_trigger("trigger-9").unwrap();
        assert_eq!(restored.id, "trigger-9");
        assert_eq!(restored.ttl, Some(30));
    }

    #[test]
    fn test_non_numeric_ttl_is_malformed() {
        let element: TriggerStorageElement =
            serde_json::from_str(r#"{"id":"t","name":"n","ttl":"ten"}"#).unwrap();
        let err = element.into_trigger("t").unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        assert!(!err.is_transient());
    }
}
