//! Subscription matcher: decides which subscriptions an event fans out to.
//!
//! For each incoming event:
//! 1. Load candidate subscriptions from the store's tag index
//! 2. Keep enabled subscriptions whose tags intersect the trigger's tags
//!    (or that match any tags)
//! 3. Drop transitions the subscription asked to ignore

use std::collections::HashSet;

use herald_common::error::StoreError;
use herald_common::store::NotifierStore;
use herald_common::types::{NotificationEvent, State, SubscriptionData, TriggerData};

/// Matches triggers and events against subscriptions.
pub struct AlertMatcher;

impl AlertMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Enabled subscriptions whose tags match `trigger`, ordered by id.
    pub async fn find_matching_subscriptions(
        &self,
        trigger: &TriggerData,
        store: &dyn NotifierStore,
    ) -> Result<Vec<SubscriptionData>, StoreError> {
        let candidates = store.get_subscriptions_by_tags(&trigger.tags).await?;

        Ok(candidates
            .into_iter()
            .filter(|s| s.enabled && Self::tags_match(s, trigger))
            .collect())
    }

    /// Non-empty tag intersection, or the subscription matches any tags.
    pub fn tags_match(subscription: &SubscriptionData, trigger: &TriggerData) -> bool {
        if subscription.any_tags {
            return true;
        }
        let trigger_tags: HashSet<&str> = trigger.tags.iter().map(String::as_str).collect();
        subscription
            .tags
            .iter()
            .any(|t| trigger_tags.contains(t.as_str()))
    }

    /// Whether the subscription opted out of this kind of transition.
    ///
    /// - `ignore_warnings`: transitions between OK and WARN
    /// - `ignore_recoverings`: transitions to a less severe state
    pub fn is_ignored(subscription: &SubscriptionData, event: &NotificationEvent) -> bool {
        if subscription.ignore_warnings && Self::is_warning_transition(event) {
            return true;
        }
        subscription.ignore_recoverings && event.state < event.old_state
    }

    fn is_warning_transition(event: &NotificationEvent) -> bool {
        matches!(
            (event.old_state, event.state),
            (State::Ok, State::Warn) | (State::Warn, State::Ok)
        )
    }
}

impl Default for AlertMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(tags: &[&str]) -> TriggerData {
        TriggerData {
            id: "t1".to_string(),
            name: "t1".to_string(),
            description: None,
            targets: vec!["a.b.c".to_string()],
            warn_value: None,
            error_value: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ttl_state: None,
            ttl: None,
            schedule: None,
            expression: None,
            patterns: vec![],
            is_simple_trigger: false,
        }
    }

    fn subscription(tags: &[&str]) -> SubscriptionData {
        SubscriptionData {
            id: "s1".to_string(),
            enabled: true,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            contacts: vec!["c1".to_string()],
            throttling_enabled: false,
            schedule: None,
            any_tags: false,
            ignore_warnings: false,
            ignore_recoverings: false,
        }
    }

    fn event(old_state: State, state: State) -> NotificationEvent {
        NotificationEvent {
            trigger_id: "t1".to_string(),
            metric: "a.b.c".to_string(),
            state,
            old_state,
            timestamp: 1000,
            message: None,
        }
    }

    #[test]
    fn test_tags_intersection() {
        let t = trigger(&["db", "prod"]);
        assert!(AlertMatcher::tags_match(&subscription(&["db"]), &t));
        assert!(AlertMatcher::tags_match(&subscription(&["web", "prod"]), &t));
        assert!(!AlertMatcher::tags_match(&subscription(&["web"]), &t));
        assert!(!AlertMatcher::tags_match(&subscription(&[]), &t));
    }

    #[test]
    fn test_any_tags_matches_untagged_trigger() {
        let mut sub = subscription(&[]);
        sub.any_tags = true;
        assert!(AlertMatcher::tags_match(&sub, &trigger(&[])));
    }

    #[test]
    fn test_ignore_warnings() {
        let mut sub = subscription(&["db"]);
        sub.ignore_warnings = true;
        assert!(AlertMatcher::is_ignored(&sub, &event(State::Ok, State::Warn)));
        assert!(AlertMatcher::is_ignored(&sub, &event(State::Warn, State::Ok)));
        assert!(!AlertMatcher::is_ignored(&sub, &event(State::Warn, State::Error)));
        assert!(!AlertMatcher::is_ignored(&sub, &event(State::Error, State::Ok)));
    }

    #[test]
    fn test_ignore_recoverings() {
        let mut sub = subscription(&["db"]);
        sub.ignore_recoverings = true;
        assert!(AlertMatcher::is_ignored(&sub, &event(State::Error, State::Ok)));
        assert!(AlertMatcher::is_ignored(&sub, &event(State::Error, State::Warn)));
        assert!(!AlertMatcher::is_ignored(&sub, &event(State::Ok, State::Error)));
        assert!(!AlertMatcher::is_ignored(&subscription(&["db"]), &event(State::Error, State::Ok)));
    }
}
