//! Throttling policy: decides whether and when a subscription is notified.
//!
//! Escalations and recoveries go out immediately and reset the escalation
//! tier. Repeated non-escalating events inside the current tier's cooldown
//! are not dropped: they are marked throttled and scheduled at the end of the
//! window, where the delivery worker coalesces them into one message. Each
//! new window advances the tier, growing the cooldown up to its ceiling.
//!
//! The policy is pure; the caller loads and persists [`ThrottleState`].

use herald_common::config::{CooldownGrowth, ThrottlingConfig};
use herald_common::types::{
    NotificationEvent, ScheduleData, State, SubscriptionData, ThrottleState, TriggerData,
};

use crate::matcher::AlertMatcher;
use crate::schedule::clip_send_after;

/// Outcome of [`ThrottlingPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub send: bool,
    /// Unix seconds; meaningful only when `send` is true
    pub send_after: i64,
    pub throttled: bool,
    /// State to persist for the (trigger, contact) pair
    pub next_state: Option<ThrottleState>,
}

impl Decision {
    fn skip(previous: Option<ThrottleState>) -> Self {
        Self {
            send: false,
            send_after: 0,
            throttled: false,
            next_state: previous,
        }
    }
}

/// Cooldown/escalation policy driven by [`ThrottlingConfig`].
#[derive(Debug, Clone)]
pub struct ThrottlingPolicy {
    config: ThrottlingConfig,
}

impl ThrottlingPolicy {
    pub fn new(config: ThrottlingConfig) -> Self {
        Self { config }
    }

    /// Cooldown in seconds of escalation tier `tier`.
    pub fn cooldown(&self, tier: u32) -> i64 {
        let base = self.config.base_cooldown_secs.max(0);
        let raw = match self.config.growth {
            CooldownGrowth::Linear => base.saturating_mul(i64::from(tier) + 1),
            CooldownGrowth::Exponential => {
                let multiplier = i64::from(self.config.factor)
                    .checked_pow(tier)
                    .unwrap_or(i64::MAX);
                base.saturating_mul(multiplier)
            }
        };
        raw.min(self.config.max_cooldown_secs).max(0)
    }

    /// Tier after one more throttled window; holds once the ceiling is hit.
    fn next_tier(&self, tier: u32) -> u32 {
        if self.cooldown(tier) >= self.config.max_cooldown_secs {
            tier
        } else {
            tier.saturating_add(1)
        }
    }

    /// Escalation: the new state is more severe than the old one.
    pub fn is_escalation(event: &NotificationEvent) -> bool {
        event.state > event.old_state
    }

    /// Decide the notification for one (subscription, contact) pair.
    ///
    /// `event.timestamp` must already be resolved by the caller.
    pub fn decide(
        &self,
        subscription: &SubscriptionData,
        trigger: &TriggerData,
        previous: Option<ThrottleState>,
        event: &NotificationEvent,
    ) -> Decision {
        if !subscription.enabled
            || !AlertMatcher::tags_match(subscription, trigger)
            || AlertMatcher::is_ignored(subscription, event)
        {
            return Decision::skip(previous);
        }

        let schedules: Vec<&ScheduleData> = trigger
            .schedule
            .iter()
            .chain(subscription.schedule.iter())
            .collect();
        let ts = event.timestamp;

        if !subscription.throttling_enabled {
            let send_after = clip_send_after(ts, &schedules);
            return Decision {
                send: true,
                send_after,
                throttled: false,
                next_state: Some(ThrottleState {
                    last_sent: send_after,
                    tier: 0,
                }),
            };
        }

        let (slot, throttled, tier) = match previous {
            _ if Self::is_escalation(event) || event.state == State::Ok => (ts, false, 0),
            None => (ts, false, 0),
            Some(prev) if ts >= prev.last_sent + self.cooldown(prev.tier) => {
                (ts, false, prev.tier)
            }
            // A coalesced notification is still pending; join it.
            Some(prev) if ts < prev.last_sent => (prev.last_sent, true, prev.tier),
            Some(prev) => (
                prev.last_sent + self.cooldown(prev.tier),
                true,
                self.next_tier(prev.tier),
            ),
        };

        let send_after = clip_send_after(slot, &schedules);
        Decision {
            send: true,
            send_after,
            throttled,
            next_state: Some(ThrottleState {
                last_sent: send_after,
                tier,
            }),
        }
    }
}

impl Default for ThrottlingPolicy {
    fn default() -> Self {
        Self::new(ThrottlingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;

    fn policy(growth: CooldownGrowth) -> ThrottlingPolicy {
        ThrottlingPolicy::new(ThrottlingConfig {
            base_cooldown_secs: 60,
            growth,
            factor: 2,
            max_cooldown_secs: 300,
        })
    }

    fn trigger() -> TriggerData {
        TriggerData {
            id: "T1".to_string(),
            name: "db load".to_string(),
            description: None,
            targets: vec!["db.load".to_string()],
            warn_value: Some(5.0),
            error_value: Some(10.0),
            tags: vec!["db".to_string()],
            ttl_state: None,
            ttl: None,
            schedule: None,
            expression: None,
            patterns: vec![],
            is_simple_trigger: true,
        }
    }

    fn subscription(throttling_enabled: bool) -> SubscriptionData {
        SubscriptionData {
            id: "S1".to_string(),
            enabled: true,
            tags: vec!["db".to_string()],
            contacts: vec!["C1".to_string()],
            throttling_enabled,
            schedule: None,
            any_tags: false,
            ignore_warnings: false,
            ignore_recoverings: false,
        }
    }

    fn event(old_state: State, state: State, timestamp: i64) -> NotificationEvent {
        NotificationEvent {
            trigger_id: "T1".to_string(),
            metric: "db.load".to_string(),
            state,
            old_state,
            timestamp,
            message: None,
        }
    }

    #[test]
    fn test_linear_cooldown_curve() {
        let p = policy(CooldownGrowth::Linear);
        let curve: Vec<i64> = (0..7).map(|t| p.cooldown(t)).collect();
        assert_eq!(curve, vec![60, 120, 180, 240, 300, 300, 300]);
    }

    #[test]
    fn test_exponential_cooldown_curve() {
        let p = policy(CooldownGrowth::Exponential);
        let curve: Vec<i64> = (0..5).map(|t| p.cooldown(t)).collect();
        assert_eq!(curve, vec![60, 120, 240, 300, 300]);
        assert_eq!(p.cooldown(u32::MAX), 300);
    }

    #[test]
    fn test_tier_stops_at_ceiling() {
        let p = policy(CooldownGrowth::Exponential);
        assert_eq!(p.next_tier(2), 3);
        assert_eq!(p.next_tier(3), 3);
    }

    #[test]
    fn test_disabled_subscription_is_skipped() {
        let p = policy(CooldownGrowth::Linear);
        let mut sub = subscription(true);
        sub.enabled = false;
        let previous = Some(ThrottleState { last_sent: T0, tier: 2 });
        let decision = p.decide(&sub, &trigger(), previous, &event(State::Ok, State::Error, T0));
        assert!(!decision.send);
        assert_eq!(decision.next_state, previous);
    }

    #[test]
    fn test_no_tag_intersection_is_skipped() {
        let p = policy(CooldownGrowth::Linear);
        let mut sub = subscription(false);
        sub.tags = vec!["web".to_string()];
        let decision = p.decide(&sub, &trigger(), None, &event(State::Ok, State::Error, T0));
        assert!(!decision.send);
    }

    #[test]
    fn test_throttling_disabled_sends_immediately() {
        let p = policy(CooldownGrowth::Linear);
        let sub = subscription(false);
        let previous = Some(ThrottleState { last_sent: T0, tier: 0 });
        let decision = p.decide(&sub, &trigger(), previous, &event(State::Warn, State::Warn, T0 + 1));
        assert!(decision.send);
        assert!(!decision.throttled);
        assert_eq!(decision.send_after, T0 + 1);
    }

    #[test]
    fn test_escalations_are_never_throttled() {
        let p = policy(CooldownGrowth::Linear);
        let sub = subscription(true);
        let transitions = [
            (State::Ok, State::Warn),
            (State::Ok, State::Error),
            (State::Warn, State::Error),
            (State::Error, State::Nodata),
            (State::Nodata, State::Exception),
        ];
        for tier in [0, 3] {
            for (old, new) in transitions {
                let previous = Some(ThrottleState { last_sent: T0 + 50, tier });
                let decision = p.decide(&sub, &trigger(), previous, &event(old, new, T0 + 10));
                assert!(decision.send);
                assert!(!decision.throttled, "{} -> {} throttled", old, new);
                assert_eq!(decision.send_after, T0 + 10);
                assert_eq!(decision.next_state.unwrap().tier, 0);
            }
        }
    }

    #[test]
    fn test_recovery_resets_tier() {
        let p = policy(CooldownGrowth::Linear);
        let previous = Some(ThrottleState { last_sent: T0, tier: 4 });
        let decision = p.decide(
            &subscription(true),
            &trigger(),
            previous,
            &event(State::Error, State::Ok, T0 + 1),
        );
        assert!(!decision.throttled);
        assert_eq!(decision.send_after, T0 + 1);
        assert_eq!(decision.next_state, Some(ThrottleState { last_sent: T0 + 1, tier: 0 }));
    }

    #[test]
    fn test_same_state_throttled_within_cooldown() {
        let p = policy(CooldownGrowth::Linear);
        let sub = subscription(true);
        for state in [State::Warn, State::Error, State::Nodata, State::Exception] {
            for tier in 0..4 {
                let previous = Some(ThrottleState { last_sent: T0, tier });
                let cooldown = p.cooldown(tier);

                let inside = p.decide(&sub, &trigger(), previous, &event(state, state, T0 + cooldown - 1));
                assert!(inside.throttled);
                assert_eq!(inside.send_after, T0 + cooldown);

                let elapsed = p.decide(&sub, &trigger(), previous, &event(state, state, T0 + cooldown));
                assert!(!elapsed.throttled);
                assert_eq!(elapsed.send_after, T0 + cooldown);
            }
        }
    }

    #[test]
    fn test_throttled_events_coalesce_into_pending_slot() {
        let p = policy(CooldownGrowth::Linear);
        let sub = subscription(true);

        let first = p.decide(
            &sub,
            &trigger(),
            Some(ThrottleState { last_sent: T0, tier: 0 }),
            &event(State::Warn, State::Warn, T0 + 5),
        );
        assert_eq!(first.send_after, T0 + 60);
        assert_eq!(first.next_state, Some(ThrottleState { last_sent: T0 + 60, tier: 1 }));

        let second = p.decide(&sub, &trigger(), first.next_state, &event(State::Warn, State::Warn, T0 + 30));
        assert!(second.throttled);
        assert_eq!(second.send_after, T0 + 60);
        assert_eq!(second.next_state, first.next_state);

        // After the slot went out the next window uses tier 1 (120s).
        let third = p.decide(&sub, &trigger(), second.next_state, &event(State::Warn, State::Warn, T0 + 90));
        assert!(third.throttled);
        assert_eq!(third.send_after, T0 + 60 + 120);
    }

    #[test]
    fn test_warn_warn_error_scenario() {
        let p = policy(CooldownGrowth::Linear);
        let sub = subscription(true);
        let t = trigger();

        let first = p.decide(&sub, &t, None, &event(State::Ok, State::Warn, T0));
        assert!(first.send);
        assert!(!first.throttled);
        assert_eq!(first.send_after, T0);

        let second = p.decide(&sub, &t, first.next_state, &event(State::Warn, State::Warn, T0 + 1));
        assert!(second.send);
        assert!(second.throttled);
        assert!(second.send_after > T0 + 1);

        let third = p.decide(&sub, &t, second.next_state, &event(State::Warn, State::Error, T0 + 2));
        assert!(third.send);
        assert!(!third.throttled);
        assert_eq!(third.send_after, T0 + 2);
    }

    #[test]
    fn test_send_after_never_before_event() {
        let p = policy(CooldownGrowth::Exponential);
        let sub = subscription(true);
        let mut state = None;
        let states = [State::Warn, State::Warn, State::Error, State::Error, State::Warn, State::Ok];
        let mut old = State::Ok;
        for (i, new) in states.into_iter().enumerate() {
            let ts = T0 + i as i64 * 7;
            let decision = p.decide(&sub, &trigger(), state, &event(old, new, ts));
            assert!(decision.send_after >= ts);
            state = decision.next_state;
            old = new;
        }
    }

    #[test]
    fn test_schedule_clips_forward() {
        use herald_common::types::ScheduleDay;

        let p = policy(CooldownGrowth::Linear);
        let mut t = trigger();
        // Monday 2024-01-01, window 09:00-18:00 every day
        let monday: i64 = 1_704_067_200;
        t.schedule = Some(ScheduleData {
            days: ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]
                .iter()
                .map(|d| ScheduleDay { name: d.to_string(), enabled: true })
                .collect(),
            tz_offset: 0,
            start_offset: 9 * 60,
            end_offset: 18 * 60,
        });

        let decision = p.decide(&subscription(false), &t, None, &event(State::Ok, State::Error, monday + 3600));
        assert_eq!(decision.send_after, monday + 9 * 3600);
    }

    #[test]
    fn test_throttled_slot_after_subscription_hours_moves_to_next_window() {
        use herald_common::types::ScheduleDay;

        let p = policy(CooldownGrowth::Linear);
        let monday: i64 = 1_704_067_200;
        let mut sub = subscription(true);
        sub.schedule = Some(ScheduleData {
            days: ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]
                .iter()
                .map(|d| ScheduleDay { name: d.to_string(), enabled: true })
                .collect(),
            tz_offset: 0,
            start_offset: 9 * 60,
            end_offset: 18 * 60,
        });

        // Sent at 17:59:30; the cooldown slot lands at 18:00:30.
        let last_sent = monday + 18 * 3600 - 30;
        let previous = Some(ThrottleState { last_sent, tier: 0 });
        let decision = p.decide(&sub, &trigger(), previous, &event(State::Warn, State::Warn, last_sent + 5));

        let tuesday_opening = monday + 86_400 + 9 * 3600;
        assert!(decision.send);
        assert!(decision.throttled);
        assert_eq!(decision.send_after, tuesday_opening);
        assert_eq!(
            decision.next_state,
            Some(ThrottleState { last_sent: tuesday_opening, tier: 1 })
        );
    }
}
