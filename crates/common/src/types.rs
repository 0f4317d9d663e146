use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trigger / metric state labels.
///
/// Variants are declared in ascending severity; `Ord` is used by the
/// throttling policy to detect escalations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Ok,
    Warn,
    Error,
    Nodata,
    Exception,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Ok => write!(f, "OK"),
            State::Warn => write!(f, "WARN"),
            State::Error => write!(f, "ERROR"),
            State::Nodata => write!(f, "NODATA"),
            State::Exception => write!(f, "EXCEPTION"),
        }
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(State::Ok),
            "WARN" => Ok(State::Warn),
            "ERROR" => Ok(State::Error),
            "NODATA" => Ok(State::Nodata),
            "EXCEPTION" => Ok(State::Exception),
            other => Err(format!("unknown state label '{}'", other)),
        }
    }
}

/// A single day entry of a notification schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDay {
    /// Short weekday name: "Mon", "Tue", ... "Sun"
    pub name: String,
    pub enabled: bool,
}

/// Allowed notification windows.
///
/// Offsets are minutes from local midnight; `tz_offset` is the number of
/// minutes to subtract from UTC to get local time (JavaScript convention).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleData {
    pub days: Vec<ScheduleDay>,
    #[serde(rename = "tzOffset")]
    pub tz_offset: i64,
    #[serde(rename = "startOffset")]
    pub start_offset: i64,
    #[serde(rename = "endOffset")]
    pub end_offset: i64,
}

/// An alerting rule, as read from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerData {
    pub id: String,
    pub name: String,
    #[serde(rename = "desc", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub warn_value: Option<f64>,
    #[serde(default)]
    pub error_value: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// State to assume once `ttl` seconds pass without data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_state: Option<State>,
    /// Maximum silence duration in seconds
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(rename = "sched", default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub is_simple_trigger: bool,
}

/// Last known state of one metric of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricState {
    #[serde(default)]
    pub event_timestamp: i64,
    pub state: State,
    #[serde(default)]
    pub suppressed: bool,
    /// Last time the metric was observed
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// End of the maintenance window, 0 when none
    #[serde(default)]
    pub maintenance: i64,
}

impl MetricState {
    /// Timestamp of the last state change; falls back to the observation
    /// time when the checker did not record an explicit event time.
    pub fn get_event_timestamp(&self) -> i64 {
        if self.event_timestamp == 0 {
            self.timestamp
        } else {
            self.event_timestamp
        }
    }

    /// Point from which the checker should resume evaluation.
    pub fn get_check_point(&self, check_point_gap: i64) -> i64 {
        (self.timestamp - check_point_gap).max(self.event_timestamp)
    }
}

/// Aggregate state of a trigger, written by the checker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckData {
    #[serde(default)]
    pub metrics: HashMap<String, MetricState>,
    #[serde(default)]
    pub score: i64,
    pub state: Option<State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub event_timestamp: i64,
    #[serde(rename = "msg", default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub suppressed: bool,
}

impl CheckData {
    /// State of `metric`, or a fresh `NODATA` state observed at
    /// `empty_timestamp` when the metric has never been seen.
    pub fn get_metric_state(&self, metric: &str, empty_timestamp: i64) -> MetricState {
        self.metrics.get(metric).cloned().unwrap_or(MetricState {
            event_timestamp: 0,
            state: State::Nodata,
            suppressed: false,
            timestamp: empty_timestamp,
            value: None,
            maintenance: 0,
        })
    }

    /// Same fallback rule as [`MetricState::get_event_timestamp`]; `None`
    /// only when neither timestamp was ever recorded.
    pub fn get_event_timestamp(&self) -> Option<i64> {
        if self.event_timestamp == 0 {
            self.timestamp
        } else {
            Some(self.event_timestamp)
        }
    }
}

/// One state transition of a trigger/metric pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub trigger_id: String,
    pub metric: String,
    pub state: State,
    pub old_state: State,
    /// Unix seconds; 0 when the checker did not date the event
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "msg", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A rule mapping trigger tags to contacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub id: String,
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Contact ids, in notification order
    #[serde(default)]
    pub contacts: Vec<String>,
    #[serde(rename = "throttling", default)]
    pub throttling_enabled: bool,
    #[serde(rename = "sched", default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleData>,
    /// Match every trigger regardless of tags
    #[serde(default)]
    pub any_tags: bool,
    #[serde(default)]
    pub ignore_warnings: bool,
    #[serde(default)]
    pub ignore_recoverings: bool,
}

/// A delivery destination bound to a sender type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactData {
    pub id: String,
    #[serde(rename = "type")]
    pub contact_type: String,
    pub value: String,
}

/// Per (trigger, contact) throttling record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleState {
    /// Send-after of the most recent notification slot; may lie in the
    /// future while a coalesced notification is pending.
    pub last_sent: i64,
    pub tier: u32,
}

/// The unit stored in the notification queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub id: Uuid,
    pub event: NotificationEvent,
    pub trigger: TriggerData,
    pub contact: ContactData,
    /// Unix seconds
    pub send_after: i64,
    pub throttled: bool,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl ScheduledNotification {
    pub fn new(
        event: NotificationEvent,
        trigger: TriggerData,
        contact: ContactData,
        send_after: i64,
        throttled: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            trigger,
            contact,
            send_after,
            throttled,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}
