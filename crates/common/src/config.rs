use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Shape of the throttling cooldown curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CooldownGrowth {
    /// `base * (tier + 1)`
    Linear,
    /// `base * factor ^ tier`
    Exponential,
}

impl std::str::FromStr for CooldownGrowth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(CooldownGrowth::Linear),
            "exponential" => Ok(CooldownGrowth::Exponential),
            other => Err(anyhow::anyhow!(
                "THROTTLE_GROWTH must be 'linear' or 'exponential', got '{}'",
                other
            )),
        }
    }
}

/// Cooldown curve parameters for throttled subscriptions.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottlingConfig {
    /// Cooldown of tier 0
    pub base_cooldown_secs: i64,
    pub growth: CooldownGrowth,
    /// Multiplier for exponential growth
    pub factor: u32,
    /// Ceiling; tiers past it hold this cooldown
    pub max_cooldown_secs: i64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            base_cooldown_secs: 300,
            growth: CooldownGrowth::Linear,
            factor: 2,
            max_cooldown_secs: 3600,
        }
    }
}

/// Settings of the delivery side of the pipeline.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Deadline of a single sender call
    pub sending_timeout: Duration,
    /// Age past which a failing notification is dropped instead of resent
    pub resending_timeout: Duration,
    /// Delay before a failed notification becomes due again
    pub resend_delay: Duration,
    /// Idle sleep between polls of the notification queue
    pub poll_interval: Duration,
    /// Maximum notifications popped per poll
    pub fetch_limit: usize,
    /// Extra time to wait for more due notifications before grouping
    pub batch_window: Duration,
    /// Concurrent sender calls across all contacts
    pub max_parallel_sends: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            sending_timeout: Duration::from_secs(10),
            resending_timeout: Duration::from_secs(24 * 3600),
            resend_delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            fetch_limit: 100,
            batch_window: Duration::ZERO,
            max_parallel_sends: 16,
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis connection string
    pub redis_url: String,

    /// Back-off between retries of a failed store operation
    pub store_retry_delay: Duration,

    pub notifier: NotifierConfig,

    pub throttling: ThrottlingConfig,

    /// One settings map per sender backend; each carries a `type` key
    pub senders: Vec<HashMap<String, String>>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{} has an invalid value", name))
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let senders = match std::env::var("HERALD_SENDERS") {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                anyhow::anyhow!("HERALD_SENDERS must be a JSON array of string maps: {}", e)
            })?,
            Err(_) => vec![HashMap::from([("type".to_string(), "log".to_string())])],
        };

        let fetch_limit: usize = env_or("NOTIFIER_FETCH_LIMIT", "100")?;
        let max_parallel_sends: usize = env_or("NOTIFIER_MAX_PARALLEL_SENDS", "16")?;
        if fetch_limit == 0 || max_parallel_sends == 0 {
            anyhow::bail!("NOTIFIER_FETCH_LIMIT and NOTIFIER_MAX_PARALLEL_SENDS must be positive");
        }

        Ok(Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            store_retry_delay: Duration::from_millis(env_or("STORE_RETRY_DELAY_MS", "1000")?),
            notifier: NotifierConfig {
                sending_timeout: Duration::from_millis(env_or("SENDING_TIMEOUT_MS", "10000")?),
                resending_timeout: Duration::from_secs(env_or("RESENDING_TIMEOUT_SECS", "86400")?),
                resend_delay: Duration::from_secs(env_or("RESEND_DELAY_SECS", "60")?),
                poll_interval: Duration::from_millis(env_or("NOTIFIER_POLL_INTERVAL_MS", "1000")?),
                fetch_limit,
                batch_window: Duration::from_millis(env_or("NOTIFIER_BATCH_WINDOW_MS", "0")?),
                max_parallel_sends,
            },
            throttling: ThrottlingConfig {
                base_cooldown_secs: env_or("THROTTLE_BASE_COOLDOWN_SECS", "300")?,
                growth: std::env::var("THROTTLE_GROWTH")
                    .unwrap_or_else(|_| "linear".to_string())
                    .parse()?,
                factor: env_or("THROTTLE_FACTOR", "2")?,
                max_cooldown_secs: env_or("THROTTLE_MAX_COOLDOWN_SECS", "3600")?,
            },
            senders,
        })
    }
}
