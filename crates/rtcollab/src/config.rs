use serde::Deserialize;
use tokio::time::Duration;
use tracing::info;

const DEFAULT_BASE_URL: &str = "ws://localhost:8000";
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_RECENT_NOTIFICATIONS: usize = 5;

/// Bounded exponential backoff used after an unexpected disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts per disconnect episode
    pub max_attempts: u32,
    /// Delay before the first attempt; doubled for every following one
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before the given (zero-based) attempt: `base_delay * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
        )
    }
}

/// Transport configuration shared by room sessions and the notification channel
#[derive(Debug, Clone, PartialEq)]
pub struct CollabConfig {
    /// Base WebSocket URL, e.g. `ws://localhost:8000`
    pub base_url: String,
    /// Interval between heartbeat `ping` frames while a connection is open
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// How many pushed notifications the notification channel keeps around
    pub recent_notifications: usize,
}

impl CollabConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the reconnection policy
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the capacity of the recent-notification buffer
    pub fn with_recent_notifications(mut self, capacity: usize) -> Self {
        self.recent_notifications = capacity;
        self
    }

    /// Load configuration from `COLLAB_*` environment variables
    ///
    /// Every variable is optional; missing ones fall back to the defaults.
    pub fn from_env() -> crate::CollabResult<Self> {
        let env: EnvConfig = envy::prefixed("COLLAB_").from_env()?;
        let config = Self::from(env);
        info!("Loaded collaboration config for {}", config.base_url);
        Ok(config)
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            reconnect: ReconnectPolicy::default(),
            recent_notifications: DEFAULT_RECENT_NOTIFICATIONS,
        }
    }
}

/// Flat environment representation of [`CollabConfig`]
#[derive(Debug, Deserialize)]
struct EnvConfig {
    #[serde(default = "default_base_url")]
    base_url: String,
    #[serde(default = "default_heartbeat_secs")]
    heartbeat_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    reconnect_max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    reconnect_base_delay_ms: u64,
    #[serde(default = "default_recent_notifications")]
    recent_notifications: usize,
}

impl From<EnvConfig> for CollabConfig {
    fn from(env: EnvConfig) -> Self {
        Self {
            base_url: env.base_url,
            heartbeat_interval: Duration::from_secs(env.heartbeat_interval_secs),
            reconnect: ReconnectPolicy::new(
                env.reconnect_max_attempts,
                Duration::from_millis(env.reconnect_base_delay_ms),
            ),
            recent_notifications: env.recent_notifications,
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_recent_notifications() -> usize {
    DEFAULT_RECENT_NOTIFICATIONS
}
