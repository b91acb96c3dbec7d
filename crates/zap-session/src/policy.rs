//! Reconnection and liveness policy.

use std::time::Duration;
use zap_core::config::SessionConfig;

/// Timing and retry bounds applied by every supervisor of a registry.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Consecutive transient closes tolerated before the session fails.
    pub max_attempts: u32,
    /// Delay before the first reconnect; doubles per attempt.
    pub base_delay: Duration,
    /// Optional ceiling for a single backoff delay.
    pub max_delay: Option<Duration>,
    /// How long a connection may stay in `Connecting` before it is retried.
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub health_check_interval: Duration,
    /// Cap on buffered received messages. `None` = unbounded.
    pub max_buffered_messages: Option<usize>,
    pub clear_credentials_on_failure: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionPolicy {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            max_attempts: cfg.max_reconnect_attempts,
            base_delay: Duration::from_secs(cfg.reconnect_base_delay_secs),
            max_delay: cfg.reconnect_max_delay_secs.map(Duration::from_secs),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(cfg.keepalive_interval_secs),
            health_check_interval: Duration::from_secs(cfg.health_check_interval_secs),
            max_buffered_messages: cfg.max_buffered_messages,
            clear_credentials_on_failure: cfg.clear_credentials_on_failure,
        }
    }
}

impl SessionPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`, clamped to `max_delay` when set.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
