mod defaults;


use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ZapError;
use defaults::*;

/// Top-level zap configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub zap: ZapConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZapConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ZapConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Credential store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Connection lifecycle policy.
///
/// Backoff for reconnect attempt `n` is `reconnect_base_delay_secs * 2^(n-1)`,
/// clamped to `reconnect_max_delay_secs` when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_secs: u64,
    /// Ceiling for a single backoff delay. Absent = uncapped.
    #[serde(default)]
    pub reconnect_max_delay_secs: Option<u64>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Cap on buffered received messages per session. Absent = unbounded.
    #[serde(default)]
    pub max_buffered_messages: Option<usize>,
    /// Clear stored credentials when reconnect attempts are exhausted.
    #[serde(default)]
    pub clear_credentials_on_failure: bool,
    /// Session ids `zap start` initializes on boot.
    #[serde(default)]
    pub autostart: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_secs: default_reconnect_base_delay(),
            reconnect_max_delay_secs: None,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            health_check_interval_secs: default_health_check_interval(),
            max_buffered_messages: None,
            clear_credentials_on_failure: false,
            autostart: Vec::new(),
        }
    }
}

/// WebSocket protocol bridge config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub url: String,
    /// How long a send waits for the bridge's acknowledgement.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

impl Config {
    /// Reject values the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ZapError> {
        let s = &self.session;
        if s.reconnect_base_delay_secs == 0 {
            return Err(ZapError::Config(
                "session.reconnect_base_delay_secs must be greater than 0".into(),
            ));
        }
        if s.connect_timeout_secs == 0
            || s.keepalive_interval_secs == 0
            || s.health_check_interval_secs == 0
        {
            return Err(ZapError::Config(
                "session timeouts and intervals must be greater than 0".into(),
            ));
        }
        if let Some(max) = s.reconnect_max_delay_secs {
            if max < s.reconnect_base_delay_secs {
                return Err(ZapError::Config(format!(
                    "session.reconnect_max_delay_secs ({max}) is below the base delay ({})",
                    s.reconnect_base_delay_secs
                )));
            }
        }
        if s.max_buffered_messages == Some(0) {
            return Err(ZapError::Config(
                "session.max_buffered_messages must be greater than 0 (omit it for unbounded)"
                    .into(),
            ));
        }
        if !self.bridge.url.starts_with("ws://") && !self.bridge.url.starts_with("wss://") {
            return Err(ZapError::Config(format!(
                "bridge.url must be a ws:// or wss:// URL, got '{}'",
                self.bridge.url
            )));
        }
        if self.bridge.send_timeout_secs == 0 {
            return Err(ZapError::Config(
                "bridge.send_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `~` to home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file.
///
/// Falls back to defaults if the file does not exist.
pub fn load(path: &str) -> Result<Config, ZapError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ZapError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| ZapError::Config(format!("failed to parse config: {}", e)))?;

    config.validate()?;
    Ok(config)
}
