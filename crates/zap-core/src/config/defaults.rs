//! Default value functions used by serde for config deserialization.

pub fn default_name() -> String {
    "zap".to_string()
}

pub fn default_data_dir() -> String {
    "~/.zap".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_db_path() -> String {
    "~/.zap/data/zap.db".to_string()
}

pub fn default_max_reconnect_attempts() -> u32 {
    5
}

pub fn default_reconnect_base_delay() -> u64 {
    5
}

pub fn default_connect_timeout() -> u64 {
    60
}

pub fn default_keepalive_interval() -> u64 {
    30
}

pub fn default_health_check_interval() -> u64 {
    15
}

pub fn default_bridge_url() -> String {
    "ws://127.0.0.1:8787/session".to_string()
}

pub fn default_send_timeout_secs() -> u64 {
    30
}
