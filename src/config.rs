use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Wire protocol spoken by the sensor gateway on the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Fixed 13-byte binary event records.
    Binary,
    /// One JSON object per line (legacy bench firmware).
    JsonLines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Sqlite,
    Journal,
    Console,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_directory: Option<String>,
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_sink")]
    pub sink: SinkKind,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_data_dir")]
    pub data_directory: String,
    #[serde(default = "default_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_seconds: u64,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_seconds: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    921600
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_window_size() -> usize {
    100
}

fn default_protocol() -> Protocol {
    Protocol::Binary
}

fn default_sink() -> SinkKind {
    SinkKind::Sqlite
}

fn default_database_path() -> String {
    "./deployment/events.db".to_string()
}

fn default_data_dir() -> String {
    "./deployment/data".to_string()
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_idle_threshold_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn default_path() -> &'static str {
        "config/deauth-collector.toml"
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read configuration from {}", path_ref.display()))?;
        Self::from_toml(&raw).with_context(|| {
            format!("failed to parse configuration from {}", path_ref.display())
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        if config.service_name.trim().is_empty() {
            config.service_name = "deauth-collector".to_string();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            bail!("window_size must be at least 1");
        }
        if self.read_timeout_ms == 0 {
            bail!("read_timeout_ms must be greater than zero");
        }
        if self.heartbeat_seconds == 0 {
            bail!("heartbeat_seconds must be greater than zero");
        }
        if self.reconnect_initial_backoff_ms > self.reconnect_max_backoff_ms {
            bail!(
                "reconnect_initial_backoff_ms ({}) exceeds reconnect_max_backoff_ms ({})",
                self.reconnect_initial_backoff_ms,
                self.reconnect_max_backoff_ms
            );
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reconnect_initial_backoff_ms),
            Duration::from_millis(self.reconnect_max_backoff_ms),
        )
    }
}
