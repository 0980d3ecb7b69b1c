//! Daemon configuration at ~/.config/livesync/config.toml
//!
//! Everything except the watched resources, the provider base URL and the
//! public callback address has a default, so a minimal config is three
//! lines.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_port() -> u16 {
    4097
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("livesync")
}

fn default_renewal_interval_secs() -> u64 {
    60
}

fn default_renewal_window_secs() -> u64 {
    300
}

fn default_grace_secs() -> u64 {
    120
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    5
}

/// Bounded exponential backoff knobs, shared by registration and
/// reconciliation retries.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Public URL the provider pushes notifications to, e.g. an ngrok or
    /// reverse-proxy address ending in /webhook.
    pub callback_address: String,

    /// Provider resources (calendar ids) to keep watched.
    pub resources: Vec<String>,

    /// Base URL of the provider API.
    pub provider_base_url: String,

    /// Static bearer token for provider calls. Obtaining and refreshing
    /// credentials is out of scope; whatever mints this token owns that.
    #[serde(default)]
    pub provider_bearer_token: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Where channel and watermark snapshots live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// How often the renewal scheduler ticks.
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,

    /// Channels expiring within this window get a successor registered.
    /// Must comfortably exceed the tick interval.
    #[serde(default = "default_renewal_window_secs")]
    pub renewal_window_secs: u64,

    /// How long a superseded channel stays queryable for in-flight
    /// notifications before deletion.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("livesync");

        Ok(config_dir.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn renewal_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renewal_window_secs as i64)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }
}
