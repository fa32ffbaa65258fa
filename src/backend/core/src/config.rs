//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Broker connection configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Worker runtime configuration
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Broker (Redis) connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker host
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Broker credential
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default = "default_db")]
    pub db: i64,

    /// Prefix applied to every broker key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Reconnect policy for broker outages
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            db: default_db(),
            key_prefix: default_key_prefix(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BrokerConfig {
    /// Build the broker connection URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Reconnect backoff, linear in the attempt count with a cap:
/// `min(attempt * step_ms, max_ms)`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay added per attempt
    #[serde(default = "default_reconnect_step_ms")]
    pub step_ms: u64,

    /// Upper bound on the delay
    #[serde(default = "default_reconnect_max_ms")]
    pub max_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step_ms: default_reconnect_step_ms(),
            max_ms: default_reconnect_max_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given reconnect attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = (attempt as u64).saturating_mul(self.step_ms).min(self.max_ms);
        Duration::from_millis(ms)
    }
}

/// Worker runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Maximum concurrently in-flight jobs per queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Sleep between claim attempts when the queue is empty (milliseconds)
    #[serde(default = "default_claim_interval_ms")]
    pub claim_interval_ms: u64,

    /// Processing lock TTL; a worker that stops renewing for this long is
    /// considered dead (milliseconds)
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Interval between stalled-job reclaim passes (milliseconds)
    #[serde(default = "default_stalled_check_interval_ms")]
    pub stalled_check_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            claim_interval_ms: default_claim_interval_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            stalled_check_interval_ms: default_stalled_check_interval_ms(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

// Default value functions
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 6379 }
fn default_db() -> i64 { 3 }
fn default_key_prefix() -> String { "medq:".to_string() }
fn default_reconnect_step_ms() -> u64 { 2000 }
fn default_reconnect_max_ms() -> u64 { 20000 }
fn default_concurrency() -> usize { 100 }
fn default_claim_interval_ms() -> u64 { 250 }
fn default_lock_ttl_ms() -> u64 { 30000 }
fn default_stalled_check_interval_ms() -> u64 { 5000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MEDQ").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MEDQ").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_without_password() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.url(), "redis://127.0.0.1:6379/3");
    }

    #[test]
    fn broker_url_with_password() {
        let cfg = BrokerConfig {
            password: Some("secret".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.url(), "redis://:secret@127.0.0.1:6379/3");
    }

    #[test]
    fn reconnect_backoff_linear_then_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(20000));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(20000));
    }

    #[test]
    fn worker_defaults() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.concurrency, 100);
        assert_eq!(settings.lock_ttl_ms, 30000);
    }
}
