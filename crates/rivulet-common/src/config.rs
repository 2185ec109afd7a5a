//! Configuration management for Rivulet

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Main configuration structure for Rivulet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Consumer group engine configuration
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Telemetry aggregation configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Publisher configuration
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Backing pools and the streams routed to them
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

impl Config {
    /// Load configuration from a TOML/JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.validate()?;
        debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.consumer.validate()?;
        self.telemetry.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Live-tail block time in milliseconds (loop mode only)
    pub block_time_ms: u64,
    /// Slot lease TTL in milliseconds
    pub lock_ttl_ms: u64,
    /// Heartbeat interval in milliseconds
    pub lock_tick_ms: u64,
    /// Dead-peer threshold and reclaim throttle in milliseconds
    pub claim_interval_ms: u64,
    /// Minimum idle time before a pending entry is claimed (defaults to the claim interval)
    pub min_idle_ms: Option<u64>,
    /// Pending entries fetched per reclaim page
    pub pending_page_size: usize,
    /// Backoff before retrying a pass that lost its slot
    pub retry_backoff_ms: u64,
    /// Default maximum number of concurrent slots per group
    pub default_limit: usize,
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_tick_ms == 0 || self.lock_tick_ms >= self.lock_ttl_ms {
            return Err(Error::Config(format!(
                "lock_tick_ms ({}) must be positive and below lock_ttl_ms ({})",
                self.lock_tick_ms, self.lock_ttl_ms
            )));
        }
        if self.pending_page_size == 0 {
            return Err(Error::Config("pending_page_size must be positive".to_string()));
        }
        if self.default_limit == 0 {
            return Err(Error::Config("default_limit must be positive".to_string()));
        }
        Ok(())
    }

    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_tick(&self) -> Duration {
        Duration::from_millis(self.lock_tick_ms)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_millis(self.claim_interval_ms)
    }

    pub fn min_idle(&self) -> Duration {
        Duration::from_millis(self.min_idle_ms.unwrap_or(self.claim_interval_ms))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 30_000,
            lock_ttl_ms: 90_000,
            lock_tick_ms: 60_000,
            claim_interval_ms: 120_000,
            min_idle_ms: None,
            pending_page_size: 100,
            retry_backoff_ms: 10_000,
            default_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Events accumulated before counters are flushed
    pub speed_limit: usize,
    /// Maximum time between flushes in milliseconds
    pub flush_interval_ms: u64,
    /// Prefix of the per-day aggregate key
    pub key_prefix: String,
    /// Expiry of the per-day aggregate key in hours
    pub expiry_hours: u64,
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.speed_limit == 0 {
            return Err(Error::Config("speed_limit must be positive".to_string()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_hours * 3600)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            speed_limit: 10_000,
            flush_interval_ms: 60_000,
            key_prefix: "_orm_ss:".to_string(),
            expiry_hours: 216,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Plain,
    Lz4,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Body codec applied after serialization
    pub codec: CodecKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool code, used in lock names and GC signals
    pub code: String,
    /// Streams routed to this pool
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    /// Consumer groups reading this stream
    #[serde(default)]
    pub groups: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.consumer.lock_ttl(), Duration::from_secs(90));
        assert_eq!(config.consumer.lock_tick(), Duration::from_secs(60));
        assert_eq!(config.consumer.min_idle(), Duration::from_secs(120));
        assert_eq!(config.consumer.pending_page_size, 100);
        assert_eq!(config.telemetry.speed_limit, 10_000);
        assert_eq!(config.telemetry.expiry(), Duration::from_secs(216 * 3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_min_idle_override() {
        let consumer = ConsumerConfig {
            min_idle_ms: Some(500),
            ..Default::default()
        };
        assert_eq!(consumer.min_idle(), Duration::from_millis(500));
        assert_eq!(consumer.claim_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_tick_above_ttl() {
        let mut config = Config::default();
        config.consumer.lock_tick_ms = config.consumer.lock_ttl_ms;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[consumer]
claim_interval_ms = 5000

[telemetry]
speed_limit = 10

[publisher]
codec = "lz4"

[[pools]]
code = "default"
streams = [{{ name = "orders", groups = ["billing"] }}]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.consumer.claim_interval_ms, 5000);
        assert_eq!(config.consumer.lock_ttl_ms, 90_000);
        assert_eq!(config.telemetry.speed_limit, 10);
        assert_eq!(config.publisher.codec, CodecKind::Lz4);
        assert_eq!(config.pools[0].streams[0].groups, vec!["billing".to_string()]);
    }

    #[tokio::test]
    async fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"consumer": {{"retry_backoff_ms": 10}}}}"#).unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.consumer.retry_backoff(), Duration::from_millis(10));
        assert_eq!(config.publisher.codec, CodecKind::Plain);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Config::load("/nonexistent/rivulet.toml").await.unwrap_err();
        assert!(err.is_config());
    }
}
