//! Stream, group and pool registration

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use rivulet_common::config::{Config, ConsumerConfig, TelemetryConfig};
use rivulet_common::error::{Error, Result};
use rivulet_common::types::GARBAGE_COLLECTOR_STREAM;
use rivulet_store::Pool;

use crate::broker::{Broker, BrokerInner};
use crate::codec::{self, Codec, PlainCodec};

/// Pool the garbage collector stream is routed to unless registered explicitly
pub const DEFAULT_POOL: &str = "default";

/// Mutable registration phase; [`Registry::validate`] turns it into a [`Broker`]
pub struct Registry {
    pools: HashMap<String, Pool>,
    /// Streams in registration order: (stream, pool code, groups)
    streams: Vec<(String, String, Vec<String>)>,
    codec: Arc<dyn Codec>,
    consumer: ConsumerConfig,
    telemetry: TelemetryConfig,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
            streams: Vec::new(),
            codec: Arc::new(PlainCodec),
            consumer: ConsumerConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Registry carrying the settings and stream routes of a loaded config.
    /// The pools it names still have to be registered.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.codec = codec::for_kind(config.publisher.codec);
        registry.consumer = config.consumer.clone();
        registry.telemetry = config.telemetry.clone();

        for pool in &config.pools {
            for stream in &pool.streams {
                let groups: Vec<&str> = stream.groups.iter().map(String::as_str).collect();
                registry.register_stream(&stream.name, &pool.code, &groups);
            }
        }
        registry
    }

    pub fn register_pool(&mut self, pool: Pool) -> &mut Self {
        self.pools.insert(pool.code().to_string(), pool);
        self
    }

    pub fn register_stream(&mut self, stream: &str, pool: &str, groups: &[&str]) -> &mut Self {
        self.streams.push((
            stream.to_string(),
            pool.to_string(),
            groups.iter().map(|g| (*g).to_string()).collect(),
        ));
        self
    }

    pub fn set_codec(&mut self, codec: Arc<dyn Codec>) -> &mut Self {
        self.codec = codec;
        self
    }

    pub fn set_consumer_config(&mut self, config: ConsumerConfig) -> &mut Self {
        self.consumer = config;
        self
    }

    pub fn set_telemetry_config(&mut self, config: TelemetryConfig) -> &mut Self {
        self.telemetry = config;
        self
    }

    /// Check every route and freeze the registry
    pub fn validate(self) -> Result<Broker> {
        let mut stream_pools: HashMap<String, String> = HashMap::new();
        let mut group_streams: HashMap<String, Vec<String>> = HashMap::new();

        for (stream, pool, groups) in &self.streams {
            if !self.pools.contains_key(pool) {
                return Err(Error::Config(format!(
                    "stream {} uses unregistered pool '{}'",
                    stream, pool
                )));
            }
            if let Some(existing) = stream_pools.get(stream) {
                if existing != pool {
                    return Err(Error::Config(format!(
                        "stream {} registered in pools '{}' and '{}'",
                        stream, existing, pool
                    )));
                }
            }
            stream_pools.insert(stream.clone(), pool.clone());

            for group in groups {
                let streams = group_streams.entry(group.clone()).or_default();
                if !streams.contains(stream) {
                    streams.push(stream.clone());
                }
            }
        }

        if !stream_pools.contains_key(GARBAGE_COLLECTOR_STREAM) {
            if !self.pools.contains_key(DEFAULT_POOL) {
                return Err(Error::Config(format!(
                    "stream {} must be registered when no '{}' pool exists",
                    GARBAGE_COLLECTOR_STREAM, DEFAULT_POOL
                )));
            }
            stream_pools.insert(GARBAGE_COLLECTOR_STREAM.to_string(), DEFAULT_POOL.to_string());
        }

        self.consumer.validate()?;
        self.telemetry.validate()?;

        debug!(
            "Registry validated: {} pools, {} streams, {} groups",
            self.pools.len(),
            stream_pools.len(),
            group_streams.len()
        );

        Ok(Broker::from_inner(BrokerInner {
            pools: self.pools,
            stream_pools,
            group_streams,
            codec: self.codec,
            consumer: self.consumer,
            telemetry: self.telemetry,
            shutdown: CancellationToken::new(),
        }))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_common::config::{PoolConfig, StreamConfig};

    #[test]
    fn test_unregistered_pool_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register_pool(Pool::in_memory(DEFAULT_POOL))
            .register_stream("orders", "other", &["billing"]);
        let err = registry.validate().err().unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_garbage_stream_needs_a_route() {
        let mut registry = Registry::new();
        registry
            .register_pool(Pool::in_memory("other"))
            .register_stream("orders", "other", &["billing"]);
        assert!(registry.validate().is_err());

        let mut registry = Registry::new();
        registry
            .register_pool(Pool::in_memory("other"))
            .register_stream("orders", "other", &["billing"])
            .register_stream(GARBAGE_COLLECTOR_STREAM, "other", &[]);
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_stream_in_two_pools_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register_pool(Pool::in_memory(DEFAULT_POOL))
            .register_pool(Pool::in_memory("other"))
            .register_stream("orders", DEFAULT_POOL, &[])
            .register_stream("orders", "other", &[]);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn test_from_config_routes_streams() {
        let mut config = Config::default();
        config.pools.push(PoolConfig {
            code: DEFAULT_POOL.to_string(),
            streams: vec![StreamConfig {
                name: "orders".to_string(),
                groups: vec!["billing".to_string()],
            }],
        });

        let mut registry = Registry::from_config(&config);
        registry.register_pool(Pool::in_memory(DEFAULT_POOL));
        let broker = registry.validate().unwrap();
        assert!(broker.consumer("billing").is_ok());
        assert!(broker.consumer("unknown").is_err());
    }
}
