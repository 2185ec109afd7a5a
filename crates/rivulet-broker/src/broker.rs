//! Validated broker: routing, publishing and consumer construction

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rivulet_common::config::{ConsumerConfig, TelemetryConfig};
use rivulet_common::error::{Error, Result};
use rivulet_common::metrics;
use rivulet_common::types::StreamId;
use rivulet_store::Pool;

use crate::codec::Codec;
use crate::consumer::EventsConsumer;
use crate::envelope::Envelope;
use crate::flusher::Flusher;

pub(crate) struct BrokerInner {
    pub(crate) pools: HashMap<String, Pool>,
    /// stream -> pool code
    pub(crate) stream_pools: HashMap<String, String>,
    /// group -> streams, in registration order
    pub(crate) group_streams: HashMap<String, Vec<String>>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) consumer: ConsumerConfig,
    pub(crate) telemetry: TelemetryConfig,
    pub(crate) shutdown: CancellationToken,
}

/// Entry point for publishing and consuming. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub(crate) fn from_inner(inner: BrokerInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn pool(&self, code: &str) -> Option<&Pool> {
        self.inner.pools.get(code)
    }

    /// Backing pool of a registered stream
    pub fn pool_for_stream(&self, stream: &str) -> Result<&Pool> {
        let code = self
            .inner
            .stream_pools
            .get(stream)
            .ok_or_else(|| Error::Config(format!("unregistered stream {}", stream)))?;
        self.inner
            .pools
            .get(code)
            .ok_or_else(|| Error::Internal(format!("pool '{}' vanished", code)))
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.inner.codec
    }

    pub fn consumer_config(&self) -> &ConsumerConfig {
        &self.inner.consumer
    }

    pub fn telemetry_config(&self) -> &TelemetryConfig {
        &self.inner.telemetry
    }

    /// Serialize and encode `body` into an envelope carrying `tags`
    pub fn envelope<T: Serialize + ?Sized>(&self, body: &T, tags: &[(&str, &str)]) -> Result<Envelope> {
        let raw = serde_json::to_vec(body)?;
        let encoded = self.inner.codec.encode(&raw)?;
        Ok(Envelope::new(encoded).with_tags(tags))
    }

    /// Append one event immediately
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        body: &T,
        tags: &[(&str, &str)],
    ) -> Result<StreamId> {
        let envelope = self.envelope(body, tags)?;
        self.publish_envelope(stream, envelope).await
    }

    /// Append a pre-built envelope immediately
    pub async fn publish_envelope(&self, stream: &str, envelope: Envelope) -> Result<StreamId> {
        let pool = self.pool_for_stream(stream)?;
        let id = pool.streams().append(stream, envelope.into_fields()).await?;
        metrics::record_events_published(stream, 1);
        debug!("Published {} to {}", id, stream);
        Ok(id)
    }

    /// Buffer for pipelined publishing
    pub fn new_flusher(&self) -> Flusher {
        Flusher::new(self.clone())
    }

    /// Consumer for a registered group. All of the group's streams must live
    /// in the same pool.
    pub fn consumer(&self, group: &str) -> Result<EventsConsumer> {
        let streams = self
            .inner
            .group_streams
            .get(group)
            .filter(|streams| !streams.is_empty())
            .ok_or_else(|| Error::Config(format!("unregistered streams for group {}", group)))?;

        let mut pool_code: Option<&str> = None;
        for stream in streams {
            let code = self
                .inner
                .stream_pools
                .get(stream)
                .map(String::as_str)
                .ok_or_else(|| Error::Config(format!("unregistered stream {}", stream)))?;
            match pool_code {
                Some(existing) if existing != code => {
                    return Err(Error::Config(format!(
                        "reading from different pools not allowed for group {}",
                        group
                    )));
                }
                _ => pool_code = Some(code),
            }
        }

        let pool = pool_code
            .and_then(|code| self.inner.pools.get(code))
            .ok_or_else(|| Error::Internal(format!("no pool for group {}", group)))?
            .clone();

        Ok(EventsConsumer::new(
            self.clone(),
            group.to_string(),
            pool,
            streams.clone(),
            self.inner.shutdown.child_token(),
        ))
    }

    /// Token cancelled by [`Broker::shutdown`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Stop every consumer created from this broker
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Shutting down broker");
            self.inner.shutdown.cancel();
        }
    }

    pub(crate) fn pools_by_code(&self) -> &HashMap<String, Pool> {
        &self.inner.pools
    }

    pub(crate) fn stream_pool_code(&self, stream: &str) -> Result<&str> {
        self.inner
            .stream_pools
            .get(stream)
            .map(String::as_str)
            .ok_or_else(|| Error::Config(format!("unregistered stream {}", stream)))
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("pools", &self.inner.pools.len())
            .field("streams", &self.inner.stream_pools.len())
            .field("codec", &self.inner.codec.name())
            .finish()
    }
}
