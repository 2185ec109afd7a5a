//! Consumer group engine
//!
//! An [`EventsConsumer`] drains the streams of one group. Every
//! [`consume`](EventsConsumer::consume) pass:
//! 1. takes the lowest free numbered slot lease `<group>_<pool>-N`
//! 2. reclaims entries left pending by dead peers
//! 3. replays its own unacknowledged backlog
//! 4. tails new entries, blocking in loop mode
//!
//! Each non-empty read is handed to the [`EventHandler`] as one batch and
//! acknowledged afterwards.

mod claim;
mod dispatch;
mod engine;
mod slot;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rivulet_common::config::ConsumerConfig;
use rivulet_common::error::{Error, Result};
use rivulet_store::Pool;

use crate::broker::Broker;
use crate::event::Event;
use crate::telemetry::{QueryObserver, SpeedCounters, SpeedTracker};

/// User logic invoked once per batch
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, events: &mut [Event]) -> anyhow::Result<()>;
}

/// Called once per event that failed during isolated replay
pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error, &Event) + Send + Sync>;

/// Competing consumer of one group
pub struct EventsConsumer {
    broker: Broker,
    group: String,
    pool: Pool,
    streams: Vec<String>,
    config: ConsumerConfig,
    loop_enabled: bool,
    limit: usize,
    error_handler: Option<ErrorHandler>,
    speed: Arc<SpeedTracker>,
    cancel: CancellationToken,
}

impl EventsConsumer {
    pub(crate) fn new(
        broker: Broker,
        group: String,
        pool: Pool,
        streams: Vec<String>,
        cancel: CancellationToken,
    ) -> Self {
        let config = broker.consumer_config().clone();
        let speed = Arc::new(SpeedTracker::new(
            &group,
            pool.code(),
            broker.telemetry_config().clone(),
        ));
        Self {
            limit: config.default_limit,
            broker,
            group,
            pool,
            streams,
            config,
            loop_enabled: true,
            error_handler: None,
            speed,
            cancel,
        }
    }

    /// Stop after the live tail starves instead of blocking for more
    pub fn disable_loop(&mut self) -> &mut Self {
        self.loop_enabled = false;
        self
    }

    /// Maximum number of concurrent slots in this group
    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = limit.max(1);
        self
    }

    /// Isolate handler failures per event instead of failing the pass
    pub fn set_error_handler<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&anyhow::Error, &Event) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Hook for handlers to report downstream query timings
    pub fn query_observer(&self) -> Arc<dyn QueryObserver> {
        self.speed.clone()
    }

    /// Counters accumulated since the last telemetry flush
    pub fn speed_snapshot(&self) -> SpeedCounters {
        self.speed.snapshot()
    }

    /// Aggregate key telemetry is flushed to today
    pub fn telemetry_key(&self) -> String {
        self.speed.day_key()
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn pool_code(&self) -> &str {
        self.pool.code()
    }

    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Run passes until one completes. Returns `false` only when a pass
    /// lost its slot and loop mode is disabled.
    pub async fn consume<H>(&self, count: usize, handler: &H) -> Result<bool>
    where
        H: EventHandler + ?Sized,
    {
        let count = count.max(1);
        loop {
            let complete = match self.run_pass(count, handler).await {
                Ok(complete) => complete,
                Err(Error::Cancelled) => true,
                Err(e) => return Err(e),
            };
            if complete || !self.loop_enabled {
                return Ok(complete);
            }

            warn!(
                "Consumer of group {} retrying in {:?}",
                self.group,
                self.config.retry_backoff()
            );
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(true),
                () = tokio::time::sleep(self.config.retry_backoff()) => {}
            }
        }
    }

    /// Await a store round trip unless cancellation comes first
    async fn guarded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }
}

impl std::fmt::Debug for EventsConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsConsumer")
            .field("group", &self.group)
            .field("pool", &self.pool.code())
            .field("streams", &self.streams)
            .field("loop_enabled", &self.loop_enabled)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}
