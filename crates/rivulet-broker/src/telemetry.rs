//! Throughput telemetry
//!
//! Each consumer accumulates per-batch event counts, handler time and the
//! downstream query counts reported through its [`QueryObserver`]. Counters
//! are flushed into a per-day hash in the pool's key-value store once
//! `speed_limit` events have accumulated or the flush interval elapsed.

use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use rivulet_common::config::TelemetryConfig;
use rivulet_common::error::Result;
use rivulet_store::KeyValueStore;

/// Backend a downstream query went to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Database,
    Cache,
}

/// Hook handlers call to report downstream queries
pub trait QueryObserver: Send + Sync {
    fn observe(&self, source: QuerySource, elapsed: Duration);
}

/// Accumulated counters, durations in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeedCounters {
    pub events: u64,
    pub time_us: u64,
    pub db_queries: u64,
    pub db_time_us: u64,
    pub cache_queries: u64,
    pub cache_time_us: u64,
}

impl SpeedCounters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn increments(&self) -> [(&'static str, i64); 6] {
        [
            ("events", saturating_i64(self.events)),
            ("time", saturating_i64(self.time_us)),
            ("db_queries", saturating_i64(self.db_queries)),
            ("db_time", saturating_i64(self.db_time_us)),
            ("cache_queries", saturating_i64(self.cache_queries)),
            ("cache_time", saturating_i64(self.cache_time_us)),
        ]
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

struct SpeedState {
    counters: SpeedCounters,
    last_flush: Instant,
}

/// Per-consumer accumulator; one mutex guards every counter
pub(crate) struct SpeedTracker {
    state: Mutex<SpeedState>,
    config: TelemetryConfig,
    /// `<group>_<pool>`
    subject: String,
}

impl SpeedTracker {
    pub(crate) fn new(group: &str, pool: &str, config: TelemetryConfig) -> Self {
        Self {
            state: Mutex::new(SpeedState {
                counters: SpeedCounters::default(),
                last_flush: Instant::now(),
            }),
            config,
            subject: format!("{}_{}", group, pool),
        }
    }

    /// Add one dispatched batch. Returns the drained counters when a flush
    /// is due.
    pub(crate) fn record_batch(&self, events: usize, elapsed: Duration) -> Option<SpeedCounters> {
        let mut state = self.state.lock();
        state.counters.events += events as u64;
        state.counters.time_us += micros(elapsed);

        let due = state.counters.events >= self.config.speed_limit as u64
            || (state.counters.events > 0 && state.last_flush.elapsed() >= self.config.flush_interval());
        if !due {
            return None;
        }
        state.last_flush = Instant::now();
        Some(std::mem::take(&mut state.counters))
    }

    /// Put counters back after a failed flush
    pub(crate) fn restore(&self, counters: SpeedCounters) {
        let mut state = self.state.lock();
        let c = &mut state.counters;
        c.events += counters.events;
        c.time_us += counters.time_us;
        c.db_queries += counters.db_queries;
        c.db_time_us += counters.db_time_us;
        c.cache_queries += counters.cache_queries;
        c.cache_time_us += counters.cache_time_us;
    }

    pub(crate) fn snapshot(&self) -> SpeedCounters {
        self.state.lock().counters
    }

    /// Aggregate key for the current UTC day
    pub(crate) fn day_key(&self) -> String {
        format!(
            "{}{}:{}",
            self.config.key_prefix,
            self.subject,
            Utc::now().format("%m-%d-%y")
        )
    }

    /// Write drained counters into the day record
    pub(crate) async fn flush(&self, kv: &dyn KeyValueStore, counters: SpeedCounters) -> Result<()> {
        let key = self.day_key();
        kv.hincr_by_many(&key, &counters.increments(), Some(self.config.expiry()))
            .await?;
        debug!("Flushed {} events of telemetry to {}", counters.events, key);
        Ok(())
    }
}

impl QueryObserver for SpeedTracker {
    fn observe(&self, source: QuerySource, elapsed: Duration) {
        let mut state = self.state.lock();
        match source {
            QuerySource::Database => {
                state.counters.db_queries += 1;
                state.counters.db_time_us += micros(elapsed);
            }
            QuerySource::Cache => {
                state.counters.cache_queries += 1;
                state.counters.cache_time_us += micros(elapsed);
            }
        }
    }
}
