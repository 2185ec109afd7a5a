//! In-memory publish/consume run

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use rivulet_broker::{Event, EventHandler, QueryObserver, QuerySource, Registry};
use rivulet_common::config::{PoolConfig, StreamConfig};
use rivulet_common::types::GARBAGE_COLLECTOR_STREAM;
use rivulet_common::Config;
use rivulet_store::Pool;

const DEMO_POOL: &str = "default";
const DEMO_STREAM: &str = "demo-events";
const DEMO_GROUP: &str = "demo";

/// Events published per pipelined flush
const FLUSH_EVERY: usize = 1000;

#[derive(Debug, Serialize, Deserialize)]
struct DemoEvent {
    seq: usize,
    payload: String,
}

#[derive(Debug, Serialize)]
pub struct Report {
    published: usize,
    consumed: usize,
    /// Events handled per slot consumer
    per_consumer: BTreeMap<String, usize>,
    garbage_signals: usize,
    elapsed_ms: u128,
    telemetry: HashMap<String, String>,
}

struct CountingHandler {
    handled: Arc<AtomicUsize>,
    observer: Arc<dyn QueryObserver>,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, events: &mut [Event]) -> anyhow::Result<()> {
        for event in events.iter() {
            let started = Instant::now();
            let decoded: DemoEvent = event.deserialize()?;
            self.observer.observe(QuerySource::Cache, started.elapsed());
            tracing::trace!("Handled event {} ({})", event.id(), decoded.seq);
        }
        self.handled.fetch_add(events.len(), Ordering::Relaxed);
        Ok(())
    }
}

/// Route the demo stream when the configuration names none
fn with_demo_routes(config: &Config) -> Config {
    let mut config = config.clone();
    if config.pools.is_empty() {
        config.pools.push(PoolConfig {
            code: DEMO_POOL.to_string(),
            streams: vec![StreamConfig {
                name: DEMO_STREAM.to_string(),
                groups: vec![DEMO_GROUP.to_string()],
            }],
        });
    }
    config
}

pub async fn run(config: &Config, events: usize, consumers: usize, batch: usize) -> Result<Report> {
    let config = with_demo_routes(config);
    let (stream, group) = config
        .pools
        .iter()
        .flat_map(|pool| pool.streams.iter())
        .find_map(|s| s.groups.first().map(|g| (s.name.clone(), g.clone())))
        .context("configuration routes no stream to a consumer group")?;

    let mut registry = Registry::from_config(&config);
    for pool in &config.pools {
        registry.register_pool(Pool::in_memory(pool.code.as_str()));
    }
    if !config.pools.iter().any(|p| p.code == DEMO_POOL) {
        registry.register_pool(Pool::in_memory(DEMO_POOL));
    }
    let broker = registry.validate()?;

    let started = Instant::now();
    let mut flusher = broker.new_flusher();
    for seq in 0..events {
        let body = DemoEvent {
            seq,
            payload: format!("event-{}", seq),
        };
        flusher.track(&stream, &body, &[("source", "demo")])?;
        if flusher.len() >= FLUSH_EVERY {
            flusher.flush().await?;
        }
    }
    flusher.flush().await?;
    info!("Published {} events to {}", events, stream);

    let consumers = consumers.max(1);
    let mut tasks = Vec::with_capacity(consumers);
    for _ in 0..consumers {
        let mut consumer = broker.consumer(&group)?;
        consumer.disable_loop().set_limit(consumers);
        let handled = Arc::new(AtomicUsize::new(0));
        let handler = CountingHandler {
            handled: handled.clone(),
            observer: consumer.query_observer(),
        };
        tasks.push(tokio::spawn(async move {
            let result = consumer.consume(batch, &handler).await;
            (consumer, handled, result)
        }));
    }

    let mut per_consumer = BTreeMap::new();
    let mut consumed = 0;
    let mut telemetry_key = None;
    for (i, task) in tasks.into_iter().enumerate() {
        let (consumer, handled, result) = task.await?;
        result?;
        let handled = handled.load(Ordering::Relaxed);
        consumed += handled;
        per_consumer.insert(format!("consumer-{}", i + 1), handled);
        telemetry_key.get_or_insert_with(|| consumer.telemetry_key());
        info!(
            "Consumer {} handled {} events, unflushed counters {:?}",
            i + 1,
            handled,
            consumer.speed_snapshot()
        );
    }

    let gc_pool = broker.pool_for_stream(GARBAGE_COLLECTOR_STREAM)?;
    let garbage_signals = gc_pool.streams().len(GARBAGE_COLLECTOR_STREAM).await?;

    let telemetry = match telemetry_key {
        Some(key) => {
            let pool = broker.pool_for_stream(&stream)?;
            pool.kv().hget_all(&key).await?
        }
        None => HashMap::new(),
    };

    Ok(Report {
        published: events,
        consumed,
        per_consumer,
        garbage_signals,
        elapsed_ms: started.elapsed().as_millis(),
        telemetry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_drains_everything() {
        let mut config = Config::default();
        config.telemetry.speed_limit = 50;

        let report = run(&config, 200, 3, 20).await.unwrap();
        assert_eq!(report.published, 200);
        assert_eq!(report.consumed, 200);
        assert_eq!(report.per_consumer.values().sum::<usize>(), 200);
        assert!(report.garbage_signals > 0);
        let flushed: usize = report.telemetry["events"].parse().unwrap();
        assert!(flushed > 0);
    }
}
