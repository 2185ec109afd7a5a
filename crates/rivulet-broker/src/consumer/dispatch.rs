//! Batch dispatch, acknowledgment and per-event error isolation

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use tracing::{error, warn};

use rivulet_common::error::{Error, Result};
use rivulet_common::metrics;
use rivulet_common::types::StreamId;

use super::{EventHandler, EventsConsumer};
use crate::event::Event;
use crate::gc::GarbageCollectorEvent;

impl EventsConsumer {
    /// Hand one batch to the handler and settle it
    pub(super) async fn dispatch<H>(&self, mut events: Vec<Event>, handler: &H) -> Result<()>
    where
        H: EventHandler + ?Sized,
    {
        let started = Instant::now();

        if let Err(err) = run_handler(handler, &mut events).await {
            let Some(on_error) = self.error_handler.clone() else {
                metrics::record_handler_failure(&self.group, false);
                error!("Handler of group {} failed: {:#}", self.group, err);
                return Err(Error::Handler(format!("{:#}", err)));
            };

            warn!(
                "Handler of group {} failed, replaying {} events one by one: {:#}",
                self.group,
                events.len(),
                err
            );
            for event in events.iter_mut().filter(|e| !e.is_acknowledged()) {
                if let Err(err) = run_handler(handler, std::slice::from_mut(event)).await {
                    metrics::record_handler_failure(&self.group, true);
                    on_error(&err, &*event);
                }
            }
        }
        let elapsed = started.elapsed();

        self.acknowledge(&mut events).await?;

        if events.iter().any(|e| !e.is_deleted()) {
            let signal = GarbageCollectorEvent::new(self.group.as_str(), self.pool.code());
            self.guarded(signal.publish(&self.broker)).await?;
        }

        metrics::record_events_consumed(&self.group, events.len() as u64);
        metrics::record_batch_duration(&self.group, elapsed.as_secs_f64() * 1_000_000.0);
        if let Some(counters) = self.speed.record_batch(events.len(), elapsed) {
            if let Err(e) = self.speed.flush(self.pool.kv().as_ref(), counters).await {
                warn!("Telemetry flush for group {} failed: {}", self.group, e);
                self.speed.restore(counters);
            }
        }
        Ok(())
    }

    /// Acknowledge everything the handler left untouched, one call per stream
    async fn acknowledge(&self, events: &mut [Event]) -> Result<()> {
        let mut by_stream: Vec<(&str, Vec<StreamId>)> = Vec::new();
        for event in events.iter().filter(|e| !e.is_acknowledged()) {
            match by_stream.iter_mut().find(|(stream, _)| *stream == event.stream()) {
                Some((_, ids)) => ids.push(event.id()),
                None => by_stream.push((event.stream(), vec![event.id()])),
            }
        }

        let store = self.pool.streams();
        for (stream, ids) in &by_stream {
            self.guarded(store.ack(stream, &self.group, ids)).await?;
        }
        drop(by_stream);

        for event in events.iter_mut() {
            event.mark_acknowledged();
        }
        Ok(())
    }
}

/// Run the handler, turning a panic into an error
async fn run_handler<H>(handler: &H, events: &mut [Event]) -> anyhow::Result<()>
where
    H: EventHandler + ?Sized,
{
    match AssertUnwindSafe(handler.handle(events)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
