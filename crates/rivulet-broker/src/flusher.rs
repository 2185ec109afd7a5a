//! Buffered, pipelined publishing

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use rivulet_common::error::Result;
use rivulet_common::metrics;
use rivulet_common::types::StreamId;

use crate::broker::Broker;
use crate::envelope::Envelope;

/// Collects envelopes and appends them with one call per backing pool
pub struct Flusher {
    broker: Broker,
    /// (stream, envelope) in tracking order
    buffer: Vec<(String, Envelope)>,
}

impl Flusher {
    pub(crate) fn new(broker: Broker) -> Self {
        Self {
            broker,
            buffer: Vec::new(),
        }
    }

    /// Buffer one event. Fails immediately for an unregistered stream.
    pub fn track<T: Serialize + ?Sized>(&mut self, stream: &str, body: &T, tags: &[(&str, &str)]) -> Result<()> {
        self.broker.stream_pool_code(stream)?;
        let envelope = self.broker.envelope(body, tags)?;
        self.buffer.push((stream.to_string(), envelope));
        Ok(())
    }

    /// Buffer a pre-built envelope
    pub fn track_envelope(&mut self, stream: &str, envelope: Envelope) -> Result<()> {
        self.broker.stream_pool_code(stream)?;
        self.buffer.push((stream.to_string(), envelope));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append everything buffered. Returns the assigned IDs per stream.
    ///
    /// Pools are flushed one after another; when a pool fails, the envelopes
    /// of that pool and of every pool not yet flushed stay buffered.
    pub async fn flush(&mut self) -> Result<HashMap<String, Vec<StreamId>>> {
        let mut assigned: HashMap<String, Vec<StreamId>> = HashMap::new();
        if self.buffer.is_empty() {
            return Ok(assigned);
        }

        let mut by_pool: Vec<(String, Vec<(String, Envelope)>)> = Vec::new();
        for (stream, envelope) in self.buffer.drain(..) {
            let code = match self.broker.stream_pool_code(&stream) {
                Ok(code) => code.to_string(),
                Err(e) => {
                    warn!("Dropping envelope for unroutable stream {}: {}", stream, e);
                    continue;
                }
            };
            match by_pool.iter_mut().find(|(c, _)| *c == code) {
                Some((_, batch)) => batch.push((stream, envelope)),
                None => by_pool.push((code, vec![(stream, envelope)])),
            }
        }

        let mut remaining = by_pool.into_iter();
        while let Some((code, batch)) = remaining.next() {
            let Some(pool) = self.broker.pools_by_code().get(&code) else {
                continue;
            };
            let entries: Vec<(String, _)> = batch
                .iter()
                .map(|(stream, envelope)| (stream.clone(), envelope.clone().into_fields()))
                .collect();

            match pool.streams().append_many(entries).await {
                Ok(ids) => {
                    metrics::record_flush(&code, batch.len() as u64);
                    debug!("Flushed {} events to pool {}", batch.len(), code);
                    for ((stream, _), id) in batch.into_iter().zip(ids) {
                        metrics::record_events_published(&stream, 1);
                        assigned.entry(stream).or_default().push(id);
                    }
                }
                Err(e) => {
                    self.buffer.extend(batch);
                    for (_, rest) in remaining {
                        self.buffer.extend(rest);
                    }
                    return Err(e);
                }
            }
        }

        Ok(assigned)
    }
}
