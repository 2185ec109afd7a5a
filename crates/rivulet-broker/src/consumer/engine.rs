//! The read cycle of one pass

use std::sync::Arc;

use tracing::{debug, warn};

use rivulet_common::error::{Error, Result};
use rivulet_common::metrics;
use rivulet_common::types::{ReadCursor, StreamId};
use rivulet_store::{ReadGroupRequest, StreamBatch};

use super::claim::Reclaimer;
use super::slot::Slot;
use super::{EventHandler, EventsConsumer};
use crate::event::{Event, EventContext};

/// Reading phases after the pending reclaim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Own entries delivered earlier but never acknowledged
    Backlog,
    /// Entries never delivered to the group
    Live,
}

impl EventsConsumer {
    /// One pass: take a slot, run the cycle, give the slot back.
    /// Returns `false` when the slot was lost.
    pub(super) async fn run_pass<H>(&self, count: usize, handler: &H) -> Result<bool>
    where
        H: EventHandler + ?Sized,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let slot = Slot::acquire(&self.pool, &self.group, self.limit, &self.config, &self.cancel).await?;
        let result = self.read_cycle(&slot, count, handler).await;
        slot.release().await;
        result
    }

    async fn read_cycle<H>(&self, slot: &Slot, count: usize, handler: &H) -> Result<bool>
    where
        H: EventHandler + ?Sized,
    {
        let store = self.pool.streams().clone();
        for stream in &self.streams {
            self.guarded(store.create_group(stream, &self.group, StreamId::MIN, true))
                .await?;
        }

        let ctx = Arc::new(EventContext {
            store: store.clone(),
            group: self.group.clone(),
            codec: self.broker.codec().clone(),
        });
        let block = self.loop_enabled.then(|| self.config.block_time());
        let mut reclaimer = Reclaimer::new();

        'cycle: loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            reclaimer.run(self, slot).await?;

            for phase in [Phase::Backlog, Phase::Live] {
                let mut cursors: Vec<(String, ReadCursor)> = self
                    .streams
                    .iter()
                    .map(|stream| {
                        let cursor = match phase {
                            Phase::Backlog => ReadCursor::After(StreamId::MIN),
                            Phase::Live => ReadCursor::New,
                        };
                        (stream.clone(), cursor)
                    })
                    .collect();

                loop {
                    if self.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    if slot.is_lost() {
                        return Ok(self.slot_lost(slot));
                    }

                    let batches = self
                        .guarded(store.read_group(ReadGroupRequest {
                            consumer: slot.consumer().to_string(),
                            group: self.group.clone(),
                            streams: cursors.clone(),
                            count,
                            block: if phase == Phase::Live { block } else { None },
                        }))
                        .await?;
                    if self.cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }

                    let total: usize = batches.iter().map(|b| b.entries.len()).sum();
                    if total == 0 {
                        debug!("{:?} phase of {} drained", phase, slot.consumer());
                        break;
                    }
                    if slot.is_lost() {
                        return Ok(self.slot_lost(slot));
                    }
                    if phase == Phase::Backlog {
                        advance(&mut cursors, &batches);
                    }

                    let events = into_events(batches, &ctx);
                    self.dispatch(events, handler).await?;

                    if reclaimer.is_overdue(self) {
                        debug!(
                            "{} dead peers seen by {}, reclaiming again",
                            reclaimer.dead_peers(),
                            slot.consumer()
                        );
                        continue 'cycle;
                    }
                }
            }

            if !self.loop_enabled {
                return Ok(true);
            }
        }
    }

    fn slot_lost(&self, slot: &Slot) -> bool {
        metrics::record_slot_lost(&self.group);
        warn!("Consumer {} lost its slot, ending pass", slot.consumer());
        false
    }
}

/// Move each stream's backlog cursor past the last entry it returned
fn advance(cursors: &mut [(String, ReadCursor)], batches: &[StreamBatch]) {
    for batch in batches {
        let Some(last) = batch.entries.last() else {
            continue;
        };
        if let Some((_, cursor)) = cursors.iter_mut().find(|(stream, _)| *stream == batch.stream) {
            *cursor = ReadCursor::After(last.id);
        }
    }
}

fn into_events(batches: Vec<StreamBatch>, ctx: &Arc<EventContext>) -> Vec<Event> {
    batches
        .into_iter()
        .flat_map(|batch| {
            let StreamBatch { stream, entries } = batch;
            entries
                .into_iter()
                .map(move |entry| Event::new(stream.clone(), entry, ctx.clone()))
        })
        .collect()
}
