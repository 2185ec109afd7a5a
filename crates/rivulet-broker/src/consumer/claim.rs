//! Reclaiming entries abandoned by dead peers

use std::time::Instant;

use tracing::{debug, info};

use rivulet_common::error::Result;
use rivulet_common::metrics;
use rivulet_common::types::{now_millis, StreamId};
use rivulet_store::PendingQuery;

use super::slot::Slot;
use super::EventsConsumer;

/// Pending-phase state of one pass
#[derive(Debug, Default)]
pub(crate) struct Reclaimer {
    checked_at: Option<Instant>,
    dead_peers: usize,
}

impl Reclaimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dead_peers(&self) -> usize {
        self.dead_peers
    }

    /// Dead peers were seen and the last reclaim is a full interval old
    pub(crate) fn is_overdue(&self, consumer: &EventsConsumer) -> bool {
        self.dead_peers > 0
            && self
                .checked_at
                .map_or(true, |at| at.elapsed() >= consumer.config.claim_interval())
    }

    /// Claim every entry pending at a consumer other than `slot` for at least
    /// the minimum idle time. Runs at most once per claim interval and only
    /// while some peer in the running map has gone silent.
    pub(crate) async fn run(&mut self, consumer: &EventsConsumer, slot: &Slot) -> Result<usize> {
        let config = &consumer.config;
        if let Some(at) = self.checked_at {
            if at.elapsed() < config.claim_interval() {
                return Ok(0);
            }
        }

        let running = consumer
            .guarded(consumer.pool.kv().hget_all(slot.running_key()))
            .await?;
        let now = now_millis();
        let threshold = i64::try_from(config.claim_interval_ms).unwrap_or(i64::MAX);
        let own = slot.nr().to_string();
        self.dead_peers = running
            .iter()
            .filter(|(nr, _)| **nr != own)
            .filter(|(_, alive)| alive.parse::<i64>().map_or(true, |ts| now - ts >= threshold))
            .count();
        if self.dead_peers == 0 {
            return Ok(0);
        }

        let min_idle = config.min_idle();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        let store = consumer.pool.streams();
        let mut claimed_total = 0;

        for stream in &consumer.streams {
            let mut start = StreamId::MIN;
            loop {
                let now_ms = u64::try_from(now_millis()).unwrap_or(0);
                let end = StreamId::new(now_ms.saturating_sub(min_idle_ms), u64::MAX);
                let page = consumer
                    .guarded(store.pending(PendingQuery {
                        stream: stream.clone(),
                        group: consumer.group.clone(),
                        start,
                        end,
                        count: config.pending_page_size,
                    }))
                    .await?;
                let Some(last) = page.last() else {
                    break;
                };
                start = last.id.successor();

                let ids: Vec<StreamId> = page
                    .iter()
                    .filter(|entry| entry.consumer != slot.consumer() && entry.idle >= min_idle)
                    .map(|entry| entry.id)
                    .collect();
                if !ids.is_empty() {
                    let claimed = consumer
                        .guarded(store.claim(stream, &consumer.group, slot.consumer(), min_idle, &ids))
                        .await?;
                    debug!("Claimed {} of {} pending entries in {}", claimed.len(), ids.len(), stream);
                    claimed_total += claimed.len();
                }

                if page.len() < config.pending_page_size {
                    break;
                }
            }
        }

        if claimed_total > 0 {
            metrics::record_events_claimed(&consumer.group, claimed_total as u64);
            info!(
                "Slot {} reclaimed {} entries from {} dead peers",
                slot.consumer(),
                claimed_total,
                self.dead_peers
            );
        }
        self.checked_at = Some(Instant::now());
        Ok(claimed_total)
    }
}
