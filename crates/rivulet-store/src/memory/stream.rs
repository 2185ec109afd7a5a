//! In-memory streams with consumer groups

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use rivulet_common::error::{Result, StoreError};
use rivulet_common::types::{now_millis, Fields, ReadCursor, StreamEntry, StreamId};

use crate::stream::{PendingEntry, PendingQuery, ReadGroupRequest, StreamBatch, StreamStore};

/// Append-only streams kept in process memory
pub struct MemoryStreamStore {
    /// Streams by name
    streams: DashMap<String, StreamLog>,
    /// Wakes blocked group readers on append
    appended: Notify,
}

/// A single stream
#[derive(Default)]
struct StreamLog {
    /// Entries in ID order
    entries: BTreeMap<StreamId, Fields>,
    /// Highest ID ever assigned
    last_id: StreamId,
    /// Consumer groups by name
    groups: HashMap<String, GroupState>,
}

/// Delivery state of one consumer group
struct GroupState {
    /// Last ID handed out by a `>` read
    last_delivered: StreamId,
    /// Delivered but unacknowledged entries
    pending: BTreeMap<StreamId, PendingState>,
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

fn no_group(stream: &str, group: &str) -> StoreError {
    StoreError::NoSuchGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

impl StreamLog {
    fn append(&mut self, fields: Fields) -> StreamId {
        let now = u64::try_from(now_millis()).unwrap_or_default();
        let id = if now > self.last_id.ms {
            StreamId::new(now, 0)
        } else {
            self.last_id.successor()
        };

        self.entries.insert(id, fields);
        self.last_id = id;
        id
    }

    fn deliver(
        &mut self,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        now: Instant,
    ) -> Option<Vec<StreamEntry>> {
        let StreamLog { entries, groups, .. } = self;
        let state = groups.get_mut(group)?;
        let mut delivered = Vec::new();

        match cursor {
            ReadCursor::New => {
                let start = state.last_delivered.successor();
                for (id, fields) in entries.range(start..).take(count) {
                    state.pending.insert(
                        *id,
                        PendingState {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            deliveries: 1,
                        },
                    );
                    delivered.push(StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    });
                }
                if let Some(last) = delivered.last() {
                    state.last_delivered = last.id;
                }
            }
            ReadCursor::After(after) => {
                for (id, pending) in state.pending.range_mut(after.successor()..) {
                    if delivered.len() >= count {
                        break;
                    }
                    if pending.consumer != consumer {
                        continue;
                    }
                    // Deleted while pending: nothing left to hand out
                    let Some(fields) = entries.get(id) else {
                        continue;
                    };
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    delivered.push(StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    });
                }
            }
        }

        Some(delivered)
    }
}

impl MemoryStreamStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            appended: Notify::new(),
        }
    }

    /// Snapshot of every entry currently in a stream
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.streams
            .get(stream)
            .map(|log| {
                log.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of pending entries of a group
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .get(stream)
            .and_then(|log| log.groups.get(group).map(|g| g.pending.len()))
            .unwrap_or(0)
    }

    fn read_now(&self, request: &ReadGroupRequest) -> Result<Vec<StreamBatch>> {
        let now = Instant::now();
        let mut batches = Vec::new();

        for (stream, cursor) in &request.streams {
            let mut log = self
                .streams
                .get_mut(stream)
                .ok_or_else(|| no_group(stream, &request.group))?;
            let entries = log
                .deliver(&request.group, &request.consumer, *cursor, request.count, now)
                .ok_or_else(|| no_group(stream, &request.group))?;

            if !entries.is_empty() {
                batches.push(StreamBatch {
                    stream: stream.clone(),
                    entries,
                });
            }
        }

        Ok(batches)
    }
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, stream: &str, fields: Fields) -> Result<StreamId> {
        let id = self.streams.entry(stream.to_string()).or_default().append(fields);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn append_many(&self, entries: Vec<(String, Fields)>) -> Result<Vec<StreamId>> {
        let mut ids = Vec::with_capacity(entries.len());
        for (stream, fields) in entries {
            ids.push(self.streams.entry(stream).or_default().append(fields));
        }
        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StreamId,
        make_stream: bool,
    ) -> Result<bool> {
        if !make_stream && !self.streams.contains_key(stream) {
            return Err(StoreError::Backend(format!(
                "The XGROUP subcommand requires the key '{}' to exist",
                stream
            ))
            .into());
        }

        let mut log = self.streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Ok(false);
        }

        debug!("Creating group {} on stream {}", group, stream);
        log.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered: start,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(&self, request: ReadGroupRequest) -> Result<Vec<StreamBatch>> {
        let deadline = request.block.map(|block| tokio::time::Instant::now() + block);
        let tails = request
            .streams
            .iter()
            .any(|(_, cursor)| *cursor == ReadCursor::New);

        loop {
            // Register before reading so an append in between is not missed
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batches = self.read_now(&request)?;
            if !batches.is_empty() || !tails {
                return Ok(batches);
            }

            let Some(deadline) = deadline else {
                return Ok(batches);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<usize> {
        let Some(mut log) = self.streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(state) = log.groups.get_mut(group) else {
            return Ok(0);
        };

        Ok(ids.iter().filter(|id| state.pending.remove(*id).is_some()).count())
    }

    async fn delete(&self, stream: &str, ids: &[StreamId]) -> Result<usize> {
        let Some(mut log) = self.streams.get_mut(stream) else {
            return Ok(0);
        };

        Ok(ids.iter().filter(|id| log.entries.remove(*id).is_some()).count())
    }

    async fn pending(&self, query: PendingQuery) -> Result<Vec<PendingEntry>> {
        let log = self
            .streams
            .get(&query.stream)
            .ok_or_else(|| no_group(&query.stream, &query.group))?;
        let state = log
            .groups
            .get(&query.group)
            .ok_or_else(|| no_group(&query.stream, &query.group))?;

        if query.start > query.end {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        Ok(state
            .pending
            .range(query.start..=query.end)
            .take(query.count)
            .map(|(id, p)| PendingEntry {
                id: *id,
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                deliveries: p.deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>> {
        let mut log = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamLog { entries, groups, .. } = &mut *log;
        let state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            let Some(pending) = state.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            if !entries.contains_key(id) {
                state.pending.remove(id);
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            claimed.push(*id);
        }

        Ok(claimed)
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        Ok(self.streams.get(stream).map_or(0, |log| log.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    fn fields(value: &str) -> Fields {
        vec![("s".to_string(), Bytes::from(value.to_string()))]
    }

    fn read(consumer: &str, stream: &str, cursor: ReadCursor) -> ReadGroupRequest {
        ReadGroupRequest {
            consumer: consumer.to_string(),
            group: "g".to_string(),
            streams: vec![(stream.to_string(), cursor)],
            count: 10,
            block: None,
        }
    }

    fn all_pending(stream: &str) -> PendingQuery {
        PendingQuery {
            stream: stream.to_string(),
            group: "g".to_string(),
            start: StreamId::MIN,
            end: StreamId::MAX,
            count: 100,
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = MemoryStreamStore::new();
        let mut last = StreamId::MIN;
        for i in 0..50 {
            let id = store.append("s1", fields(&i.to_string())).await.unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(store.len("s1").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_create_group_is_idempotent() {
        let store = MemoryStreamStore::new();
        assert!(store.create_group("s1", "g", StreamId::MIN, true).await.unwrap());
        assert!(!store.create_group("s1", "g", StreamId::MIN, true).await.unwrap());
        assert!(store.create_group("missing", "g", StreamId::MIN, false).await.is_err());
    }

    #[tokio::test]
    async fn test_read_new_then_backlog() {
        let store = MemoryStreamStore::new();
        store.create_group("s1", "g", StreamId::MIN, true).await.unwrap();
        let a = store.append("s1", fields("a")).await.unwrap();
        let b = store.append("s1", fields("b")).await.unwrap();

        let batches = store.read_group(read("c1", "s1", ReadCursor::New)).await.unwrap();
        assert_eq!(batches[0].entries.len(), 2);

        // Nothing new left
        assert!(store.read_group(read("c1", "s1", ReadCursor::New)).await.unwrap().is_empty());

        // Backlog replays own pending entries only
        let backlog = store
            .read_group(read("c1", "s1", ReadCursor::After(StreamId::MIN)))
            .await
            .unwrap();
        assert_eq!(backlog[0].entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);
        assert!(store
            .read_group(read("c2", "s1", ReadCursor::After(StreamId::MIN)))
            .await
            .unwrap()
            .is_empty());

        let after_a = store
            .read_group(read("c1", "s1", ReadCursor::After(a)))
            .await
            .unwrap();
        assert_eq!(after_a[0].entries[0].id, b);

        assert_eq!(store.ack("s1", "g", &[a, b]).await.unwrap(), 2);
        assert_eq!(store.pending_count("s1", "g"), 0);
    }

    #[tokio::test]
    async fn test_read_unknown_group_fails() {
        let store = MemoryStreamStore::new();
        store.append("s1", fields("a")).await.unwrap();
        assert!(store.read_group(read("c1", "s1", ReadCursor::New)).await.is_err());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(MemoryStreamStore::new());
        store.create_group("s1", "g", StreamId::MIN, true).await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut request = read("c1", "s1", ReadCursor::New);
                request.block = Some(Duration::from_secs(5));
                store.read_group(request).await.unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.append("s1", fields("late")).await.unwrap();

        let batches = reader.await.unwrap();
        assert_eq!(batches[0].entries.len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out() {
        let store = MemoryStreamStore::new();
        store.create_group("s1", "g", StreamId::MIN, true).await.unwrap();

        let mut request = read("c1", "s1", ReadCursor::New);
        request.block = Some(Duration::from_millis(20));
        assert!(store.read_group(request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_min_idle() {
        let store = MemoryStreamStore::new();
        store.create_group("s1", "g", StreamId::MIN, true).await.unwrap();
        let id = store.append("s1", fields("a")).await.unwrap();
        store.read_group(read("c1", "s1", ReadCursor::New)).await.unwrap();

        let early = store
            .claim("s1", "g", "c2", Duration::from_secs(60), &[id])
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let claimed = store
            .claim("s1", "g", "c2", Duration::from_millis(20), &[id])
            .await
            .unwrap();
        assert_eq!(claimed, vec![id]);

        let pending = store.pending(all_pending("s1")).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert!(pending[0].idle < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_claim_drops_deleted_entries() {
        let store = MemoryStreamStore::new();
        store.create_group("s1", "g", StreamId::MIN, true).await.unwrap();
        let id = store.append("s1", fields("a")).await.unwrap();
        store.read_group(read("c1", "s1", ReadCursor::New)).await.unwrap();
        assert_eq!(store.delete("s1", &[id]).await.unwrap(), 1);

        let claimed = store.claim("s1", "g", "c2", Duration::ZERO, &[id]).await.unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.pending_count("s1", "g"), 0);
    }

    #[tokio::test]
    async fn test_pending_pages_in_id_order() {
        let store = MemoryStreamStore::new();
        store.create_group("s1", "g", StreamId::MIN, true).await.unwrap();
        for i in 0..5 {
            store.append("s1", fields(&i.to_string())).await.unwrap();
        }
        store.read_group(read("c1", "s1", ReadCursor::New)).await.unwrap();

        let mut query = all_pending("s1");
        query.count = 2;
        let first = store.pending(query.clone()).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].id < first[1].id);

        query.start = first[1].id.successor();
        let second = store.pending(query).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(second[0].id > first[1].id);
        assert_eq!(second[0].deliveries, 1);
    }
}
