//! Stream store boundary

use std::time::Duration;

use async_trait::async_trait;

use rivulet_common::error::Result;
use rivulet_common::types::{Fields, ReadCursor, StreamEntry, StreamId};

/// Consumer group read across one or more streams
#[derive(Debug, Clone)]
pub struct ReadGroupRequest {
    /// Consumer identity within the group
    pub consumer: String,
    pub group: String,
    /// Streams and the position to read each one from
    pub streams: Vec<(String, ReadCursor)>,
    /// Maximum entries returned per stream
    pub count: usize,
    /// How long to wait for new entries; `None` never blocks
    pub block: Option<Duration>,
}

/// Entries read from one stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// Range query over a group's pending entries
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub stream: String,
    pub group: String,
    /// Inclusive lower bound
    pub start: StreamId,
    /// Inclusive upper bound
    pub end: StreamId,
    pub count: usize,
}

/// A delivered but unacknowledged entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: StreamId,
    /// Consumer currently owning the entry
    pub consumer: String,
    /// Time since the entry was last delivered
    pub idle: Duration,
    /// Number of times the entry was delivered
    pub deliveries: u64,
}

/// Append-only streams with consumer groups
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append one entry, returning its assigned ID
    async fn append(&self, stream: &str, fields: Fields) -> Result<StreamId>;

    /// Append many entries, possibly to different streams, in one round trip
    async fn append_many(&self, entries: Vec<(String, Fields)>) -> Result<Vec<StreamId>>;

    /// Create a consumer group. Returns `false` when it already existed.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StreamId,
        make_stream: bool,
    ) -> Result<bool>;

    /// Read entries for a consumer of a group
    async fn read_group(&self, request: ReadGroupRequest) -> Result<Vec<StreamBatch>>;

    /// Acknowledge entries, removing them from the group's pending list
    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<usize>;

    /// Physically remove entries from a stream
    async fn delete(&self, stream: &str, ids: &[StreamId]) -> Result<usize>;

    /// List pending entries in ID order
    async fn pending(&self, query: PendingQuery) -> Result<Vec<PendingEntry>>;

    /// Transfer ownership of pending entries idle for at least `min_idle`.
    /// Returns the IDs actually claimed.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[StreamId],
    ) -> Result<Vec<StreamId>>;

    /// Number of entries currently in the stream
    async fn len(&self, stream: &str) -> Result<usize>;
}
