//! Common type definitions for Rivulet

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, StoreError};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Ordered field list of a stream entry
pub type Fields = Vec<(String, Bytes)>;

/// Field holding the encoded envelope body
pub const BODY_FIELD: &str = "s";

/// Stream holding garbage collector signals
pub const GARBAGE_COLLECTOR_STREAM: &str = "orm-stream-garbage-collector";

/// Current time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Stream IDs
// ============================================================================

/// Store-assigned entry identifier, `<milliseconds>-<sequence>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId { ms: u64::MAX, seq: u64::MAX };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest ID strictly greater than this one
    #[must_use]
    pub fn successor(&self) -> Self {
        if self.seq == u64::MAX {
            Self { ms: self.ms.saturating_add(1), seq: 0 }
        } else {
            Self { ms: self.ms, seq: self.seq + 1 }
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Store(StoreError::InvalidId(s.to_string()));
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| invalid())?,
                seq: seq.parse().map_err(|_| invalid())?,
            }),
            None => Ok(Self { ms: s.parse().map_err(|_| invalid())?, seq: 0 }),
        }
    }
}

/// Read position for a consumer group read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`)
    New,
    /// This consumer's own pending entries after the given ID
    After(StreamId),
}

impl fmt::Display for ReadCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadCursor::New => f.write_str(">"),
            ReadCursor::After(id) => write!(f, "{id}"),
        }
    }
}

/// A single entry read from a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}
