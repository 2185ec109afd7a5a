//! Consumer-side view of a delivered envelope

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use rivulet_common::error::{Error, Result};
use rivulet_common::types::{Fields, StreamEntry, StreamId, BODY_FIELD};
use rivulet_store::StreamStore;

use crate::codec::Codec;

/// What every event of one dispatch shares
pub(crate) struct EventContext {
    pub(crate) store: Arc<dyn StreamStore>,
    pub(crate) group: String,
    pub(crate) codec: Arc<dyn Codec>,
}

/// A delivered event. Handlers may [`ack`](Event::ack) or
/// [`delete`](Event::delete) it; anything left untouched is acknowledged
/// after the handler returns successfully.
pub struct Event {
    stream: String,
    id: StreamId,
    fields: Fields,
    acknowledged: bool,
    deleted: bool,
    ctx: Arc<EventContext>,
}

impl Event {
    pub(crate) fn new(stream: String, entry: StreamEntry, ctx: Arc<EventContext>) -> Self {
        Self {
            stream,
            id: entry.id,
            fields: entry.fields,
            acknowledged: false,
            deleted: false,
            ctx,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Value of a tag, if present and valid UTF-8
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key && k != BODY_FIELD)
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
    }

    /// Decoded body, `None` for tag-only events
    pub fn body(&self) -> Result<Option<Bytes>> {
        self.fields
            .iter()
            .find(|(k, _)| k == BODY_FIELD)
            .map(|(_, v)| self.ctx.codec.decode(v))
            .transpose()
    }

    /// Decode and deserialize the body
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self
            .body()?
            .ok_or_else(|| Error::Serialization(format!("event {} has no body", self.id)))?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Acknowledge without removing the entry from the stream
    pub async fn ack(&mut self) -> Result<()> {
        if self.acknowledged {
            return Ok(());
        }
        self.ctx
            .store
            .ack(&self.stream, &self.ctx.group, &[self.id])
            .await?;
        self.acknowledged = true;
        Ok(())
    }

    /// Acknowledge and physically remove the entry
    pub async fn delete(&mut self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        self.ack().await?;
        self.ctx.store.delete(&self.stream, &[self.id]).await?;
        self.deleted = true;
        Ok(())
    }

    /// Mark as acknowledged by a batch ack the engine already issued
    pub(crate) fn mark_acknowledged(&mut self) {
        self.acknowledged = true;
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("stream", &self.stream)
            .field("id", &self.id)
            .field("acknowledged", &self.acknowledged)
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}
