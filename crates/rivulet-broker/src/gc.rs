//! Garbage collector signals

use serde::{Deserialize, Serialize};
use tracing::debug;

use rivulet_common::error::Result;
use rivulet_common::types::{StreamId, GARBAGE_COLLECTOR_STREAM};

use crate::broker::Broker;

/// Published after a batch leaves acknowledged entries behind in a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarbageCollectorEvent {
    #[serde(rename = "Group")]
    pub group: String,
    #[serde(rename = "Pool")]
    pub pool: String,
}

impl GarbageCollectorEvent {
    pub fn new(group: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            pool: pool.into(),
        }
    }

    pub(crate) async fn publish(&self, broker: &Broker) -> Result<StreamId> {
        let id = broker.publish(GARBAGE_COLLECTOR_STREAM, self, &[]).await?;
        debug!("Garbage collector signal {} for group {}", id, self.group);
        Ok(id)
    }
}
