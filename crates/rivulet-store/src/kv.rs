//! Key-value side channel boundary

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use rivulet_common::error::Result;

/// Hash operations used for slot liveness and telemetry
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<()>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Increment several fields of one hash and optionally set its expiry,
    /// in a single round trip
    async fn hincr_by_many(
        &self,
        key: &str,
        increments: &[(&str, i64)],
        expire: Option<Duration>,
    ) -> Result<()>;

    /// Set a key's expiry. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}
