//! In-memory hashes with expiry

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use rivulet_common::error::{Result, StoreError};

use crate::kv::KeyValueStore;

/// Hash store kept in process memory. Expired keys are dropped lazily.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    keys: DashMap<String, HashEntry>,
}

#[derive(Default)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live of a key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.keys
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.keys.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<()> {
        self.purge_expired(key);
        self.keys
            .entry(key.to_string())
            .or_default()
            .fields
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.purge_expired(key);
        Ok(self
            .keys
            .get(key)
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }

    async fn hincr_by_many(
        &self,
        key: &str,
        increments: &[(&str, i64)],
        expire: Option<Duration>,
    ) -> Result<()> {
        self.purge_expired(key);
        let mut entry = self.keys.entry(key.to_string()).or_default();

        // validate every field before applying any
        let mut updated = Vec::with_capacity(increments.len());
        for (field, by) in increments {
            let current = match entry.fields.get(*field) {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    StoreError::WrongType(format!("hash value {}.{} is not an integer", key, field))
                })?,
                None => 0,
            };
            let value = current.checked_add(*by).ok_or_else(|| {
                StoreError::WrongType(format!("increment of {}.{} would overflow", key, field))
            })?;
            updated.push(((*field).to_string(), value.to_string()));
        }
        entry.fields.extend(updated);

        if let Some(ttl) = expire {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.purge_expired(key);
        match self.keys.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hset_and_get_all() {
        let kv = MemoryKeyValueStore::new();
        kv.hset("running", "1", "100".to_string()).await.unwrap();
        kv.hset("running", "2", "200".to_string()).await.unwrap();
        kv.hset("running", "1", "150".to_string()).await.unwrap();

        let all = kv.hget_all("running").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["1"], "150");
        assert!(kv.hget_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hincr_by_many_with_expiry() {
        let kv = MemoryKeyValueStore::new();
        let hour = Duration::from_secs(3600);
        kv.hincr_by_many("speed", &[("events", 5), ("time", 10)], Some(hour))
            .await
            .unwrap();
        kv.hincr_by_many("speed", &[("events", 3)], None).await.unwrap();

        let all = kv.hget_all("speed").await.unwrap();
        assert_eq!(all["events"], "8");
        assert_eq!(all["time"], "10");
        assert!(kv.ttl("speed").unwrap() > Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn test_hincr_rejects_non_integer() {
        let kv = MemoryKeyValueStore::new();
        kv.hset("h", "f", "abc".to_string()).await.unwrap();
        assert!(kv.hincr_by_many("h", &[("f", 1)], None).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_hincr_applies_nothing() {
        let kv = MemoryKeyValueStore::new();
        kv.hset("h", "bad", "abc".to_string()).await.unwrap();
        kv.hset("h", "big", i64::MAX.to_string()).await.unwrap();

        assert!(kv
            .hincr_by_many("h", &[("events", 5), ("bad", 1)], None)
            .await
            .is_err());
        assert!(kv
            .hincr_by_many("h", &[("events", 5), ("big", 1)], None)
            .await
            .is_err());

        let all = kv.hget_all("h").await.unwrap();
        assert!(!all.contains_key("events"));
        assert_eq!(all["big"], i64::MAX.to_string());
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let kv = MemoryKeyValueStore::new();
        kv.hset("h", "f", "1".to_string()).await.unwrap();
        assert!(kv.expire("h", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(kv.hget_all("h").await.unwrap().is_empty());
        assert!(!kv.expire("h", Duration::from_secs(1)).await.unwrap());
    }
}
