//! In-memory lease service

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use rivulet_common::error::Result;

use crate::lock::{Lease, LockService};

/// Poll interval while waiting for a held lease
const OBTAIN_RETRY: Duration = Duration::from_millis(10);

/// Lease manager keeping holders in process memory
#[derive(Clone, Default)]
pub struct MemoryLockService {
    leases: Arc<DashMap<String, Holder>>,
}

struct Holder {
    token: Uuid,
    expires_at: Instant,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a lease regardless of its holder, as if it expired or was taken over
    pub fn revoke(&self, name: &str) -> bool {
        self.leases.remove(name).is_some()
    }

    /// Whether a live lease is held under `name`
    pub fn is_held(&self, name: &str) -> bool {
        self.leases
            .get(name)
            .map_or(false, |h| h.expires_at > Instant::now())
    }

    fn try_obtain(&self, name: &str, ttl: Duration) -> Option<Uuid> {
        let now = Instant::now();
        let token = Uuid::new_v4();
        let holder = Holder {
            token,
            expires_at: now + ttl,
        };

        match self.leases.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return None;
                }
                occupied.insert(holder);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
            }
        }
        Some(token)
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn obtain(&self, name: &str, ttl: Duration, wait: Duration) -> Result<Option<Box<dyn Lease>>> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(token) = self.try_obtain(name, ttl) {
                return Ok(Some(Box::new(MemoryLease {
                    name: name.to_string(),
                    token,
                    leases: self.leases.clone(),
                })));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(OBTAIN_RETRY).await;
        }
    }
}

/// Lease handed out by [`MemoryLockService`]
pub struct MemoryLease {
    name: String,
    token: Uuid,
    leases: Arc<DashMap<String, Holder>>,
}

#[async_trait]
impl Lease for MemoryLease {
    fn name(&self) -> &str {
        &self.name
    }

    async fn refresh(&self, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.leases.get_mut(&self.name) {
            Some(mut holder) if holder.token == self.token && holder.expires_at > now => {
                holder.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self) -> Result<()> {
        self.leases
            .remove_if(&self.name, |_, holder| holder.token == self.token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_obtain_is_exclusive() {
        let locker = MemoryLockService::new();
        let lease = locker.obtain("g_default-1", TTL, Duration::ZERO).await.unwrap();
        assert!(lease.is_some());
        assert!(locker.obtain("g_default-1", TTL, Duration::ZERO).await.unwrap().is_none());
        assert!(locker.obtain("g_default-2", TTL, Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_frees_name() {
        let locker = MemoryLockService::new();
        let lease = locker.obtain("a", TTL, Duration::ZERO).await.unwrap().unwrap();
        lease.release().await.unwrap();
        assert!(!locker.is_held("a"));
        assert!(locker.obtain("a", TTL, Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_cannot_refresh() {
        let locker = MemoryLockService::new();
        let lease = locker
            .obtain("a", Duration::from_millis(10), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let other = locker.obtain("a", TTL, Duration::ZERO).await.unwrap();
        assert!(other.is_some());
        assert!(!lease.refresh(TTL).await.unwrap());

        // A stale holder's release must not drop the new holder
        lease.release().await.unwrap();
        assert!(locker.is_held("a"));
    }

    #[tokio::test]
    async fn test_revoke_breaks_refresh() {
        let locker = MemoryLockService::new();
        let lease = locker.obtain("a", TTL, Duration::ZERO).await.unwrap().unwrap();
        assert!(lease.refresh(TTL).await.unwrap());
        assert!(locker.revoke("a"));
        assert!(!lease.refresh(TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_obtain_waits_for_release() {
        let locker = MemoryLockService::new();
        let lease = locker.obtain("a", TTL, Duration::ZERO).await.unwrap().unwrap();

        let waiter = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker
                    .obtain("a", TTL, Duration::from_secs(2))
                    .await
                    .unwrap()
                    .is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        lease.release().await.unwrap();
        assert!(waiter.await.unwrap());
    }
}
