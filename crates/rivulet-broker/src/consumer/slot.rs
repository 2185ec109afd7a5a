//! Numbered slot leases and their heartbeat

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rivulet_common::config::ConsumerConfig;
use rivulet_common::error::{Error, Result};
use rivulet_common::types::now_millis;
use rivulet_store::{KeyValueStore, Lease, Pool};

/// An exclusive slot of a group, held for one pass
pub(crate) struct Slot {
    nr: usize,
    consumer: String,
    running_key: String,
    ttl: Duration,
    lease: Arc<dyn Lease>,
    lost: Arc<AtomicBool>,
    refreshed_at: Arc<Mutex<Instant>>,
    stop: CancellationToken,
    heartbeat: JoinHandle<()>,
    released: bool,
}

impl Slot {
    /// Take the lowest free slot number up to `limit`
    pub(crate) async fn acquire(
        pool: &Pool,
        group: &str,
        limit: usize,
        config: &ConsumerConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let unique_key = format!("{}_{}", group, pool.code());
        let running_key = format!("{}_running", unique_key);

        let mut nr = 0;
        let lease = loop {
            nr += 1;
            let name = format!("{}-{}", unique_key, nr);
            if let Some(lease) = pool
                .locker()
                .obtain(&name, config.lock_ttl(), Duration::ZERO)
                .await?
            {
                break Arc::<dyn Lease>::from(lease);
            }
            if nr >= limit {
                return Err(Error::SlotLimitReached {
                    group: group.to_string(),
                    limit,
                });
            }
        };

        if let Err(e) = pool
            .kv()
            .hset(&running_key, &nr.to_string(), now_millis().to_string())
            .await
        {
            if let Err(release_err) = lease.release().await {
                warn!("Failed to release lease {}: {}", lease.name(), release_err);
            }
            return Err(e);
        }

        let lost = Arc::new(AtomicBool::new(false));
        let refreshed_at = Arc::new(Mutex::new(Instant::now()));
        let stop = cancel.child_token();

        let heartbeat = tokio::spawn(
            Heartbeat {
                lease: lease.clone(),
                kv: pool.kv().clone(),
                running_key: running_key.clone(),
                field: nr.to_string(),
                ttl: config.lock_ttl(),
                tick: config.lock_tick(),
                lost: lost.clone(),
                refreshed_at: refreshed_at.clone(),
                stop: stop.clone(),
            }
            .run(),
        );

        info!("Acquired slot {} of group {}", nr, group);
        Ok(Self {
            nr,
            consumer: format!("{}-{}", group, nr),
            running_key,
            ttl: config.lock_ttl(),
            lease,
            lost,
            refreshed_at,
            stop,
            heartbeat,
            released: false,
        })
    }

    pub(crate) fn nr(&self) -> usize {
        self.nr
    }

    /// Consumer identity within the store group
    pub(crate) fn consumer(&self) -> &str {
        &self.consumer
    }

    pub(crate) fn running_key(&self) -> &str {
        &self.running_key
    }

    /// Lease refresh failed, or nothing was refreshed within the TTL
    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst) || self.refreshed_at.lock().elapsed() > self.ttl
    }

    /// Stop the heartbeat and give the lease up. The running map entry
    /// stays behind and ages out.
    pub(crate) async fn release(mut self) {
        self.stop.cancel();
        if let Err(e) = (&mut self.heartbeat).await {
            warn!("Heartbeat of {} ended abnormally: {}", self.lease.name(), e);
        }
        if let Err(e) = self.lease.release().await {
            warn!("Failed to release lease {}: {}", self.lease.name(), e);
        }
        self.released = true;
        info!("Released slot {}", self.consumer);
    }
}

impl Drop for Slot {
    /// A pass dropped before `release` still stops its heartbeat and gives
    /// the lease up in the background. Without a runtime the lease expires
    /// after its TTL.
    fn drop(&mut self) {
        self.stop.cancel();
        self.heartbeat.abort();
        if self.released {
            return;
        }

        warn!("Slot {} dropped without release", self.consumer);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let lease = self.lease.clone();
            runtime.spawn(async move {
                if let Err(e) = lease.release().await {
                    warn!("Failed to release lease {}: {}", lease.name(), e);
                }
            });
        }
    }
}

struct Heartbeat {
    lease: Arc<dyn Lease>,
    kv: Arc<dyn KeyValueStore>,
    running_key: String,
    field: String,
    ttl: Duration,
    tick: Duration,
    lost: Arc<AtomicBool>,
    refreshed_at: Arc<Mutex<Instant>>,
    stop: CancellationToken,
}

impl Heartbeat {
    async fn run(self) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.tick, self.tick);
        loop {
            tokio::select! {
                () = self.stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let refreshed = tokio::select! {
                () = self.stop.cancelled() => return,
                refreshed = self.lease.refresh(self.ttl) => refreshed,
            };
            match refreshed {
                Ok(true) => {
                    *self.refreshed_at.lock() = Instant::now();
                    if let Err(e) = self
                        .kv
                        .hset(&self.running_key, &self.field, now_millis().to_string())
                        .await
                    {
                        warn!("Failed to mark {} alive: {}", self.lease.name(), e);
                    }
                    debug!("Refreshed lease {}", self.lease.name());
                }
                Ok(false) => {
                    warn!("Lease {} was lost", self.lease.name());
                    self.lost.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!("Failed to refresh lease {}: {}", self.lease.name(), e);
                    self.lost.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_store::memory::{MemoryKeyValueStore, MemoryLockService, MemoryStreamStore};

    fn pool() -> (Pool, MemoryLockService) {
        let locker = MemoryLockService::new();
        let pool = Pool::new(
            "default",
            Arc::new(MemoryStreamStore::new()),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(locker.clone()),
        );
        (pool, locker)
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            lock_ttl_ms: 300,
            lock_tick_ms: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lowest_free_number_first() {
        let (pool, _) = pool();
        let cancel = CancellationToken::new();
        let config = fast_config();

        let first = Slot::acquire(&pool, "billing", 3, &config, &cancel).await.unwrap();
        let second = Slot::acquire(&pool, "billing", 3, &config, &cancel).await.unwrap();
        assert_eq!(first.nr(), 1);
        assert_eq!(second.consumer(), "billing-2");

        first.release().await;
        let again = Slot::acquire(&pool, "billing", 3, &config, &cancel).await.unwrap();
        assert_eq!(again.nr(), 1);

        let running = pool.kv().hget_all(again.running_key()).await.unwrap();
        assert_eq!(again.running_key(), "billing_default_running");
        assert!(running.contains_key("1") && running.contains_key("2"));
        again.release().await;
        second.release().await;
    }

    #[tokio::test]
    async fn test_limit_reached() {
        let (pool, _) = pool();
        let cancel = CancellationToken::new();
        let config = fast_config();

        let held = Slot::acquire(&pool, "billing", 1, &config, &cancel).await.unwrap();
        let err = Slot::acquire(&pool, "billing", 1, &config, &cancel).await.err().unwrap();
        assert!(matches!(err, Error::SlotLimitReached { limit: 1, .. }));
        assert_eq!(err.to_string(), "consumer for group billing limit 1 reached");
        held.release().await;
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let (pool, locker) = pool();
        let cancel = CancellationToken::new();
        let slot = Slot::acquire(&pool, "billing", 1, &fast_config(), &cancel).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!slot.is_lost());
        assert!(locker.is_held("billing_default-1"));

        slot.release().await;
        assert!(!locker.is_held("billing_default-1"));
    }

    /// Leases whose refresh never answers
    struct StallingLocks(MemoryLockService);

    struct StallingLease(Box<dyn Lease>);

    #[async_trait::async_trait]
    impl rivulet_store::LockService for StallingLocks {
        async fn obtain(&self, name: &str, ttl: Duration, wait: Duration) -> Result<Option<Box<dyn Lease>>> {
            let lease = self.0.obtain(name, ttl, wait).await?;
            Ok(lease.map(|inner| Box::new(StallingLease(inner)) as Box<dyn Lease>))
        }
    }

    #[async_trait::async_trait]
    impl Lease for StallingLease {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn refresh(&self, _ttl: Duration) -> Result<bool> {
            std::future::pending().await
        }

        async fn release(&self) -> Result<()> {
            self.0.release().await
        }
    }

    #[tokio::test]
    async fn test_stale_refresh_is_lost() {
        let locker = MemoryLockService::new();
        let pool = Pool::new(
            "default",
            Arc::new(MemoryStreamStore::new()),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(StallingLocks(locker.clone())),
        );
        let cancel = CancellationToken::new();
        let slot = Slot::acquire(&pool, "billing", 1, &fast_config(), &cancel).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!slot.lost.load(Ordering::SeqCst));
        assert!(slot.is_lost());

        // a refresh stuck in flight must not hold up the release
        tokio::time::timeout(Duration::from_secs(1), slot.release()).await.unwrap();
        assert!(!locker.is_held("billing_default-1"));
    }

    #[tokio::test]
    async fn test_dropped_slot_gives_lease_up() {
        let (pool, locker) = pool();
        let cancel = CancellationToken::new();
        let slot = Slot::acquire(&pool, "billing", 1, &fast_config(), &cancel).await.unwrap();
        let stop = slot.stop.clone();

        drop(slot);
        assert!(stop.is_cancelled());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!locker.is_held("billing_default-1"));
    }

    #[tokio::test]
    async fn test_revoked_lease_is_lost() {
        let (pool, locker) = pool();
        let cancel = CancellationToken::new();
        let slot = Slot::acquire(&pool, "billing", 1, &fast_config(), &cancel).await.unwrap();

        locker.revoke("billing_default-1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(slot.is_lost());
        slot.release().await;
    }
}
