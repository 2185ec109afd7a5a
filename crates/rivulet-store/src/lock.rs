//! Distributed lock boundary

use std::time::Duration;

use async_trait::async_trait;

use rivulet_common::error::Result;

/// Named, TTL-based mutual exclusion
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lease `name`, retrying for up to `wait`.
    /// Returns `None` when another holder keeps it.
    async fn obtain(&self, name: &str, ttl: Duration, wait: Duration) -> Result<Option<Box<dyn Lease>>>;
}

/// A held lease
#[async_trait]
pub trait Lease: Send + Sync {
    fn name(&self) -> &str;

    /// Extend the lease. `false` means it was lost to expiry or another holder.
    async fn refresh(&self, ttl: Duration) -> Result<bool>;

    /// Give the lease up
    async fn release(&self) -> Result<()>;
}
