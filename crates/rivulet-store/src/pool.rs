//! Backing pool handle

use std::fmt;
use std::sync::Arc;

use crate::kv::KeyValueStore;
use crate::lock::LockService;
use crate::memory::{MemoryKeyValueStore, MemoryLockService, MemoryStreamStore};
use crate::stream::StreamStore;

/// One backing store: its streams, its key-value side channel and its locker
#[derive(Clone)]
pub struct Pool {
    code: String,
    streams: Arc<dyn StreamStore>,
    kv: Arc<dyn KeyValueStore>,
    locker: Arc<dyn LockService>,
}

impl Pool {
    pub fn new(
        code: impl Into<String>,
        streams: Arc<dyn StreamStore>,
        kv: Arc<dyn KeyValueStore>,
        locker: Arc<dyn LockService>,
    ) -> Self {
        Self {
            code: code.into(),
            streams,
            kv,
            locker,
        }
    }

    /// Pool backed by fresh in-memory stores
    pub fn in_memory(code: impl Into<String>) -> Self {
        Self::new(
            code,
            Arc::new(MemoryStreamStore::new()),
            Arc::new(MemoryKeyValueStore::new()),
            Arc::new(MemoryLockService::new()),
        )
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn streams(&self) -> &Arc<dyn StreamStore> {
        &self.streams
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn locker(&self) -> &Arc<dyn LockService> {
        &self.locker
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("code", &self.code).finish_non_exhaustive()
    }
}
