//! In-process implementations of the store boundaries

mod kv;
mod lock;
mod stream;

pub use kv::MemoryKeyValueStore;
pub use lock::{MemoryLease, MemoryLockService};
pub use stream::MemoryStreamStore;
