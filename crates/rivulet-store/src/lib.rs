//! Rivulet Store - collaborator boundaries
//!
//! The broker talks to its backing infrastructure only through the traits
//! defined here:
//! - [`StreamStore`]: append-only streams with consumer groups
//! - [`LockService`]: named TTL leases
//! - [`KeyValueStore`]: hashes used for liveness and telemetry
//!
//! The [`memory`] module implements all three in-process with Redis Streams
//! semantics.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod kv;
pub mod lock;
pub mod memory;
pub mod stream;

mod pool;

pub use kv::KeyValueStore;
pub use lock::{Lease, LockService};
pub use pool::Pool;
pub use stream::{PendingEntry, PendingQuery, ReadGroupRequest, StreamBatch, StreamStore};
