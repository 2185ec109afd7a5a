//! Rivulet Broker
//!
//! Publish/consume layer over append-only streams providing:
//! - Pipelined publishing routed to the stream's backing pool
//! - Competing consumers gated by numbered slot leases
//! - Backlog replay and reclaim of entries abandoned by dead consumers
//! - Per-event error isolation
//! - Throughput telemetry rolled up per day and group

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod consumer;
pub mod telemetry;

mod broker;
mod envelope;
mod event;
mod flusher;
mod gc;
mod registry;

pub use broker::Broker;
pub use codec::{Codec, Lz4Codec, PlainCodec};
pub use consumer::{ErrorHandler, EventHandler, EventsConsumer};
pub use envelope::Envelope;
pub use event::Event;
pub use flusher::Flusher;
pub use gc::GarbageCollectorEvent;
pub use registry::Registry;
pub use telemetry::{QueryObserver, QuerySource, SpeedCounters};
