//! Metrics and observability for Rivulet
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]

use metrics::{counter, histogram};

// ============================================================================
// Publish Metrics
// ============================================================================

/// Record envelopes appended to a stream
pub fn record_events_published(stream: &str, count: u64) {
    counter!("rivulet_events_published_total", "stream" => stream.to_string()).increment(count);
}

/// Record a pipelined flush against one pool
pub fn record_flush(pool: &str, count: u64) {
    counter!("rivulet_flushes_total", "pool" => pool.to_string()).increment(1);
    counter!("rivulet_flushed_events_total", "pool" => pool.to_string()).increment(count);
}

// ============================================================================
// Consumer Metrics
// ============================================================================

/// Record events dispatched to a handler
pub fn record_events_consumed(group: &str, count: u64) {
    counter!("rivulet_events_consumed_total", "group" => group.to_string()).increment(count);
}

/// Record pending entries claimed from dead peers
pub fn record_events_claimed(group: &str, count: u64) {
    counter!("rivulet_events_claimed_total", "group" => group.to_string()).increment(count);
}

/// Record a handler failure
pub fn record_handler_failure(group: &str, isolated: bool) {
    let mode = if isolated { "isolated" } else { "fatal" };
    counter!("rivulet_handler_failures_total",
        "group" => group.to_string(),
        "mode" => mode.to_string()
    ).increment(1);
}

/// Record a consumer losing its slot lease
pub fn record_slot_lost(group: &str) {
    counter!("rivulet_slot_lost_total", "group" => group.to_string()).increment(1);
}

/// Record handler wall time for one batch
pub fn record_batch_duration(group: &str, latency_us: f64) {
    histogram!("rivulet_batch_duration_us", "group" => group.to_string()).record(latency_us);
}
