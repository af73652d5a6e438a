//! Pluggable counter sink.
//!
//! The proxy and the routing table keep their own atomic counters for the
//! hot path; a `Sink` receives the same increments so deployments can wire
//! them into whatever metrics backend they run. No format is mandated.

use tracing::debug;

/// Receives monotonic counter increments.
pub trait Sink: Send + Sync {
    fn counter_add(&self, name: &str, value: u64);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl Sink for NoopSink {
    fn counter_add(&self, _name: &str, _value: u64) {}
}

/// Emits each increment as a debug-level tracing event.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn counter_add(&self, name: &str, value: u64) {
        debug!(counter = name, value, "counter");
    }
}
