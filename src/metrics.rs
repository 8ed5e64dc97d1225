//! Counter events emitted by the rate limiter.
//!
//! The limiter only decides *that* a counter should be bumped; shipping the
//! value to a metrics backend is up to the sink.

use tracing::debug;

/// Receiver for fire-and-forget counter increments.
///
/// Implementations must not block for long and have no way to fail the
/// caller: an unavailable metrics system simply drops the event.
pub trait MetricsSink: Send + Sync {
    /// Increment the counter called `name` by one.
    fn incr_counter(&self, name: &str);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str) {}
}

/// Emits each event as a `tracing` record under the `windowguard::metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn incr_counter(&self, name: &str) {
        debug!(target: "windowguard::metrics", counter = %name, "incr");
    }
}
