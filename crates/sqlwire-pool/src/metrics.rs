//! Pool metrics and the observer hook.
//!
//! The pool keeps its counters under the same mutex as its entries, so a
//! [`PoolMetrics`] snapshot is always internally consistent. Events go to a
//! [`PoolObserver`]; the default [`TracingObserver`] turns them into
//! `tracing` events.

use std::time::Duration;

use crate::entry::AcquisitionTrace;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Open connections, including ones being created or validated
    pub total: usize,
    pub idle: usize,
    /// Connections handed out to callers
    pub active: usize,
    /// Callers blocked in `acquire`
    pub waiting: usize,
    pub max_size: usize,
    /// Successful acquisitions since the pool was built
    pub acquisitions: u64,
    pub timeouts: u64,
    /// Leak warnings raised (one per offending acquisition)
    pub leaks: u64,
    pub created: u64,
    pub discarded: u64,
    /// Mean time callers waited in successful acquisitions
    pub average_acquire_time: Duration,
}

/// Running counters, updated under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) acquisitions: u64,
    pub(crate) timeouts: u64,
    pub(crate) leaks: u64,
    pub(crate) created: u64,
    pub(crate) discarded: u64,
    pub(crate) acquire_time: Duration,
}

impl Counters {
    pub(crate) fn average_acquire_time(&self) -> Duration {
        match u32::try_from(self.acquisitions) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.acquire_time / n,
            Err(_) => {
                let nanos = self.acquire_time.as_nanos() / u128::from(self.acquisitions);
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            }
        }
    }
}

/// A caller obtained a connection.
#[derive(Debug, Clone)]
pub struct AcquireEvent {
    pub connection_id: u64,
    /// Time from the `acquire` call until the connection was handed out
    pub wait: Duration,
    /// `true` when the connection was opened for this caller
    pub created: bool,
}

/// A connection was held past the leak-detection threshold.
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub connection_id: u64,
    pub held: Duration,
    pub threshold: Duration,
    pub trace: AcquisitionTrace,
}

/// Why a connection left the pool for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Ping failed during checkout validation
    ValidationFailed,
    /// The connection reported itself unusable on release
    Broken,
    /// `reset_session` failed on release
    ResetFailed,
    MaxLifetime,
    IdleTimeout,
    /// The holder called `discard`
    Explicit,
    PoolClosed,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiscardReason::ValidationFailed => "validation failed",
            DiscardReason::Broken => "connection broken",
            DiscardReason::ResetFailed => "session reset failed",
            DiscardReason::MaxLifetime => "max lifetime reached",
            DiscardReason::IdleTimeout => "idle timeout",
            DiscardReason::Explicit => "discarded by holder",
            DiscardReason::PoolClosed => "pool closed",
        };
        f.write_str(s)
    }
}

/// A connection was closed and removed from the pool.
#[derive(Debug, Clone)]
pub struct DiscardEvent {
    pub connection_id: u64,
    pub reason: DiscardReason,
}

/// Receives pool events.
///
/// Callbacks run on the thread that caused the event, never while the pool
/// lock is held, so an observer may call back into the pool.
pub trait PoolObserver: Send + Sync {
    fn on_acquire(&self, _event: &AcquireEvent) {}

    fn on_timeout(&self, _waited: Duration) {}

    fn on_leak(&self, _report: &LeakReport) {}

    fn on_discard(&self, _event: &DiscardEvent) {}

    /// Called after every maintenance pass.
    fn on_metrics(&self, _metrics: &PoolMetrics) {}
}

/// Logs pool events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_acquire(&self, event: &AcquireEvent) {
        tracing::trace!(
            connection_id = event.connection_id,
            wait_us = event.wait.as_micros(),
            created = event.created,
            "connection acquired"
        );
    }

    fn on_timeout(&self, waited: Duration) {
        tracing::warn!(waited_ms = waited.as_millis(), "timed out acquiring a pooled connection");
    }

    fn on_leak(&self, report: &LeakReport) {
        tracing::warn!(
            connection_id = report.connection_id,
            held_ms = report.held.as_millis(),
            threshold_ms = report.threshold.as_millis(),
            acquired_at = %report.trace,
            "possible connection leak"
        );
        if let Some(backtrace) = report.trace.backtrace() {
            tracing::debug!(connection_id = report.connection_id, "acquired at:\n{backtrace}");
        }
    }

    fn on_discard(&self, event: &DiscardEvent) {
        tracing::debug!(
            connection_id = event.connection_id,
            reason = %event.reason,
            "connection discarded"
        );
    }

    fn on_metrics(&self, metrics: &PoolMetrics) {
        tracing::debug!(
            total = metrics.total,
            idle = metrics.idle,
            active = metrics.active,
            waiting = metrics.waiting,
            timeouts = metrics.timeouts,
            leaks = metrics.leaks,
            "pool metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_acquire_time() {
        let mut counters = Counters::default();
        assert_eq!(counters.average_acquire_time(), Duration::ZERO);
        counters.acquisitions = 4;
        counters.acquire_time = Duration::from_millis(10);
        assert_eq!(counters.average_acquire_time(), Duration::from_micros(2500));
    }

    #[test]
    fn discard_reason_display() {
        assert_eq!(DiscardReason::MaxLifetime.to_string(), "max lifetime reached");
        assert_eq!(DiscardReason::Explicit.to_string(), "discarded by holder");
    }
}
