//! Bookkeeping for individual pooled connections.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a pooled connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    InUse,
    /// Being pinged or reset outside the pool lock
    Validating,
}

/// The call site that acquired a connection.
#[derive(Clone)]
pub struct AcquisitionTrace {
    location: &'static Location<'static>,
    thread: Option<String>,
    backtrace: Option<Arc<Backtrace>>,
}

impl AcquisitionTrace {
    pub(crate) fn capture(location: &'static Location<'static>, force_backtrace: bool) -> Self {
        let backtrace = if force_backtrace {
            Some(Backtrace::force_capture())
        } else {
            let bt = Backtrace::capture();
            matches!(bt.status(), std::backtrace::BacktraceStatus::Captured).then_some(bt)
        };
        Self {
            location,
            thread: std::thread::current().name().map(str::to_string),
            backtrace: backtrace.map(Arc::new),
        }
    }

    pub(crate) fn location_only(location: &'static Location<'static>) -> Self {
        Self {
            location,
            thread: std::thread::current().name().map(str::to_string),
            backtrace: None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn thread(&self) -> Option<&str> {
        self.thread.as_deref()
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }
}

impl fmt::Display for AcquisitionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)?;
        if let Some(thread) = &self.thread {
            write!(f, " (thread {thread})")?;
        }
        Ok(())
    }
}

impl fmt::Debug for AcquisitionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionTrace")
            .field("location", &self.location)
            .field("thread", &self.thread)
            .field("backtrace", &self.backtrace.is_some())
            .finish()
    }
}

/// An idle connection waiting in the pool.
pub(crate) struct IdleEntry<T> {
    pub(crate) id: u64,
    pub(crate) conn: T,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
}

impl<T> IdleEntry<T> {
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Record of a connection currently handed out.
///
/// The connection itself travels with the [`PooledConnection`]; the pool
/// only keeps what it needs for leak detection.
///
/// [`PooledConnection`]: crate::PooledConnection
pub(crate) struct Checkout {
    pub(crate) acquired_at: Instant,
    pub(crate) trace: AcquisitionTrace,
    pub(crate) leak_reported: bool,
}

/// Snapshot of one pooled connection, for diagnostics.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub id: u64,
    pub state: EntryState,
    /// Time since the last state change
    pub since: Duration,
    /// Acquisition site, for in-use entries
    pub trace: Option<AcquisitionTrace>,
}
