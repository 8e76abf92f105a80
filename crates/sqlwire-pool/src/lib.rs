//! Blocking connection pool for sqlwire connections.
//!
//! [`Pool`] hands out connections opened by any [`Connector`] and takes
//! them back when the [`PooledConnection`] guard drops. It provides:
//!
//! - A hard bound: idle plus in-use connections never exceed `max_size`
//! - Waiting with timeout when the pool is exhausted
//! - Validation on checkout and session reset on release
//! - A reaper thread that retires old connections and keeps `min_idle`
//! - Leak detection that names the call site holding the connection
//! - [`PoolMetrics`] snapshots and a pluggable [`PoolObserver`]
//!
//! [`Connector`]: sqlwire_core::Connector

pub mod config;
pub mod entry;
pub mod metrics;
pub mod pool;
mod reaper;

#[cfg(test)]
mod testing;

pub use config::PoolConfig;
pub use entry::{AcquisitionTrace, EntryInfo, EntryState};
pub use metrics::{
    AcquireEvent, DiscardEvent, DiscardReason, LeakReport, PoolMetrics, PoolObserver,
    TracingObserver,
};
pub use pool::{MaintenanceReport, Pool, PooledConnection};
