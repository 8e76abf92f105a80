//! The blocking connection pool.
//!
//! All bookkeeping lives in one [`PoolState`] behind a `parking_lot` mutex.
//! Opening, pinging, resetting and closing connections happen with the lock
//! released; while that I/O runs the slot stays reserved (`connecting` or
//! `validating`), so `total()` never exceeds `max_size`.

use std::collections::{HashMap, VecDeque};
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use sqlwire_core::{Connection, Connector, Error, PoolError, PoolErrorKind, Result};

use crate::config::PoolConfig;
use crate::entry::{AcquisitionTrace, Checkout, EntryInfo, EntryState, IdleEntry};
use crate::metrics::{AcquireEvent, Counters, DiscardEvent, DiscardReason, LeakReport, PoolMetrics};
use crate::reaper::Reaper;

pub(crate) struct PoolState<T> {
    idle: VecDeque<IdleEntry<T>>,
    checked_out: HashMap<u64, Checkout>,
    validating: HashMap<u64, Instant>,
    connecting: usize,
    waiting: usize,
    closed: bool,
    next_id: u64,
    counters: Counters,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            checked_out: HashMap::new(),
            validating: HashMap::new(),
            connecting: 0,
            waiting: 0,
            closed: false,
            next_id: 1,
            counters: Counters::default(),
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.validating.len() + self.connecting
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle connections closed for age or idleness
    pub retired: usize,
    /// Connections opened to reach `min_idle`
    pub created: usize,
    /// New leak warnings raised
    pub leaks: usize,
}

pub(crate) struct Shared<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    available: Condvar,
    reaper: Mutex<Option<Reaper>>,
}

/// A thread-safe pool of connections opened by a [`Connector`].
///
/// Cloning is cheap; clones share the same connections.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::new(MySqlConnector::new(config)?, PoolConfig::new(8))?;
/// let mut conn = pool.acquire()?;
/// conn.execute("UPDATE jobs SET state = 'done' WHERE id = ?", &[id.into()])?;
/// // returned to the pool here
/// ```
pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Build a pool and open `min_idle` connections up front.
    ///
    /// Fails if the config is invalid or any of the initial connections
    /// cannot be opened.
    pub fn new(connector: C, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            connector,
            config,
            state: Mutex::new(PoolState::new()),
            available: Condvar::new(),
            reaper: Mutex::new(None),
        });

        for _ in 0..shared.config.min_idle {
            let conn = shared.connector.connect().map_err(connect_error)?;
            let mut state = shared.state.lock();
            let id = state.allocate_id();
            state.counters.created += 1;
            let now = Instant::now();
            state.idle.push_back(IdleEntry {
                id,
                conn,
                created_at: now,
                last_used_at: now,
            });
        }

        if let Some(interval) = shared.config.reaper_interval {
            let reaper = Reaper::spawn(Arc::downgrade(&shared), interval)?;
            *shared.reaper.lock() = Some(reaper);
        }

        tracing::info!(
            max_size = shared.config.max_size,
            min_idle = shared.config.min_idle,
            "connection pool started"
        );
        Ok(Self { shared })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    /// Check out a connection, waiting up to `acquire_timeout`.
    #[track_caller]
    pub fn acquire(&self) -> Result<PooledConnection<C>> {
        self.acquire_timeout(self.shared.config.acquire_timeout)
    }

    /// Check out a connection, waiting up to `timeout`.
    ///
    /// The caller's location is recorded for leak reports.
    #[track_caller]
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<C>> {
        let location = Location::caller();
        let trace = if self.shared.config.leak_detection_threshold.is_some() {
            AcquisitionTrace::capture(location, self.shared.config.capture_backtrace)
        } else {
            AcquisitionTrace::location_only(location)
        };
        self.shared.checkout(timeout, trace)
    }

    /// Retire expired idle connections, top up to `min_idle` and check for
    /// leaks. The reaper thread calls this on every tick.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        self.shared.run_maintenance()
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.shared.metrics()
    }

    /// Snapshot of every connection the pool is tracking.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = Instant::now();
        let state = self.shared.state.lock();
        let idle = state.idle.iter().map(|e| EntryInfo {
            id: e.id,
            state: EntryState::Idle,
            since: e.idle_for(now),
            trace: None,
        });
        let in_use = state.checked_out.iter().map(|(id, c)| EntryInfo {
            id: *id,
            state: EntryState::InUse,
            since: now.saturating_duration_since(c.acquired_at),
            trace: Some(c.trace.clone()),
        });
        let validating = state.validating.iter().map(|(id, since)| EntryInfo {
            id: *id,
            state: EntryState::Validating,
            since: now.saturating_duration_since(*since),
            trace: None,
        });
        let mut entries: Vec<EntryInfo> = idle.chain(in_use).chain(validating).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Close idle connections, wake waiters and stop the reaper.
    ///
    /// Connections still checked out are closed when they come back.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.counters.discarded += idle.len() as u64;
            self.shared.available.notify_all();
            idle
        };
        for entry in idle {
            self.shared.retire(entry.id, entry.conn, DiscardReason::PoolClosed);
        }
        let reaper = self.shared.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop();
        }
        tracing::info!("connection pool closed");
    }
}

impl<C: Connector> Shared<C> {
    fn checkout(self: &Arc<Self>, timeout: Duration, trace: AcquisitionTrace) -> Result<PooledConnection<C>> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let max_size = self.config.max_size;
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(closed_error());
            }

            if let Some(entry) = state.idle.pop_back() {
                let now = Instant::now();
                if self.lifetime_exceeded(&entry, now) {
                    self.discard_locked(&mut state, entry.id, entry.conn, DiscardReason::MaxLifetime);
                    continue;
                }

                let entry = if self.needs_validation(&entry, now) {
                    state.validating.insert(entry.id, now);
                    let (entry, alive) = MutexGuard::unlocked(&mut state, || {
                        let mut entry = entry;
                        let alive = self.validate(&mut entry);
                        (entry, alive)
                    });
                    if !alive {
                        self.discard_locked(&mut state, entry.id, entry.conn, DiscardReason::ValidationFailed);
                        continue;
                    }
                    state.validating.remove(&entry.id);
                    entry
                } else {
                    entry
                };

                if state.closed {
                    self.discard_locked(&mut state, entry.id, entry.conn, DiscardReason::PoolClosed);
                    return Err(closed_error());
                }
                return Ok(self.hand_out(state, entry, started, trace, false));
            }

            if state.total() < max_size {
                state.connecting += 1;
                let opened = MutexGuard::unlocked(&mut state, || self.connector.connect());
                state.connecting -= 1;
                let conn = match opened {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.available.notify_one();
                        drop(state);
                        tracing::warn!(error = %e, "failed to open pooled connection");
                        return Err(connect_error(e));
                    }
                };
                let id = state.allocate_id();
                state.counters.created += 1;
                tracing::debug!(connection_id = id, "opened pooled connection");
                if state.closed {
                    self.discard_locked(&mut state, id, conn, DiscardReason::PoolClosed);
                    return Err(closed_error());
                }
                let now = Instant::now();
                let entry = IdleEntry {
                    id,
                    conn,
                    created_at: now,
                    last_used_at: now,
                };
                return Ok(self.hand_out(state, entry, started, trace, true));
            }

            state.waiting += 1;
            let timed_out = match deadline {
                Some(deadline) => self.available.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.available.wait(&mut state);
                    false
                }
            };
            state.waiting -= 1;

            if timed_out && !state.closed && state.idle.is_empty() && state.total() >= max_size {
                state.counters.timeouts += 1;
                let in_use = state.checked_out.len();
                drop(state);
                let waited = started.elapsed();
                self.config.observer.on_timeout(waited);
                return Err(Error::pool(
                    PoolErrorKind::Timeout,
                    format!(
                        "timed out after {waited:?} waiting for a connection ({in_use} of {max_size} in use)"
                    ),
                ));
            }
        }
    }

    fn hand_out(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, PoolState<C::Connection>>,
        entry: IdleEntry<C::Connection>,
        started: Instant,
        trace: AcquisitionTrace,
        created: bool,
    ) -> PooledConnection<C> {
        let now = Instant::now();
        let wait = now.saturating_duration_since(started);
        state.checked_out.insert(
            entry.id,
            Checkout {
                acquired_at: now,
                trace,
                leak_reported: false,
            },
        );
        state.counters.acquisitions += 1;
        state.counters.acquire_time += wait;
        drop(state);

        self.config.observer.on_acquire(&AcquireEvent {
            connection_id: entry.id,
            wait,
            created,
        });
        PooledConnection {
            conn: Some(entry.conn),
            id: entry.id,
            created_at: entry.created_at,
            acquired_at: now,
            pool: Arc::clone(self),
        }
    }

    fn lifetime_exceeded(&self, entry: &IdleEntry<C::Connection>, now: Instant) -> bool {
        self.config.max_lifetime.is_some_and(|max| entry.age(now) >= max)
    }

    fn needs_validation(&self, entry: &IdleEntry<C::Connection>, now: Instant) -> bool {
        self.config.test_on_checkout
            || entry.idle_for(now) >= self.config.validation_idle_threshold
            || !entry.conn.is_usable()
    }

    fn validate(&self, entry: &mut IdleEntry<C::Connection>) -> bool {
        if !entry.conn.is_usable() {
            return false;
        }
        tracing::debug!(connection_id = entry.id, "validating idle connection");
        match entry.conn.ping() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(connection_id = entry.id, error = %e, "pooled connection failed validation");
                false
            }
        }
    }

    /// Close `conn` while its slot stays reserved, then free the slot.
    fn discard_locked<'a>(
        &'a self,
        state: &mut MutexGuard<'a, PoolState<C::Connection>>,
        id: u64,
        conn: C::Connection,
        reason: DiscardReason,
    ) {
        state.validating.insert(id, Instant::now());
        MutexGuard::unlocked(state, || self.retire(id, conn, reason));
        state.validating.remove(&id);
        state.counters.discarded += 1;
        self.available.notify_one();
    }

    fn retire(&self, id: u64, mut conn: C::Connection, reason: DiscardReason) {
        if conn.is_usable() {
            if let Err(e) = conn.close() {
                tracing::debug!(connection_id = id, error = %e, "error closing discarded connection");
            }
        }
        drop(conn);
        self.config.observer.on_discard(&DiscardEvent {
            connection_id: id,
            reason,
        });
    }

    fn release(&self, id: u64, created_at: Instant, mut conn: C::Connection) {
        {
            let mut state = self.state.lock();
            state.checked_out.remove(&id);
            if state.closed {
                self.discard_locked(&mut state, id, conn, DiscardReason::PoolClosed);
                return;
            }
            state.validating.insert(id, Instant::now());
        }

        let verdict = if !conn.is_usable() {
            Err(DiscardReason::Broken)
        } else if self
            .config
            .max_lifetime
            .is_some_and(|max| created_at.elapsed() >= max)
        {
            Err(DiscardReason::MaxLifetime)
        } else if self.config.reset_on_release {
            conn.reset_session().map_err(|e| {
                tracing::warn!(connection_id = id, error = %e, "failed to reset pooled connection");
                DiscardReason::ResetFailed
            })
        } else {
            Ok(())
        };

        let mut state = self.state.lock();
        state.validating.remove(&id);
        let verdict = match verdict {
            Ok(()) if state.closed => Err(DiscardReason::PoolClosed),
            other => other,
        };
        match verdict {
            Ok(()) => {
                state.idle.push_back(IdleEntry {
                    id,
                    conn,
                    created_at,
                    last_used_at: Instant::now(),
                });
                self.available.notify_one();
            }
            Err(reason) => self.discard_locked(&mut state, id, conn, reason),
        }
    }

    fn discard_checked_out(&self, id: u64, conn: C::Connection) {
        let mut state = self.state.lock();
        state.checked_out.remove(&id);
        self.discard_locked(&mut state, id, conn, DiscardReason::Explicit);
    }

    /// Stop tracking a checked-out connection without closing it.
    fn forget(&self, id: u64) {
        let mut state = self.state.lock();
        state.checked_out.remove(&id);
        self.available.notify_one();
    }

    pub(crate) fn run_maintenance(&self) -> MaintenanceReport {
        let now = Instant::now();
        let min_idle = self.config.min_idle;
        let mut retired = Vec::new();
        let mut leaks = Vec::new();

        let to_open = {
            let mut state = self.state.lock();
            if state.closed {
                return MaintenanceReport::default();
            }

            let idle = std::mem::take(&mut state.idle);
            let mut remaining = idle.len();
            for entry in idle {
                let reason = if self.lifetime_exceeded(&entry, now) {
                    Some(DiscardReason::MaxLifetime)
                } else if remaining > min_idle
                    && self
                        .config
                        .idle_timeout
                        .is_some_and(|limit| entry.idle_for(now) >= limit)
                {
                    Some(DiscardReason::IdleTimeout)
                } else {
                    None
                };
                match reason {
                    Some(reason) => {
                        remaining -= 1;
                        state.validating.insert(entry.id, now);
                        retired.push((entry, reason));
                    }
                    None => state.idle.push_back(entry),
                }
            }

            if let Some(threshold) = self.config.leak_detection_threshold {
                for (id, checkout) in &mut state.checked_out {
                    let held = now.saturating_duration_since(checkout.acquired_at);
                    if !checkout.leak_reported && held >= threshold {
                        checkout.leak_reported = true;
                        leaks.push(LeakReport {
                            connection_id: *id,
                            held,
                            threshold,
                            trace: checkout.trace.clone(),
                        });
                    }
                }
                state.counters.leaks += leaks.len() as u64;
            }

            let room = self.config.max_size.saturating_sub(state.total());
            let to_open = min_idle
                .saturating_sub(state.idle.len() + state.connecting)
                .min(room);
            state.connecting += to_open;
            to_open
        };

        let report_retired = retired.len();
        for (entry, reason) in retired {
            self.retire(entry.id, entry.conn, reason);
            let mut state = self.state.lock();
            state.validating.remove(&entry.id);
            state.counters.discarded += 1;
            self.available.notify_one();
        }
        for leak in &leaks {
            self.config.observer.on_leak(leak);
        }

        let mut created = 0;
        for _ in 0..to_open {
            let opened = self.connector.connect();
            let mut state = self.state.lock();
            state.connecting -= 1;
            match opened {
                Ok(conn) => {
                    let id = state.allocate_id();
                    state.counters.created += 1;
                    created += 1;
                    if state.closed {
                        self.discard_locked(&mut state, id, conn, DiscardReason::PoolClosed);
                        continue;
                    }
                    let opened_at = Instant::now();
                    state.idle.push_back(IdleEntry {
                        id,
                        conn,
                        created_at: opened_at,
                        last_used_at: opened_at,
                    });
                    self.available.notify_one();
                }
                Err(e) => {
                    self.available.notify_one();
                    drop(state);
                    tracing::warn!(error = %e, "failed to open connection for min_idle");
                }
            }
        }

        self.config.observer.on_metrics(&self.metrics());
        MaintenanceReport {
            retired: report_retired,
            created,
            leaks: leaks.len(),
        }
    }

    fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        PoolMetrics {
            total: state.total(),
            idle: state.idle.len(),
            active: state.checked_out.len(),
            waiting: state.waiting,
            max_size: self.config.max_size,
            acquisitions: state.counters.acquisitions,
            timeouts: state.counters.timeouts,
            leaks: state.counters.leaks,
            created: state.counters.created,
            discarded: state.counters.discarded,
            average_acquire_time: state.counters.average_acquire_time(),
        }
    }
}

fn closed_error() -> Error {
    Error::pool(PoolErrorKind::Closed, "pool is closed")
}

fn connect_error(err: Error) -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::Connect,
        message: format!("failed to open connection: {err}"),
        source: Some(Box::new(err)),
    })
}

/// A connection checked out of a [`Pool`].
///
/// Dropping it hands the connection back: broken connections are closed,
/// healthy ones are reset (when `reset_on_release` is on) and made idle.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    id: u64,
    created_at: Instant,
    acquired_at: Instant,
    pool: Arc<Shared<C>>,
}

impl<C: Connector> PooledConnection<C> {
    /// Pool-assigned id, stable for the connection's life.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Close the connection instead of returning it.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard_checked_out(self.id, conn);
        }
    }

    /// Take the connection out of the pool for good. Its slot is freed
    /// without closing it.
    pub fn detach(mut self) -> C::Connection {
        let conn = self.conn.take().expect("pooled connection present until consumed");
        self.pool.forget(self.id);
        conn
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("pooled connection present until consumed")
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("pooled connection present until consumed")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.id, self.created_at, conn);
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .finish_non_exhaustive()
    }
}
