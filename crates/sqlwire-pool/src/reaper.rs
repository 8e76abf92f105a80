//! Background maintenance thread.
//!
//! The reaper holds only a weak reference to the pool, so it never keeps a
//! dropped pool alive; it exits on the first tick after the last handle is
//! gone, or immediately when stopped.

use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use sqlwire_core::Connector;

use crate::pool::Shared;

#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Signal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep for `interval`; `false` once stopped.
    fn wait(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, interval);
        }
        !*stopped
    }
}

pub(crate) struct Reaper {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn spawn<C: Connector>(pool: Weak<Shared<C>>, interval: Duration) -> io::Result<Self> {
        let signal = Arc::new(Signal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("sqlwire-pool-reaper".to_string())
            .spawn(move || run(&pool, interval, &thread_signal))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it, unless called from the reaper itself.
    pub(crate) fn stop(mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("pool reaper panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.signal.stop();
    }
}

fn run<C: Connector>(pool: &Weak<Shared<C>>, interval: Duration, signal: &Signal) {
    tracing::debug!(interval_ms = interval.as_millis(), "pool reaper started");
    while signal.wait(interval) {
        let Some(shared) = pool.upgrade() else {
            break;
        };
        let report = shared.run_maintenance();
        if report.retired > 0 || report.created > 0 || report.leaks > 0 {
            tracing::trace!(
                retired = report.retired,
                created = report.created,
                leaks = report.leaks,
                "pool maintenance"
            );
        }
    }
    tracing::debug!("pool reaper stopped");
}
