//! In-memory connector for pool tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use sqlwire_core::{Connection, ConnectionErrorKind, Connector, Error, Result, Row, Value};

use crate::metrics::{DiscardEvent, DiscardReason, LeakReport, PoolObserver};

#[derive(Default)]
pub(crate) struct Probe {
    pub(crate) opened: AtomicU64,
    pub(crate) live: AtomicUsize,
    pub(crate) peak_live: AtomicUsize,
    pub(crate) pings: AtomicUsize,
    pub(crate) resets: AtomicUsize,
    pub(crate) closes: AtomicUsize,
    pub(crate) fail_connect: AtomicBool,
    pub(crate) fail_ping: AtomicBool,
    pub(crate) fail_reset: AtomicBool,
}

pub(crate) struct FakeConnector {
    probe: Arc<Probe>,
}

impl FakeConnector {
    pub(crate) fn new() -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        (
            Self {
                probe: Arc::clone(&probe),
            },
            probe,
        )
    }
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    fn connect(&self) -> Result<FakeConnection> {
        if self.probe.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection(ConnectionErrorKind::Refused, "connection refused"));
        }
        self.probe.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.probe.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(FakeConnection {
            probe: Arc::clone(&self.probe),
            usable: true,
        })
    }
}

pub(crate) struct FakeConnection {
    probe: Arc<Probe>,
    usable: bool,
}

impl FakeConnection {
    pub(crate) fn break_connection(&mut self) {
        self.usable = false;
    }
}

impl Connection for FakeConnection {
    fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }

    fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Ok(0)
    }

    fn ping(&mut self) -> Result<()> {
        self.probe.pings.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_ping.load(Ordering::SeqCst) {
            self.usable = false;
            return Err(Error::connection(ConnectionErrorKind::Disconnected, "server has gone away"));
        }
        Ok(())
    }

    fn reset_session(&mut self) -> Result<()> {
        self.probe.resets.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail_reset.load(Ordering::SeqCst) {
            return Err(Error::protocol("reset rejected"));
        }
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn close(&mut self) -> Result<()> {
        self.usable = false;
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.probe.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub(crate) timeouts: AtomicUsize,
    pub(crate) leaks: Mutex<Vec<LeakReport>>,
    discards: Mutex<Vec<DiscardEvent>>,
}

impl RecordingObserver {
    pub(crate) fn discards(&self) -> Vec<DiscardReason> {
        self.discards.lock().iter().map(|e| e.reason).collect()
    }
}

impl PoolObserver for RecordingObserver {
    fn on_timeout(&self, _waited: Duration) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_leak(&self, report: &LeakReport) {
        self.leaks.lock().push(report.clone());
    }

    fn on_discard(&self, event: &DiscardEvent) {
        self.discards.lock().push(event.clone());
    }
}
