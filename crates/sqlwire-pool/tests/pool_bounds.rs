//! Concurrency tests: many threads hammering a small pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sqlwire_core::{Connection, Connector, Result, Row, Value};
use sqlwire_pool::{Pool, PoolConfig};

#[derive(Default)]
struct Gauge {
    live: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
}

struct CountingConnector {
    gauge: Arc<Gauge>,
    connect_delay: Duration,
}

impl Connector for CountingConnector {
    type Connection = CountingConnection;

    fn connect(&self) -> Result<CountingConnection> {
        thread::sleep(self.connect_delay);
        self.gauge.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.gauge.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(live, Ordering::SeqCst);
        Ok(CountingConnection {
            gauge: Arc::clone(&self.gauge),
            in_use: AtomicBool::new(false),
        })
    }
}

struct CountingConnection {
    gauge: Arc<Gauge>,
    in_use: AtomicBool,
}

impl CountingConnection {
    fn claim(&self) {
        assert!(
            !self.in_use.swap(true, Ordering::SeqCst),
            "connection handed to two callers"
        );
    }

    fn unclaim(&self) {
        self.in_use.store(false, Ordering::SeqCst);
    }
}

impl Connection for CountingConnection {
    fn query(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }

    fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Ok(1)
    }

    fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_usable(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for CountingConnection {
    fn drop(&mut self) {
        self.gauge.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn pool(max_size: usize, gauge: &Arc<Gauge>) -> Pool<CountingConnector> {
    let connector = CountingConnector {
        gauge: Arc::clone(gauge),
        connect_delay: Duration::from_millis(2),
    };
    let config = PoolConfig::new(max_size)
        .acquire_timeout(Duration::from_secs(10))
        .reaper_interval(None);
    Pool::new(connector, config).unwrap()
}

#[test]
fn never_exceeds_max_size() {
    const THREADS: usize = 16;
    const ROUNDS: usize = 20;

    let gauge = Arc::new(Gauge::default());
    let pool = pool(4, &gauge);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let mut conn = pool.acquire().unwrap();
                    conn.claim();
                    let metrics = pool.metrics();
                    assert!(metrics.active + metrics.idle <= 4, "{metrics:?}");
                    assert!(metrics.total <= 4, "{metrics:?}");
                    assert_eq!(conn.execute("UPDATE t SET n = n + 1", &[]).unwrap(), 1);
                    thread::sleep(Duration::from_micros(200));
                    conn.unclaim();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(gauge.peak.load(Ordering::SeqCst) <= 4);
    let metrics = pool.metrics();
    assert_eq!(metrics.acquisitions, (THREADS * ROUNDS) as u64);
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.waiting, 0);
    assert_eq!(metrics.timeouts, 0);
    assert!(metrics.idle <= 4);
}

#[test]
fn maintenance_concurrent_with_acquire_stays_bounded() {
    let gauge = Arc::new(Gauge::default());
    let connector = CountingConnector {
        gauge: Arc::clone(&gauge),
        connect_delay: Duration::from_millis(1),
    };
    let config = PoolConfig::new(3)
        .min_idle(3)
        .max_lifetime(Some(Duration::from_millis(5)))
        .acquire_timeout(Duration::from_secs(10))
        .reaper_interval(Some(Duration::from_millis(1)));
    let pool = Pool::new(connector, config).unwrap();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..25 {
                    let conn = pool.acquire().unwrap();
                    conn.claim();
                    thread::sleep(Duration::from_micros(300));
                    conn.unclaim();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    pool.close();

    assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
    assert!(gauge.opened.load(Ordering::SeqCst) > 3);
}

#[test]
fn waiters_are_all_served() {
    let gauge = Arc::new(Gauge::default());
    let pool = pool(1, &gauge);
    let held = pool.acquire().unwrap();
    let served = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let served = Arc::clone(&served);
            thread::spawn(move || {
                let _conn = pool.acquire().unwrap();
                served.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while pool.metrics().waiting < 4 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(pool.metrics().waiting, 4);
    drop(held);

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(served.load(Ordering::SeqCst), 4);
    assert_eq!(gauge.opened.load(Ordering::SeqCst), 1);
}
