//! Integration tests for series handles driven by the background scheduler.
//!
//! These use short flush periods and poll against a deadline, so they
//! exercise the real timer thread rather than calling `flush` directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::tempdir;
use tsring::error::PersistenceError;
use tsring::events::{EventKind, SeriesEvent};
use tsring::file::FileGateway;
use tsring::gateway::PersistenceGateway;
use tsring::header::SeriesHeader;
use tsring::item::Item;
use tsring::ring::RingBuffer;
use tsring::series::{SeriesContext, SeriesHandle};
use tsring::StoreConfig;

fn fast_config() -> StoreConfig {
    StoreConfig {
        append_period: Duration::from_millis(50),
        rewrite_period: Duration::from_millis(20),
        ..StoreConfig::default()
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_scheduled_flush_persists_appends() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(FileGateway::new(temp_dir.path()));
    let ctx = SeriesContext::new(&fast_config(), gateway.clone()).unwrap();
    let series = SeriesHandle::open(ctx, "sensor.temp", "temperature", 100).unwrap();

    for ts in 1..=10 {
        series.append(Item::new(ts, ts as f64 * 0.5)).unwrap();
    }
    assert!(series.is_flush_required());
    assert!(series.next_flush_in().is_some());

    assert!(
        wait_until(Duration::from_secs(5), || !series.is_flush_required()),
        "scheduled flush did not run"
    );

    let header = gateway.read_header_at(&gateway.path_for("sensor.temp")).unwrap();
    assert_eq!(header.current_size(), 10);
    assert_eq!(header.most_recent_timestamp(), Some(10));
    assert_eq!(series.next_flush_in(), None);
}

#[test]
fn test_scheduled_rewrite_after_out_of_order_append() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(FileGateway::new(temp_dir.path()));
    let ctx = SeriesContext::new(&fast_config(), gateway.clone()).unwrap();
    let series = SeriesHandle::open(ctx, "s", "", 10).unwrap();

    series.append_all([Item::new(10, 1.0), Item::new(30, 3.0)]).unwrap();
    series.append(Item::new(20, 2.0)).unwrap();
    assert!(series.is_rewrite_pending());

    assert!(wait_until(Duration::from_secs(5), || !series.is_flush_required()));

    let header = gateway.read_header_at(&gateway.path_for("s")).unwrap();
    let on_disk = tsring::gateway::PersistenceGateway::read_series(gateway.as_ref(), &header).unwrap();
    assert_eq!(
        on_disk.snapshot(),
        vec![Item::new(10, 1.0), Item::new(20, 2.0), Item::new(30, 3.0)]
    );
}

#[test]
fn test_property_change_is_flushed_on_schedule() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(FileGateway::new(temp_dir.path()));
    let ctx = SeriesContext::new(&fast_config(), gateway.clone()).unwrap();
    let series = SeriesHandle::open(ctx, "s", "", 10).unwrap();

    series.set_property("unit", "celsius");
    assert!(series.is_flush_required());
    assert!(wait_until(Duration::from_secs(5), || !series.is_flush_required()));

    let header = gateway.read_header_at(&gateway.path_for("s")).unwrap();
    assert_eq!(header.property("unit"), Some("celsius"));
}

#[test]
fn test_listeners_see_events_in_order() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(FileGateway::new(temp_dir.path()));
    let ctx = SeriesContext::new(&fast_config(), gateway).unwrap();
    let series = SeriesHandle::open(ctx, "s", "", 10).unwrap();

    let (tx, rx) = mpsc::channel::<SeriesEvent>();
    let tx = Mutex::new(tx);
    series.add_listener(move |event: &SeriesEvent| {
        tx.lock().send(event.clone()).unwrap();
    });

    series.append(Item::new(1, 1.0)).unwrap();
    series.append(Item::new(2, 2.0)).unwrap();
    series.remove(&Item::new(1, 1.0)).unwrap();
    series.clear().unwrap();

    let events: Vec<SeriesEvent> = (0..4)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();

    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::ItemsAdded,
            EventKind::ItemsAdded,
            EventKind::ItemsRemoved,
            EventKind::SeriesChanged,
        ]
    );
    let mod_counts: Vec<u64> = events.iter().map(|event| event.mod_count).collect();
    assert_eq!(mod_counts, vec![1, 2, 3, 4]);
    assert_eq!(events[2].items, vec![Item::new(1, 1.0)]);
    assert!(events.iter().all(|event| event.series_id == "s"));
}

#[test]
fn test_removed_listener_stops_receiving() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(FileGateway::new(temp_dir.path()));
    let ctx = SeriesContext::new(&fast_config(), gateway).unwrap();
    let series = SeriesHandle::open(ctx, "s", "", 10).unwrap();

    let (tx, rx) = mpsc::channel::<u64>();
    let tx = Mutex::new(tx);
    let id = series.add_listener(move |event: &SeriesEvent| {
        tx.lock().send(event.mod_count).unwrap();
    });

    series.append(Item::new(1, 1.0)).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);

    assert!(series.remove_listener(id));
    series.append(Item::new(2, 2.0)).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(series.mod_count(), 2);
}

#[test]
fn test_evicted_series_keeps_buffered_appends() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(FileGateway::new(temp_dir.path()));
    let config = StoreConfig {
        append_period: Duration::from_secs(3600),
        ..StoreConfig::default()
    };
    let ctx = SeriesContext::new(&config, gateway).unwrap();
    let series = SeriesHandle::open(ctx, "s", "", 5).unwrap();

    series.append_all((1..=3).map(|ts| Item::new(ts, 1.0))).unwrap();
    series.flush().unwrap();

    // Load, then append more and evict before the next flush
    assert_eq!(series.snapshot().unwrap().len(), 3);
    series.append_all((4..=7).map(|ts| Item::new(ts, 2.0))).unwrap();
    series.trigger_eviction();
    assert!(series.is_evicted());
    assert_eq!(series.size(), 5);

    let timestamps: Vec<i64> = series.iter().unwrap().map(|item| item.timestamp).collect();
    assert_eq!(timestamps, vec![3, 4, 5, 6, 7]);
    assert!(!series.is_evicted());
}

#[test]
fn test_concurrent_appends_to_one_series() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(FileGateway::new(temp_dir.path()));
    let ctx = SeriesContext::new(&fast_config(), gateway).unwrap();
    let series = SeriesHandle::open(ctx, "s", "", 1_000).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let series = Arc::clone(&series);
            thread::spawn(move || {
                for _ in 0..100 {
                    series.append(Item::new(1, 1.0)).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(series.mod_count(), 400);
    assert_eq!(series.snapshot().unwrap().len(), 400);
    series.flush().unwrap();
    assert!(!series.is_flush_required());
}

/// File gateway whose writes can be switched off to simulate an outage.
#[derive(Debug)]
struct ToggleGateway {
    inner: FileGateway,
    failing: AtomicBool,
    failed_writes: AtomicU64,
}

impl ToggleGateway {
    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(PersistenceError::Corrupted {
                path: self.inner.root().to_path_buf(),
                reason: "disk unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl PersistenceGateway for ToggleGateway {
    fn exists(&self, header: &SeriesHeader) -> bool {
        self.inner.exists(header)
    }

    fn create_file(&self, header: &mut SeriesHeader) -> Result<(), PersistenceError> {
        self.inner.create_file(header)
    }

    fn read_header(&self, header: &mut SeriesHeader) -> Result<(), PersistenceError> {
        self.inner.read_header(header)
    }

    fn read_series(&self, header: &SeriesHeader) -> Result<RingBuffer, PersistenceError> {
        self.inner.read_series(header)
    }

    fn write_series(&self, header: &mut SeriesHeader, ring: &RingBuffer) -> Result<(), PersistenceError> {
        self.check()?;
        self.inner.write_series(header, ring)
    }

    fn append_to_series(&self, header: &mut SeriesHeader, items: &[Item]) -> Result<(), PersistenceError> {
        self.check()?;
        self.inner.append_to_series(header, items)
    }
}

#[test]
fn test_failed_background_flush_is_retried_after_recovery() {
    let temp_dir = tempdir().unwrap();
    let gateway = Arc::new(ToggleGateway {
        inner: FileGateway::new(temp_dir.path()),
        failing: AtomicBool::new(true),
        failed_writes: AtomicU64::new(0),
    });
    let config = StoreConfig {
        append_period: Duration::from_millis(30),
        rewrite_period: Duration::from_secs(3600),
        ..StoreConfig::default()
    };
    let ctx = SeriesContext::new(&config, gateway.clone()).unwrap();
    let series = SeriesHandle::open(ctx, "s", "", 10).unwrap();

    series.append_all((1..=4).map(|ts| Item::new(ts, ts as f64))).unwrap();

    // Let the timer fail more than once so the retry itself is retried
    assert!(
        wait_until(Duration::from_secs(5), || gateway.failed_writes.load(Ordering::SeqCst) >= 2),
        "background flush was not attempted"
    );
    assert!(series.is_flush_required());

    gateway.failing.store(false, Ordering::SeqCst);
    assert!(
        wait_until(Duration::from_secs(5), || !series.is_flush_required()),
        "background flush was not retried after recovery"
    );

    let header = gateway.inner.read_header_at(&gateway.inner.path_for("s")).unwrap();
    assert_eq!(header.current_size(), 4);
    assert_eq!(header.most_recent_timestamp(), Some(4));
}
