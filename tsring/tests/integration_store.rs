//! Integration tests for the full store lifecycle.
//!
//! These tests exercise the flow from store creation through appends,
//! mutations and reopening, including configuration loaded from disk.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tsring::config::{CacheConfig, LruCacheConfig, PressureCacheConfig};
use tsring::error::{ConfigError, TsringError};
use tsring::item::Item;
use tsring::metrics::{AtomicCounter, CacheMetrics, GatewayMetrics, StoreMetrics};
use tsring::store::Store;
use tsring::StoreConfig;

/// Config whose timers never fire during a test.
fn manual_flush_config() -> StoreConfig {
    StoreConfig {
        append_period: Duration::from_secs(3600),
        rewrite_period: Duration::from_secs(3600),
        default_series_length: 60,
        ..StoreConfig::default()
    }
}

#[test]
fn test_full_store_lifecycle() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("lifecycle_test");

    let base_time = 1_700_000_000_000i64;
    let one_sec = 1_000i64;

    // Phase 1: create series and write more than they hold
    {
        let store = Store::open(&store_path, manual_flush_config()).unwrap();
        let cpu = store.series("vm1.cpu", "vCPU usage", None).unwrap();
        let mem = store.series("vm1.mem", "RSS bytes", Some(30)).unwrap();

        for i in 0..90 {
            let ts = base_time + i * one_sec;
            cpu.append(Item::new(ts, (i % 100) as f64)).unwrap();
            mem.append(Item::new(ts, (1024 + i * 10) as f64)).unwrap();
        }
        cpu.set_property("unit", "percent");

        assert_eq!(cpu.size(), 60);
        assert_eq!(mem.size(), 30);
        store.close().unwrap();
    }

    // Phase 2: reopen and verify only the most recent items survived
    {
        let store = Store::open(&store_path, manual_flush_config()).unwrap();
        assert_eq!(store.ids(), vec!["vm1.cpu".to_string(), "vm1.mem".to_string()]);

        let cpu = store.get("vm1.cpu").unwrap();
        assert_eq!(cpu.description(), "vCPU usage");
        assert_eq!(cpu.property("unit"), Some("percent".to_string()));
        assert_eq!(cpu.size(), 60);
        assert_eq!(cpu.latest_timestamp(), Some(base_time + 89 * one_sec));

        let data = cpu.snapshot().unwrap();
        assert_eq!(data.len(), 60);
        assert_eq!(data[0].timestamp, base_time + 30 * one_sec);

        let mem = store.get("vm1.mem").unwrap();
        let data = mem.snapshot().unwrap();
        assert_eq!(data.len(), 30);
        assert_eq!(data[0], Item::new(base_time + 60 * one_sec, 1624.0));

        // Keep writing after the reopen; the on-disk ring continues
        mem.append(Item::new(base_time + 90 * one_sec, 1.0)).unwrap();
    }

    // Phase 3: the append made in phase 2 was flushed on drop
    {
        let store = Store::open(&store_path, manual_flush_config()).unwrap();
        let mem = store.get("vm1.mem").unwrap();
        let latest = mem.latest().unwrap().unwrap();
        assert_eq!(latest, Item::new(base_time + 90 * one_sec, 1.0));
        assert_eq!(mem.earliest().unwrap().unwrap().timestamp, base_time + 61 * one_sec);
    }
}

#[test]
fn test_rewrite_survives_reopen() {
    let temp_dir = tempdir().unwrap();

    {
        let store = Store::open(temp_dir.path(), manual_flush_config()).unwrap();
        let series = store.series("s", "", Some(10)).unwrap();
        series
            .append_all([Item::new(1, 1.0), Item::new(2, 2.0), Item::new(4, 4.0)])
            .unwrap();
        store.flush_all().unwrap();

        series.append(Item::new(3, 3.0)).unwrap();
        series.remove(&Item::new(1, 1.0)).unwrap();
        assert!(series.is_rewrite_pending());
    }

    let store = Store::open(temp_dir.path(), manual_flush_config()).unwrap();
    let series = store.get("s").unwrap();
    assert_eq!(
        series.snapshot().unwrap(),
        vec![Item::new(2, 2.0), Item::new(3, 3.0), Item::new(4, 4.0)]
    );
}

#[test]
fn test_cleared_series_reopens_empty() {
    let temp_dir = tempdir().unwrap();

    {
        let store = Store::open(temp_dir.path(), manual_flush_config()).unwrap();
        let series = store.series("s", "", None).unwrap();
        series.append_all((1..=5).map(|ts| Item::new(ts, 0.0))).unwrap();
        store.flush_all().unwrap();
        series.clear().unwrap();
    }

    let store = Store::open(temp_dir.path(), manual_flush_config()).unwrap();
    let series = store.get("s").unwrap();
    assert_eq!(series.size(), 0);
    assert_eq!(series.latest_timestamp(), None);
    assert!(series.snapshot().unwrap().is_empty());
}

#[test]
fn test_parallel_writers_on_many_series() {
    let temp_dir = tempdir().unwrap();
    let store = Arc::new(Store::open(temp_dir.path(), manual_flush_config()).unwrap());

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let series = store.series(&format!("worker.{w}"), "", Some(50)).unwrap();
                for ts in 0..200 {
                    series.append(Item::new(ts, f64::from(w))).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(store.len(), 8);
    assert_eq!(store.flush_all().unwrap(), 8);
    for id in store.ids() {
        let series = store.get(&id).unwrap();
        assert_eq!(series.size(), 50);
        assert_eq!(series.earliest().unwrap().unwrap().timestamp, 150);
    }
}

#[test]
fn test_store_with_pressure_cache() {
    let temp_dir = tempdir().unwrap();
    let config = StoreConfig {
        cache: CacheConfig::Pressure(PressureCacheConfig {
            pressure_threshold_percent: 100.0,
            ..PressureCacheConfig::default()
        }),
        ..manual_flush_config()
    };

    let store = Store::open(temp_dir.path(), config).unwrap();
    let series = store.series("s", "", Some(4)).unwrap();
    series.append_all((1..=6).map(|ts| Item::new(ts, 0.0))).unwrap();

    assert_eq!(series.snapshot().unwrap().len(), 4);
    let stats = store.cache_stats();
    assert_eq!(stats.policy, "pressure");
    assert_eq!(stats.len, 1);
    assert_eq!(stats.max_size, None);
}

#[test]
fn test_config_loaded_from_file() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("tsring.json");
    std::fs::write(
        &config_path,
        r#"{
            "append_period": 0.5,
            "default_series_length": 12,
            "cache": { "policy": "lru", "initial_size": 8 }
        }"#,
    )
    .unwrap();

    let config = StoreConfig::load(&config_path).unwrap();
    assert_eq!(config.append_period, Duration::from_millis(500));
    assert_eq!(config.rewrite_period, StoreConfig::default().rewrite_period);
    assert_eq!(
        config.cache,
        CacheConfig::Lru(LruCacheConfig {
            initial_size: 8,
            ..LruCacheConfig::default()
        })
    );

    let store = Store::open(temp_dir.path().join("data"), config).unwrap();
    assert_eq!(store.series("s", "", None).unwrap().max_length(), 12);
    assert_eq!(store.cache_stats().max_size, Some(8));
}

#[test]
fn test_missing_config_file_is_reported() {
    let temp_dir = tempdir().unwrap();
    let result = StoreConfig::load(temp_dir.path().join("absent.json"));
    assert!(matches!(result, Err(TsringError::Config(ConfigError::Read { .. }))));
}

#[test]
fn test_renamed_series_file_is_skipped() {
    let temp_dir = tempdir().unwrap();
    {
        let store = Store::open(temp_dir.path(), manual_flush_config()).unwrap();
        store.series("a", "", Some(5)).unwrap().append(Item::new(1, 1.0)).unwrap();
        store.close().unwrap();
    }
    std::fs::rename(temp_dir.path().join("a.tsr"), temp_dir.path().join("b.tsr")).unwrap();

    let store = Store::open(temp_dir.path(), manual_flush_config()).unwrap();
    assert!(store.is_empty());
    assert!(store.get("a").is_none());

    // The id is free again and gets a fresh, usable file
    let series = store.series("a", "", Some(5)).unwrap();
    assert!(series.snapshot().unwrap().is_empty());
    series.append(Item::new(2, 2.0)).unwrap();
    assert_eq!(store.flush_all().unwrap(), 1);
    assert!(temp_dir.path().join("b.tsr").is_file());
}

#[test]
fn test_store_metrics_are_published() {
    let temp_dir = tempdir().unwrap();
    let requests = Arc::new(AtomicCounter::default());
    let appends = Arc::new(AtomicCounter::default());
    let rewrites = Arc::new(AtomicCounter::default());
    let metrics = StoreMetrics {
        cache: CacheMetrics {
            requests: requests.clone(),
            ..CacheMetrics::default()
        },
        gateway: GatewayMetrics {
            appends: appends.clone(),
            rewrites: rewrites.clone(),
            ..GatewayMetrics::default()
        },
    };

    let store = Store::open_with_metrics(temp_dir.path(), manual_flush_config(), metrics).unwrap();
    let series = store.series("s", "", Some(5)).unwrap();
    series.append_all([Item::new(1, 1.0), Item::new(2, 2.0)]).unwrap();
    store.flush_all().unwrap();
    assert_eq!(appends.get(), 1);

    series.snapshot().unwrap();
    series.snapshot().unwrap();
    assert!(requests.get() >= 2);

    series.clear().unwrap();
    store.flush_all().unwrap();
    assert!(rewrites.get() >= 1);
}
