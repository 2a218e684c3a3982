//! Caches of deserialized series.
//!
//! Loading a series means reading its whole file, so handles keep loaded
//! [`RingBuffer`]s in a [`SeriesCache`] keyed by series id. The cache owns
//! retention only: evicting an entry never loses data, because everything not
//! yet on disk is also held by the series' write-behind buffer.
//!
//! Two policies are provided:
//!
//! - [`AdaptiveLruCache`]: bounded LRU whose size follows process memory
//!   utilisation. Grows while memory is plentiful, shrinks when it is tight.
//! - [`PressureCache`]: unbounded map that drops everything whenever memory
//!   utilisation crosses a threshold.
//!
//! Memory utilisation is a process-wide approximation read through a
//! [`MemoryProbe`], never a per-entry accounting. Resizing decisions are
//! heuristic and rate-limited.
//!
//! [`RingBuffer`]: crate::ring::RingBuffer

use std::collections::HashMap;
use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::config::{LruCacheConfig, PressureCacheConfig};
use crate::metrics::CacheMetrics;
use crate::ring::SharedRing;
use crate::scheduler::{FlushScheduler, ScheduledTask};

/// Retention policy for deserialized series.
pub trait SeriesCache: Send + Sync + Debug {
    /// Returns the cached series, marking it as recently used.
    fn get(&self, id: &str) -> Option<SharedRing>;

    /// Caches a series, returning the entry it replaced.
    fn put(&self, id: &str, ring: SharedRing) -> Option<SharedRing>;

    /// Drops a series from the cache, returning it if it was present.
    fn remove(&self, id: &str) -> Option<SharedRing>;

    /// Returns the number of cached series.
    fn len(&self) -> usize;

    /// Returns whether the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of the cache counters.
    fn stats(&self) -> CacheStats;
}

/// Point-in-time view of a cache's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Name of the policy ("lru" or "pressure").
    pub policy: &'static str,
    /// Number of cached series.
    pub len: usize,
    /// Current size bound, if the policy has one.
    pub max_size: Option<usize>,
    /// Total lookups.
    pub requests: u64,
    /// Total lookups that found an entry.
    pub hits: u64,
    /// Total entries dropped by policy.
    pub removes: u64,
    /// Hit percentage over the last completed sampling period.
    pub hit_percentage: f64,
}

/// Source of the memory utilisation figure driving cache sizing.
pub trait MemoryProbe: Send + Sync + Debug {
    /// Returns memory utilisation as a percentage.
    fn utilisation_percent(&self) -> f64;
}

/// [`MemoryProbe`] reading this process' resident memory with `sysinfo`.
///
/// Utilisation is resident memory divided by the budget, or by total system
/// memory when no budget is set. Without a budget a large host reads as
/// nearly idle, so the LRU cache relies on
/// [`LruCacheConfig::size_limit`](crate::config::LruCacheConfig::size_limit)
/// to stop growing.
#[derive(Debug)]
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
    budget_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    /// Creates a probe, optionally with an explicit memory budget in bytes.
    pub fn new(budget_bytes: Option<u64>) -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| warn!(error = %e, "cannot resolve own pid, using system-wide memory"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
            budget_bytes,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    #[allow(clippy::cast_precision_loss)] // percentages do not need full u64 precision
    fn utilisation_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let available = self.budget_bytes.unwrap_or_else(|| system.total_memory());
        if available == 0 {
            return 0.0;
        }

        let used = match self.pid {
            Some(pid) => {
                system.refresh_process(pid);
                system.process(pid).map_or(0, sysinfo::Process::memory)
            }
            None => system.used_memory(),
        };
        used as f64 / available as f64 * 100.0
    }
}

/// [`MemoryProbe`] returning a value set by the caller.
///
/// Useful in tests and for pinning cache behaviour.
#[derive(Debug, Default)]
pub struct StaticMemoryProbe(AtomicU64);

impl StaticMemoryProbe {
    /// Creates a probe reporting `percent`.
    pub fn new(percent: f64) -> Self {
        Self(AtomicU64::new(percent.to_bits()))
    }

    /// Changes the reported utilisation.
    pub fn set(&self, percent: f64) {
        self.0.store(percent.to_bits(), Ordering::Relaxed);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn utilisation_percent(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Shared hit/request bookkeeping for both policies.
#[derive(Debug, Default)]
struct HitCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    removes: AtomicU64,
    window_hits: AtomicU64,
    window_start_requests: AtomicU64,
    hit_percentage: AtomicU64,
}

impl HitCounters {
    fn record_request(&self, hit: bool, metrics: &CacheMetrics) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        metrics.requests.increment();
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.window_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_removes(&self, count: usize, metrics: &CacheMetrics) {
        if count > 0 {
            self.removes.fetch_add(count as u64, Ordering::Relaxed);
            metrics.removes.add(count as u64);
        }
    }

    /// Closes the sampling window and publishes its hit percentage.
    #[allow(clippy::cast_precision_loss)]
    fn roll_hit_rate(&self, metrics: &CacheMetrics) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        let window_requests = requests - self.window_start_requests.swap(requests, Ordering::Relaxed);
        let window_hits = self.window_hits.swap(0, Ordering::Relaxed);
        let percentage = if window_requests == 0 {
            0.0
        } else {
            window_hits as f64 / window_requests as f64 * 100.0
        };
        self.hit_percentage.store(percentage.to_bits(), Ordering::Relaxed);
        metrics.hit_percentage.record(percentage);
        percentage
    }

    fn stats(&self, policy: &'static str, len: usize, max_size: Option<usize>) -> CacheStats {
        CacheStats {
            policy,
            len,
            max_size,
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            hit_percentage: f64::from_bits(self.hit_percentage.load(Ordering::Relaxed)),
        }
    }
}

/// Bounded LRU cache that resizes itself with memory utilisation.
///
/// - Whenever a `put` leaves the cache full, a growth check is queued on the
///   scheduler, at most once per `min_expansion_interval`. The check grows
///   the size by `increase_decrease_percent` if utilisation is below
///   `expansion_threshold_percent`, never past `size_limit`.
/// - Every `maintenance_period`, the size shrinks by the same percentage if
///   utilisation is above `shrink_threshold_percent`, evicting least recently
///   used entries. The hit rate is sampled on the same period.
///
/// Size changes are at least one entry and the size never drops below one.
#[derive(Debug)]
pub struct AdaptiveLruCache {
    entries: Mutex<LruCache<String, SharedRing>>,
    config: LruCacheConfig,
    probe: Arc<dyn MemoryProbe>,
    scheduler: Arc<FlushScheduler>,
    metrics: CacheMetrics,
    counters: HitCounters,
    max_size: AtomicUsize,
    last_size_check: Mutex<Option<Instant>>,
    maintenance: Vec<ScheduledTask>,
    self_ref: Weak<AdaptiveLruCache>,
}

impl AdaptiveLruCache {
    /// Creates the cache and schedules its maintenance tasks.
    pub fn new(
        config: LruCacheConfig,
        probe: Arc<dyn MemoryProbe>,
        scheduler: Arc<FlushScheduler>,
    ) -> Arc<Self> {
        Self::with_metrics(config, probe, scheduler, CacheMetrics::default())
    }

    /// Creates the cache publishing to `metrics`.
    pub fn with_metrics(
        config: LruCacheConfig,
        probe: Arc<dyn MemoryProbe>,
        scheduler: Arc<FlushScheduler>,
        metrics: CacheMetrics,
    ) -> Arc<Self> {
        let initial_size = NonZeroUsize::new(config.initial_size).unwrap_or(NonZeroUsize::MIN);
        metrics.max_size.set(initial_size.get() as u64);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let period = config.maintenance_period;
            let shrink = {
                let weak = weak.clone();
                scheduler.schedule_with_fixed_delay(period, period, move || {
                    if let Some(cache) = weak.upgrade() {
                        cache.shrink_if_required();
                    }
                })
            };
            let hit_rate = {
                let weak = weak.clone();
                scheduler.schedule_with_fixed_delay(period, period, move || {
                    if let Some(cache) = weak.upgrade() {
                        cache.counters.roll_hit_rate(&cache.metrics);
                    }
                })
            };

            Self {
                entries: Mutex::new(LruCache::new(initial_size)),
                config,
                probe,
                scheduler,
                metrics,
                counters: HitCounters::default(),
                max_size: AtomicUsize::new(initial_size.get()),
                last_size_check: Mutex::new(None),
                maintenance: vec![shrink, hit_rate],
                self_ref: weak.clone(),
            }
        })
    }

    /// Returns the current size bound.
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Acquire)
    }

    /// Grows the size bound if memory utilisation allows it.
    ///
    /// Returns the new size if it changed.
    pub fn expand_if_possible(&self) -> Option<usize> {
        let mut entries = self.entries.lock();
        let utilisation = self.probe.utilisation_percent();
        if utilisation >= self.config.expansion_threshold_percent {
            debug!(
                utilisation,
                threshold = self.config.expansion_threshold_percent,
                "cache full but memory too high to grow"
            );
            return None;
        }

        let current = self.max_size();
        let limit = self.config.size_limit.unwrap_or(usize::MAX);
        if current >= limit {
            debug!(size = current, limit, "cache full and at its size limit");
            return None;
        }

        let new_size = current.saturating_add(self.step(current)).min(limit);
        self.apply_size(&mut entries, new_size);
        info!(
            utilisation,
            threshold = self.config.expansion_threshold_percent,
            new_size,
            "increasing series cache size"
        );
        Some(new_size)
    }

    /// Shrinks the size bound and evicts least recently used entries if
    /// memory utilisation is above the shrink threshold.
    ///
    /// Returns the new size if it changed.
    pub fn shrink_if_required(&self) -> Option<usize> {
        let mut entries = self.entries.lock();
        let utilisation = self.probe.utilisation_percent();
        if utilisation <= self.config.shrink_threshold_percent {
            return None;
        }

        let current = self.max_size();
        let new_size = current.saturating_sub(self.step(current)).max(1);
        if new_size == current {
            return None;
        }

        let evicted = entries.len().saturating_sub(new_size);
        self.apply_size(&mut entries, new_size);
        self.counters.record_removes(evicted, &self.metrics);
        self.metrics.series_count.set(entries.len() as u64);
        info!(
            utilisation,
            threshold = self.config.shrink_threshold_percent,
            new_size,
            evicted,
            "decreasing series cache size"
        );
        Some(new_size)
    }

    /// Samples the hit percentage since the previous call and resets the window.
    pub fn roll_hit_rate(&self) -> f64 {
        self.counters.roll_hit_rate(&self.metrics)
    }

    fn step(&self, current: usize) -> usize {
        (current * self.config.increase_decrease_percent as usize / 100).max(1)
    }

    fn apply_size(&self, entries: &mut LruCache<String, SharedRing>, new_size: usize) {
        let capacity = NonZeroUsize::new(new_size).unwrap_or(NonZeroUsize::MIN);
        // resize() evicts from the LRU end when shrinking
        entries.resize(capacity);
        self.max_size.store(capacity.get(), Ordering::Release);
        self.metrics.max_size.set(capacity.get() as u64);
    }

    fn request_expansion_check(&self) {
        {
            let mut last = self.last_size_check.lock();
            let now = Instant::now();
            if let Some(previous) = *last
                && now.duration_since(previous) <= self.config.min_expansion_interval
            {
                return;
            }
            *last = Some(now);
        }

        debug!("series cache full, checking whether it can grow");
        let weak = self.self_ref.clone();
        self.scheduler.execute(move || {
            if let Some(cache) = weak.upgrade() {
                cache.expand_if_possible();
            }
        });
    }
}

impl SeriesCache for AdaptiveLruCache {
    fn get(&self, id: &str) -> Option<SharedRing> {
        let mut entries = self.entries.lock();
        let found = entries.get(id).cloned();
        self.counters.record_request(found.is_some(), &self.metrics);
        found
    }

    fn put(&self, id: &str, ring: SharedRing) -> Option<SharedRing> {
        let mut entries = self.entries.lock();
        let previous = match entries.push(id.to_string(), ring) {
            Some((key, old)) if key == id => Some(old),
            Some((key, _)) => {
                debug!(series = %key, "evicted least recently used series");
                self.counters.record_removes(1, &self.metrics);
                None
            }
            None => None,
        };

        let len = entries.len();
        self.metrics.series_count.set(len as u64);
        drop(entries);

        if len >= self.max_size() {
            self.request_expansion_check();
        }
        previous
    }

    fn remove(&self, id: &str) -> Option<SharedRing> {
        let mut entries = self.entries.lock();
        let removed = entries.pop(id);
        self.metrics.series_count.set(entries.len() as u64);
        removed
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn stats(&self) -> CacheStats {
        self.counters.stats("lru", self.len(), Some(self.max_size()))
    }
}

impl Drop for AdaptiveLruCache {
    fn drop(&mut self) {
        for task in &self.maintenance {
            task.cancel();
        }
    }
}

/// Unbounded cache released wholesale under memory pressure.
///
/// Entries stay cached until a periodic check finds utilisation above
/// `pressure_threshold_percent`, at which point every entry is dropped.
#[derive(Debug)]
pub struct PressureCache {
    entries: Mutex<HashMap<String, SharedRing>>,
    config: PressureCacheConfig,
    probe: Arc<dyn MemoryProbe>,
    metrics: CacheMetrics,
    counters: HitCounters,
    check: Option<ScheduledTask>,
}

impl PressureCache {
    /// Creates the cache and schedules its memory check.
    pub fn new(
        config: PressureCacheConfig,
        probe: Arc<dyn MemoryProbe>,
        scheduler: &FlushScheduler,
    ) -> Arc<Self> {
        Self::with_metrics(config, probe, scheduler, CacheMetrics::default())
    }

    /// Creates the cache publishing to `metrics`.
    pub fn with_metrics(
        config: PressureCacheConfig,
        probe: Arc<dyn MemoryProbe>,
        scheduler: &FlushScheduler,
        metrics: CacheMetrics,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let interval = config.check_interval;
            let check = scheduler.schedule_with_fixed_delay(interval, interval, move || {
                if let Some(cache) = weak.upgrade() {
                    cache.release_if_under_pressure();
                    cache.counters.roll_hit_rate(&cache.metrics);
                }
            });

            Self {
                entries: Mutex::new(HashMap::new()),
                config,
                probe,
                metrics,
                counters: HitCounters::default(),
                check: Some(check),
            }
        })
    }

    /// Drops every entry if memory utilisation is above the threshold.
    ///
    /// Returns the number of entries released.
    pub fn release_if_under_pressure(&self) -> usize {
        let utilisation = self.probe.utilisation_percent();
        if utilisation <= self.config.pressure_threshold_percent {
            return 0;
        }

        let released = {
            let mut entries = self.entries.lock();
            let released = entries.len();
            entries.clear();
            released
        };
        self.counters.record_removes(released, &self.metrics);
        self.metrics.series_count.set(0);
        info!(
            utilisation,
            threshold = self.config.pressure_threshold_percent,
            released,
            "memory pressure, released cached series"
        );
        released
    }
}

impl SeriesCache for PressureCache {
    fn get(&self, id: &str) -> Option<SharedRing> {
        let found = self.entries.lock().get(id).cloned();
        self.counters.record_request(found.is_some(), &self.metrics);
        found
    }

    fn put(&self, id: &str, ring: SharedRing) -> Option<SharedRing> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(id.to_string(), ring);
        self.metrics.series_count.set(entries.len() as u64);
        previous
    }

    fn remove(&self, id: &str) -> Option<SharedRing> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(id);
        self.metrics.series_count.set(entries.len() as u64);
        removed
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn stats(&self) -> CacheStats {
        self.counters.stats("pressure", self.len(), None)
    }
}

impl Drop for PressureCache {
    fn drop(&mut self) {
        if let Some(check) = self.check.take() {
            check.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::metrics::{AtomicCounter, AtomicGauge};
    use crate::ring::RingBuffer;

    fn ring() -> SharedRing {
        RingBuffer::new(4).into_shared()
    }

    fn lru_config(initial_size: usize, percent: u32) -> LruCacheConfig {
        LruCacheConfig {
            initial_size,
            increase_decrease_percent: percent,
            min_expansion_interval: Duration::from_millis(1),
            maintenance_period: Duration::from_secs(3600),
            ..LruCacheConfig::default()
        }
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_full_cache_grows_when_memory_is_low() {
        let scheduler = Arc::new(FlushScheduler::new(1).unwrap());
        let probe = Arc::new(StaticMemoryProbe::new(10.0));
        let cache = AdaptiveLruCache::new(lru_config(2, 50), probe, scheduler);

        cache.put("a", ring());
        cache.put("b", ring());
        assert!(wait_for(|| cache.max_size() == 3));

        cache.put("c", ring());
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_growth_stops_at_size_limit() {
        let scheduler = Arc::new(FlushScheduler::new(1).unwrap());
        let probe = Arc::new(StaticMemoryProbe::new(0.0));
        let config = LruCacheConfig {
            size_limit: Some(5),
            ..lru_config(4, 100)
        };
        let cache = AdaptiveLruCache::new(config, probe, scheduler);

        assert_eq!(cache.expand_if_possible(), Some(5));
        assert_eq!(cache.expand_if_possible(), None);

        for id in ["a", "b", "c", "d", "e", "f"] {
            cache.put(id, ring());
        }
        assert_eq!(cache.max_size(), 5);
        assert_eq!(cache.len(), 5);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_full_cache_stays_put_when_memory_is_high() {
        let scheduler = Arc::new(FlushScheduler::new(1).unwrap());
        let probe = Arc::new(StaticMemoryProbe::new(75.0));
        let cache = AdaptiveLruCache::new(lru_config(2, 50), probe, scheduler);

        assert_eq!(cache.expand_if_possible(), None);

        cache.put("a", ring());
        cache.put("b", ring());
        cache.get("a");
        cache.put("c", ring());

        assert_eq!(cache.max_size(), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.stats().removes, 1);
    }

    #[test]
    fn test_shrink_evicts_least_recently_used() {
        let scheduler = Arc::new(FlushScheduler::new(1).unwrap());
        let probe = Arc::new(StaticMemoryProbe::new(70.0));
        let cache = AdaptiveLruCache::new(lru_config(4, 50), probe.clone(), scheduler);

        for id in ["a", "b", "c", "d"] {
            cache.put(id, ring());
        }
        cache.get("a");

        assert_eq!(cache.shrink_if_required(), None);

        probe.set(95.0);
        assert_eq!(cache.shrink_if_required(), Some(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("d").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_size_never_drops_below_one() {
        let scheduler = Arc::new(FlushScheduler::new(1).unwrap());
        let probe = Arc::new(StaticMemoryProbe::new(99.0));
        let cache = AdaptiveLruCache::new(lru_config(1, 20), probe, scheduler);

        assert_eq!(cache.shrink_if_required(), None);
        assert_eq!(cache.max_size(), 1);
    }

    #[test]
    fn test_put_returns_replaced_entry() {
        let scheduler = Arc::new(FlushScheduler::new(1).unwrap());
        let probe = Arc::new(StaticMemoryProbe::new(99.0));
        let cache = AdaptiveLruCache::new(lru_config(4, 20), probe, scheduler);

        let first = ring();
        assert!(cache.put("a", first.clone()).is_none());
        let replaced = cache.put("a", ring()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(cache.remove("a").is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_rate_and_metrics() {
        let scheduler = Arc::new(FlushScheduler::new(1).unwrap());
        let probe = Arc::new(StaticMemoryProbe::new(99.0));
        let requests = Arc::new(AtomicCounter::default());
        let hit_percentage = Arc::new(AtomicGauge::default());
        let metrics = CacheMetrics {
            requests: requests.clone(),
            hit_percentage: hit_percentage.clone(),
            ..CacheMetrics::default()
        };
        let cache = AdaptiveLruCache::with_metrics(lru_config(4, 20), probe, scheduler, metrics);

        cache.put("a", ring());
        cache.get("a");
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        assert_eq!(cache.roll_hit_rate(), 75.0);
        assert_eq!(requests.get(), 4);
        assert_eq!(hit_percentage.get(), 75.0);

        // New window
        cache.get("missing");
        assert_eq!(cache.roll_hit_rate(), 0.0);

        let stats = cache.stats();
        assert_eq!(stats.requests, 5);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.max_size, Some(4));
    }

    #[test]
    fn test_pressure_cache_releases_everything_above_threshold() {
        let scheduler = FlushScheduler::new(1).unwrap();
        let probe = Arc::new(StaticMemoryProbe::new(50.0));
        let cache = PressureCache::new(PressureCacheConfig::default(), probe.clone(), &scheduler);

        cache.put("a", ring());
        cache.put("b", ring());
        assert_eq!(cache.release_if_under_pressure(), 0);
        assert_eq!(cache.len(), 2);

        probe.set(95.0);
        assert_eq!(cache.release_if_under_pressure(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().removes, 2);
        assert_eq!(cache.stats().max_size, None);
    }

    #[test]
    fn test_pressure_check_runs_periodically() {
        let scheduler = FlushScheduler::new(1).unwrap();
        let probe = Arc::new(StaticMemoryProbe::new(99.0));
        let config = PressureCacheConfig {
            check_interval: Duration::from_millis(10),
            ..PressureCacheConfig::default()
        };
        let cache = PressureCache::new(config, probe, &scheduler);

        cache.put("a", ring());
        assert!(wait_for(|| cache.is_empty()));
    }

    #[test]
    fn test_system_probe_reports_a_percentage() {
        let probe = SystemMemoryProbe::new(None);
        let utilisation = probe.utilisation_percent();
        assert!(utilisation >= 0.0);
        assert!(utilisation.is_finite());
    }
}
