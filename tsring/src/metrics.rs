//! Observability hooks exposed to a metrics collaborator.
//!
//! Components publish counts through the [`Counter`] and [`Gauge`] traits.
//! Everything defaults to the null implementations, so nothing is recorded
//! until a caller wires real sinks in. [`AtomicCounter`] and [`AtomicGauge`]
//! are simple in-process sinks, handy for tests and the CLI.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing or directly settable count.
pub trait Counter: Send + Sync + Debug {
    /// Adds one to the count.
    fn increment(&self) {
        self.add(1);
    }

    /// Adds `delta` to the count.
    fn add(&self, delta: u64);

    /// Overwrites the count.
    fn set(&self, value: u64);
}

/// A sampled floating-point value.
pub trait Gauge: Send + Sync + Debug {
    /// Records a new value.
    fn record(&self, value: f64);
}

/// Counter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCounter;

impl Counter for NullCounter {
    fn add(&self, _delta: u64) {}

    fn set(&self, _value: u64) {}
}

/// Gauge that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGauge;

impl Gauge for NullGauge {
    fn record(&self, _value: f64) {}
}

/// In-process counter backed by an atomic.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Returns the current count.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Counter for AtomicCounter {
    fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// In-process gauge holding the last recorded value.
#[derive(Debug, Default)]
pub struct AtomicGauge(AtomicU64);

impl AtomicGauge {
    /// Returns the last recorded value (0.0 if nothing was recorded).
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl Gauge for AtomicGauge {
    fn record(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Sinks published by the series caches.
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    /// Number of cache lookups.
    pub requests: Arc<dyn Counter>,
    /// Number of entries evicted by policy.
    pub removes: Arc<dyn Counter>,
    /// Current maximum number of entries.
    pub max_size: Arc<dyn Counter>,
    /// Current number of cached series.
    pub series_count: Arc<dyn Counter>,
    /// Hit percentage over the last maintenance period.
    pub hit_percentage: Arc<dyn Gauge>,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self {
            requests: Arc::new(NullCounter),
            removes: Arc::new(NullCounter),
            max_size: Arc::new(NullCounter),
            series_count: Arc::new(NullCounter),
            hit_percentage: Arc::new(NullGauge),
        }
    }
}

/// Sinks published by [`FileGateway`](crate::file::FileGateway).
#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    /// Number of header reads.
    pub header_reads: Arc<dyn Counter>,
    /// Number of whole-series rewrites.
    pub rewrites: Arc<dyn Counter>,
    /// Number of incremental appends.
    pub appends: Arc<dyn Counter>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self {
            header_reads: Arc::new(NullCounter),
            rewrites: Arc::new(NullCounter),
            appends: Arc::new(NullCounter),
        }
    }
}

/// All sinks of a [`Store`](crate::store::Store), handed to
/// [`Store::open_with_metrics`](crate::store::Store::open_with_metrics).
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
    /// Sinks for the series cache.
    pub cache: CacheMetrics,
    /// Sinks for the file gateway.
    pub gateway: GatewayMetrics,
}
