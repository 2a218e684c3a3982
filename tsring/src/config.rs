//! Configuration types for a tsring store.
//!
//! A [`StoreConfig`] fixes the flush cadence, the default series length, the
//! size of the flush worker pool and the series cache policy. All types
//! deserialize from JSON, with durations written as seconds, and every field
//! has a default so a config file only needs to name what it changes.
//!
//! ```json
//! {
//!   "append_period": 30,
//!   "rewrite_period": 5,
//!   "cache": { "policy": "lru", "initial_size": 512 }
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Top-level store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum delay before buffered appends are flushed.
    #[serde(with = "duration_serde")]
    pub append_period: Duration,

    /// Maximum delay before a series marked for whole-file rewrite is flushed.
    ///
    /// Normally shorter than `append_period`, since a rewrite pins the whole
    /// series in memory until it is written.
    #[serde(with = "duration_serde")]
    pub rewrite_period: Duration,

    /// Capacity used for new series when the caller does not give one.
    pub default_series_length: usize,

    /// Number of threads running flushes and cache maintenance.
    pub flush_workers: usize,

    /// Series cache policy.
    pub cache: CacheConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            append_period: Duration::from_secs(30),
            rewrite_period: Duration::from_secs(5),
            default_series_length: 10_000,
            flush_workers: 1,
            cache: CacheConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be loaded, or any validation error from [`StoreConfig::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a period is zero, the default series length
    /// or worker count is zero, or the cache settings are out of range.
    pub fn validate(&self) -> Result<()> {
        check_period("append_period", self.append_period)?;
        check_period("rewrite_period", self.rewrite_period)?;

        if self.default_series_length == 0 {
            return Err(ConfigError::InvalidSeriesLength.into());
        }
        if self.flush_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount.into());
        }

        match &self.cache {
            CacheConfig::Lru(lru) => lru.validate(),
            CacheConfig::Pressure(pressure) => pressure.validate(),
        }
    }
}

/// Series cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum CacheConfig {
    /// Bounded LRU cache whose size follows memory utilisation.
    Lru(LruCacheConfig),
    /// Unbounded cache emptied whenever memory utilisation crosses a threshold.
    Pressure(PressureCacheConfig),
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::Lru(LruCacheConfig::default())
    }
}

/// Tuning for [`AdaptiveLruCache`](crate::cache::AdaptiveLruCache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LruCacheConfig {
    /// Starting number of cached series.
    pub initial_size: usize,

    /// Percentage by which the size grows or shrinks on each adjustment.
    pub increase_decrease_percent: u32,

    /// Growth is allowed only while memory utilisation is below this percentage.
    pub expansion_threshold_percent: f64,

    /// The cache shrinks when memory utilisation is above this percentage.
    pub shrink_threshold_percent: f64,

    /// Minimum time between two growth checks.
    #[serde(with = "duration_serde")]
    pub min_expansion_interval: Duration,

    /// Interval of the shrink check and hit-rate sampling.
    #[serde(with = "duration_serde")]
    pub maintenance_period: Duration,

    /// Upper bound the size never grows past, whatever the utilisation.
    ///
    /// Utilisation only measures this process against the memory budget, so
    /// without a budget on a large host the cache could keep growing long
    /// after it stops paying off. `None` removes the bound.
    pub size_limit: Option<usize>,

    /// Memory budget in bytes; total system memory when unset.
    ///
    /// Growth is gated on this process' resident memory relative to the
    /// budget. Set it on hosts where total memory is far larger than what
    /// the store should use.
    pub memory_budget_bytes: Option<u64>,
}

impl Default for LruCacheConfig {
    fn default() -> Self {
        Self {
            initial_size: 256,
            increase_decrease_percent: 20,
            expansion_threshold_percent: 60.0,
            shrink_threshold_percent: 90.0,
            min_expansion_interval: Duration::from_secs(1),
            maintenance_period: Duration::from_secs(60),
            size_limit: Some(16_384),
            memory_budget_bytes: None,
        }
    }
}

impl LruCacheConfig {
    /// Validates the LRU tuning.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCache`] for a zero initial size or an
    /// out-of-range percentage, [`ConfigError::InvalidPeriod`] for a zero
    /// maintenance period.
    pub fn validate(&self) -> Result<()> {
        if self.initial_size == 0 {
            return Err(invalid_cache("initial_size must be greater than zero"));
        }
        if self.increase_decrease_percent == 0 || self.increase_decrease_percent > 100 {
            return Err(invalid_cache(format!(
                "increase_decrease_percent must be in (0, 100], got {}",
                self.increase_decrease_percent
            )));
        }
        if let Some(limit) = self.size_limit
            && limit < self.initial_size
        {
            return Err(invalid_cache(format!(
                "size_limit ({limit}) must not be below initial_size ({})",
                self.initial_size
            )));
        }
        check_percent("expansion_threshold_percent", self.expansion_threshold_percent)?;
        check_percent("shrink_threshold_percent", self.shrink_threshold_percent)?;
        check_period("maintenance_period", self.maintenance_period)?;
        Ok(())
    }
}

/// Tuning for [`PressureCache`](crate::cache::PressureCache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureCacheConfig {
    /// Every cached series is released when utilisation exceeds this percentage.
    pub pressure_threshold_percent: f64,

    /// Interval between memory checks.
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,

    /// Memory budget in bytes; total system memory when unset.
    pub memory_budget_bytes: Option<u64>,
}

impl Default for PressureCacheConfig {
    fn default() -> Self {
        Self {
            pressure_threshold_percent: 90.0,
            check_interval: Duration::from_secs(5),
            memory_budget_bytes: None,
        }
    }
}

impl PressureCacheConfig {
    /// Validates the pressure tuning.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an out-of-range threshold or a zero interval.
    pub fn validate(&self) -> Result<()> {
        check_percent("pressure_threshold_percent", self.pressure_threshold_percent)?;
        check_period("check_interval", self.check_interval)?;
        Ok(())
    }
}

fn check_period(name: &'static str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(ConfigError::InvalidPeriod { name, value }.into());
    }
    Ok(())
}

fn check_percent(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 100.0) {
        return Err(invalid_cache(format!("{name} must be in (0, 100], got {value}")));
    }
    Ok(())
}

fn invalid_cache(reason: impl Into<String>) -> crate::error::TsringError {
    ConfigError::InvalidCache {
        reason: reason.into(),
    }
    .into()
}

/// Serde support for Duration fields.
///
/// Durations are written as total seconds (f64) so config files stay readable.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}
