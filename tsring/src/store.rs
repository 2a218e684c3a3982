//! Store module for the tsring time-series storage engine.
//!
//! A [`Store`] owns a directory of series files and the collaborators shared
//! by their handles: the flush scheduler, the series cache and the event
//! dispatcher.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── server.cpu.tsr          <- One file per series
//! ├── server.memory.tsr
//! └── ...
//! ```
//!
//! Series files are discovered when the store opens. New series are created
//! on first use with [`Store::series`].
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use tsring::config::StoreConfig;
//! use tsring::item::Item;
//! use tsring::store::Store;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::open("./data", StoreConfig::default())?;
//!
//! let cpu = store.series("server.cpu", "CPU usage percent", Some(1440))?;
//! cpu.append(Item::new(1_640_000_000_000, 85.5))?;
//!
//! // Appends are written behind; force them out now
//! store.flush_all()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::CacheStats;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError, TsringError};
use crate::file::{FILE_EXTENSION, FileGateway, file_name_for};
use crate::metrics::StoreMetrics;
use crate::series::{SeriesContext, SeriesHandle};

/// Top-level handle on a directory of series.
///
/// # Thread Safety
///
/// The store and its series handles are `Send + Sync`. Series operations
/// lock per series, so independent series never contend.
///
/// Dropping the store flushes every series with pending changes.
#[derive(Debug)]
pub struct Store {
    /// Path to the store directory.
    path: PathBuf,
    /// Configuration the store was opened with.
    config: StoreConfig,
    /// Collaborators handed to every series.
    ctx: SeriesContext,
    /// Open series by id.
    series: RwLock<BTreeMap<String, Arc<SeriesHandle>>>,
}

impl Store {
    /// Opens the store at `path`, creating the directory if needed.
    ///
    /// Existing series files are discovered and registered without loading
    /// their data. A file that cannot be read, or whose name does not match
    /// the series id stored in it (e.g. a renamed file), is logged and skipped.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory path for the store
    /// * `config` - Flush, cache and worker settings
    ///
    /// # Errors
    ///
    /// - [`ConfigError`](crate::error::ConfigError) if `config` is invalid
    /// - [`StoreError::DirectoryAccess`] if the directory cannot be created or listed
    /// - [`StoreError::WorkerSpawn`] if a background thread cannot start
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        Self::open_with_metrics(path, config, StoreMetrics::default())
    }

    /// Opens the store like [`Store::open`], publishing cache and file
    /// counters to `metrics`.
    ///
    /// # Errors
    ///
    /// See [`Store::open`].
    pub fn open_with_metrics<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        metrics: StoreMetrics,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        config.validate()?;

        fs::create_dir_all(&path).map_err(|e| StoreError::DirectoryAccess {
            path: path.clone(),
            source: e,
        })?;

        let gateway = Arc::new(FileGateway::new(&path).with_metrics(metrics.gateway));
        let ctx = SeriesContext::with_cache_metrics(&config, gateway.clone(), metrics.cache)?;

        let mut series = BTreeMap::new();
        let entries = fs::read_dir(&path).map_err(|e| StoreError::DirectoryAccess {
            path: path.clone(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::DirectoryAccess {
                path: path.clone(),
                source: e,
            })?;
            let file_path = entry.path();
            if file_path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }

            match gateway.read_header_at(&file_path) {
                Ok(header) if file_path.file_name() != Some(OsStr::new(&file_name_for(header.id()))) => {
                    // The gateway addresses series by id, so this file would be unreachable
                    warn!(
                        path = %file_path.display(),
                        series = header.id(),
                        expected = %file_name_for(header.id()),
                        "skipping series file whose name does not match its id"
                    );
                }
                Ok(header) => {
                    debug!(series = header.id(), path = %file_path.display(), "discovered series");
                    let handle = SeriesHandle::from_header(ctx.clone(), header);
                    series.insert(handle.id().to_string(), handle);
                }
                Err(e) => {
                    warn!(path = %file_path.display(), error = %e, "skipping unreadable series file");
                }
            }
        }

        info!(path = %path.display(), series = series.len(), "opened store");
        Ok(Self {
            path,
            config,
            ctx,
            series: RwLock::new(series),
        })
    }

    /// Returns the series `id`, creating it if it does not exist.
    ///
    /// `description` and `max_length` only apply to a new series;
    /// `max_length` defaults to the configured `default_series_length`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidSeriesId`] if `id` is empty, contains control
    ///   characters, or maps to the same file as another series
    /// - [`TsringError::Persistence`] if the series file cannot be created
    pub fn series(
        &self,
        id: &str,
        description: &str,
        max_length: Option<usize>,
    ) -> Result<Arc<SeriesHandle>> {
        if let Some(handle) = self.series.read().get(id) {
            return Ok(Arc::clone(handle));
        }

        let mut series = self.series.write();
        if let Some(handle) = series.get(id) {
            return Ok(Arc::clone(handle));
        }

        validate_id(id)?;
        let file_name = file_name_for(id);
        if let Some(existing) = series.keys().find(|existing| file_name_for(existing) == file_name) {
            return Err(StoreError::InvalidSeriesId {
                id: id.to_string(),
                reason: format!("file name '{file_name}' is already used by series '{existing}'"),
            }
            .into());
        }

        let max_length = max_length.unwrap_or(self.config.default_series_length);
        if max_length == 0 {
            return Err(crate::error::ConfigError::InvalidSeriesLength.into());
        }

        let handle = SeriesHandle::open(self.ctx.clone(), id, description, max_length)?;
        debug!(series = id, max_length, "created series");
        series.insert(id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Returns an open series.
    pub fn get(&self, id: &str) -> Option<Arc<SeriesHandle>> {
        self.series.read().get(id).cloned()
    }

    /// Returns the ids of all series, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.series.read().keys().cloned().collect()
    }

    /// Returns the number of series.
    pub fn len(&self) -> usize {
        self.series.read().len()
    }

    /// Returns whether the store has no series.
    pub fn is_empty(&self) -> bool {
        self.series.read().is_empty()
    }

    /// Flushes every series with pending changes.
    ///
    /// All series are attempted even if some fail. Returns how many series
    /// were written.
    ///
    /// # Errors
    ///
    /// Returns the first flush error encountered.
    pub fn flush_all(&self) -> Result<usize> {
        let handles: Vec<_> = self.series.read().values().cloned().collect();

        let mut flushed = 0;
        let mut first_error: Option<TsringError> = None;
        for handle in handles {
            if !handle.is_flush_required() {
                continue;
            }
            match handle.flush() {
                Ok(()) => flushed += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    /// Returns the series cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.cache.stats()
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the path to the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes everything and closes the store.
    ///
    /// # Errors
    ///
    /// Returns the first flush error, see [`Store::flush_all`].
    pub fn close(self) -> Result<()> {
        self.flush_all().map(|_| ())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!(path = %self.path.display(), error = %e, "failed to flush store on close");
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        "id must not be empty"
    } else if id.chars().any(char::is_control) {
        "id must not contain control characters"
    } else {
        return Ok(());
    };

    Err(StoreError::InvalidSeriesId {
        id: id.to_string(),
        reason: reason.to_string(),
    }
    .into())
}
