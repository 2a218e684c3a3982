//! Filesystem-backed series handles.
//!
//! A [`SeriesHandle`] is the public face of one series. It combines the
//! persisted header, the write-behind buffer, the shared series cache and the
//! flush scheduler behind a single read-write lock.
//!
//! # Appends vs. everything else
//!
//! The dominant workload is in-order appends, so they never load the series:
//! an item at or after the latest timestamp goes into the write-behind buffer,
//! and into the cached ring buffer only if it happens to be resident. Reads,
//! removals and out-of-order appends load the whole series first. A load reads
//! the file, replays the buffered appends that are not on disk yet and caches
//! the result.
//!
//! # Flushing
//!
//! Buffered appends are flushed within `append_period`, whole-series rewrites
//! within `rewrite_period`. A failed scheduled flush is logged, keeps its
//! buffered changes and retries after `append_period`, indefinitely.
//!
//! # Identity
//!
//! Handles compare by identity and hash by id; structural equality would mean
//! loading both series.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::cache::{AdaptiveLruCache, PressureCache, SeriesCache, SystemMemoryProbe};
use crate::config::{CacheConfig, StoreConfig};
use crate::error::{DeserializationError, Result};
use crate::events::{EventDispatcher, EventKind, ListenerId, ListenerSet, SeriesEvent, SeriesListener};
use crate::gateway::PersistenceGateway;
use crate::header::SeriesHeader;
use crate::item::Item;
use crate::metrics::CacheMetrics;
use crate::ring::{RingBuffer, SharedRing};
use crate::scheduler::{FlushScheduler, FlushSlot};
use crate::write_behind::{PendingWrite, WriteBehindBuffer};

/// Collaborators shared by every series of a store.
#[derive(Debug, Clone)]
pub struct SeriesContext {
    /// Runs deferred flushes and cache maintenance.
    pub scheduler: Arc<FlushScheduler>,
    /// Holds loaded series.
    pub cache: Arc<dyn SeriesCache>,
    /// Reads and writes series files.
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Delivers change events to listeners.
    pub events: Arc<EventDispatcher>,
    /// Maximum delay before buffered appends are flushed.
    pub append_period: Duration,
    /// Maximum delay before a pending rewrite is flushed.
    pub rewrite_period: Duration,
}

impl SeriesContext {
    /// Builds the scheduler, cache and event dispatcher described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or a worker thread cannot start.
    pub fn new(config: &StoreConfig, gateway: Arc<dyn PersistenceGateway>) -> Result<Self> {
        Self::with_cache_metrics(config, gateway, CacheMetrics::default())
    }

    /// Like [`SeriesContext::new`], with the cache publishing to `metrics`.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or a worker thread cannot start.
    pub fn with_cache_metrics(
        config: &StoreConfig,
        gateway: Arc<dyn PersistenceGateway>,
        metrics: CacheMetrics,
    ) -> Result<Self> {
        config.validate()?;

        let scheduler = Arc::new(FlushScheduler::new(config.flush_workers)?);
        let cache: Arc<dyn SeriesCache> = match &config.cache {
            CacheConfig::Lru(lru) => AdaptiveLruCache::with_metrics(
                lru.clone(),
                Arc::new(SystemMemoryProbe::new(lru.memory_budget_bytes)),
                Arc::clone(&scheduler),
                metrics,
            ),
            CacheConfig::Pressure(pressure) => PressureCache::with_metrics(
                pressure.clone(),
                Arc::new(SystemMemoryProbe::new(pressure.memory_budget_bytes)),
                &scheduler,
                metrics,
            ),
        };

        Ok(Self {
            scheduler,
            cache,
            gateway,
            events: Arc::new(EventDispatcher::new()?),
            append_period: config.append_period,
            rewrite_period: config.rewrite_period,
        })
    }
}

/// State guarded by the series lock.
#[derive(Debug)]
struct SeriesState {
    header: SeriesHeader,
    write_behind: WriteBehindBuffer,
    last_timestamp: Option<i64>,
    last_item: Option<Item>,
    flush_slot: FlushSlot,
}

/// Handle to one filesystem-backed series.
pub struct SeriesHandle {
    id: String,
    state: RwLock<SeriesState>,
    ctx: SeriesContext,
    listeners: Arc<ListenerSet>,
    mod_count: AtomicU64,
    self_ref: Weak<SeriesHandle>,
}

impl fmt::Debug for SeriesHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesHandle")
            .field("id", &self.id)
            .field("mod_count", &self.mod_count())
            .finish_non_exhaustive()
    }
}

impl PartialEq for SeriesHandle {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl Eq for SeriesHandle {}

impl Hash for SeriesHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl SeriesHandle {
    /// Opens series `id`, creating its file if it does not exist yet.
    ///
    /// For an existing file, the persisted header wins over `description`
    /// and `max_length`.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Shared store collaborators
    /// * `id` - Series id
    /// * `description` - Description for a new series
    /// * `max_length` - Capacity for a new series
    ///
    /// # Errors
    ///
    /// Returns [`TsringError::Persistence`](crate::error::TsringError::Persistence)
    /// if the header cannot be read or the file cannot be created.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use tsring::config::StoreConfig;
    /// use tsring::file::FileGateway;
    /// use tsring::item::Item;
    /// use tsring::series::{SeriesContext, SeriesHandle};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// # let dir = tempfile::tempdir()?;
    /// let gateway = Arc::new(FileGateway::new(dir.path()));
    /// let ctx = SeriesContext::new(&StoreConfig::default(), gateway)?;
    ///
    /// let series = SeriesHandle::open(ctx, "server.cpu", "CPU usage", 3)?;
    /// for (ts, value) in [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0)] {
    ///     series.append(Item::new(ts, value))?;
    /// }
    /// assert_eq!(series.snapshot()?.len(), 3);
    /// series.flush()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(
        ctx: SeriesContext,
        id: impl Into<String>,
        description: impl Into<String>,
        max_length: usize,
    ) -> Result<Arc<Self>> {
        let mut header = SeriesHeader::new(id, description, max_length);
        if ctx.gateway.exists(&header) {
            ctx.gateway.read_header(&mut header)?;
        } else {
            ctx.gateway.create_file(&mut header)?;
        }
        Ok(Self::from_header(ctx, header))
    }

    /// Wraps a header already synchronized with its file.
    pub fn from_header(ctx: SeriesContext, header: SeriesHeader) -> Arc<Self> {
        let id = header.id().to_string();
        let state = SeriesState {
            write_behind: WriteBehindBuffer::new(header.max_length()),
            last_timestamp: header.most_recent_timestamp(),
            last_item: None,
            flush_slot: FlushSlot::new(),
            header,
        };

        Arc::new_cyclic(|weak| Self {
            id,
            state: RwLock::new(state),
            ctx,
            listeners: Arc::new(ListenerSet::default()),
            mod_count: AtomicU64::new(0),
            self_ref: weak.clone(),
        })
    }

    /// Returns the series id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the series description.
    pub fn description(&self) -> String {
        self.state.read().header.description().to_string()
    }

    /// Returns the series capacity.
    pub fn max_length(&self) -> usize {
        self.state.read().header.max_length()
    }

    /// Returns a copy of the in-memory header.
    pub fn header(&self) -> SeriesHeader {
        self.state.read().header.clone()
    }

    /// Appends an item.
    ///
    /// Items at or after the latest timestamp are buffered without loading
    /// the series and cannot fail. Earlier items load the series, are inserted
    /// at their sorted position and mark the series for a whole-file rewrite.
    ///
    /// # Errors
    ///
    /// Returns [`TsringError::Deserialization`](crate::error::TsringError::Deserialization)
    /// if an out-of-order item requires a load that fails.
    pub fn append(&self, item: Item) -> Result<()> {
        let mut state = self.state.write();
        self.append_locked(&mut state, item)
    }

    /// Appends several items under one lock acquisition.
    ///
    /// # Errors
    ///
    /// Stops at the first item whose append fails, see [`SeriesHandle::append`].
    pub fn append_all<I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = Item>,
    {
        let mut state = self.state.write();
        for item in items {
            self.append_locked(&mut state, item)?;
        }
        Ok(())
    }

    /// Returns every item, earliest first.
    ///
    /// # Errors
    ///
    /// Returns [`TsringError::Deserialization`](crate::error::TsringError::Deserialization)
    /// if the series must be loaded and the load fails. The same applies to
    /// every read below.
    pub fn snapshot(&self) -> Result<Vec<Item>> {
        self.read_ring(RingBuffer::snapshot)
    }

    /// Iterates over a snapshot of the items, earliest first.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn iter(&self) -> Result<std::vec::IntoIter<Item>> {
        Ok(self.snapshot()?.into_iter())
    }

    /// Returns the item at `index`, index 0 being the earliest.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn get(&self, index: usize) -> Result<Option<Item>> {
        self.read_ring(|ring| ring.get(index))
    }

    /// Returns the items with `start <= timestamp <= end`.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn range(&self, start: i64, end: i64) -> Result<Vec<Item>> {
        self.read_ring(|ring| ring.range(start, end))
    }

    /// Returns the latest item at or before `timestamp`.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn at_or_before(&self, timestamp: i64) -> Result<Option<Item>> {
        self.read_ring(|ring| ring.at_or_before(timestamp))
    }

    /// Returns the earliest item at or after `timestamp`.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn at_or_after(&self, timestamp: i64) -> Result<Option<Item>> {
        self.read_ring(|ring| ring.at_or_after(timestamp))
    }

    /// Returns the earliest item.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn earliest(&self) -> Result<Option<Item>> {
        self.read_ring(RingBuffer::earliest)
    }

    /// Returns the latest item, loading the series only if nothing was
    /// appended through this handle yet.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn latest(&self) -> Result<Option<Item>> {
        let state = self.state.read();
        if let Some(item) = state.last_item {
            return Ok(Some(item));
        }
        let ring = self.load(&state)?;
        let latest = ring.read().latest();
        Ok(latest)
    }

    /// Returns the latest timestamp without loading the series.
    pub fn latest_timestamp(&self) -> Option<i64> {
        self.state.read().last_timestamp
    }

    /// Returns the number of items.
    ///
    /// Exact while the series is loaded. Otherwise this is the approximation
    /// `min(max_length, persisted + buffered appends)`, which can overcount
    /// when the buffered appends overlap the persisted items once flushed.
    pub fn size(&self) -> usize {
        let state = self.state.read();
        match self.resident(&state) {
            Some(ring) => ring.read().len(),
            None => (state.header.current_size() + state.write_behind.append_count())
                .min(state.header.max_length()),
        }
    }

    /// Removes every item and marks the series for rewrite.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        let ring = self.load(&state)?;
        ring.write().clear();
        state.last_timestamp = None;
        state.last_item = None;
        self.mark_for_rewrite(&mut state, ring);
        self.publish(EventKind::SeriesChanged, Vec::new());
        Ok(())
    }

    /// Removes one occurrence of `item`. Returns whether it was found.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn remove(&self, item: &Item) -> Result<bool> {
        Ok(!self.remove_all(std::slice::from_ref(item))?.is_empty())
    }

    /// Removes one occurrence of each of `items`, returning those found.
    ///
    /// # Errors
    ///
    /// See [`SeriesHandle::snapshot`].
    pub fn remove_all(&self, items: &[Item]) -> Result<Vec<Item>> {
        let mut state = self.state.write();
        let ring = self.load(&state)?;
        let removed = {
            let mut guard = ring.write();
            let removed = guard.remove_all(items);
            if !removed.is_empty() {
                state.last_item = guard.latest();
                state.last_timestamp = state.last_item.map(|item| item.timestamp);
            }
            removed
        };

        if !removed.is_empty() {
            self.mark_for_rewrite(&mut state, ring);
            self.publish(EventKind::ItemsRemoved, removed.clone());
        }
        Ok(removed)
    }

    /// Writes pending changes now.
    ///
    /// A no-op when nothing is pending. On failure the changes stay buffered
    /// and a retry is scheduled after `append_period`.
    ///
    /// # Errors
    ///
    /// Returns [`TsringError::Persistence`](crate::error::TsringError::Persistence)
    /// if the write fails.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        self.flush_locked(&mut state)
    }

    /// Returns whether there are unpersisted changes.
    pub fn is_flush_required(&self) -> bool {
        let state = self.state.read();
        state.write_behind.is_flush_required(&state.header)
    }

    /// Returns whether a whole-file rewrite is pending.
    pub fn is_rewrite_pending(&self) -> bool {
        self.state.read().write_behind.is_rewrite_pending()
    }

    /// Returns the number of appends buffered since the last flush.
    pub fn pending_append_count(&self) -> usize {
        self.state.read().write_behind.append_count()
    }

    /// Returns the time until the next scheduled flush, if one is scheduled.
    pub fn next_flush_in(&self) -> Option<Duration> {
        self.state.read().flush_slot.remaining()
    }

    /// Schedules a flush within `append_period` without changing any data.
    ///
    /// Only the header is written unless other changes are pending.
    pub fn queue_header_rewrite(&self) {
        let mut state = self.state.write();
        self.request_flush(&mut state, self.ctx.append_period);
    }

    /// Returns a property value.
    pub fn property(&self, key: &str) -> Option<String> {
        self.state.read().header.property(key).map(str::to_string)
    }

    /// Returns all properties.
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.state.read().header.properties().clone()
    }

    /// Sets a property, returning the previous value. Persisted with the
    /// next flush.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let mut state = self.state.write();
        let previous = state.header.set_property(key, value);
        self.request_flush(&mut state, self.ctx.append_period);
        previous
    }

    /// Removes a property, returning its value.
    pub fn remove_property(&self, key: &str) -> Option<String> {
        let mut state = self.state.write();
        let removed = state.header.remove_property(key);
        if removed.is_some() {
            self.request_flush(&mut state, self.ctx.append_period);
        }
        removed
    }

    /// Registers a change listener.
    pub fn add_listener<L>(&self, listener: L) -> ListenerId
    where
        L: SeriesListener + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    /// Unregisters a change listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Returns the number of change events published so far.
    pub fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    /// Testing hook: drops the series from the cache.
    pub fn trigger_eviction(&self) {
        let _state = self.state.write();
        self.ctx.cache.remove(&self.id);
    }

    /// Testing hook: returns whether the series is absent from the cache.
    pub fn is_evicted(&self) -> bool {
        let _state = self.state.read();
        self.ctx.cache.get(&self.id).is_none()
    }

    fn append_locked(&self, state: &mut SeriesState, item: Item) -> Result<()> {
        let in_order = state
            .last_timestamp
            .is_none_or(|last| item.timestamp >= last);

        if in_order {
            if state.write_behind.add_for_append(item) {
                self.request_flush(state, self.ctx.append_period);
            }
            if let Some(ring) = self.resident(state) {
                ring.write().add(item);
            }
            state.last_timestamp = Some(item.timestamp);
            state.last_item = Some(item);
        } else {
            debug!(series = %self.id, timestamp = item.timestamp, "out-of-order append, loading series");
            let ring = self.load(state)?;
            let discarded = ring.write().add(item);
            if discarded == Some(item) {
                debug!(series = %self.id, timestamp = item.timestamp, "item older than a full series, dropped");
                return Ok(());
            }
            self.mark_for_rewrite(state, ring);
        }

        self.publish(EventKind::ItemsAdded, vec![item]);
        Ok(())
    }

    fn read_ring<T>(&self, read: impl FnOnce(&RingBuffer) -> T) -> Result<T> {
        let state = self.state.read();
        let ring = self.load(&state)?;
        let guard = ring.read();
        Ok(read(&guard))
    }

    /// Returns the in-memory series if it is loaded, without loading it.
    fn resident(&self, state: &SeriesState) -> Option<SharedRing> {
        state
            .write_behind
            .rewrite_series()
            .cloned()
            .or_else(|| self.ctx.cache.get(&self.id))
    }

    fn load(&self, state: &SeriesState) -> Result<SharedRing> {
        if let Some(ring) = self.resident(state) {
            return Ok(ring);
        }

        let mut ring = self
            .ctx
            .gateway
            .read_series(&state.header)
            .map_err(|source| DeserializationError {
                series: self.id.clone(),
                source,
            })?;

        // Buffered appends are not on disk yet; their events already fired
        let buffered = state.write_behind.append_items();
        for item in &buffered {
            ring.add(*item);
        }
        debug!(
            series = %self.id,
            items = ring.len(),
            replayed = buffered.len(),
            "loaded series into cache"
        );

        let shared = ring.into_shared();
        self.ctx.cache.put(&self.id, Arc::clone(&shared));
        Ok(shared)
    }

    fn mark_for_rewrite(&self, state: &mut SeriesState, ring: SharedRing) {
        state.write_behind.cache_for_rewrite(ring);
        self.request_flush(state, self.ctx.rewrite_period);
    }

    fn request_flush(&self, state: &mut SeriesState, delay: Duration) {
        let weak = self.self_ref.clone();
        state.flush_slot.request(&self.ctx.scheduler, delay, move || {
            if let Some(series) = weak.upgrade() {
                // Failures are logged and rescheduled inside flush
                let _ = series.flush();
            }
        });
    }

    fn flush_locked(&self, state: &mut SeriesState) -> Result<()> {
        let pending = state.write_behind.pending(&state.header);
        let gateway = &self.ctx.gateway;
        let result = match &pending {
            PendingWrite::Clean => return Ok(()),
            PendingWrite::HeaderOnly => gateway.append_to_series(&mut state.header, &[]),
            PendingWrite::Append(items) => gateway.append_to_series(&mut state.header, items),
            PendingWrite::Rewrite(ring) => {
                let ring = ring.read();
                gateway.write_series(&mut state.header, &ring)
            }
        };

        match result {
            Ok(()) => {
                state.write_behind.clear();
                debug!(
                    series = %self.id,
                    size = state.header.current_size(),
                    rewrite = matches!(pending, PendingWrite::Rewrite(_)),
                    "flushed series"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    series = %self.id,
                    error = %e,
                    retry_in = ?self.ctx.append_period,
                    "failed to flush series, keeping changes for retry"
                );
                self.request_flush(state, self.ctx.append_period);
                Err(e.into())
            }
        }
    }

    fn publish(&self, kind: EventKind, items: Vec<Item>) {
        let mod_count = self.mod_count.fetch_add(1, Ordering::AcqRel) + 1;
        if self.listeners.is_empty() {
            return;
        }
        self.ctx.events.dispatch(
            &self.listeners,
            SeriesEvent {
                series_id: self.id.clone(),
                kind,
                items,
                mod_count,
            },
        );
    }
}

impl Drop for SeriesHandle {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if state.write_behind.is_flush_required(&state.header)
            && let Err(e) = self.flush_locked(&mut state)
        {
            warn!(series = %self.id, error = %e, "dropping series with unflushed changes");
        }
        state.flush_slot.cancel();
    }
}
