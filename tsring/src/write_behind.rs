//! Staging area for changes not yet persisted.
//!
//! A [`WriteBehindBuffer`] is in one of two modes:
//!
//! - **append**: a bounded ring of items appended since the last flush, which
//!   the next flush hands to `append_to_series`.
//! - **rewrite**: a reference to the whole in-memory series after a non-append
//!   mutation, which the next flush hands to `write_series`.
//!
//! Rewrite mode supersedes append mode: switching clears the pending appends
//! because the whole-series write includes them. The buffer has no lock of its
//! own and lives inside the owning series' guarded state, so every transition
//! happens under that series' write lock.

use crate::header::SeriesHeader;
use crate::item::Item;
use crate::ring::{RingBuffer, SharedRing};

/// What the next flush has to write.
#[derive(Debug, Clone)]
pub enum PendingWrite {
    /// Nothing to persist.
    Clean,
    /// Only the header properties changed.
    HeaderOnly,
    /// Items to append to the existing file.
    Append(Vec<Item>),
    /// The whole series must be rewritten.
    Rewrite(SharedRing),
}

/// Per-series record of unpersisted changes.
#[derive(Debug)]
pub struct WriteBehindBuffer {
    rewrite: Option<SharedRing>,
    appends: RingBuffer,
}

impl WriteBehindBuffer {
    /// Creates an empty buffer for a series of capacity `max_length`.
    pub fn new(max_length: usize) -> Self {
        Self {
            rewrite: None,
            appends: RingBuffer::new(max_length),
        }
    }

    /// Switches to rewrite mode, holding `ring` until the next flush.
    ///
    /// Pending appends are dropped; they are already part of `ring`.
    pub fn cache_for_rewrite(&mut self, ring: SharedRing) {
        self.appends.clear();
        self.rewrite = Some(ring);
    }

    /// Buffers an appended item.
    ///
    /// Returns `false` without buffering when a rewrite is pending, since the
    /// rewrite already covers the item.
    pub fn add_for_append(&mut self, item: Item) -> bool {
        if self.rewrite.is_some() {
            return false;
        }
        self.appends.add(item);
        true
    }

    /// Returns whether a whole-series rewrite is pending.
    pub fn is_rewrite_pending(&self) -> bool {
        self.rewrite.is_some()
    }

    /// Returns the series held for rewrite.
    pub fn rewrite_series(&self) -> Option<&SharedRing> {
        self.rewrite.as_ref()
    }

    /// Returns the buffered appends, earliest first.
    pub fn append_items(&self) -> Vec<Item> {
        self.appends.snapshot()
    }

    /// Returns the number of buffered appends.
    pub fn append_count(&self) -> usize {
        self.appends.len()
    }

    /// Returns whether the next flush has anything to write.
    pub fn is_flush_required(&self, header: &SeriesHeader) -> bool {
        self.rewrite.is_some() || !self.appends.is_empty() || header.is_properties_rewrite_required()
    }

    /// Returns what the next flush has to write.
    pub fn pending(&self, header: &SeriesHeader) -> PendingWrite {
        if let Some(ring) = &self.rewrite {
            PendingWrite::Rewrite(ring.clone())
        } else if !self.appends.is_empty() {
            PendingWrite::Append(self.appends.snapshot())
        } else if header.is_properties_rewrite_required() {
            PendingWrite::HeaderOnly
        } else {
            PendingWrite::Clean
        }
    }

    /// Forgets everything buffered, after a successful flush.
    pub fn clear(&mut self) {
        self.rewrite = None;
        self.appends.clear();
    }
}
