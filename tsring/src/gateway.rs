//! Durable storage contract for series data.
//!
//! A [`PersistenceGateway`] owns the byte layout of series files. The rest of
//! the crate only relies on the contract below: a failed call may leave the
//! file in any state, but never touches the caller's pending in-memory data,
//! so the caller can simply retry.

use std::fmt::Debug;

use crate::error::PersistenceError;
use crate::header::SeriesHeader;
use crate::item::Item;
use crate::ring::RingBuffer;

/// Durable read/write access to series files.
pub trait PersistenceGateway: Send + Sync + Debug {
    /// Returns whether a file exists for the series.
    fn exists(&self, header: &SeriesHeader) -> bool;

    /// Initializes a new, empty backing file for the series.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the file cannot be written.
    fn create_file(&self, header: &mut SeriesHeader) -> Result<(), PersistenceError>;

    /// Populates `header` (capacity, persisted counters, properties) from the
    /// existing file.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the file is missing, unreadable or corrupt.
    fn read_header(&self, header: &mut SeriesHeader) -> Result<(), PersistenceError>;

    /// Deserializes the full contents of the series.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the file is missing, unreadable or corrupt.
    fn read_series(&self, header: &SeriesHeader) -> Result<RingBuffer, PersistenceError>;

    /// Rewrites the whole file from `ring`, including the latest header and
    /// properties. Clears the header's properties dirty flag on success.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the file cannot be written.
    fn write_series(&self, header: &mut SeriesHeader, ring: &RingBuffer) -> Result<(), PersistenceError>;

    /// Durably appends `items` without rewriting the whole file, updating the
    /// header counters. Also persists pending property changes, so an empty
    /// `items` slice performs a header-only write.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the file cannot be written.
    fn append_to_series(&self, header: &mut SeriesHeader, items: &[Item]) -> Result<(), PersistenceError>;
}
