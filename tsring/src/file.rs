//! Series file format and the filesystem [`PersistenceGateway`].
//!
//! Each series lives in its own file, laid out as an on-disk ring so that
//! appends touch only the new slots and a few counters.
//!
//! # File Format
//!
//! ```text
//! [0..40)            Fixed header (little-endian)
//!                      [0..4)   magic "TSRG"
//!                      [4..8)   format version
//!                      [8..12)  metadata capacity in bytes
//!                      [12..16) max length (slot count)
//!                      [16..20) current size
//!                      [20..24) head slot (oldest item)
//!                      [24..32) most recent timestamp (i64::MIN when empty)
//!                      [32..40) reserved
//! [40..40+M)         Metadata: u32 length + JSON {id, description, properties}
//! [40+M..)           max_length slots of (i64 timestamp, f64 value)
//! ```
//!
//! Appends map the file with `memmap2`, write the new slots, advance the
//! counters and flush. Whole-series rewrites build the complete image in
//! memory, write it to a temporary file and rename it over the original, so a
//! failed rewrite never leaves a half-written series behind.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PersistenceError;
use crate::gateway::PersistenceGateway;
use crate::header::SeriesHeader;
use crate::item::Item;
use crate::metrics::GatewayMetrics;
use crate::ring::RingBuffer;

/// Magic bytes identifying a series file.
const FILE_MAGIC: [u8; 4] = *b"TSRG";

/// Current series file format version.
const FILE_VERSION: u32 = 1;

/// Size of the fixed header in bytes.
const FIXED_HEADER_SIZE: usize = 40;

/// Size of one item slot in bytes.
const ITEM_SIZE: usize = 16;

/// Smallest metadata region reserved in a new file.
const MIN_METADATA_CAPACITY: usize = 512;

/// Sentinel stored when the series has no items.
const EMPTY_TIMESTAMP: i64 = i64::MIN;

/// Extension used for series files.
pub const FILE_EXTENSION: &str = "tsr";

/// Metadata block stored as JSON after the fixed header.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMetadata {
    id: String,
    description: String,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

/// Decoded fixed header of a series file.
#[derive(Debug, Clone, Copy)]
struct FileLayout {
    metadata_capacity: usize,
    max_length: usize,
    current_size: usize,
    head: usize,
    most_recent: i64,
}

impl FileLayout {
    /// Decodes and validates the fixed header against the file length.
    fn decode(bytes: &[u8], path: &Path) -> Result<Self, PersistenceError> {
        if bytes.len() < FIXED_HEADER_SIZE {
            return Err(corrupted(
                path,
                format!(
                    "file too small: {} bytes, expected at least {FIXED_HEADER_SIZE}",
                    bytes.len()
                ),
            ));
        }

        if bytes[0..4] != FILE_MAGIC {
            return Err(corrupted(
                path,
                format!(
                    "invalid magic bytes: expected {:?}, found {:?}",
                    FILE_MAGIC,
                    &bytes[0..4]
                ),
            ));
        }

        let version = read_u32(bytes, 4);
        if version != FILE_VERSION {
            return Err(corrupted(
                path,
                format!("unsupported version: expected {FILE_VERSION}, found {version}"),
            ));
        }

        let layout = Self {
            metadata_capacity: read_u32(bytes, 8) as usize,
            max_length: read_u32(bytes, 12) as usize,
            current_size: read_u32(bytes, 16) as usize,
            head: read_u32(bytes, 20) as usize,
            most_recent: read_i64(bytes, 24),
        };

        if layout.max_length == 0
            || layout.current_size > layout.max_length
            || layout.head >= layout.max_length
        {
            return Err(corrupted(
                path,
                format!(
                    "inconsistent counters: max_length={}, size={}, head={}",
                    layout.max_length, layout.current_size, layout.head
                ),
            ));
        }

        if bytes.len() != layout.file_size() {
            return Err(corrupted(
                path,
                format!(
                    "file size mismatch: {} bytes, expected {}",
                    bytes.len(),
                    layout.file_size()
                ),
            ));
        }

        Ok(layout)
    }

    /// Writes the fixed header into the first [`FIXED_HEADER_SIZE`] bytes.
    #[allow(clippy::cast_possible_truncation)] // all fields were validated to fit in u32
    fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&FILE_MAGIC);
        out[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&(self.metadata_capacity as u32).to_le_bytes());
        out[12..16].copy_from_slice(&(self.max_length as u32).to_le_bytes());
        out[16..20].copy_from_slice(&(self.current_size as u32).to_le_bytes());
        out[20..24].copy_from_slice(&(self.head as u32).to_le_bytes());
        out[24..32].copy_from_slice(&self.most_recent.to_le_bytes());
        out[32..40].fill(0);
    }

    fn data_offset(&self) -> usize {
        FIXED_HEADER_SIZE + self.metadata_capacity
    }

    fn file_size(&self) -> usize {
        self.data_offset() + self.max_length * ITEM_SIZE
    }

    fn slot_offset(&self, slot: usize) -> usize {
        self.data_offset() + slot * ITEM_SIZE
    }

    fn most_recent(&self) -> Option<i64> {
        (self.most_recent != EMPTY_TIMESTAMP).then_some(self.most_recent)
    }

    /// Reads the persisted items, oldest first.
    fn read_items(&self, bytes: &[u8]) -> Vec<Item> {
        (0..self.current_size)
            .map(|i| {
                let offset = self.slot_offset((self.head + i) % self.max_length);
                Item::new(read_i64(bytes, offset), read_f64(bytes, offset + 8))
            })
            .collect()
    }

    /// Writes `item` into the next ring slot and advances the counters.
    fn append_item(&mut self, bytes: &mut [u8], item: Item) {
        let slot = if self.current_size < self.max_length {
            let slot = (self.head + self.current_size) % self.max_length;
            self.current_size += 1;
            slot
        } else {
            // Full: overwrite the oldest slot
            let slot = self.head;
            self.head = (self.head + 1) % self.max_length;
            slot
        };

        let offset = self.slot_offset(slot);
        bytes[offset..offset + 8].copy_from_slice(&item.timestamp.to_le_bytes());
        bytes[offset + 8..offset + 16].copy_from_slice(&item.value.to_le_bytes());

        if self.most_recent == EMPTY_TIMESTAMP || item.timestamp > self.most_recent {
            self.most_recent = item.timestamp;
        }
    }
}

/// [`PersistenceGateway`] storing one file per series under a root directory.
#[derive(Debug, Clone)]
pub struct FileGateway {
    root: PathBuf,
    metrics: GatewayMetrics,
}

impl FileGateway {
    /// Creates a gateway storing series files under `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            metrics: GatewayMetrics::default(),
        }
    }

    /// Replaces the metrics sinks.
    #[must_use]
    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path of the file backing series `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(file_name_for(id))
    }

    /// Reads only the header of the series file at `path`.
    ///
    /// Used when discovering series in a directory, before their ids are known.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the file is unreadable or corrupt.
    pub fn read_header_at(&self, path: &Path) -> Result<SeriesHeader, PersistenceError> {
        let mmap = map_read(path)?;
        let layout = FileLayout::decode(&mmap, path)?;
        let metadata = decode_metadata(&mmap, &layout, path)?;

        let mut header = SeriesHeader::new(metadata.id, String::new(), layout.max_length);
        header.load_from_file(metadata.description, layout.max_length, metadata.properties);
        header.set_persisted_state(layout.current_size, layout.most_recent());
        self.metrics.header_reads.increment();
        Ok(header)
    }

    /// Writes a complete file image for `header` with the given items.
    fn write_file(&self, header: &mut SeriesHeader, items: &[Item]) -> Result<(), PersistenceError> {
        let path = self.path_for(header.id());
        let metadata = encode_metadata(header, &path)?;

        let max_length = header.max_length();
        if u32::try_from(max_length).is_err() {
            return Err(corrupted(&path, format!("series length {max_length} exceeds u32")));
        }
        let skip = items.len().saturating_sub(max_length);
        let items = &items[skip..];

        let mut layout = FileLayout {
            metadata_capacity: metadata_capacity_for(metadata.len()),
            max_length,
            current_size: 0,
            head: 0,
            most_recent: EMPTY_TIMESTAMP,
        };

        let mut image = vec![0u8; layout.file_size()];
        write_metadata(&mut image, &metadata);
        for item in items {
            layout.append_item(&mut image, *item);
        }
        layout.encode(&mut image[..FIXED_HEADER_SIZE]);

        let tmp_path = path.with_extension(format!("{FILE_EXTENSION}.tmp"));
        fs::write(&tmp_path, &image).map_err(|e| io_error(&tmp_path, e))?;
        fs::rename(&tmp_path, &path).map_err(|e| io_error(&path, e))?;

        header.set_persisted_state(layout.current_size, layout.most_recent());
        header.mark_properties_written();
        Ok(())
    }
}

impl PersistenceGateway for FileGateway {
    fn exists(&self, header: &SeriesHeader) -> bool {
        self.path_for(header.id()).is_file()
    }

    fn create_file(&self, header: &mut SeriesHeader) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.root).map_err(|e| io_error(&self.root, e))?;
        debug!(series = header.id(), "creating series file");
        self.write_file(header, &[])
    }

    fn read_header(&self, header: &mut SeriesHeader) -> Result<(), PersistenceError> {
        let path = self.path_for(header.id());
        let mmap = map_read(&path)?;
        let layout = FileLayout::decode(&mmap, &path)?;
        let metadata = decode_metadata(&mmap, &layout, &path)?;

        header.load_from_file(metadata.description, layout.max_length, metadata.properties);
        header.set_persisted_state(layout.current_size, layout.most_recent());
        self.metrics.header_reads.increment();
        Ok(())
    }

    fn read_series(&self, header: &SeriesHeader) -> Result<RingBuffer, PersistenceError> {
        let path = self.path_for(header.id());
        let mmap = map_read(&path)?;
        let layout = FileLayout::decode(&mmap, &path)?;
        Ok(RingBuffer::from_items(layout.max_length, layout.read_items(&mmap)))
    }

    fn write_series(&self, header: &mut SeriesHeader, ring: &RingBuffer) -> Result<(), PersistenceError> {
        self.write_file(header, &ring.snapshot())?;
        self.metrics.rewrites.increment();
        debug!(series = header.id(), items = ring.len(), "rewrote series file");
        Ok(())
    }

    fn append_to_series(&self, header: &mut SeriesHeader, items: &[Item]) -> Result<(), PersistenceError> {
        let path = self.path_for(header.id());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| open_error(&path, e))?;

        // SAFETY: The file is open read/write and only this process writes to
        // it, serialized by the owning series' write lock. Rewrites replace the
        // file by rename, so this mapping never observes a truncation.
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| io_error(&path, e))? };
        let mut layout = FileLayout::decode(&mmap, &path)?;

        if header.is_properties_rewrite_required() {
            let metadata = encode_metadata(header, &path)?;
            if metadata.len() + 4 > layout.metadata_capacity {
                // Properties outgrew the reserved region; rewrite the whole file
                let mut ring = RingBuffer::from_items(layout.max_length, layout.read_items(&mmap));
                drop(mmap);
                drop(file);
                for item in items {
                    ring.add(*item);
                }
                debug!(series = header.id(), "metadata region full, rewriting series");
                return self.write_series(header, &ring);
            }
            write_metadata(&mut mmap, &metadata);
        }

        let skip = items.len().saturating_sub(layout.max_length);
        for item in &items[skip..] {
            layout.append_item(&mut mmap, *item);
        }
        layout.encode(&mut mmap[..FIXED_HEADER_SIZE]);
        mmap.flush().map_err(|e| io_error(&path, e))?;

        header.set_persisted_state(layout.current_size, layout.most_recent());
        header.mark_properties_written();
        self.metrics.appends.increment();
        Ok(())
    }
}

/// Returns the file name used for series `id`.
///
/// Characters outside `[A-Za-z0-9._-]` are replaced with `_`. The real id is
/// stored in the file's metadata, so the mapping does not need to be reversible.
pub fn file_name_for(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}.{FILE_EXTENSION}")
}

fn map_read(path: &Path) -> Result<Mmap, PersistenceError> {
    let file = File::open(path).map_err(|e| open_error(path, e))?;
    // SAFETY: The mapping is read-only and only this process writes series
    // files. Rewrites go through rename, leaving this mapping's inode intact.
    unsafe { Mmap::map(&file).map_err(|e| io_error(path, e)) }
}

fn metadata_capacity_for(encoded_len: usize) -> usize {
    (encoded_len + 4).next_power_of_two().max(MIN_METADATA_CAPACITY)
}

fn encode_metadata(header: &SeriesHeader, path: &Path) -> Result<Vec<u8>, PersistenceError> {
    let metadata = StoredMetadata {
        id: header.id().to_string(),
        description: header.description().to_string(),
        properties: header.properties().clone(),
    };
    serde_json::to_vec(&metadata).map_err(|e| PersistenceError::Metadata {
        path: path.to_path_buf(),
        source: e,
    })
}

#[allow(clippy::cast_possible_truncation)] // bounded by the metadata capacity
fn write_metadata(bytes: &mut [u8], metadata: &[u8]) {
    let start = FIXED_HEADER_SIZE;
    bytes[start..start + 4].copy_from_slice(&(metadata.len() as u32).to_le_bytes());
    bytes[start + 4..start + 4 + metadata.len()].copy_from_slice(metadata);
}

fn decode_metadata(
    bytes: &[u8],
    layout: &FileLayout,
    path: &Path,
) -> Result<StoredMetadata, PersistenceError> {
    let len = read_u32(bytes, FIXED_HEADER_SIZE) as usize;
    if len + 4 > layout.metadata_capacity {
        return Err(corrupted(
            path,
            format!(
                "metadata length {len} exceeds reserved capacity {}",
                layout.metadata_capacity
            ),
        ));
    }
    let start = FIXED_HEADER_SIZE + 4;
    serde_json::from_slice(&bytes[start..start + len]).map_err(|e| PersistenceError::Metadata {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(buf)
}

fn read_f64(bytes: &[u8], offset: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    f64::from_le_bytes(buf)
}

fn corrupted(path: &Path, reason: String) -> PersistenceError {
    PersistenceError::Corrupted {
        path: path.to_path_buf(),
        reason,
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn open_error(path: &Path, source: std::io::Error) -> PersistenceError {
    if source.kind() == ErrorKind::NotFound {
        PersistenceError::MissingFile {
            path: path.to_path_buf(),
        }
    } else {
        io_error(path, source)
    }
}
