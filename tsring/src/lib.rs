//! # tsring
//!
//! Filesystem-backed round-robin time-series storage.
//!
//! tsring keeps each series in a fixed-capacity file that behaves as a ring:
//! once full, every new item replaces the oldest one. The storage layer is
//! built to absorb a very high rate of appends without deserializing series on
//! every write, to cache loaded series within a memory budget, and to flush
//! pending changes to disk asynchronously without losing them when a series
//! leaves the cache.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - In-order appends never load a series; they are buffered and flushed
//!   incrementally through a memory-mapped file
//! - Bounded, predictable storage: size is fixed per series at creation
//! - Write-behind with debounced flushing ("bring forward, never delay")
//! - Pluggable series cache: adaptive LRU or release-on-memory-pressure
//! - Ordered, asynchronous change events per series
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsring::{Item, Store, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::open("./my_metrics", StoreConfig::default())?;
//!
//! // Create (or reopen) a series holding the last 1440 values
//! let cpu = store.series("web1.cpu", "CPU usage percent", Some(1440))?;
//!
//! // Append without touching the rest of the series
//! cpu.append(Item::new(1_640_000_000_000, 85.5))?;
//!
//! // Query data back (loads the series into the cache)
//! for item in cpu.range(0, i64::MAX)? {
//!     println!("{}: {}", item.timestamp, item.value);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Store`]: opens a directory, discovers and creates series
//! - [`SeriesHandle`]: one series; appends, reads, properties, listeners
//! - [`SeriesContext`]: collaborators shared by the series of a store
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`store`]: store lifecycle
//! - [`series`]: series handles and their flush logic
//! - [`ring`]: in-memory ring buffer
//! - [`write_behind`]: staging of unpersisted changes
//! - [`scheduler`]: shared deferred-task clock
//! - [`cache`]: series cache policies and memory probes
//! - [`gateway`]: persistence contract
//! - [`file`]: series file format and the filesystem gateway
//! - [`header`]: persisted series metadata
//! - [`events`]: change notifications
//! - [`metrics`]: counters and gauges for a metrics collaborator
//! - [`config`]: store configuration
//! - [`error`]: error types

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod file;
pub mod gateway;
pub mod header;
pub mod item;
pub mod metrics;
pub mod ring;
pub mod scheduler;
pub mod series;
pub mod store;
pub mod write_behind;

// Re-export primary API types at crate root for convenience.
pub use config::StoreConfig;
pub use error::{Result, TsringError};
pub use item::Item;
pub use series::{SeriesContext, SeriesHandle};
pub use store::Store;
