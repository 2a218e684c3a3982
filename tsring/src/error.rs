//! Error types for the tsring time-series store.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// The main error type for all tsring operations.
///
/// Per-concern error enums convert into this type with `?`, so callers can
/// match on the concern that failed without losing the structured context.
#[derive(Error, Debug)]
pub enum TsringError {
    /// Error opening or managing a store directory.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error reading or writing a series file.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A series could not be loaded into memory for a read or mutation.
    #[error("deserialization error: {0}")]
    Deserialization(#[from] DeserializationError),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors that can occur when opening or managing a store directory.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store directory could not be created or listed.
    #[error("failed to access store directory '{}': {source}", path.display())]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A background worker thread could not be started.
    #[error("failed to spawn worker thread '{name}': {source}")]
    WorkerSpawn {
        /// Name of the thread.
        name: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The series id cannot be used to name a series.
    #[error("invalid series id '{id}': {reason}")]
    InvalidSeriesId {
        /// The rejected id.
        id: String,
        /// Why the id was rejected.
        reason: String,
    },
}

/// Errors raised by a [`PersistenceGateway`](crate::gateway::PersistenceGateway).
///
/// A failed call leaves the on-disk state unspecified; callers retain any
/// pending in-memory changes and retry later.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// An I/O operation on a series file failed.
    #[error("I/O failure on '{}': {source}", path.display())]
    Io {
        /// The series file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The series file has an invalid layout.
    #[error("series file '{}' is corrupted: {reason}", path.display())]
    Corrupted {
        /// The series file path.
        path: PathBuf,
        /// Description of the corruption.
        reason: String,
    },

    /// The series metadata block could not be encoded or decoded.
    #[error("invalid metadata in '{}': {source}", path.display())]
    Metadata {
        /// The series file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The series file does not exist.
    #[error("series file '{}' does not exist", path.display())]
    MissingFile {
        /// The expected series file path.
        path: PathBuf,
    },
}

/// A series could not be deserialized for a read or a non-append mutation.
///
/// Not retried automatically: a corrupt file reads the same way every time.
#[derive(Error, Debug)]
#[error("failed to load series '{series}': {source}")]
pub struct DeserializationError {
    /// Id of the series that failed to load.
    pub series: String,
    /// The underlying gateway failure.
    #[source]
    pub source: PersistenceError,
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A flush or maintenance period is zero.
    #[error("{name} must be greater than zero, got {value:?}")]
    InvalidPeriod {
        /// Name of the offending setting.
        name: &'static str,
        /// The configured value.
        value: Duration,
    },

    /// A series length of zero was requested.
    #[error("series length must be greater than zero")]
    InvalidSeriesLength,

    /// The number of flush workers is zero.
    #[error("flush_workers must be greater than zero")]
    InvalidWorkerCount,

    /// Cache tuning parameters are out of range.
    #[error("invalid cache configuration: {reason}")]
    InvalidCache {
        /// Description of what is invalid.
        reason: String,
    },

    /// The config file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`StoreConfig`](crate::config::StoreConfig).
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Type alias for `Result<T, TsringError>`.
pub type Result<T> = std::result::Result<T, TsringError>;
