//! Timestamped values stored in a series.

use serde::{Deserialize, Serialize};

/// A single timestamped value.
///
/// Timestamps are milliseconds since the Unix epoch. Series expect them to be
/// mostly non-decreasing but tolerate occasional earlier values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Timestamp in milliseconds.
    pub timestamp: i64,
    /// The recorded value.
    pub value: f64,
}

impl Item {
    /// Creates a new item.
    #[inline]
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(i64, f64)> for Item {
    fn from((timestamp, value): (i64, f64)) -> Self {
        Self::new(timestamp, value)
    }
}
