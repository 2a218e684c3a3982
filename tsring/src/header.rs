//! Persisted per-series metadata.
//!
//! A [`SeriesHeader`] mirrors the metadata block of a series file: identity,
//! capacity, persisted counters, and a string property map. Property changes
//! set a dirty flag so the next flush rewrites the metadata even when no items
//! are pending.

use std::collections::BTreeMap;

/// In-memory mirror of a series file's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesHeader {
    id: String,
    description: String,
    max_length: usize,
    current_size: usize,
    most_recent_timestamp: Option<i64>,
    properties: BTreeMap<String, String>,
    properties_rewrite_required: bool,
}

impl SeriesHeader {
    /// Creates a header for a series that has not been persisted yet.
    pub fn new(id: impl Into<String>, description: impl Into<String>, max_length: usize) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            max_length: max_length.max(1),
            current_size: 0,
            most_recent_timestamp: None,
            properties: BTreeMap::new(),
            properties_rewrite_required: false,
        }
    }

    /// Returns the series id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the series capacity.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Returns the number of items currently persisted.
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Returns the timestamp of the most recent persisted item.
    pub fn most_recent_timestamp(&self) -> Option<i64> {
        self.most_recent_timestamp
    }

    /// Returns a property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Returns all properties.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Sets a property, returning the previous value.
    ///
    /// Marks the metadata for rewrite on the next flush.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.properties_rewrite_required = true;
        self.properties.insert(key.into(), value.into())
    }

    /// Removes a property, returning its value.
    ///
    /// Marks the metadata for rewrite only if something was removed.
    pub fn remove_property(&mut self, key: &str) -> Option<String> {
        let removed = self.properties.remove(key);
        if removed.is_some() {
            self.properties_rewrite_required = true;
        }
        removed
    }

    /// Returns whether the properties changed since the last successful write.
    pub fn is_properties_rewrite_required(&self) -> bool {
        self.properties_rewrite_required
    }

    /// Applies metadata read from a series file.
    ///
    /// Used by gateways when syncing the header with an existing file; clears
    /// the rewrite flag because memory now matches disk.
    pub fn load_from_file(
        &mut self,
        description: String,
        max_length: usize,
        properties: BTreeMap<String, String>,
    ) {
        self.description = description;
        self.max_length = max_length.max(1);
        self.properties = properties;
        self.properties_rewrite_required = false;
    }

    /// Records the persisted counters after a successful read or write.
    pub fn set_persisted_state(&mut self, current_size: usize, most_recent_timestamp: Option<i64>) {
        self.current_size = current_size.min(self.max_length);
        self.most_recent_timestamp = most_recent_timestamp;
    }

    /// Clears the properties dirty flag once the metadata has been written.
    pub fn mark_properties_written(&mut self) {
        self.properties_rewrite_required = false;
    }
}
