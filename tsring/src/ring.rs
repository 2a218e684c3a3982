//! In-memory round-robin buffer for a single series.
//!
//! A [`RingBuffer`] holds at most `capacity` items ordered by timestamp. When
//! an append would exceed the capacity, the earliest item is discarded.
//!
//! # Ordering
//!
//! The buffer is kept sorted in the common case: appends at or after the
//! latest timestamp go to the tail in O(1), earlier items are placed with a
//! binary search. A buffer built from out-of-order data (for example a file
//! written across a clock resync) is flagged as unordered, and lookups fall
//! back to linear scans until a bulk insert re-sorts it.
//!
//! # Identity
//!
//! `RingBuffer` deliberately does not implement `PartialEq`. Comparing series
//! structurally would mean deserializing whole files just to answer an
//! equality check.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::item::Item;

/// A ring buffer shared between the series cache and the write-behind buffer.
///
/// All mutation happens under the owning series' write lock; the inner lock
/// only satisfies the borrow rules for the shared reference.
pub type SharedRing = Arc<RwLock<RingBuffer>>;

/// Fixed-capacity, timestamp-ordered sequence of [`Item`]s.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    items: VecDeque<Item>,
    capacity: usize,
    /// Whether `items` is sorted by timestamp.
    ordered: bool,
}

impl RingBuffer {
    /// Creates an empty ring buffer.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            ordered: true,
        }
    }

    /// Creates a ring buffer from items in stored order.
    ///
    /// If more than `capacity` items are supplied, only the last `capacity`
    /// are kept. Items are not re-sorted; an out-of-order sequence marks the
    /// buffer as unordered.
    pub fn from_items<I>(capacity: usize, items: I) -> Self
    where
        I: IntoIterator<Item = Item>,
    {
        let mut ring = Self::new(capacity);
        for item in items {
            if ring.ordered
                && let Some(latest) = ring.items.back()
                && item.timestamp < latest.timestamp
            {
                ring.ordered = false;
            }
            ring.push_back(item);
        }
        ring
    }

    /// Wraps the buffer for sharing between the cache and the write-behind buffer.
    pub fn into_shared(self) -> SharedRing {
        Arc::new(RwLock::new(self))
    }

    /// Returns the maximum number of items held.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of items held.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns whether the items are known to be sorted by timestamp.
    #[inline]
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Adds an item, discarding the earliest item if the buffer is full.
    ///
    /// Items at or after the latest timestamp are appended in O(1). Earlier
    /// items are inserted at their sorted position. Returns the discarded
    /// item, which may be `item` itself if it is older than everything held
    /// by a full buffer.
    pub fn add(&mut self, item: Item) -> Option<Item> {
        let in_order = self
            .items
            .back()
            .is_none_or(|latest| item.timestamp >= latest.timestamp);

        if in_order || !self.ordered {
            return self.push_back(item);
        }

        let index = self
            .items
            .partition_point(|existing| existing.timestamp <= item.timestamp);
        if index == 0 && self.items.len() == self.capacity {
            return Some(item);
        }
        self.items.insert(index, item);
        self.truncate_front()
    }

    /// Inserts a batch of items, re-sorting the buffer afterwards.
    ///
    /// The sort is stable, so items sharing a timestamp keep their arrival
    /// order. Returns the number of items discarded to respect the capacity.
    pub fn insert_all<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = Item>,
    {
        self.items.extend(items);
        self.items
            .make_contiguous()
            .sort_by_key(|item| item.timestamp);
        self.ordered = true;

        let excess = self.items.len().saturating_sub(self.capacity);
        self.items.drain(..excess);
        excess
    }

    /// Removes the first item equal to `item`.
    ///
    /// Returns `true` if an item was removed.
    pub fn remove(&mut self, item: &Item) -> bool {
        let position = if self.ordered {
            let start = self
                .items
                .partition_point(|existing| existing.timestamp < item.timestamp);
            self.items
                .range(start..)
                .take_while(|existing| existing.timestamp == item.timestamp)
                .position(|existing| existing == item)
                .map(|offset| start + offset)
        } else {
            self.items.iter().position(|existing| existing == item)
        };

        match position {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes every item in `items` (one occurrence each).
    ///
    /// Returns the items that were actually removed.
    pub fn remove_all<'a, I>(&mut self, items: I) -> Vec<Item>
    where
        I: IntoIterator<Item = &'a Item>,
    {
        items
            .into_iter()
            .filter(|item| self.remove(item))
            .copied()
            .collect()
    }

    /// Removes all items.
    pub fn clear(&mut self) {
        self.items.clear();
        self.ordered = true;
    }

    /// Returns the item at `index`, where index 0 is the earliest.
    #[inline]
    pub fn get(&self, index: usize) -> Option<Item> {
        self.items.get(index).copied()
    }

    /// Returns a copy of all items, earliest first.
    pub fn snapshot(&self) -> Vec<Item> {
        self.items.iter().copied().collect()
    }

    /// Iterates over the items, earliest first.
    pub fn iter(&self) -> impl Iterator<Item = &Item> + '_ {
        self.items.iter()
    }

    /// Returns the earliest item.
    pub fn earliest(&self) -> Option<Item> {
        self.items.front().copied()
    }

    /// Returns the latest item.
    pub fn latest(&self) -> Option<Item> {
        self.items.back().copied()
    }

    /// Returns the latest item with a timestamp at or before `timestamp`.
    pub fn at_or_before(&self, timestamp: i64) -> Option<Item> {
        if self.ordered {
            let index = self
                .items
                .partition_point(|item| item.timestamp <= timestamp);
            index.checked_sub(1).and_then(|i| self.get(i))
        } else {
            self.items
                .iter()
                .filter(|item| item.timestamp <= timestamp)
                .max_by_key(|item| item.timestamp)
                .copied()
        }
    }

    /// Returns the earliest item with a timestamp at or after `timestamp`.
    pub fn at_or_after(&self, timestamp: i64) -> Option<Item> {
        if self.ordered {
            let index = self.items.partition_point(|item| item.timestamp < timestamp);
            self.get(index)
        } else {
            self.items
                .iter()
                .filter(|item| item.timestamp >= timestamp)
                .min_by_key(|item| item.timestamp)
                .copied()
        }
    }

    /// Returns the items with `start <= timestamp <= end`, in stored order.
    pub fn range(&self, start: i64, end: i64) -> Vec<Item> {
        if start > end {
            return Vec::new();
        }
        if self.ordered {
            let from = self.items.partition_point(|item| item.timestamp < start);
            let to = self.items.partition_point(|item| item.timestamp <= end);
            self.items.range(from..to).copied().collect()
        } else {
            self.items
                .iter()
                .filter(|item| (start..=end).contains(&item.timestamp))
                .copied()
                .collect()
        }
    }

    fn push_back(&mut self, item: Item) -> Option<Item> {
        self.items.push_back(item);
        self.truncate_front()
    }

    fn truncate_front(&mut self) -> Option<Item> {
        if self.items.len() > self.capacity {
            self.items.pop_front()
        } else {
            None
        }
    }
}
