//! Change notifications for series.
//!
//! Mutations publish [`SeriesEvent`]s through an [`EventDispatcher`], whose
//! single worker thread calls listeners outside any series lock. Events of one
//! series reach its listeners in the order the mutations were applied.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::RwLock;
use tracing::warn;

use crate::error::StoreError;
use crate::item::Item;

/// What kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Items were appended or inserted.
    ItemsAdded,
    /// Items were removed.
    ItemsRemoved,
    /// The series changed in a way not described by its items (e.g. cleared).
    SeriesChanged,
}

/// A change to one series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesEvent {
    /// Id of the series that changed.
    pub series_id: String,
    /// Kind of change.
    pub kind: EventKind,
    /// Items added or removed; empty for [`EventKind::SeriesChanged`].
    pub items: Vec<Item>,
    /// Series mod count after the change. Listeners can detect missed events
    /// by checking for gaps.
    pub mod_count: u64,
}

/// Receives change events for a series.
///
/// Implemented for any `Fn(&SeriesEvent) + Send + Sync` closure.
pub trait SeriesListener: Send + Sync {
    /// Called on the dispatcher thread for each event.
    fn on_event(&self, event: &SeriesEvent);
}

impl<F> SeriesListener for F
where
    F: Fn(&SeriesEvent) + Send + Sync,
{
    fn on_event(&self, event: &SeriesEvent) {
        self(event);
    }
}

/// Token returned by listener registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listeners registered on one series.
#[derive(Default)]
pub struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn SeriesListener>)>>,
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl ListenerSet {
    /// Registers a listener.
    pub fn add(&self, listener: Arc<dyn SeriesListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Returns whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Calls every listener with `event`.
    ///
    /// A panicking listener is logged and skipped; the others still run.
    pub fn notify(&self, event: &SeriesEvent) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                warn!(series = %event.series_id, mod_count = event.mod_count, "series listener panicked");
            }
        }
    }
}

type Delivery = (Arc<ListenerSet>, SeriesEvent);

/// Ordered, asynchronous delivery of series events.
///
/// Dropping the dispatcher delivers the events already queued, then stops
/// the worker.
pub struct EventDispatcher {
    sender: Option<Sender<Delivery>>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("queued", &self.sender.as_ref().map_or(0, Sender::len))
            .finish()
    }
}

impl EventDispatcher {
    /// Starts the dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WorkerSpawn`] if the thread cannot be started.
    pub fn new() -> Result<Self, StoreError> {
        let (sender, receiver) = unbounded::<Delivery>();
        let name = "tsring-events".to_string();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for (listeners, event) in receiver {
                    listeners.notify(&event);
                }
            })
            .map_err(|source| StoreError::WorkerSpawn { name, source })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queues `event` for delivery to `listeners`.
    pub fn dispatch(&self, listeners: &Arc<ListenerSet>, event: SeriesEvent) {
        if let Some(sender) = &self.sender {
            // Only fails once the worker is gone, which happens during drop
            let _ = sender.send((Arc::clone(listeners), event));
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
    }
}
