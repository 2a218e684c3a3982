//! Shared deferred-task clock for flushes and cache maintenance.
//!
//! A [`FlushScheduler`] owns a small pool of worker threads draining one
//! deadline-ordered queue. Every series and cache in a store shares the same
//! scheduler, handed to them at construction.
//!
//! Tasks are idempotent from the scheduler's point of view: cancelling marks a
//! task so that it is skipped when its deadline comes up, and a task that
//! already fired is simply done. Per-series debouncing lives in [`FlushSlot`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

use crate::error::StoreError;

enum Job {
    Once(Box<dyn FnOnce() + Send>),
    Repeat {
        period: Duration,
        run: Arc<dyn Fn() + Send + Sync>,
    },
}

#[derive(Debug)]
struct TaskState {
    cancelled: AtomicBool,
    done: AtomicBool,
    deadline: Mutex<Instant>,
}

/// Handle to a task submitted to a [`FlushScheduler`].
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    state: Arc<TaskState>,
}

impl ScheduledTask {
    /// Prevents the task from running if it has not started yet.
    ///
    /// Periodic tasks stop repeating.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Returns whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns whether the task has started running or was cancelled.
    ///
    /// A periodic task is only done once cancelled.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.state.done.load(Ordering::Acquire)
    }

    /// Returns the time left until the task's next deadline.
    pub fn remaining(&self) -> Duration {
        self.state
            .deadline
            .lock()
            .saturating_duration_since(Instant::now())
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Arc<TaskState>,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

impl Queue {
    fn push(&mut self, deadline: Instant, task: Arc<TaskState>, job: Job) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            task,
            job,
        });
    }
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

/// Process-wide pool of workers running deferred and periodic tasks.
///
/// Dropping the scheduler stops the workers. Tasks still queued at that point
/// are discarded without running.
pub struct FlushScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("workers", &self.workers.len())
            .field("queued", &self.queued())
            .finish()
    }
}

impl FlushScheduler {
    /// Starts a scheduler with `workers` threads (at least one).
    ///
    /// A single worker keeps flush I/O strictly ordered; more workers let
    /// flushes of distinct series overlap.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WorkerSpawn`] if a worker thread cannot be started.
    pub fn new(workers: usize) -> Result<Self, StoreError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(workers.max(1)),
        };
        for index in 0..workers.max(1) {
            let name = format!("tsring-flush-{index}");
            let shared = Arc::clone(&scheduler.shared);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(&shared))
                .map_err(|source| StoreError::WorkerSpawn { name, source })?;
            scheduler.workers.push(handle);
        }
        Ok(scheduler)
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(delay, Job::Once(Box::new(task)))
    }

    /// Runs `task` as soon as a worker is free.
    pub fn execute<F>(&self, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Duration::ZERO, task)
    }

    /// Runs `task` after `initial_delay`, then repeatedly with `period`
    /// between the end of one run and the start of the next, until cancelled.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.submit(
            initial_delay,
            Job::Repeat {
                period,
                run: Arc::new(task),
            },
        )
    }

    /// Returns the number of tasks waiting in the queue, cancelled ones included.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    fn submit(&self, delay: Duration, job: Job) -> ScheduledTask {
        let deadline = Instant::now() + delay;
        let state = Arc::new(TaskState {
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            deadline: Mutex::new(deadline),
        });

        let mut queue = self.shared.queue.lock();
        queue.push(deadline, Arc::clone(&state), job);
        drop(queue);
        self.shared.available.notify_one();

        ScheduledTask { state }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            std::mem::take(&mut queue.heap)
        };
        self.shared.available.notify_all();
        debug!(discarded = discarded.len(), "stopping flush scheduler");
        // Dropped outside the lock, closures may own handles that schedule on drop
        drop(discarded);

        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last owner may be a task running on one of our own workers
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn run_worker(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }

        let next_deadline = queue.heap.peek().map(|entry| entry.deadline);
        match next_deadline {
            None => shared.available.wait(&mut queue),
            Some(deadline) if deadline > Instant::now() => {
                shared.available.wait_until(&mut queue, deadline);
            }
            Some(_) => {
                if let Some(entry) = queue.heap.pop() {
                    run_entry(shared, &mut queue, entry);
                }
            }
        }
    }
}

fn run_entry(shared: &Shared, queue: &mut MutexGuard<'_, Queue>, entry: Entry) {
    let Entry { task, job, .. } = entry;
    if task.cancelled.load(Ordering::Acquire) {
        return;
    }

    match job {
        Job::Once(run) => {
            task.done.store(true, Ordering::Release);
            MutexGuard::unlocked(queue, || guarded(run));
        }
        Job::Repeat { period, run } => {
            let body = Arc::clone(&run);
            MutexGuard::unlocked(queue, || guarded(move || body()));

            if !queue.shutdown && !task.cancelled.load(Ordering::Acquire) {
                let deadline = Instant::now() + period;
                *task.deadline.lock() = deadline;
                queue.push(deadline, Arc::clone(&task), Job::Repeat { period, run });
                shared.available.notify_one();
            }
        }
    }
}

fn guarded<F: FnOnce()>(run: F) {
    if catch_unwind(AssertUnwindSafe(run)).is_err() {
        error!("scheduled task panicked");
    }
}

/// Debounced flush request for one series.
///
/// Requests follow "bring forward, never delay": a new request replaces the
/// pending one only if it would fire sooner.
#[derive(Debug, Default)]
pub struct FlushSlot {
    pending: Option<ScheduledTask>,
}

impl FlushSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that `task` run within `delay`.
    ///
    /// If nothing is pending, or the pending task already fired, `task` is
    /// scheduled after `delay`. If the pending task is due later than `delay`
    /// from now, it is cancelled and replaced. Otherwise the pending task is
    /// kept and `task` is dropped.
    ///
    /// Returns `true` if `task` was scheduled.
    pub fn request<F>(&mut self, scheduler: &FlushScheduler, delay: Duration, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(pending) = &self.pending
            && !pending.is_done()
        {
            if pending.remaining() <= delay {
                return false;
            }
            pending.cancel();
        }
        self.pending = Some(scheduler.schedule(delay, task));
        true
    }

    /// Returns the time left before the pending task fires, if one is pending.
    pub fn remaining(&self) -> Option<Duration> {
        self.pending
            .as_ref()
            .filter(|task| !task.is_done())
            .map(ScheduledTask::remaining)
    }

    /// Cancels the pending task, if any.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}
