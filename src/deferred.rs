//! Deferred-task priority queue.
//!
//! Low-priority work is held until a caller forces a flush or the queue
//! reaches its threshold. Draining runs tasks in priority order (lower
//! ordinal first, FIFO within a priority) and notifies the listener for each
//! task right before it runs.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::binding::EngineBinding;
use crate::config::EngineConfig;
use crate::delivery::{Delivery, DeliverySink};
use crate::processor::Processor;
use crate::request::Request;

/// Task priority. Lower ordinal runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Highest = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Lowest = 4,
}

impl Priority {
    #[must_use]
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Identifier assigned to an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Deferred unit of work.
pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// Observer told about each task just before it runs.
pub trait DeferredListener: Send + Sync {
    fn on_flush(&self, id: TaskId, priority: Priority);
}

struct Entry {
    id: TaskId,
    priority: Priority,
    task: DeferredTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap pops the greatest entry, so both keys are reversed.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Priority queue of deferred tasks with a flush threshold.
pub struct DeferredQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    next_id: AtomicU64,
    threshold: usize,
    listener: Option<Arc<dyn DeferredListener>>,
}

impl fmt::Debug for DeferredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredQueue")
            .field("len", &self.len())
            .field("threshold", &self.threshold)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl DeferredQueue {
    /// Creates a queue flushed by [`flush_if_threshold`](Self::flush_if_threshold)
    /// once it holds `threshold` tasks (minimum one).
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_id: AtomicU64::new(1),
            threshold: threshold.max(1),
            listener: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.deferred_threshold)
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn DeferredListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a task.
    pub fn enqueue(&self, task: DeferredTask, priority: Priority) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut heap = self.lock();
        heap.push(Entry { id, priority, task });
        debug!(task_id = %id, ?priority, queued = heap.len(), "deferred task enqueued");
        id
    }

    /// Drains and runs every task if the queue has reached its threshold.
    /// Returns the number of tasks run.
    pub fn flush_if_threshold(&self) -> usize {
        let len = self.len();
        if len < self.threshold {
            debug!(len, threshold = self.threshold, "deferred queue below threshold");
            return 0;
        }
        self.flush_all()
    }

    /// Drains and runs every task regardless of threshold. Returns the number run.
    ///
    /// Tasks run on the calling thread after the queue lock is released, so
    /// a task may enqueue further work.
    pub fn flush_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut heap = self.lock();
            std::iter::from_fn(|| heap.pop()).collect()
        };
        let count = drained.len();
        if count > 0 {
            info!(count, "flushing deferred tasks");
        }

        for Entry { id, priority, task } in drained {
            if let Some(listener) = &self.listener {
                listener.on_flush(id, priority);
            }
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!(task_id = %id, ?priority, "deferred task panicked");
            }
        }
        count
    }

    /// Drops every queued task of `priority` without running it. Returns the number removed.
    pub fn remove_by_priority(&self, priority: Priority) -> usize {
        let mut heap = self.lock();
        let before = heap.len();
        heap.retain(|entry| entry.priority != priority);
        let removed = before - heap.len();
        debug!(?priority, removed, "deferred tasks removed");
        removed
    }

    /// Defers an asynchronous request through `binding`.
    ///
    /// When the task runs, submission failures are reported to `sink` as a
    /// failed delivery.
    pub fn enqueue_request(
        &self,
        binding: Arc<EngineBinding>,
        request: Request,
        processor: Arc<dyn Processor>,
        sink: Arc<dyn DeliverySink>,
        priority: Priority,
    ) -> TaskId {
        self.enqueue(
            Box::new(move || {
                let request_id = request.id();
                let processor_id = processor.id();
                if let Err(error) = binding.run_async(request, processor, Arc::clone(&sink)) {
                    warn!(request_id = %request_id, error = %error, "deferred request rejected");
                    sink.deliver(Delivery::failure(processor_id, request_id, error));
                }
            }),
            priority,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
