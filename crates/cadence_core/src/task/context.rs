//! Task targets and the per-task context handed to task bodies.

use crate::sync::{Fence, FenceSignal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Where a task runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NamedThread {
    /// The producer's local queue. Only serviced by the producer thread itself,
    /// while it waits or explicitly drains the queue.
    Producer,
    /// The execution role: a dedicated thread, or the producer's local queue when
    /// no dedicated thread exists.
    Execution,
    /// Any thread of the worker pool.
    AnyWorker,
}

/// Handed to every task body while it runs.
#[derive(Debug)]
pub struct TaskContext {
    target: NamedThread,
    holds: Vec<Fence>,
}

impl TaskContext {
    pub(crate) fn new(target: NamedThread) -> Self {
        Self {
            target,
            holds: Vec::new(),
        }
    }

    /// The target this task was spawned for.
    #[inline]
    #[must_use]
    pub const fn target(&self) -> NamedThread {
        self.target
    }

    /// Delays completion of the current task until `fence` completes as well.
    ///
    /// The task body still returns normally; only the task's own fence is held back.
    pub fn dont_complete_until(&mut self, fence: Fence) {
        if !fence.is_complete() {
            self.holds.push(fence);
        }
    }

    /// Signals the task fence now, or once every held fence has completed.
    pub(crate) fn complete(self, signal: FenceSignal) {
        if self.holds.is_empty() {
            signal.signal();
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(self.holds.len()));
        let slot = Arc::new(Mutex::new(Some(signal)));
        for hold in self.holds {
            let remaining = Arc::clone(&remaining);
            let slot = Arc::clone(&slot);
            hold.on_complete(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(signal) = slot.lock().take() {
                        signal.signal();
                    }
                }
            });
        }
    }
}
