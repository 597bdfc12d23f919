//! # Execution Lock
//!
//! The per-batch mutex of the execution role, plus ref-counted stalls.
//!
//! ```text
//! execution role:  [batch 1]──[batch 2]──────────────[batch 3]──
//! producer:                  stall()═══ nested stall ═══drop()
//!                            (waits for batch 2 to finish)
//! ```
//!
//! A batch holds the lock for its whole walk over a command list. A stall holds it
//! from the producer side so the producer can touch the device directly. Stalls
//! nest on the owning thread; the last guard to drop releases the lock. A batch
//! started on the stalling thread itself runs under the stall.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct LockState {
    batch_owner: Option<ThreadId>,
    stall_owner: Option<ThreadId>,
    stall_depth: u32,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.batch_owner.is_none() && self.stall_depth == 0
    }
}

/// Mutual exclusion between execution batches and producer stalls.
#[derive(Debug, Default)]
pub struct ExecutionLock {
    state: Mutex<LockState>,
    released: Condvar,
}

/// Held for the duration of one execution batch.
#[derive(Debug)]
#[must_use = "the batch ends when the guard is dropped"]
pub struct BatchGuard<'a> {
    lock: &'a ExecutionLock,
    owned: bool,
}

/// Held while the execution role is stalled.
#[derive(Debug)]
#[must_use = "the stall ends when the guard is dropped"]
pub struct StallGuard<'a> {
    lock: &'a ExecutionLock,
}

impl ExecutionLock {
    /// Creates an unlocked execution lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for one batch, waiting for any running batch or stall.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is already inside a batch; the lock is not
    /// reentrant and waiting would never return.
    pub fn lock_batch(&self) -> BatchGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.stall_owner == Some(me) {
            return BatchGuard { lock: self, owned: false };
        }
        if state.batch_owner == Some(me) {
            drop(state);
            tracing::error!("execution batch started from inside another batch");
            panic!("deadlock: execution lock is not reentrant");
        }
        while !state.is_free() {
            self.released.wait(&mut state);
        }
        state.batch_owner = Some(me);
        BatchGuard { lock: self, owned: true }
    }

    /// Stalls the execution role.
    ///
    /// The first stall waits for the running batch to finish; nested stalls from the
    /// same thread only bump the depth.
    pub fn stall(&self) -> StallGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.stall_owner == Some(me) {
            state.stall_depth += 1;
            return StallGuard { lock: self };
        }
        while !state.is_free() {
            self.released.wait(&mut state);
        }
        state.stall_owner = Some(me);
        state.stall_depth = 1;
        StallGuard { lock: self }
    }

    /// Returns true while at least one stall guard is alive.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.state.lock().stall_depth > 0
    }

    /// Returns true if the calling thread holds the current stall.
    ///
    /// Such a thread must not wait for execution work: every batch it waits for
    /// blocks in [`ExecutionLock::lock_batch`] behind its own stall.
    #[must_use]
    pub fn is_stalled_by_current_thread(&self) -> bool {
        let state = self.state.lock();
        state.stall_depth > 0 && state.stall_owner == Some(thread::current().id())
    }

    /// Current stall nesting depth.
    #[must_use]
    pub fn stall_depth(&self) -> u32 {
        self.state.lock().stall_depth
    }

    /// Returns true while a batch holds the lock.
    #[must_use]
    pub fn is_batch_active(&self) -> bool {
        self.state.lock().batch_owner.is_some()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.lock.state.lock().batch_owner = None;
            self.lock.released.notify_all();
        }
    }
}

impl Drop for StallGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.stall_depth -= 1;
        if state.stall_depth == 0 {
            state.stall_owner = None;
            drop(state);
            self.lock.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_nested_stalls_release_on_last_drop() {
        let lock = ExecutionLock::new();
        let outer = lock.stall();
        let inner = lock.stall();
        assert_eq!(lock.stall_depth(), 2);
        drop(inner);
        assert!(lock.is_stalled());
        drop(outer);
        assert!(!lock.is_stalled());
    }

    #[test]
    fn test_batch_on_stalling_thread_passes_through() {
        let lock = ExecutionLock::new();
        let _stall = lock.stall();
        let batch = lock.lock_batch();
        assert!(!lock.is_batch_active());
        drop(batch);
        assert!(lock.is_stalled());
    }

    #[test]
    fn test_stall_blocks_other_batches() {
        let lock = Arc::new(ExecutionLock::new());
        let ran = Arc::new(AtomicBool::new(false));
        let stall = lock.stall();

        let worker = {
            let lock = Arc::clone(&lock);
            let ran = Arc::clone(&ran);
            std::thread::spawn(move || {
                let _batch = lock.lock_batch();
                ran.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
        drop(stall);
        worker.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stall_owner_is_the_stalling_thread() {
        let lock = Arc::new(ExecutionLock::new());
        assert!(!lock.is_stalled_by_current_thread());

        let stall = lock.stall();
        assert!(lock.is_stalled_by_current_thread());
        let elsewhere = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.is_stalled_by_current_thread())
        };
        assert!(!elsewhere.join().unwrap());

        drop(stall);
        assert!(!lock.is_stalled_by_current_thread());
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn test_reentrant_batch_is_fatal() {
        let lock = ExecutionLock::new();
        let _outer = lock.lock_batch();
        let _inner = lock.lock_batch();
    }
}
