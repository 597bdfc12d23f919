//! # One-Shot Fences
//!
//! A [`Fence`] is a reference-counted completion token. Its signal side is a separate,
//! move-only [`FenceSignal`]; `signal` consumes it, so a fence completes at most once.
//!
//! ```text
//!   producer                      execution role
//!   ────────                      ──────────────
//!   let (fence, signal) = Fence::new();
//!   record(SignalFence(signal)) ──►  signal.signal()
//!   fence.wait()  ◄──────────────────  pending → signaled
//! ```
//!
//! Dropping a `FenceSignal` without signaling abandons the fence. Waiters on an
//! abandoned fence panic instead of hanging, which is how a fatal error on one
//! thread reaches the threads waiting on its work.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Callback run once when a fence completes.
type Subsequent = Box<dyn FnOnce() + Send>;

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

struct FenceState {
    id: u64,
    complete: AtomicBool,
    abandoned: AtomicBool,
    /// Subsequents waiting for completion. Guarded together with the flags.
    subsequents: Mutex<Vec<Subsequent>>,
    condvar: Condvar,
}

impl FenceState {
    fn new(complete: bool) -> Self {
        Self {
            id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
            complete: AtomicBool::new(complete),
            abandoned: AtomicBool::new(false),
            subsequents: Mutex::new(Vec::new()),
            condvar: Condvar::new(),
        }
    }
}

/// Shared, read-side handle of a one-shot completion token.
#[derive(Clone)]
pub struct Fence {
    state: Arc<FenceState>,
}

/// Write-side handle of a [`Fence`]. Consumed by [`FenceSignal::signal`].
pub struct FenceSignal {
    state: Option<Arc<FenceState>>,
}

impl Fence {
    /// Creates a pending fence and its signal handle.
    #[must_use]
    pub fn new() -> (Self, FenceSignal) {
        let state = Arc::new(FenceState::new(false));
        (
            Self { state: Arc::clone(&state) },
            FenceSignal { state: Some(state) },
        )
    }

    /// Creates a fence that is already complete.
    #[must_use]
    pub fn signaled() -> Self {
        Self {
            state: Arc::new(FenceState::new(true)),
        }
    }

    /// Process-unique id, for logging.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Returns true once the fence has been signaled. Never flips back.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.complete.load(Ordering::Acquire)
    }

    /// Returns true if the signal side was dropped without signaling.
    #[inline]
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.state.abandoned.load(Ordering::Acquire)
    }

    /// Returns true if both handles refer to the same fence.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Runs `subsequent` once the fence completes.
    ///
    /// Runs it immediately on the calling thread if the fence is already complete.
    /// If the fence is abandoned the callback is dropped without running.
    pub fn on_complete<F>(&self, subsequent: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.state.subsequents.lock();
            if !self.is_complete() {
                if !self.is_abandoned() {
                    pending.push(Box::new(subsequent));
                }
                return;
            }
        }
        subsequent();
    }

    /// Blocks the calling thread until the fence completes.
    ///
    /// This is a plain blocking wait. Threads that own a local task queue should go
    /// through `TaskGraph::wait_until` so the queue keeps being serviced.
    ///
    /// # Panics
    ///
    /// Panics if the fence is abandoned.
    pub fn wait(&self) {
        if self.is_complete() {
            return;
        }
        let mut guard = self.state.subsequents.lock();
        while !self.is_complete() {
            self.assert_not_abandoned();
            self.state.condvar.wait(&mut guard);
        }
    }

    /// Waits up to `timeout`. Returns true if the fence completed.
    ///
    /// # Panics
    ///
    /// Panics if the fence is abandoned.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_complete() {
            return true;
        }
        let mut guard = self.state.subsequents.lock();
        if !self.is_complete() {
            self.assert_not_abandoned();
            self.state.condvar.wait_for(&mut guard, timeout);
        }
        self.assert_not_abandoned();
        self.is_complete()
    }

    pub(crate) fn assert_not_abandoned(&self) {
        if self.is_abandoned() && !self.is_complete() {
            panic!("fence {} abandoned before it was signaled", self.state.id);
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.state.id)
            .field("complete", &self.is_complete())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

impl FenceSignal {
    /// Returns a read handle for the fence this signal completes.
    #[must_use]
    pub fn fence(&self) -> Fence {
        match &self.state {
            Some(state) => Fence { state: Arc::clone(state) },
            None => unreachable!("fence signal used after signaling"),
        }
    }

    /// Completes the fence, wakes every waiter and runs the subsequents.
    pub fn signal(mut self) {
        if let Some(state) = self.state.take() {
            let subsequents = {
                let mut pending = state.subsequents.lock();
                state.complete.store(true, Ordering::Release);
                std::mem::take(&mut *pending)
            };
            state.condvar.notify_all();
            for subsequent in subsequents {
                subsequent();
            }
        }
    }
}

impl Drop for FenceSignal {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::warn!(fence = state.id, "fence signal dropped without signaling");
            let dropped = {
                let mut pending = state.subsequents.lock();
                state.abandoned.store(true, Ordering::Release);
                std::mem::take(&mut *pending)
            };
            state.condvar.notify_all();
            // Subsequents hold the signals of dependent work; dropping them abandons
            // that work in turn.
            drop(dropped);
        }
    }
}

impl fmt::Debug for FenceSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceSignal")
            .field("id", &self.state.as_ref().map(|state| state.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_signal_completes_once() {
        let (fence, signal) = Fence::new();
        assert!(!fence.is_complete());
        signal.signal();
        assert!(fence.is_complete());
        assert!(fence.is_complete());
    }

    #[test]
    fn test_completed_wait_returns_immediately() {
        let fence = Fence::signaled();
        let start = Instant::now();
        fence.wait();
        assert!(fence.wait_timeout(Duration::from_millis(1)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_cross_thread_wait() {
        let (fence, signal) = Fence::new();
        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait())
        };
        thread::sleep(Duration::from_millis(10));
        signal.signal();
        waiter.join().unwrap();
        assert!(fence.is_complete());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (fence, _signal) = Fence::new();
        assert!(!fence.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_subsequents_run_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (fence, signal) = Fence::new();
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            fence.on_complete(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        signal.signal();
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let late = Arc::clone(&counter);
        fence.on_complete(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    #[should_panic(expected = "abandoned")]
    fn test_abandoned_fence_panics_waiter() {
        let (fence, signal) = Fence::new();
        drop(signal);
        fence.wait();
    }

    #[test]
    fn test_abandon_drops_subsequents() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (fence, signal) = Fence::new();
        let seen = Arc::clone(&counter);
        fence.on_complete(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        drop(signal);
        assert!(fence.is_abandoned());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
