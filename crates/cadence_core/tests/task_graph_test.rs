//! Integration tests for fences, the execution lock and the task graph working together.

use cadence_core::{ExecutionLock, Fence, NamedThread, TaskGraph, TaskGraphConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_fence_is_monotonic_across_observers() {
    let (fence, signal) = Fence::new();
    let saw_regression = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let observers: Vec<_> = (0..4)
        .map(|_| {
            let fence = fence.clone();
            let saw_regression = Arc::clone(&saw_regression);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen_complete = false;
                while !stop.load(Ordering::Acquire) {
                    let now = fence.is_complete();
                    if seen_complete && !now {
                        saw_regression.store(true, Ordering::Release);
                    }
                    seen_complete |= now;
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    signal.signal();
    thread::sleep(Duration::from_millis(5));
    stop.store(true, Ordering::Release);
    for observer in observers {
        observer.join().unwrap();
    }

    assert!(fence.is_complete());
    assert!(!saw_regression.load(Ordering::Acquire));
}

#[test]
fn test_fan_in_runs_after_all_prerequisites() {
    let graph = TaskGraph::new(TaskGraphConfig::with_workers(4)).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    let producers: Vec<Fence> = (0..32)
        .map(|_| {
            let finished = Arc::clone(&finished);
            graph.spawn(NamedThread::AnyWorker, &[], move |_| {
                thread::sleep(Duration::from_micros(200));
                finished.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let observed = Arc::new(AtomicUsize::new(0));
    let join = {
        let finished = Arc::clone(&finished);
        let observed = Arc::clone(&observed);
        graph.spawn(NamedThread::Execution, &producers, move |_| {
            observed.store(finished.load(Ordering::SeqCst), Ordering::SeqCst);
        })
    };

    graph.wait_until(&join, NamedThread::Producer);
    assert_eq!(observed.load(Ordering::SeqCst), 32);
}

#[test]
fn test_execution_chain_preserves_order() {
    let graph = TaskGraph::new(TaskGraphConfig::with_workers(4)).unwrap();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut previous: Option<Fence> = None;
    for index in 0..50 {
        let log = Arc::clone(&log);
        let prerequisites: Vec<Fence> = previous.iter().cloned().collect();
        previous = Some(graph.spawn(NamedThread::Execution, &prerequisites, move |_| {
            log.lock().push(index);
        }));
    }

    if let Some(last) = previous {
        graph.wait_until(&last, NamedThread::Producer);
    }
    assert_eq!(*log.lock(), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_stall_waits_for_running_batch() {
    let lock = Arc::new(ExecutionLock::new());
    let (started, batch_started) = Fence::new();
    let batch_done = Arc::new(AtomicBool::new(false));

    let batch = {
        let lock = Arc::clone(&lock);
        let batch_done = Arc::clone(&batch_done);
        thread::spawn(move || {
            let _guard = lock.lock_batch();
            batch_started.signal();
            thread::sleep(Duration::from_millis(20));
            batch_done.store(true, Ordering::SeqCst);
        })
    };

    started.wait();
    let stall = lock.stall();
    assert!(batch_done.load(Ordering::SeqCst));
    assert!(lock.is_stalled());
    drop(stall);
    batch.join().unwrap();
}

#[test]
fn test_self_wait_on_execution_role_is_detected() {
    let graph = Arc::new(TaskGraph::new(TaskGraphConfig::with_workers(2)).unwrap());
    let inner = Arc::clone(&graph);
    let task = graph.spawn(NamedThread::Execution, &[], move |_| {
        let (never, _keep) = Fence::new();
        inner.wait_until(&never, NamedThread::Execution);
    });

    // The execution thread dies on the fatal; its task fence is abandoned, so the
    // waiter panics instead of hanging.
    let start = Instant::now();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        graph.wait_until(&task, NamedThread::Producer);
    }));
    assert!(outcome.is_err());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(graph.take_fatal().is_some_and(|message| message.contains("deadlock")));
}
