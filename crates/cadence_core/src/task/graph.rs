//! # Task Graph
//!
//! Prerequisite-driven tasks over a worker pool, an optional dedicated execution
//! thread, and the producer's local queue.
//!
//! ```text
//! spawn(target, prereqs, body) ──► PendingTask (counter = prereqs + 1)
//!                                      │ last prerequisite completes
//!                                      ▼
//!            ┌───────────────┬─────────┴──────────┬────────────────┐
//!            │ AnyWorker     │ Execution          │ Producer       │
//!            │ worker pool   │ dedicated thread   │ local queue    │
//!            │               │ (or producer queue)│ (cooperative)  │
//!            └───────────────┴────────────────────┴────────────────┘
//! ```
//!
//! Local queues are only serviced by their owner, and only while it waits. Waiting
//! on a role's queue from inside a task of that same role can never return; it is
//! detected and treated as fatal.

use super::context::{NamedThread, TaskContext};
use crate::error::{TaskGraphError, TaskGraphResult};
use crate::sync::{Fence, FenceSignal};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// How often a cooperative wait re-checks an abandoned fence.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

type TaskBody = Box<dyn FnOnce(&mut TaskContext) + Send>;

thread_local! {
    /// Target of the task currently running on this thread.
    static ACTIVE_TARGET: Cell<Option<NamedThread>> = const { Cell::new(None) };
    /// Nesting depth of tasks taken from the producer's local queue.
    static PRODUCER_QUEUE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Task graph configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskGraphConfig {
    /// Number of worker threads (at least 1).
    pub worker_count: usize,
    /// Spawn a dedicated execution thread.
    pub execution_thread: bool,
    /// Prefix for thread names.
    pub thread_name_prefix: String,
}

impl Default for TaskGraphConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
        Self {
            worker_count: cores.saturating_sub(2).clamp(1, 8),
            execution_thread: true,
            thread_name_prefix: "cadence".to_string(),
        }
    }
}

impl TaskGraphConfig {
    /// Config with an explicit worker count and a dedicated execution thread.
    #[must_use]
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            ..Self::default()
        }
    }

    /// One worker and no execution thread: execution work lands on the producer.
    #[must_use]
    pub fn inline_execution() -> Self {
        Self {
            worker_count: 1,
            execution_thread: false,
            ..Self::default()
        }
    }
}

enum Message {
    Run(Job),
    Wake,
    Shutdown,
}

struct Job {
    target: NamedThread,
    body: TaskBody,
    signal: FenceSignal,
}

/// Counters for the graph. Snapshot via [`TaskGraph::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskGraphStats {
    /// Tasks created.
    pub spawned: u64,
    /// Task bodies that ran to completion.
    pub executed: u64,
}

struct Queue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

struct Shared {
    workers: Queue,
    execution: Option<Queue>,
    producer: Queue,
    producer_thread: Mutex<ThreadId>,
    execution_thread: Mutex<Option<ThreadId>>,
    fatal: Mutex<Option<String>>,
    spawned: AtomicU64,
    executed: AtomicU64,
}

impl Shared {
    fn sender_for(&self, target: NamedThread) -> &Sender<Message> {
        match target {
            NamedThread::AnyWorker => &self.workers.tx,
            NamedThread::Execution => self.execution.as_ref().map_or(&self.producer.tx, |queue| &queue.tx),
            NamedThread::Producer => &self.producer.tx,
        }
    }

    fn enqueue(&self, job: Job) {
        let target = job.target;
        if self.sender_for(target).send(Message::Run(job)).is_err() {
            tracing::warn!(?target, "task queue closed, task abandoned");
        }
    }
}

/// A task waiting for its prerequisites.
struct PendingTask {
    remaining: AtomicUsize,
    job: Mutex<Option<Job>>,
    shared: Weak<Shared>,
}

impl PendingTask {
    fn release(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Some(job) = self.job.lock().take() else {
            return;
        };
        if let Some(shared) = self.shared.upgrade() {
            shared.enqueue(job);
        }
    }
}

/// Restores the thread-local task markers when a task body returns or unwinds.
struct ActiveTask {
    previous: Option<NamedThread>,
    from_producer_queue: bool,
}

impl ActiveTask {
    fn enter(target: NamedThread, from_producer_queue: bool) -> Self {
        let previous = ACTIVE_TARGET.with(|active| active.replace(Some(target)));
        if from_producer_queue {
            PRODUCER_QUEUE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        }
        Self {
            previous,
            from_producer_queue,
        }
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        ACTIVE_TARGET.with(|active| active.set(self.previous));
        if self.from_producer_queue {
            PRODUCER_QUEUE_DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }
}

fn run_job(shared: &Shared, job: Job, from_producer_queue: bool) {
    let Job { target, body, signal } = job;
    let _active = ActiveTask::enter(target, from_producer_queue);
    let mut context = TaskContext::new(target);
    body(&mut context);
    shared.executed.fetch_add(1, Ordering::Relaxed);
    context.complete(signal);
}

fn thread_loop(shared: &Arc<Shared>, rx: &Receiver<Message>) {
    for message in rx.iter() {
        match message {
            Message::Run(job) => run_job(shared, job, false),
            Message::Wake => {}
            Message::Shutdown => break,
        }
    }
}

/// The task scheduler.
///
/// The thread that creates the graph becomes the producer; see
/// [`TaskGraph::attach_producer`] to move that role.
pub struct TaskGraph {
    shared: Arc<Shared>,
    config: TaskGraphConfig,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TaskGraph {
    /// Starts the worker pool and, if configured, the execution thread.
    ///
    /// # Errors
    ///
    /// Returns [`TaskGraphError::ThreadSpawn`] if the OS refuses a thread.
    pub fn new(config: TaskGraphConfig) -> TaskGraphResult<Self> {
        let shared = Arc::new(Shared {
            workers: Queue::new(),
            execution: config.execution_thread.then(Queue::new),
            producer: Queue::new(),
            producer_thread: Mutex::new(thread::current().id()),
            execution_thread: Mutex::new(None),
            fatal: Mutex::new(None),
            spawned: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        });

        let graph = Self {
            shared,
            config,
            threads: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        };

        for index in 0..graph.config.worker_count.max(1) {
            let shared = Arc::clone(&graph.shared);
            let name = format!("{}-worker-{index}", graph.config.thread_name_prefix);
            graph.start_thread(name, move || {
                let rx = shared.workers.rx.clone();
                thread_loop(&shared, &rx);
            })?;
        }

        if graph.shared.execution.is_some() {
            let shared = Arc::clone(&graph.shared);
            let name = format!("{}-execution", graph.config.thread_name_prefix);
            graph.start_thread(name, move || {
                *shared.execution_thread.lock() = Some(thread::current().id());
                if let Some(rx) = shared.execution.as_ref().map(|queue| queue.rx.clone()) {
                    thread_loop(&shared, &rx);
                }
            })?;
        }

        tracing::info!(
            workers = graph.config.worker_count.max(1),
            execution_thread = graph.config.execution_thread,
            "task graph started"
        );
        Ok(graph)
    }

    fn start_thread<F>(&self, name: String, body: F) -> TaskGraphResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|source| TaskGraphError::ThreadSpawn { name, source })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Makes the calling thread the producer.
    pub fn attach_producer(&self) {
        *self.shared.producer_thread.lock() = thread::current().id();
    }

    /// Returns true if the calling thread is the producer.
    #[must_use]
    pub fn is_producer_thread(&self) -> bool {
        *self.shared.producer_thread.lock() == thread::current().id()
    }

    /// Returns true if the calling thread is the dedicated execution thread.
    #[must_use]
    pub fn is_execution_thread(&self) -> bool {
        *self.shared.execution_thread.lock() == Some(thread::current().id())
    }

    /// Returns true if execution work runs on a dedicated thread.
    #[inline]
    #[must_use]
    pub fn has_execution_thread(&self) -> bool {
        self.shared.execution.is_some()
    }

    /// Number of worker threads.
    #[inline]
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.config.worker_count.max(1)
    }

    /// Returns true if the calling thread is inside a task of `role`.
    ///
    /// For [`NamedThread::Producer`] this means a task taken from the producer's
    /// local queue.
    #[must_use]
    pub fn is_thread_processing(&self, role: NamedThread) -> bool {
        match role {
            NamedThread::Producer => PRODUCER_QUEUE_DEPTH.with(Cell::get) > 0,
            other => ACTIVE_TARGET.with(Cell::get) == Some(other),
        }
    }

    /// Creates a task that runs `body` on `target` once all `prerequisites` complete.
    ///
    /// # Returns
    ///
    /// The task's completion fence. It completes after `body` returns and after every
    /// fence passed to [`TaskContext::dont_complete_until`].
    pub fn spawn<F>(&self, target: NamedThread, prerequisites: &[Fence], body: F) -> Fence
    where
        F: FnOnce(&mut TaskContext) + Send + 'static,
    {
        let (fence, signal) = Fence::new();
        self.shared.spawned.fetch_add(1, Ordering::Relaxed);

        let pending = Arc::new(PendingTask {
            remaining: AtomicUsize::new(prerequisites.len() + 1),
            job: Mutex::new(Some(Job {
                target,
                body: Box::new(body),
                signal,
            })),
            shared: Arc::downgrade(&self.shared),
        });

        for prerequisite in prerequisites {
            let pending = Arc::clone(&pending);
            prerequisite.on_complete(move || pending.release());
        }
        pending.release();
        fence
    }

    /// Blocks until `fence` completes, servicing `role`'s local queue if the
    /// calling thread owns it.
    ///
    /// # Panics
    ///
    /// Fatal if the calling thread is already processing a task of `role`: the queue
    /// that would complete the fence is the one this thread is stuck inside.
    pub fn wait_until(&self, fence: &Fence, role: NamedThread) {
        if fence.is_complete() {
            return;
        }
        if role != NamedThread::AnyWorker && self.is_thread_processing(role) {
            self.fatal(&format!(
                "deadlock: waiting on fence {} from inside a {role:?} task",
                fence.id()
            ));
        }
        match self.local_queue(role) {
            Some(queue) => self.service_until(fence, queue),
            None => fence.wait(),
        }
    }

    /// Waits for every fence in `fences` with [`TaskGraph::wait_until`].
    pub fn wait_until_all(&self, fences: &[Fence], role: NamedThread) {
        for fence in fences {
            self.wait_until(fence, role);
        }
    }

    /// Spins until `fence` completes without servicing any queue.
    ///
    /// For callers already inside a local task, where servicing is not an option
    /// but the work being waited on runs elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if the fence is abandoned.
    pub fn spin_until(&self, fence: &Fence) {
        while !fence.is_complete() {
            fence.assert_not_abandoned();
            thread::yield_now();
        }
    }

    /// Runs every task currently queued on the producer's local queue.
    ///
    /// Returns the number of tasks run. Does nothing off the producer thread.
    pub fn process_until_idle(&self) -> usize {
        if !self.is_producer_thread() {
            return 0;
        }
        let mut processed = 0;
        while let Ok(message) = self.shared.producer.rx.try_recv() {
            if let Message::Run(job) = message {
                run_job(&self.shared, job, true);
                processed += 1;
            }
        }
        processed
    }

    /// Records a fatal condition and panics with `message`.
    ///
    /// The first message is kept and can be read back with [`TaskGraph::take_fatal`]
    /// from another thread, since the panic itself may unwind a thread nobody joins.
    pub fn fatal(&self, message: &str) -> ! {
        tracing::error!(reason = message, "fatal task graph condition");
        self.shared.fatal.lock().get_or_insert_with(|| message.to_string());
        panic!("{message}");
    }

    /// Returns true once any fatal condition was recorded and not yet taken.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.shared.fatal.lock().is_some()
    }

    /// The first recorded fatal message, left in place.
    #[must_use]
    pub fn fatal_message(&self) -> Option<String> {
        self.shared.fatal.lock().clone()
    }

    /// Takes the first recorded fatal message, if any.
    #[must_use]
    pub fn take_fatal(&self) -> Option<String> {
        self.shared.fatal.lock().take()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> TaskGraphStats {
        TaskGraphStats {
            spawned: self.shared.spawned.load(Ordering::Relaxed),
            executed: self.shared.executed.load(Ordering::Relaxed),
        }
    }

    /// Stops and joins every thread. Tasks already queued run first.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.worker_count() {
            let _ = self.shared.workers.tx.send(Message::Shutdown);
        }
        if let Some(queue) = &self.shared.execution {
            let _ = queue.tx.send(Message::Shutdown);
        }

        let me = thread::current().id();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("task graph thread panicked");
            }
        }
        tracing::info!("task graph stopped");
    }

    fn local_queue(&self, role: NamedThread) -> Option<(&Receiver<Message>, &Sender<Message>)> {
        match role {
            NamedThread::Producer if self.is_producer_thread() => {
                Some((&self.shared.producer.rx, &self.shared.producer.tx))
            }
            NamedThread::Execution => match &self.shared.execution {
                Some(queue) if self.is_execution_thread() => Some((&queue.rx, &queue.tx)),
                None if self.is_producer_thread() => {
                    Some((&self.shared.producer.rx, &self.shared.producer.tx))
                }
                _ => None,
            },
            _ => None,
        }
    }

    fn service_until(&self, fence: &Fence, (rx, tx): (&Receiver<Message>, &Sender<Message>)) {
        let wake = tx.clone();
        fence.on_complete(move || {
            let _ = wake.send(Message::Wake);
        });
        let from_producer_queue = rx.same_channel(&self.shared.producer.rx);

        loop {
            if fence.is_complete() {
                return;
            }
            fence.assert_not_abandoned();
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Message::Run(job)) => run_job(&self.shared, job, from_producer_queue),
                Ok(Message::Shutdown) => {
                    // Not ours to consume; hand it back to the owning loop.
                    let _ = tx.send(Message::Shutdown);
                    fence.wait();
                    return;
                }
                Ok(Message::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    fence.wait();
                    return;
                }
            }
        }
    }
}

impl Drop for TaskGraph {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
