//! # Executor
//!
//! The injected service that owns the default context and the execution pipeline.
//!
//! ```text
//!  producer                    execution role              workers
//!  ────────                    ──────────────              ───────
//!  ImmediateCommandList
//!     │ dispatch()
//!     ├──► dispatch task ──────► execute task ─► default context
//!     │    (chained on the       (chained on the
//!     │     previous dispatch)    previous execute)
//!     └──► translate tasks ─────────────────────────────► deferred contexts
//! ```
//!
//! Every piece of pipeline state lives here instead of in globals: the outstanding
//! task fences, the last dispatch and execute tasks, the bypass latch, and the
//! execution lock that serializes batches against producer stalls.

use crate::backend::{CommandContext, Device};
use crate::command::ExecuteEnv;
use crate::command_list::{CommandList, ListSource, ListTracker};
use crate::config::TunablesHandle;
use crate::error::RhiResult;
use cadence_core::{ExecutionLock, Fence, NamedThread, StallGuard, TaskGraph, TaskGraphConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long a stalled producer lets an execution task finish before calling it a deadlock.
const STALLED_WAIT_GRACE: Duration = Duration::from_millis(50);

/// Counters snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Top-level lists walked on the execution role.
    pub lists_executed: u64,
    /// Commands in those lists.
    pub commands_executed: u64,
    /// Commands executed inline while bypassed.
    pub inline_commands: u64,
    /// Dispatches that handed a list to the execution role.
    pub dispatches: u64,
    /// Translate groups submitted through deferred contexts.
    pub parallel_groups: u64,
    /// Lists of parallel submissions that fell back to serial translation.
    pub serial_submits: u64,
    /// Bypass latch changes.
    pub bypass_toggles: u64,
    /// Granted execution stalls.
    pub stalls: u64,
}

#[derive(Default)]
struct StatCounters {
    lists_executed: AtomicU64,
    commands_executed: AtomicU64,
    inline_commands: AtomicU64,
    dispatches: AtomicU64,
    parallel_groups: AtomicU64,
    serial_submits: AtomicU64,
    bypass_toggles: AtomicU64,
    stalls: AtomicU64,
}

#[derive(Clone, Copy)]
pub(crate) enum Stat {
    InlineCommands,
    Dispatches,
    ParallelGroups,
    SerialSubmits,
}

/// Pipeline bookkeeping, guarded by one mutex.
#[derive(Default)]
pub(crate) struct PipelineState {
    /// Last dispatch task.
    pub(crate) dispatch_task: Option<Fence>,
    /// Last execute task.
    pub(crate) execution_task: Option<Fence>,
    /// Fences the next dispatch must wait for.
    pub(crate) all_outstanding: Vec<Fence>,
    /// Fences [`Executor::wait_for_tasks`] waits for.
    pub(crate) wait_outstanding: Vec<Fence>,
}

impl PipelineState {
    fn clear_completed(&mut self) {
        if self.dispatch_task.as_ref().is_some_and(Fence::is_complete) {
            self.dispatch_task = None;
        }
        if self.execution_task.as_ref().is_some_and(Fence::is_complete) {
            self.execution_task = None;
        }
    }
}

/// Owns the default context, the task graph and the pipeline state.
///
/// Shared as `Arc<Executor>` between the immediate list and the tasks it spawns.
pub struct Executor {
    device: Arc<dyn Device>,
    context: Mutex<Box<dyn CommandContext>>,
    execution_lock: ExecutionLock,
    tasks: TaskGraph,
    tunables: TunablesHandle,
    lists: ListTracker,
    bypass: AtomicBool,
    parallel: AtomicBool,
    pub(crate) pipeline: Mutex<PipelineState>,
    stats: StatCounters,
}

impl Executor {
    /// Starts the task graph and creates the default context.
    ///
    /// The calling thread becomes the producer. Without an execution thread (turned
    /// off, or refused by the device) the executor stays bypassed for its lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`crate::RhiError::Config`] for out-of-range tunables and
    /// [`crate::RhiError::TaskGraph`] if a thread cannot be spawned.
    pub fn new(device: Arc<dyn Device>, tunables: TunablesHandle) -> RhiResult<Arc<Self>> {
        let snapshot = tunables.snapshot();
        snapshot.validate()?;

        let execution_thread = snapshot.use_execution_thread && device.supports_execution_thread();
        let tasks = TaskGraph::new(TaskGraphConfig {
            worker_count: snapshot.worker_width,
            execution_thread,
            thread_name_prefix: "cadence".to_string(),
        })?;

        let bypass = snapshot.bypass || !execution_thread;
        let context = device.create_default_context();

        tracing::info!(
            device = device.name(),
            execution_thread,
            bypass,
            workers = snapshot.worker_width,
            "executor started"
        );

        Ok(Arc::new(Self {
            device,
            context: Mutex::new(context),
            execution_lock: ExecutionLock::new(),
            tasks,
            tunables,
            lists: ListTracker::new(),
            bypass: AtomicBool::new(bypass),
            parallel: AtomicBool::new(!bypass && snapshot.use_parallel_algorithms),
            pipeline: Mutex::new(PipelineState::default()),
            stats: StatCounters::default(),
        }))
    }

    /// The device.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// The task graph.
    #[inline]
    #[must_use]
    pub const fn tasks(&self) -> &TaskGraph {
        &self.tasks
    }

    /// The tunables.
    #[inline]
    #[must_use]
    pub const fn tunables(&self) -> &TunablesHandle {
        &self.tunables
    }

    /// Tracker counting every live list created by this executor.
    #[inline]
    #[must_use]
    pub const fn lists(&self) -> &ListTracker {
        &self.lists
    }

    /// Creates a list for recording off the producer.
    #[must_use]
    pub fn create_command_list(&self) -> CommandList {
        CommandList::new(&self.lists)
    }

    /// Records a new list on a worker once `prerequisites` completed.
    ///
    /// # Returns
    ///
    /// The recording fence and the list source. Both can go into a submission
    /// right away; the list is picked up after the fence completed.
    pub fn spawn_recording<F>(&self, prerequisites: &[Fence], record: F) -> (Fence, ListSource)
    where
        F: FnOnce(&mut CommandList) + Send + 'static,
    {
        let mut list = self.create_command_list();
        let (slot, receiver) = crossbeam_channel::bounded(1);
        let fence = self
            .tasks
            .spawn(NamedThread::AnyWorker, prerequisites, move |_| {
                record(&mut list);
                if let Err(returned) = slot.send(list) {
                    tracing::debug!(list = returned.0.uid(), "recorded list no longer wanted");
                }
            });
        (fence, ListSource::Recording(receiver))
    }

    /// Live lists, the immediate list included.
    #[inline]
    #[must_use]
    pub fn outstanding_lists(&self) -> usize {
        self.lists.outstanding()
    }

    /// Returns true if recording executes inline.
    #[inline]
    #[must_use]
    pub fn bypass(&self) -> bool {
        self.bypass.load(Ordering::Acquire)
    }

    /// Whether parallel translation was allowed at the last latch.
    #[inline]
    #[must_use]
    pub fn use_parallel_algorithms(&self) -> bool {
        self.parallel.load(Ordering::Acquire)
    }

    /// Returns true if a dedicated execution thread exists.
    #[inline]
    #[must_use]
    pub fn has_execution_thread(&self) -> bool {
        self.tasks.has_execution_thread()
    }

    /// Re-reads the bypass tunable. Only meaningful on the producer between frames.
    ///
    /// # Panics
    ///
    /// Fatal if any list besides the immediate list is alive, or if the immediate
    /// list still holds commands.
    pub(crate) fn latch_bypass(&self, immediate_has_commands: bool) {
        let outstanding = self.outstanding_lists();
        if outstanding != 1 || immediate_has_commands {
            self.tasks.fatal(&format!(
                "bypass latched with {outstanding} live command lists (immediate list has commands: {immediate_has_commands})"
            ));
        }

        let tunables = self.tunables.snapshot();
        let bypass =
            !self.has_execution_thread() || !self.tasks.is_producer_thread() || tunables.bypass;
        if bypass != self.bypass() {
            if bypass {
                self.device.flush_pending_deletes();
            }
            self.stats.bypass_toggles.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(bypass, "bypass latched");
        }
        self.bypass.store(bypass, Ordering::Release);
        self.parallel
            .store(!bypass && tunables.use_parallel_algorithms, Ordering::Release);
    }

    /// Fatal unless the immediate list is the only live list.
    pub fn check_no_outstanding_lists(&self) {
        let outstanding = self.outstanding_lists();
        if outstanding != 1 {
            self.tasks.fatal(&format!(
                "{} command lists still alive besides the immediate list",
                outstanding.saturating_sub(1)
            ));
        }
    }

    /// Runs `work` against the default context on the calling thread.
    ///
    /// Takes the execution lock for the duration, so it never interleaves with a
    /// batch. A producer holding a stall passes straight through.
    pub(crate) fn with_default_context<R>(
        &self,
        role: NamedThread,
        work: impl FnOnce(&mut ExecuteEnv<'_>) -> R,
    ) -> R {
        let _batch = self.execution_lock.lock_batch();
        let mut context = self.context.lock();
        let mut env = ExecuteEnv::new(context.as_mut(), &self.tasks, role);
        work(&mut env)
    }

    /// Executes `list` inline on the producer. The bypass path.
    pub(crate) fn execute_inline(&self, list: CommandList) {
        let executed = self.with_default_context(NamedThread::Producer, |env| list.execute(env));
        self.stats
            .inline_commands
            .fetch_add(executed as u64, Ordering::Relaxed);
    }

    /// One execution batch: the whole list under the execution lock.
    pub(crate) fn run_batch(&self, list: CommandList) {
        let uid = list.uid();
        let executed = self.with_default_context(NamedThread::Execution, |env| list.execute(env));
        self.stats.lists_executed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .commands_executed
            .fetch_add(executed as u64, Ordering::Relaxed);
        tracing::trace!(list = uid, commands = executed, "executed command list");
    }

    pub(crate) fn count(&self, stat: Stat, amount: u64) {
        let counter = match stat {
            Stat::InlineCommands => &self.stats.inline_commands,
            Stat::Dispatches => &self.stats.dispatches,
            Stat::ParallelGroups => &self.stats.parallel_groups,
            Stat::SerialSubmits => &self.stats.serial_submits,
        };
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Makes the next dispatch wait for `fence`.
    pub fn add_outstanding_task(&self, fence: Fence) {
        if !fence.is_complete() {
            self.pipeline.lock().all_outstanding.push(fence);
        }
    }

    /// Makes [`Executor::wait_for_tasks`] wait for `fence`.
    pub fn add_wait_task(&self, fence: Fence) {
        if !fence.is_complete() {
            self.pipeline.lock().wait_outstanding.push(fence);
        }
    }

    /// Returns true if a fence is queued for the next dispatch.
    #[must_use]
    pub fn has_outstanding_tasks(&self) -> bool {
        self.pipeline
            .lock()
            .all_outstanding
            .iter()
            .any(|fence| !fence.is_complete())
    }

    /// Waits cooperatively on the producer until `fence` completes.
    ///
    /// Does not dispatch. Go through the immediate list's `wait_on` when the fence
    /// may still be sitting in undispatched commands.
    ///
    /// # Panics
    ///
    /// Fatal if called from inside a producer-queue task, or from the execution
    /// role while `fence` is pending: the execution role may be the only one left
    /// to signal it.
    pub fn wait_on(&self, fence: &Fence) {
        if fence.is_complete() {
            return;
        }
        if self.tasks.is_execution_thread() || self.tasks.is_thread_processing(NamedThread::Execution) {
            self.tasks.fatal(&format!(
                "deadlock: wait_on fence {} from the execution role",
                fence.id()
            ));
        }
        self.tasks.wait_until(fence, NamedThread::Producer);
    }

    /// Fatal if the caller holds an execution stall and `task` has not completed.
    ///
    /// A batch that released the lock just before the stall was granted still has
    /// to complete its fence, so `task` gets a short grace period first.
    fn check_stalled_wait(&self, task: &Fence) {
        if task.is_complete() || !self.execution_lock.is_stalled_by_current_thread() {
            return;
        }
        if task.wait_timeout(STALLED_WAIT_GRACE) {
            return;
        }
        self.tasks.fatal(&format!(
            "deadlock: waiting on execution task {} while this thread holds an execution stall",
            task.id()
        ));
    }

    /// Waits for every fence registered with [`Executor::add_wait_task`].
    ///
    /// From inside a producer-queue task this spins instead of servicing the queue.
    pub fn wait_for_tasks(&self) {
        let waits = std::mem::take(&mut self.pipeline.lock().wait_outstanding);
        let nested = self.tasks.is_thread_processing(NamedThread::Producer);
        for fence in &waits {
            if nested {
                self.tasks.spin_until(fence);
            } else {
                self.tasks.wait_until(fence, NamedThread::Producer);
            }
        }
    }

    /// Waits until the last dispatch task completed.
    ///
    /// # Panics
    ///
    /// Fatal if called from inside a producer-queue task while a dispatch is pending:
    /// the dispatch may be queued behind the caller. Fatal as well while the caller
    /// holds an execution stall.
    pub fn wait_for_dispatch(&self) {
        loop {
            let Some(dispatch) = self.pipeline.lock().dispatch_task.clone() else {
                return;
            };
            self.check_stalled_wait(&dispatch);
            if !dispatch.is_complete() {
                if self.tasks.is_thread_processing(NamedThread::Producer) {
                    self.tasks.fatal(&format!(
                        "deadlock: wait_for_dispatch on fence {} from inside a producer task",
                        dispatch.id()
                    ));
                }
                self.tasks.wait_until(&dispatch, NamedThread::Producer);
            }
            let mut pipeline = self.pipeline.lock();
            if pipeline
                .dispatch_task
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&dispatch))
            {
                pipeline.dispatch_task = None;
                return;
            }
        }
    }

    /// Waits until every dispatched list finished executing.
    ///
    /// From inside a producer-queue task this spins instead of servicing the queue.
    ///
    /// # Panics
    ///
    /// Fatal if the caller holds an execution stall while work is in flight.
    pub fn wait_for_execution_tasks(&self) {
        let nested = self.tasks.is_thread_processing(NamedThread::Producer);
        let wait = |fence: &Fence| {
            self.check_stalled_wait(fence);
            if nested {
                self.tasks.spin_until(fence);
            } else {
                self.tasks.wait_until(fence, NamedThread::Producer);
            }
        };

        loop {
            let (dispatch, execution) = {
                let mut pipeline = self.pipeline.lock();
                pipeline.clear_completed();
                (pipeline.dispatch_task.clone(), pipeline.execution_task.clone())
            };
            match (dispatch, execution) {
                (None, None) => return,
                (Some(dispatch), _) => wait(&dispatch),
                (None, Some(execution)) => wait(&execution),
            }
        }
    }

    /// Returns true while a dispatch or execute task is in flight.
    #[must_use]
    pub fn is_execution_active(&self) -> bool {
        let mut pipeline = self.pipeline.lock();
        pipeline.clear_completed();
        pipeline.dispatch_task.is_some() || pipeline.execution_task.is_some()
    }

    /// Returns true if nothing is queued, in flight or awaited.
    #[must_use]
    pub fn is_completely_flushed(&self) -> bool {
        let mut pipeline = self.pipeline.lock();
        pipeline.clear_completed();
        pipeline.dispatch_task.is_none()
            && pipeline.execution_task.is_none()
            && pipeline.all_outstanding.iter().all(Fence::is_complete)
            && pipeline.wait_outstanding.iter().all(Fence::is_complete)
    }

    /// Blocks the execution role so the producer may use the default context.
    ///
    /// # Returns
    ///
    /// `None` when nothing is in flight, so no stall is needed; also `None` after
    /// simply waiting for the execution tasks when async dispatch is off. Otherwise
    /// a guard that holds the execution lock until dropped.
    #[must_use]
    pub fn stall_execution(&self) -> Option<ExecutionStall<'_>> {
        if self.bypass() {
            return None;
        }
        if !self.tunables.snapshot().async_dispatch {
            self.wait_for_execution_tasks();
            return None;
        }
        if !self.execution_lock.is_stalled() && !self.is_execution_active() {
            return None;
        }
        self.stats.stalls.fetch_add(1, Ordering::Relaxed);
        let guard = self.execution_lock.stall();
        tracing::debug!(depth = self.execution_lock.stall_depth(), "execution stalled");
        Some(ExecutionStall {
            _guard: guard,
            executor: self,
        })
    }

    /// Returns true while a producer stall is held.
    #[inline]
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.execution_lock.is_stalled()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            lists_executed: self.stats.lists_executed.load(Ordering::Relaxed),
            commands_executed: self.stats.commands_executed.load(Ordering::Relaxed),
            inline_commands: self.stats.inline_commands.load(Ordering::Relaxed),
            dispatches: self.stats.dispatches.load(Ordering::Relaxed),
            parallel_groups: self.stats.parallel_groups.load(Ordering::Relaxed),
            serial_submits: self.stats.serial_submits.load(Ordering::Relaxed),
            bypass_toggles: self.stats.bypass_toggles.load(Ordering::Relaxed),
            stalls: self.stats.stalls.load(Ordering::Relaxed),
        }
    }

    /// Drains the pipeline and joins the task graph threads.
    ///
    /// The immediate list flushes its own commands before calling this.
    pub fn shutdown(&self) {
        if self.tasks.is_producer_thread() {
            self.wait_for_dispatch();
            self.wait_for_execution_tasks();
            self.wait_for_tasks();
        }
        self.tasks.shutdown();
        self.device.flush_pending_deletes();
        tracing::info!(stats = ?self.stats(), "executor shut down");
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("device", &self.device.name())
            .field("bypass", &self.bypass())
            .field("execution_thread", &self.has_execution_thread())
            .field("outstanding_lists", &self.outstanding_lists())
            .finish_non_exhaustive()
    }
}

/// A held execution stall. The execution role resumes when the last one drops.
pub struct ExecutionStall<'a> {
    _guard: StallGuard<'a>,
    executor: &'a Executor,
}

impl ExecutionStall<'_> {
    /// Runs `work` directly against the default context.
    pub fn with_context<R>(&self, work: impl FnOnce(&mut dyn CommandContext) -> R) -> R {
        let mut context = self.executor.context.lock();
        work(context.as_mut())
    }
}

impl std::fmt::Debug for ExecutionStall<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStall")
            .field("depth", &self.executor.execution_lock.stall_depth())
            .finish()
    }
}
