//! # Parallel Translate Balancer
//!
//! Takes a batch of independently recorded lists and decides how to turn them into
//! native commands: serially on the default context, or in parallel on deferred
//! contexts, one per group of adjacent lists.
//!
//! ```text
//! immediate stream:  ... │ group 0 │ group 1 │ group 2 │ ...
//!                          ▲         ▲         ▲
//!                  worker: translate translate translate   (any order)
//! ```
//!
//! Each group leaves a "wait for group, then submit" command at its position in the
//! immediate stream, so translated contexts are spliced in strictly in order even
//! when the workers finish out of order.

mod plan;

pub use plan::{
    plan_by_memory, plan_translate_groups, BalanceThresholds, TranslatePlan, Workload,
};

use crate::backend::{ContextContainer, ContextLease};
use crate::command::{Command, ExecuteEnv};
use crate::command_list::{CommandList, ListSource};
use crate::config::Tunables;
use crate::executor::{Executor, Stat};
use crate::immediate::{FlushMode, ImmediateCommandList};
use cadence_core::{Fence, NamedThread, TaskContext};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;

/// One list of a parallel submission.
pub struct ParallelEntry {
    /// The recorded, or still recording, list.
    pub list: ListSource,
    /// Completes when recording finished. `None` if it already has.
    pub completion: Option<Fence>,
    /// Translate cost estimate.
    pub workload: Workload,
}

impl ParallelEntry {
    /// Entry for a list whose recording completes with `completion`.
    #[must_use]
    pub fn new(list: impl Into<ListSource>, completion: Option<Fence>, workload: Workload) -> Self {
        Self {
            list: list.into(),
            completion,
            workload,
        }
    }

    /// Entry for a finished list, using its own draw count as the estimate.
    #[must_use]
    pub fn recorded(list: CommandList) -> Self {
        let workload = Workload::Known(list.draw_count());
        Self::new(list, None, workload)
    }
}

/// Lists submitted together, in stream order.
#[derive(Default)]
pub struct ParallelSubmission {
    /// Entries in the order their commands must reach the device.
    pub entries: Vec<ParallelEntry>,
    /// Marks depth or other prepass work.
    ///
    /// The task graph has no priority levels, so prepass translation is scheduled
    /// exactly like any other. The flag only tags the balancer's log records.
    pub prepass: bool,
}

impl ParallelSubmission {
    /// Empty submission.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty prepass submission.
    #[must_use]
    pub fn prepass() -> Self {
        Self {
            entries: Vec::new(),
            prepass: true,
        }
    }

    /// Appends an entry.
    pub fn push(&mut self, entry: ParallelEntry) {
        self.entries.push(entry);
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there is nothing to submit.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Slot of one translate group: the translate task's fence and, once it
/// completed, the finished lease.
pub struct TranslateGroup {
    fence: Fence,
    lease: Receiver<ContextLease>,
    index: usize,
    num: usize,
}

impl TranslateGroup {
    /// Submits the translated context into the executing context.
    pub(crate) fn submit(self, env: &mut ExecuteEnv<'_>) {
        env.wait_for_prerequisite(&self.fence);
        match self.lease.try_recv() {
            Ok(lease) => lease.submit(&mut *env.context),
            Err(_) => env.tasks().fatal(&format!(
                "translate group {} of {} completed without a context",
                self.index, self.num
            )),
        }
    }
}

/// A list assembled later by a balance setup task.
pub struct PendingList {
    fence: Fence,
    list: Receiver<CommandList>,
}

impl PendingList {
    /// Executes the assembled list in place.
    pub(crate) fn submit(self, env: &mut ExecuteEnv<'_>) {
        env.wait_for_prerequisite(&self.fence);
        match self.list.try_recv() {
            Ok(list) => {
                list.execute(env);
            }
            Err(_) => env
                .tasks()
                .fatal(&format!("balance setup task {} produced no list", self.fence.id())),
        }
    }
}

/// Translates `lists` in order into the lease's deferred context.
fn translate(executor: &Executor, lists: Vec<ListSource>, mut lease: ContextLease, slot: &Sender<ContextLease>) {
    let (index, num) = (lease.index(), lease.num());
    {
        let tasks = executor.tasks();
        let mut env = ExecuteEnv::new(lease.context(), tasks, NamedThread::AnyWorker);
        for list in lists {
            list.resolve(tasks).execute(&mut env);
        }
    }
    lease.finish();
    if slot.send(lease).is_err() {
        tracing::warn!(index, num, "translate group slot dropped before translation finished");
    }
}

fn translate_group(
    executor: &Arc<Executor>,
    lists: Vec<ListSource>,
    container: Box<dyn ContextContainer>,
    index: usize,
    num: usize,
    prerequisites: &[Fence],
) -> TranslateGroup {
    let lease = ContextLease::new(container, index, num);
    let (slot, receiver) = crossbeam_channel::bounded(1);
    let translator = Arc::clone(executor);
    let fence = executor
        .tasks()
        .spawn(NamedThread::AnyWorker, prerequisites, move |_| {
            translate(&translator, lists, lease, &slot);
        });
    TranslateGroup {
        fence,
        lease: receiver,
        index,
        num,
    }
}

fn parallel_translate_available(executor: &Executor, tunables: &Tunables) -> bool {
    executor.has_execution_thread()
        && executor.use_parallel_algorithms()
        && tunables.use_deferred_contexts
        && executor.device().supports_parallel_execute()
}

/// One container per group, or none at all.
fn acquire_containers(executor: &Executor, num: usize) -> Option<Vec<Box<dyn ContextContainer>>> {
    (0..num)
        .map(|index| executor.device().context_container(index, num))
        .collect()
}

impl ImmediateCommandList {
    /// Submits lists recorded elsewhere, translating them in parallel when worthwhile.
    ///
    /// Each entry's commands reach the device at this point of the immediate stream,
    /// in entry order, once its completion fence fired.
    pub fn queue_parallel_async_command_list_submit(&mut self, submission: ParallelSubmission) {
        let ParallelSubmission { entries, prepass } = submission;
        if entries.is_empty() {
            return;
        }

        if self.bypass() {
            for entry in entries {
                if let Some(completion) = &entry.completion {
                    self.executor.wait_on(completion);
                }
                self.executor.execute_inline(entry.list.resolve(self.executor.tasks()));
            }
            return;
        }

        let tunables = self.executor.tunables().snapshot();
        self.dispatch();
        if tunables.flush_on_queue_parallel_submit {
            self.flush(FlushMode::FlushExecution);
        }

        self.buffer_lock_fence = self.buffer_lock_fence.take().filter(|fence| !fence.is_complete());
        let lock_fence = self.buffer_lock_fence.clone();

        if tunables.balance_translates_after_tasks {
            tracing::debug!(lists = entries.len(), prepass, "deferring balance until lists are recorded");
            self.balance_after_tasks(entries, &tunables, lock_fence);
        } else {
            let workloads: Vec<Workload> = entries.iter().map(|entry| entry.workload).collect();
            let plan = plan_translate_groups(&workloads, &BalanceThresholds::from_tunables(&tunables));
            tracing::debug!(
                lists = entries.len(),
                groups = plan.group_count(),
                merged = plan.merged_groups,
                parallel = plan.parallel,
                prepass,
                "balanced parallel submission"
            );

            let containers = if plan.parallel && parallel_translate_available(&self.executor, &tunables) {
                acquire_containers(&self.executor, plan.group_count())
            } else {
                None
            };
            match containers {
                Some(containers) => self.translate_parallel(entries, &plan, containers, lock_fence),
                None => self.translate_serial(entries),
            }
        }

        if tunables.flush_on_queue_parallel_submit {
            self.flush(FlushMode::FlushExecution);
        }
    }

    fn translate_parallel(
        &mut self,
        entries: Vec<ParallelEntry>,
        plan: &TranslatePlan,
        containers: Vec<Box<dyn ContextContainer>>,
        lock_fence: Option<Fence>,
    ) {
        let num = plan.group_count();
        let mut entries = entries.into_iter();
        for (index, (range, container)) in plan.groups.iter().zip(containers).enumerate() {
            let mut prerequisites = Vec::with_capacity(range.len() + 1);
            let mut lists = Vec::with_capacity(range.len());
            for entry in entries.by_ref().take(range.len()) {
                if let Some(completion) = entry.completion {
                    self.executor.add_outstanding_task(completion.clone());
                    self.executor.add_wait_task(completion.clone());
                    prerequisites.push(completion);
                }
                lists.push(entry.list);
            }
            prerequisites.extend(lock_fence.iter().cloned());

            let group = translate_group(&self.executor, lists, container, index, num, &prerequisites);
            self.executor.add_outstanding_task(group.fence.clone());
            self.list.append(Command::WaitForAndSubmitGroup(group));
            self.dispatch();
        }
        self.executor.count(Stat::ParallelGroups, num as u64);
    }

    fn translate_serial(&mut self, entries: Vec<ParallelEntry>) {
        self.executor.count(Stat::SerialSubmits, entries.len() as u64);
        for entry in entries {
            if let Some(completion) = &entry.completion {
                self.executor.add_outstanding_task(completion.clone());
                self.executor.add_wait_task(completion.clone());
            }
            self.list.append(Command::WaitForAndSubmitSubList {
                fence: entry.completion,
                list: entry.list,
            });
        }
        self.dispatch();
    }

    /// Defers partitioning to a setup task that runs once every list is recorded
    /// and sizes groups by the memory each list actually used.
    fn balance_after_tasks(&mut self, entries: Vec<ParallelEntry>, tunables: &Tunables, lock_fence: Option<Fence>) {
        let mut prerequisites: Vec<Fence> = entries
            .iter()
            .filter_map(|entry| entry.completion.clone())
            .collect();
        for completion in &prerequisites {
            self.executor.add_wait_task(completion.clone());
        }
        prerequisites.extend(lock_fence);

        let thresholds = BalanceThresholds::by_memory(tunables);
        let parallel = parallel_translate_available(&self.executor, tunables);
        let lists: Vec<ListSource> = entries.into_iter().map(|entry| entry.list).collect();

        let (slot, receiver) = crossbeam_channel::bounded(1);
        let executor = Arc::clone(&self.executor);
        let setup = self
            .executor
            .tasks()
            .spawn(NamedThread::AnyWorker, &prerequisites, move |cx| {
                let child = balance_recorded(&executor, lists, &thresholds, parallel, cx);
                if slot.send(child).is_err() {
                    tracing::warn!("balance setup finished after its pending list was dropped");
                }
            });

        self.executor.add_outstanding_task(setup.clone());
        self.list.append(Command::SubmitPendingList(PendingList {
            fence: setup,
            list: receiver,
        }));
        self.dispatch();
    }
}

/// Body of the balance setup task: plans by memory and assembles the list the
/// execution role will run in place of the submission.
fn balance_recorded(
    executor: &Arc<Executor>,
    lists: Vec<ListSource>,
    thresholds: &BalanceThresholds,
    parallel: bool,
    cx: &mut TaskContext,
) -> CommandList {
    let lists: Vec<CommandList> = lists
        .into_iter()
        .map(|list| list.resolve(executor.tasks()))
        .collect();
    let mut child = executor.create_command_list();
    let sizes: Vec<usize> = lists.iter().map(CommandList::used_memory).collect();
    let plan = plan_by_memory(&sizes, thresholds);
    tracing::debug!(
        lists = lists.len(),
        groups = plan.group_count(),
        parallel = parallel && plan.parallel,
        "balanced recorded lists by memory"
    );

    if !parallel || !plan.parallel {
        executor.count(Stat::SerialSubmits, lists.len() as u64);
        for list in lists {
            child.append(Command::SubmitSubList(Box::new(list)));
        }
        return child;
    }

    let num = plan.group_count();
    let mut lists = lists.into_iter();
    for (index, range) in plan.groups.iter().enumerate() {
        let Some(container) = executor.device().context_container(index, num) else {
            executor
                .tasks()
                .fatal(&format!("no context container for translate group {index} of {num}"));
        };
        let members: Vec<ListSource> = lists.by_ref().take(range.len()).map(ListSource::from).collect();
        let group = translate_group(executor, members, container, index, num, &[]);
        cx.dont_complete_until(group.fence.clone());
        child.append(Command::WaitForAndSubmitGroup(group));
    }
    executor.count(Stat::ParallelGroups, num as u64);
    child
}
