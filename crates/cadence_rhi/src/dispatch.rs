//! Dispatch: handing a recorded list to the execution role.
//!
//! ```text
//! dispatch N-1 ──► dispatch N            (prerequisites: outstanding fences + N-1)
//!                     │ spawns
//! execute N-1  ──► execute N             (chained, runs on the execution role)
//! ```
//!
//! Chaining both on their predecessors keeps top-level lists in submission order no
//! matter which prerequisite completes first.

use crate::command_list::CommandList;
use crate::executor::{Executor, PipelineState, Stat};
use cadence_core::NamedThread;
use std::sync::Arc;

impl Executor {
    /// Queues `list` for execution after everything dispatched before it.
    ///
    /// Executes inline when bypassed. An empty list with nothing outstanding is
    /// dropped without creating any task.
    pub(crate) fn submit(self: &Arc<Self>, list: CommandList) {
        if self.bypass() {
            if list.has_commands() {
                self.execute_inline(list);
            }
            return;
        }

        let mut pipeline = self.pipeline.lock();
        pipeline.all_outstanding.retain(|fence| !fence.is_complete());
        if !list.has_commands() && pipeline.all_outstanding.is_empty() {
            return;
        }
        self.count(Stat::Dispatches, 1);

        let pending_dispatch = pipeline
            .dispatch_task
            .take()
            .filter(|dispatch| !dispatch.is_complete());

        if pipeline.all_outstanding.is_empty() && pending_dispatch.is_none() {
            self.spawn_execute_locked(&mut pipeline, list);
            return;
        }

        let mut prerequisites = std::mem::take(&mut pipeline.all_outstanding);
        prerequisites.extend(pending_dispatch);

        let async_dispatch = self.tunables().snapshot().async_dispatch;
        let target = if async_dispatch {
            NamedThread::Execution
        } else {
            NamedThread::Producer
        };

        tracing::debug!(
            list = list.uid(),
            prerequisites = prerequisites.len(),
            ?target,
            "dispatch deferred on outstanding tasks"
        );

        let executor = Arc::clone(self);
        let dispatch = self.tasks().spawn(target, &prerequisites, move |cx| {
            let execute = executor.spawn_execute(list);
            if async_dispatch {
                cx.dont_complete_until(execute);
            }
        });
        pipeline.dispatch_task = Some(dispatch);
    }

    fn spawn_execute(self: &Arc<Self>, list: CommandList) -> cadence_core::Fence {
        let mut pipeline = self.pipeline.lock();
        self.spawn_execute_locked(&mut pipeline, list)
    }

    fn spawn_execute_locked(
        self: &Arc<Self>,
        pipeline: &mut PipelineState,
        list: CommandList,
    ) -> cadence_core::Fence {
        let previous: Vec<_> = pipeline
            .execution_task
            .take()
            .filter(|execute| !execute.is_complete())
            .into_iter()
            .collect();

        let executor = Arc::clone(self);
        let execute = self
            .tasks()
            .spawn(NamedThread::Execution, &previous, move |_| executor.run_batch(list));
        pipeline.execution_task = Some(execute.clone());
        execute
    }
}
