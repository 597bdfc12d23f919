//! # Immediate Command List
//!
//! The producer's own list, and its handle on the executor.
//!
//! ```text
//! record ──► [ immediate list ] ──dispatch()──► execution role
//!    │
//!    └─ bypassed: executes right here, nothing is buffered
//! ```
//!
//! Everything that touches the pipeline goes through here: dispatch and flush,
//! fences, child list submission, frame throttling and buffer locks.

use crate::backend::{BufferHandle, CommandContext, Device, LockMode};
use crate::command::Command;
use crate::command_list::{CommandList, ListSource, RecordCommands};
use crate::config::TunablesHandle;
use crate::error::RhiResult;
use crate::executor::{ExecutionStall, Executor};
use crate::locks::{BufferLock, LockRecord, LockTracker};
use cadence_core::{ArenaSpan, Fence, NamedThread};
use std::sync::Arc;

/// How far [`ImmediateCommandList::flush`] drains the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Wait for the registered producer-side task fences only.
    WaitForOutstandingTasksOnly,
    /// Hand the recorded commands to the execution role.
    DispatchToExecution,
    /// Dispatch, then wait until the dispatch task ran.
    WaitForDispatchToExecution,
    /// Dispatch and wait until everything reached the device.
    FlushExecution,
    /// As [`FlushMode::FlushExecution`], then release deferred deletions.
    FlushExecutionAndDeletes,
}

/// The producer's command list.
pub struct ImmediateCommandList {
    pub(crate) executor: Arc<Executor>,
    pub(crate) list: CommandList,
    pub(crate) buffer_lock_fence: Option<Fence>,
    frame_fences: [Option<Fence>; 2],
    frame_slot: usize,
    locks: LockTracker,
    render_tasks: Vec<Fence>,
}

impl ImmediateCommandList {
    /// Starts an executor on `device` and binds the calling thread as producer.
    ///
    /// # Errors
    ///
    /// As [`Executor::new`].
    pub fn new(device: Arc<dyn Device>, tunables: impl Into<TunablesHandle>) -> RhiResult<Self> {
        let executor = Executor::new(device, tunables.into())?;
        let list = executor.create_command_list();
        Ok(Self {
            executor,
            list,
            buffer_lock_fence: None,
            frame_fences: [None, None],
            frame_slot: 0,
            locks: LockTracker::default(),
            render_tasks: Vec::new(),
        })
    }

    /// The executor.
    #[inline]
    #[must_use]
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Returns true if recording executes inline.
    #[inline]
    #[must_use]
    pub fn bypass(&self) -> bool {
        self.executor.bypass()
    }

    /// Creates a list for recording on another thread.
    #[must_use]
    pub fn create_command_list(&self) -> CommandList {
        self.executor.create_command_list()
    }

    /// Commands recorded since the last dispatch.
    #[inline]
    #[must_use]
    pub fn num_commands(&self) -> usize {
        self.list.num_commands()
    }

    /// Returns true if commands wait for dispatch.
    #[inline]
    #[must_use]
    pub fn has_commands(&self) -> bool {
        self.list.has_commands()
    }

    /// Re-reads the bypass tunable. Call between frames with the pipeline flushed.
    ///
    /// # Panics
    ///
    /// Fatal if other lists are alive or commands are still recorded.
    pub fn latch_bypass(&mut self) {
        self.executor.latch_bypass(self.list.has_commands());
    }

    /// Hands everything recorded so far to the execution role.
    pub fn dispatch(&mut self) {
        if self.bypass() {
            if self.list.has_commands() {
                let list = self.list.take(self.executor.lists());
                self.executor.execute_inline(list);
            }
            return;
        }
        if !self.list.has_commands() && !self.executor.has_outstanding_tasks() {
            return;
        }

        let list = self.list.take(self.executor.lists());
        self.executor.submit(list);

        if self.executor.tunables().snapshot().force_execution_flush {
            self.drain();
        }
    }

    /// Drains the pipeline as far as `mode` asks.
    pub fn flush(&mut self, mode: FlushMode) {
        match mode {
            FlushMode::WaitForOutstandingTasksOnly => self.executor.wait_for_tasks(),
            FlushMode::DispatchToExecution => self.dispatch(),
            FlushMode::WaitForDispatchToExecution => {
                self.dispatch();
                self.executor.wait_for_dispatch();
            }
            FlushMode::FlushExecution => {
                self.dispatch();
                self.drain();
            }
            FlushMode::FlushExecutionAndDeletes => {
                self.dispatch();
                self.drain();
                self.executor.device().flush_pending_deletes();
            }
        }
    }

    fn drain(&mut self) {
        self.executor.wait_for_dispatch();
        self.executor.wait_for_execution_tasks();
        self.executor.wait_for_tasks();
        self.locks.clear_staged();
    }

    /// Records a fence that completes when the execution role reaches this point.
    ///
    /// Already complete when bypassed, since everything before it already ran.
    #[must_use]
    pub fn create_fence(&mut self) -> Fence {
        if self.bypass() {
            return Fence::signaled();
        }
        let (fence, signal) = Fence::new();
        self.list.append(Command::SignalFence(signal));
        fence
    }

    /// Waits until `fence` completes, dispatching first so it can.
    pub fn wait_on(&mut self, fence: &Fence) {
        if fence.is_complete() {
            return;
        }
        self.dispatch();
        self.executor.wait_on(fence);
    }

    /// Executes `child` at this point of the stream once `completion` fired.
    ///
    /// Whatever was recorded before is dispatched first, and the child is
    /// dispatched on its own so later work does not wait behind its recording.
    pub fn queue_async_command_list_submit(&mut self, completion: Option<Fence>, child: impl Into<ListSource>) {
        let child = child.into();
        if self.bypass() {
            if let Some(completion) = &completion {
                self.executor.wait_on(completion);
            }
            self.executor.execute_inline(child.resolve(self.executor.tasks()));
            return;
        }

        self.dispatch();
        if let Some(completion) = &completion {
            self.executor.add_outstanding_task(completion.clone());
            self.executor.add_wait_task(completion.clone());
        }
        self.list.append(Command::WaitForAndSubmitSubList {
            fence: completion,
            list: child,
        });
        self.dispatch();
    }

    /// Executes an already recorded `child` at this point of the stream.
    pub fn queue_command_list_submit(&mut self, child: CommandList) {
        if self.bypass() {
            self.executor.execute_inline(child);
            return;
        }
        self.list.append(Command::SubmitSubList(Box::new(child)));
    }

    /// Ends a frame and keeps the producer at most one frame ahead.
    ///
    /// Records [`Command::EndFrame`] and a frame fence, dispatches, then waits for
    /// the previous frame's fence.
    pub fn end_drawing_frame(&mut self) {
        self.end_frame();
        let fence = self.create_fence();
        self.frame_fences[self.frame_slot] = Some(fence);
        self.dispatch();

        let previous = 1 - self.frame_slot;
        if let Some(fence) = self.frame_fences[previous].take() {
            self.executor.wait_on(&fence);
        }
        self.frame_slot = previous;
        self.executor.tasks().process_until_idle();
    }

    /// Registers a producer-side task that [`ImmediateCommandList::wait_for_tasks`]
    /// waits for.
    pub fn add_render_thread_task(&mut self, fence: Fence) {
        self.executor.add_wait_task(fence.clone());
        self.render_tasks.push(fence);
    }

    /// A fence over every pending producer-side task, or `None` if all completed.
    #[must_use]
    pub fn render_thread_task_fence(&mut self) -> Option<Fence> {
        self.render_tasks.retain(|fence| !fence.is_complete());
        match self.render_tasks.len() {
            0 => None,
            1 => self.render_tasks.first().cloned(),
            _ => Some(
                self.executor
                    .tasks()
                    .spawn(NamedThread::AnyWorker, &self.render_tasks, |_| {}),
            ),
        }
    }

    /// Waits for every producer-side task fence registered so far.
    pub fn wait_for_tasks(&mut self) {
        self.executor.wait_for_tasks();
        self.render_tasks.clear();
    }

    /// Stalls the execution role. See [`Executor::stall_execution`].
    #[must_use]
    pub fn stall_execution(&self) -> Option<ExecutionStall<'_>> {
        self.executor.stall_execution()
    }

    /// Locks `size` bytes of `buffer` at `offset`.
    ///
    /// Write-only locks taken while the pipeline runs are staged: the returned
    /// memory is not the buffer's and is uploaded by the unlock. Every other lock
    /// flushes the pipeline and reads the buffer from the device.
    ///
    /// # Panics
    ///
    /// Fatal if `buffer` is already locked.
    pub fn lock_buffer(&mut self, buffer: BufferHandle, offset: u32, size: usize, mode: LockMode) -> BufferLock {
        let staged = mode == LockMode::WriteOnly
            && !self.bypass()
            && self.executor.tunables().snapshot().buffer_write_locks;

        let data = if staged {
            vec![0; size]
        } else {
            self.flush(FlushMode::FlushExecution);
            let len = u32::try_from(size).unwrap_or(u32::MAX);
            let mut data = self.executor.device().read_buffer(buffer, offset, len);
            data.resize(size, 0);
            data
        };

        self.locks.lock(
            buffer,
            LockRecord {
                offset,
                size,
                mode,
                staged,
            },
        );
        BufferLock::new(buffer, offset, mode, data)
    }

    /// Releases a lock taken with [`ImmediateCommandList::lock_buffer`].
    ///
    /// A staged lock records its upload followed by a fence that parallel
    /// translation waits for; it dispatches early once enough bytes are staged.
    ///
    /// # Panics
    ///
    /// Fatal if the lock does not match an outstanding one.
    pub fn unlock_buffer(&mut self, lock: BufferLock) {
        let record = self.locks.unlock(&lock);
        let (buffer, offset) = (lock.buffer(), lock.offset());
        let data = lock.into_data();

        if !record.staged {
            if record.mode == LockMode::WriteOnly {
                self.flush(FlushMode::FlushExecution);
                self.executor
                    .with_default_context(NamedThread::Producer, |env| {
                        env.context.update_buffer(buffer, offset, &data);
                    });
            }
            return;
        }

        self.update_buffer(buffer, offset, &data);
        let fence = self.create_fence();
        self.buffer_lock_fence = Some(fence);
        if self.locks.add_staged(record.size) {
            tracing::debug!(threshold = crate::locks::STAGING_DISPATCH_THRESHOLD, "staging threshold crossed, dispatching early");
            self.dispatch();
        }
    }

    /// Runs `work` against the default context right now, flushing first.
    pub fn execute_now<R>(&mut self, work: impl FnOnce(&mut dyn CommandContext) -> R) -> R {
        self.flush(FlushMode::FlushExecution);
        self.executor
            .with_default_context(NamedThread::Producer, |env| work(&mut *env.context))
    }
}

impl RecordCommands for ImmediateCommandList {
    fn record(&mut self, command: Command) {
        if !self.bypass() {
            self.list.append(command);
            return;
        }

        let list = &self.list;
        self.executor
            .with_default_context(NamedThread::Producer, |env| command.execute(env, list.arena()));
        self.executor.count(crate::executor::Stat::InlineCommands, 1);
        if !self.list.has_commands() {
            self.list.reset();
        }
    }

    fn payload(&mut self, data: &[u8]) -> ArenaSpan {
        self.list.arena_mut().copy_from_slice(data)
    }
}

impl Drop for ImmediateCommandList {
    fn drop(&mut self) {
        if std::thread::panicking() || self.executor.tasks().is_poisoned() {
            tracing::warn!("immediate list dropped after a fatal condition; skipping the final flush");
            return;
        }
        self.flush(FlushMode::FlushExecution);
        self.executor.shutdown();
    }
}

impl std::fmt::Debug for ImmediateCommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateCommandList")
            .field("executor", &self.executor)
            .field("commands", &self.list.num_commands())
            .field("locked_buffers", &self.locks.outstanding())
            .finish_non_exhaustive()
    }
}
