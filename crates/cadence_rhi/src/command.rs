//! # Commands
//!
//! The closed set of recordable operations. A command is executed exactly once
//! against a native context and dropped right after ("invoke and drop").
//!
//! Payloads that do not fit inline (upload data, marker names) live in the owning
//! list's arena and are referenced by [`ArenaSpan`].

use crate::backend::{BufferHandle, CommandContext, DrawArgs, DrawIndexedArgs, Viewport};
use crate::balancer::{PendingList, TranslateGroup};
use crate::command_list::{CommandList, ListSource};
use cadence_core::{Arena, ArenaSpan, Fence, FenceSignal, NamedThread, TaskGraph};

/// Closure command for operations outside the built-in set.
pub type CustomCommand = Box<dyn FnOnce(&mut dyn CommandContext) + Send>;

/// One recorded operation.
pub enum Command {
    /// Start of frame.
    BeginFrame,
    /// End of frame.
    EndFrame,
    /// Start of scene.
    BeginScene,
    /// End of scene.
    EndScene,
    /// Viewport change.
    SetViewport(Viewport),
    /// Vertex stream binding.
    SetStreamSource {
        /// Stream slot.
        stream: u32,
        /// Bound buffer.
        buffer: BufferHandle,
        /// Byte offset.
        offset: u32,
    },
    /// Non-indexed draw.
    DrawPrimitive(DrawArgs),
    /// Indexed draw.
    DrawIndexed(DrawIndexedArgs),
    /// Compute dispatch.
    DispatchCompute([u32; 3]),
    /// Buffer upload; the bytes live in the list arena.
    UpdateBuffer {
        /// Target buffer.
        buffer: BufferHandle,
        /// Byte offset.
        offset: u32,
        /// Upload bytes.
        data: ArenaSpan,
    },
    /// Debug marker; the UTF-8 name lives in the list arena.
    PushMarker(ArenaSpan),
    /// Closes the innermost debug marker.
    PopMarker,
    /// Signals a fence when the executing role reaches this point.
    SignalFence(FenceSignal),
    /// Executes a child list in place.
    SubmitSubList(Box<CommandList>),
    /// Executes a child list in place once its recording fence completed.
    WaitForAndSubmitSubList {
        /// Recording completion of the child, if still in flight when queued.
        fence: Option<Fence>,
        /// The child list.
        list: ListSource,
    },
    /// Submits a translated deferred context in place.
    WaitForAndSubmitGroup(TranslateGroup),
    /// Executes a list produced later by a balance setup task.
    SubmitPendingList(PendingList),
    /// Arbitrary native work.
    Custom(CustomCommand),
}

impl Command {
    /// Returns true for commands that count towards the list's workload.
    #[inline]
    #[must_use]
    pub const fn is_draw(&self) -> bool {
        matches!(
            self,
            Self::DrawPrimitive(_) | Self::DrawIndexed(_) | Self::DispatchCompute(_)
        )
    }

    /// Short name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BeginFrame => "BeginFrame",
            Self::EndFrame => "EndFrame",
            Self::BeginScene => "BeginScene",
            Self::EndScene => "EndScene",
            Self::SetViewport(_) => "SetViewport",
            Self::SetStreamSource { .. } => "SetStreamSource",
            Self::DrawPrimitive(_) => "DrawPrimitive",
            Self::DrawIndexed(_) => "DrawIndexed",
            Self::DispatchCompute(_) => "DispatchCompute",
            Self::UpdateBuffer { .. } => "UpdateBuffer",
            Self::PushMarker(_) => "PushMarker",
            Self::PopMarker => "PopMarker",
            Self::SignalFence(_) => "SignalFence",
            Self::SubmitSubList(_) => "SubmitSubList",
            Self::WaitForAndSubmitSubList { .. } => "WaitForAndSubmitSubList",
            Self::WaitForAndSubmitGroup(_) => "WaitForAndSubmitGroup",
            Self::SubmitPendingList(_) => "SubmitPendingList",
            Self::Custom(_) => "Custom",
        }
    }

    /// Performs the command against `env` and consumes it.
    ///
    /// `arena` is the arena of the list the command was recorded into.
    pub fn execute(self, env: &mut ExecuteEnv<'_>, arena: &Arena) {
        match self {
            Self::BeginFrame => env.context.begin_frame(),
            Self::EndFrame => env.context.end_frame(),
            Self::BeginScene => env.context.begin_scene(),
            Self::EndScene => env.context.end_scene(),
            Self::SetViewport(viewport) => env.context.set_viewport(viewport),
            Self::SetStreamSource { stream, buffer, offset } => {
                env.context.set_stream_source(stream, buffer, offset);
            }
            Self::DrawPrimitive(args) => env.context.draw_primitive(args),
            Self::DrawIndexed(args) => env.context.draw_indexed(args),
            Self::DispatchCompute(groups) => env.context.dispatch_compute(groups),
            Self::UpdateBuffer { buffer, offset, data } => {
                env.context.update_buffer(buffer, offset, arena.bytes(data));
            }
            Self::PushMarker(name) => {
                env.context.push_marker(&String::from_utf8_lossy(arena.bytes(name)));
            }
            Self::PopMarker => env.context.pop_marker(),
            Self::SignalFence(signal) => signal.signal(),
            Self::SubmitSubList(list) => {
                (*list).execute(env);
            }
            Self::WaitForAndSubmitSubList { fence, list } => {
                if let Some(fence) = fence {
                    env.wait_for_prerequisite(&fence);
                }
                list.resolve(env.tasks()).execute(env);
            }
            Self::WaitForAndSubmitGroup(group) => group.submit(env),
            Self::SubmitPendingList(pending) => pending.submit(env),
            Self::Custom(work) => work(&mut *env.context),
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where and on whose behalf commands are executing.
pub struct ExecuteEnv<'a> {
    /// The native context receiving the calls.
    pub context: &'a mut dyn CommandContext,
    tasks: &'a TaskGraph,
    role: NamedThread,
}

impl<'a> ExecuteEnv<'a> {
    /// Binds a context, the task graph and the role the walk runs as.
    pub fn new(context: &'a mut dyn CommandContext, tasks: &'a TaskGraph, role: NamedThread) -> Self {
        Self { context, tasks, role }
    }

    /// The role this walk runs as.
    #[inline]
    #[must_use]
    pub const fn role(&self) -> NamedThread {
        self.role
    }

    /// The task graph.
    #[inline]
    #[must_use]
    pub const fn tasks(&self) -> &'a TaskGraph {
        self.tasks
    }

    /// Waits for a child list's recording fence.
    ///
    /// On the execution role the fence was a prerequisite of the dispatch that
    /// delivered this list, so it must already be complete. On the producer the
    /// wait services the local queue; elsewhere it blocks.
    pub(crate) fn wait_for_prerequisite(&self, fence: &Fence) {
        if fence.is_complete() {
            return;
        }
        match self.role {
            NamedThread::Execution => self.tasks.fatal(&format!(
                "sub-list fence {} still pending on the execution role; it was not a dispatch prerequisite",
                fence.id()
            )),
            NamedThread::Producer => self.tasks.wait_until(fence, NamedThread::Producer),
            NamedThread::AnyWorker => fence.wait(),
        }
    }
}
