//! # Command Lists
//!
//! An arena plus an ordered chain of [`Command`]s.
//!
//! ```text
//! record ──► [cmd][cmd][cmd] ... ──► execute (walk in order, invoke, drop) ──► reset
//!               │
//!               └─ payload spans ──► arena blocks
//! ```
//!
//! Every live list is counted by its executor's [`ListTracker`], from creation until
//! the list is dropped by whoever executed it.

use crate::backend::{BufferHandle, CommandContext, DrawArgs, DrawIndexedArgs, Viewport};
use crate::command::{Command, ExecuteEnv};
use cadence_core::{Arena, ArenaSpan, TaskGraph};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_LIST_UID: AtomicU64 = AtomicU64::new(1);

/// Counts live command lists.
#[derive(Clone, Debug, Default)]
pub struct ListTracker {
    outstanding: Arc<AtomicUsize>,
}

impl ListTracker {
    /// Creates a tracker with no lists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lists alive right now.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn token(&self) -> ListToken {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        ListToken {
            outstanding: Arc::clone(&self.outstanding),
        }
    }
}

/// Decrements the tracker when the owning list is dropped.
#[derive(Debug)]
struct ListToken {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for ListToken {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Recording surface shared by explicit lists and the immediate list.
///
/// Implementors provide [`RecordCommands::record`] and [`RecordCommands::payload`];
/// everything else is sugar over those two.
pub trait RecordCommands {
    /// Appends `command`, or performs it right away when the recorder is bypassed.
    fn record(&mut self, command: Command);

    /// Copies `data` into the recorder's arena.
    fn payload(&mut self, data: &[u8]) -> ArenaSpan;

    /// Records [`Command::BeginFrame`].
    fn begin_frame(&mut self) {
        self.record(Command::BeginFrame);
    }

    /// Records [`Command::EndFrame`].
    fn end_frame(&mut self) {
        self.record(Command::EndFrame);
    }

    /// Records [`Command::BeginScene`].
    fn begin_scene(&mut self) {
        self.record(Command::BeginScene);
    }

    /// Records [`Command::EndScene`].
    fn end_scene(&mut self) {
        self.record(Command::EndScene);
    }

    /// Records a viewport change.
    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(Command::SetViewport(viewport));
    }

    /// Records a vertex stream binding.
    fn set_stream_source(&mut self, stream: u32, buffer: BufferHandle, offset: u32) {
        self.record(Command::SetStreamSource { stream, buffer, offset });
    }

    /// Records a non-indexed draw.
    fn draw_primitive(&mut self, args: DrawArgs) {
        self.record(Command::DrawPrimitive(args));
    }

    /// Records an indexed draw.
    fn draw_indexed(&mut self, args: DrawIndexedArgs) {
        self.record(Command::DrawIndexed(args));
    }

    /// Records a compute dispatch.
    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.record(Command::DispatchCompute([x, y, z]));
    }

    /// Records a buffer upload. `data` is copied into the arena.
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u32, data: &[u8]) {
        let data = self.payload(data);
        self.record(Command::UpdateBuffer { buffer, offset, data });
    }

    /// Records a typed buffer upload.
    fn update_buffer_pod<T: bytemuck::Pod>(&mut self, buffer: BufferHandle, offset: u32, data: &[T])
    where
        Self: Sized,
    {
        self.update_buffer(buffer, offset, bytemuck::cast_slice(data));
    }

    /// Records a debug marker push. The name is copied into the arena.
    fn push_marker(&mut self, name: &str) {
        let name = self.payload(name.as_bytes());
        self.record(Command::PushMarker(name));
    }

    /// Records a debug marker pop.
    fn pop_marker(&mut self) {
        self.record(Command::PopMarker);
    }

    /// Records arbitrary native work.
    fn custom<F>(&mut self, work: F)
    where
        F: FnOnce(&mut dyn CommandContext) + Send + 'static,
        Self: Sized,
    {
        self.record(Command::Custom(Box::new(work)));
    }
}

/// An arena-backed, ordered command buffer.
pub struct CommandList {
    uid: u64,
    arena: Arena,
    commands: Vec<Command>,
    draw_count: u32,
    executing: bool,
    _token: ListToken,
}

impl CommandList {
    /// Creates an empty list counted by `tracker`.
    #[must_use]
    pub fn new(tracker: &ListTracker) -> Self {
        Self {
            uid: NEXT_LIST_UID.fetch_add(1, Ordering::Relaxed),
            arena: Arena::new(),
            commands: Vec::new(),
            draw_count: 0,
            executing: false,
            _token: tracker.token(),
        }
    }

    /// Process-unique id.
    #[inline]
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.uid
    }

    /// Number of recorded commands.
    #[inline]
    #[must_use]
    pub fn num_commands(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if anything was recorded since the last reset.
    #[inline]
    #[must_use]
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Bytes held by recorded commands and their arena payloads.
    #[inline]
    #[must_use]
    pub fn used_memory(&self) -> usize {
        self.arena.used() + self.commands.len() * std::mem::size_of::<Command>()
    }

    /// Draw and dispatch commands recorded, the list's workload hint.
    #[inline]
    #[must_use]
    pub const fn draw_count(&self) -> u32 {
        self.draw_count
    }

    /// Returns true while the list is being walked.
    #[inline]
    #[must_use]
    pub const fn is_executing(&self) -> bool {
        self.executing
    }

    /// Reserves `size` bytes in the list's arena.
    pub fn allocate(&mut self, size: usize, align: usize) -> ArenaSpan {
        self.arena.allocate(size, align)
    }

    /// The list's arena.
    #[inline]
    #[must_use]
    pub const fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The list's arena, mutably, for filling spans from [`CommandList::allocate`].
    #[inline]
    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    /// Appends `command` after the current tail.
    pub fn append(&mut self, command: Command) {
        if command.is_draw() {
            self.draw_count += 1;
        }
        self.commands.push(command);
    }

    /// Drops every command and flushes the arena.
    ///
    /// Resetting an empty list is a no-op; two resets in a row are legal.
    ///
    /// # Panics
    ///
    /// Fatal if called while the list is executing.
    pub fn reset(&mut self) {
        assert!(
            !self.executing,
            "command list {} reset while it is executing",
            self.uid
        );
        if self.commands.is_empty() && self.arena.used() == 0 {
            return;
        }
        self.commands.clear();
        self.arena.flush();
        self.draw_count = 0;
    }

    /// Walks every command in recording order against `env`, then drops the list.
    ///
    /// # Returns
    ///
    /// Number of commands executed, child lists not included.
    pub fn execute(mut self, env: &mut ExecuteEnv<'_>) -> usize {
        self.begin_execution();
        let executed = self.commands.len();
        let arena = &self.arena;
        for command in self.commands.drain(..) {
            command.execute(env, arena);
        }
        self.executing = false;
        self.reset();
        executed
    }

    pub(crate) fn begin_execution(&mut self) {
        assert!(!self.executing, "command list {} executed twice", self.uid);
        self.executing = true;
    }

    /// Moves the contents out, leaving this list empty with a fresh arena.
    pub(crate) fn take(&mut self, tracker: &ListTracker) -> Self {
        std::mem::replace(self, Self::new(tracker))
    }
}

impl RecordCommands for CommandList {
    fn record(&mut self, command: Command) {
        self.append(command);
    }

    fn payload(&mut self, data: &[u8]) -> ArenaSpan {
        self.arena.copy_from_slice(data)
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("uid", &self.uid)
            .field("commands", &self.commands.len())
            .field("draws", &self.draw_count)
            .field("used_memory", &self.used_memory())
            .finish()
    }
}

/// A child list as handed to a submission: already recorded, or still being
/// recorded by a task that hands it back when done.
pub enum ListSource {
    /// Finished list.
    Recorded(Box<CommandList>),
    /// Delivered by the recording task before its fence completes.
    Recording(Receiver<CommandList>),
}

impl ListSource {
    /// Workload hint, if the list is already recorded.
    #[must_use]
    pub fn draw_count(&self) -> Option<u32> {
        match self {
            Self::Recorded(list) => Some(list.draw_count()),
            Self::Recording(_) => None,
        }
    }

    /// The list. Only valid once the recording fence completed.
    ///
    /// # Panics
    ///
    /// Fatal if the recording task finished without handing the list back.
    pub(crate) fn resolve(self, tasks: &TaskGraph) -> CommandList {
        match self {
            Self::Recorded(list) => *list,
            Self::Recording(receiver) => match receiver.try_recv() {
                Ok(list) => list,
                Err(_) => tasks.fatal("recording task completed without handing back its list"),
            },
        }
    }
}

impl From<CommandList> for ListSource {
    fn from(list: CommandList) -> Self {
        Self::Recorded(Box::new(list))
    }
}

impl std::fmt::Debug for ListSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recorded(list) => f.debug_tuple("Recorded").field(list).finish(),
            Self::Recording(_) => f.write_str("Recording"),
        }
    }
}
