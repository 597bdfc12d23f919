//! # Device Boundary
//!
//! The engine never talks to a graphics API directly. It talks to:
//!
//! ```text
//! Device ──► default CommandContext   (one, guarded by the execution lock)
//!        └─► ContextContainer(i, K)   (one per translate group, moved into its task)
//!                 └─► deferred CommandContext
//! ```
//!
//! A container is wrapped in a [`ContextLease`] as soon as it is vended. The lease
//! is finished by the translate task and submitted into the parent context by the
//! group's submit command, in group order.

pub mod recording;

/// Opaque buffer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u32);

impl BufferHandle {
    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Viewport rectangle in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Viewport {
    /// Left edge.
    pub min_x: u32,
    /// Top edge.
    pub min_y: u32,
    /// Right edge (exclusive).
    pub max_x: u32,
    /// Bottom edge (exclusive).
    pub max_y: u32,
}

impl Viewport {
    /// Viewport covering `width` x `height` from the origin.
    #[must_use]
    pub const fn sized(width: u32, height: u32) -> Self {
        Self {
            min_x: 0,
            min_y: 0,
            max_x: width,
            max_y: height,
        }
    }
}

/// Primitive topology.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrimitiveType {
    /// Independent triangles.
    #[default]
    TriangleList,
    /// Triangle strip.
    TriangleStrip,
    /// Independent lines.
    LineList,
    /// Points.
    PointList,
}

/// Arguments of a non-indexed draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawArgs {
    /// Topology.
    pub primitive: PrimitiveType,
    /// First vertex.
    pub base_vertex: u32,
    /// Number of primitives.
    pub num_primitives: u32,
    /// Number of instances.
    pub num_instances: u32,
}

/// Arguments of an indexed draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawIndexedArgs {
    /// Topology.
    pub primitive: PrimitiveType,
    /// Index buffer.
    pub index_buffer: BufferHandle,
    /// Added to every index.
    pub base_vertex: i32,
    /// First index read.
    pub first_index: u32,
    /// Number of primitives.
    pub num_primitives: u32,
    /// Number of instances.
    pub num_instances: u32,
}

/// Buffer lock intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Read current contents.
    ReadOnly,
    /// Overwrite contents. Eligible for staging in the command stream.
    WriteOnly,
}

/// Native command context: the calls a command list translates into.
pub trait CommandContext: Send {
    /// Starts a frame.
    fn begin_frame(&mut self);
    /// Ends a frame.
    fn end_frame(&mut self);
    /// Starts a scene.
    fn begin_scene(&mut self);
    /// Ends a scene.
    fn end_scene(&mut self);
    /// Sets the viewport.
    fn set_viewport(&mut self, viewport: Viewport);
    /// Binds a vertex stream.
    fn set_stream_source(&mut self, stream: u32, buffer: BufferHandle, offset: u32);
    /// Non-indexed draw.
    fn draw_primitive(&mut self, args: DrawArgs);
    /// Indexed draw.
    fn draw_indexed(&mut self, args: DrawIndexedArgs);
    /// Compute dispatch.
    fn dispatch_compute(&mut self, groups: [u32; 3]);
    /// Writes `data` into `buffer` at `offset`.
    fn update_buffer(&mut self, buffer: BufferHandle, offset: u32, data: &[u8]);
    /// Opens a debug marker.
    fn push_marker(&mut self, name: &str);
    /// Closes the innermost debug marker.
    fn pop_marker(&mut self);
}

/// Owner of one deferred context for one translate group.
pub trait ContextContainer: Send {
    /// The deferred context to translate into.
    fn context(&mut self) -> &mut dyn CommandContext;

    /// Closes the deferred context. Called on the translating thread.
    fn finish_context(&mut self);

    /// Submits the finished context into `parent` and releases the container.
    ///
    /// # Arguments
    ///
    /// * `index` - Group index within the balance call
    /// * `num` - Number of groups in the balance call
    /// * `parent` - The default context, at the group's position in the stream
    fn submit_and_free(self: Box<Self>, index: usize, num: usize, parent: &mut dyn CommandContext);
}

/// The native device.
pub trait Device: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Creates the default (immediate) context. Called once per executor.
    fn create_default_context(&self) -> Box<dyn CommandContext>;

    /// Whether the device can be driven from a dedicated execution thread.
    fn supports_execution_thread(&self) -> bool {
        true
    }

    /// Whether deferred contexts can be recorded in parallel.
    fn supports_parallel_execute(&self) -> bool;

    /// Vends a deferred context container for group `index` of `num`.
    ///
    /// `None` means the balance call must translate serially.
    fn context_container(&self, index: usize, num: usize) -> Option<Box<dyn ContextContainer>>;

    /// Releases resources whose deletion was deferred until the pipeline drained.
    fn flush_pending_deletes(&self);

    /// Creates a buffer of `size` bytes.
    fn create_buffer(&self, size: u32) -> BufferHandle;

    /// Reads `size` bytes of `buffer` starting at `offset`.
    ///
    /// Only called with the pipeline fully flushed.
    fn read_buffer(&self, buffer: BufferHandle, offset: u32, size: u32) -> Vec<u8>;
}

/// RAII ownership of a vended [`ContextContainer`].
///
/// Finished by the translate task, submitted by the group's submit command.
pub struct ContextLease {
    container: Option<Box<dyn ContextContainer>>,
    index: usize,
    num: usize,
    finished: bool,
}

impl ContextLease {
    /// Wraps a container vended for group `index` of `num`.
    #[must_use]
    pub fn new(container: Box<dyn ContextContainer>, index: usize, num: usize) -> Self {
        Self {
            container: Some(container),
            index,
            num,
            finished: false,
        }
    }

    /// Group index.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Number of groups in the balance call.
    #[inline]
    #[must_use]
    pub const fn num(&self) -> usize {
        self.num
    }

    /// Returns true once [`ContextLease::finish`] ran.
    #[inline]
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// The deferred context.
    pub fn context(&mut self) -> &mut dyn CommandContext {
        match self.container.as_deref_mut() {
            Some(container) => container.context(),
            None => unreachable!("context lease accessed after submission"),
        }
    }

    /// Closes the deferred context.
    pub fn finish(&mut self) {
        if let Some(container) = self.container.as_deref_mut() {
            container.finish_context();
            self.finished = true;
        }
    }

    /// Submits into `parent` and releases the container.
    ///
    /// # Panics
    ///
    /// Panics if the lease was never finished.
    pub fn submit(mut self, parent: &mut dyn CommandContext) {
        assert!(
            self.finished,
            "translate group {} of {} submitted before its context was finished",
            self.index, self.num
        );
        if let Some(container) = self.container.take() {
            container.submit_and_free(self.index, self.num, parent);
        }
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        if self.container.is_some() {
            tracing::warn!(
                index = self.index,
                num = self.num,
                "context lease dropped without submission"
            );
        }
    }
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("index", &self.index)
            .field("num", &self.num)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
