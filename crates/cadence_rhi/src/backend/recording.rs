//! # Recording Device
//!
//! A [`Device`] that performs no graphics work and logs every native call instead.
//!
//! The default context appends to the log as calls happen. Deferred contexts buffer
//! their calls and append them when the container is submitted, which is exactly
//! when a real backend would splice the translated commands into the parent stream.
//! Serial and parallel translation of the same lists therefore produce the same log.

use super::{
    BufferHandle, CommandContext, ContextContainer, Device, DrawArgs, DrawIndexedArgs, Viewport,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// One logged native call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    /// `begin_frame`
    BeginFrame,
    /// `end_frame`
    EndFrame,
    /// `begin_scene`
    BeginScene,
    /// `end_scene`
    EndScene,
    /// `set_viewport`
    SetViewport(Viewport),
    /// `set_stream_source`
    SetStreamSource {
        /// Stream slot.
        stream: u32,
        /// Bound buffer.
        buffer: BufferHandle,
        /// Byte offset.
        offset: u32,
    },
    /// `draw_primitive`
    DrawPrimitive(DrawArgs),
    /// `draw_indexed`
    DrawIndexed(DrawIndexedArgs),
    /// `dispatch_compute`
    DispatchCompute([u32; 3]),
    /// `update_buffer`
    UpdateBuffer {
        /// Target buffer.
        buffer: BufferHandle,
        /// Byte offset.
        offset: u32,
        /// Uploaded bytes.
        data: Vec<u8>,
    },
    /// `push_marker`
    PushMarker(String),
    /// `pop_marker`
    PopMarker,
}

/// Capabilities of a [`RecordingDevice`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordingDeviceConfig {
    /// Report parallel-execute support.
    pub parallel_execute: bool,
    /// Most containers vended for one balance call.
    pub max_parallel_contexts: usize,
    /// Report execution-thread support.
    pub execution_thread: bool,
}

impl Default for RecordingDeviceConfig {
    fn default() -> Self {
        Self {
            parallel_execute: true,
            max_parallel_contexts: 8,
            execution_thread: true,
        }
    }
}

impl RecordingDeviceConfig {
    /// A device without deferred contexts.
    #[must_use]
    pub const fn serial_only() -> Self {
        Self {
            parallel_execute: false,
            max_parallel_contexts: 0,
            execution_thread: true,
        }
    }
}

/// Counters kept by a [`RecordingDevice`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordingStats {
    /// Containers vended.
    pub containers_vended: u64,
    /// Containers submitted into the default context.
    pub deferred_submits: u64,
    /// Calls to `flush_pending_deletes`.
    pub pending_delete_flushes: u64,
}

#[derive(Default)]
struct DeviceState {
    calls: Mutex<Vec<DeviceCall>>,
    buffers: Mutex<Vec<Vec<u8>>>,
    containers_vended: AtomicU64,
    deferred_submits: AtomicU64,
    pending_delete_flushes: AtomicU64,
    default_contexts: AtomicUsize,
}

impl DeviceState {
    fn apply(&self, call: DeviceCall) {
        if let DeviceCall::UpdateBuffer { buffer, offset, data } = &call {
            let mut buffers = self.buffers.lock();
            if let Some(contents) = buffers.get_mut(buffer.id() as usize) {
                let start = *offset as usize;
                let end = start + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[start..end].copy_from_slice(data);
            }
        }
        self.calls.lock().push(call);
    }
}

/// Call-logging device. Cheap to clone; clones share the log.
#[derive(Clone, Default)]
pub struct RecordingDevice {
    state: Arc<DeviceState>,
    config: RecordingDeviceConfig,
}

impl RecordingDevice {
    /// Creates a device with the given capabilities.
    #[must_use]
    pub fn new(config: RecordingDeviceConfig) -> Self {
        Self {
            state: Arc::new(DeviceState::default()),
            config,
        }
    }

    /// Copy of the call log so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.calls.lock().clone()
    }

    /// Drains the call log.
    #[must_use]
    pub fn take_calls(&self) -> Vec<DeviceCall> {
        std::mem::take(&mut *self.state.calls.lock())
    }

    /// Number of logged calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }

    /// Current contents of `buffer`.
    #[must_use]
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Vec<u8> {
        self.state
            .buffers
            .lock()
            .get(buffer.id() as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> RecordingStats {
        RecordingStats {
            containers_vended: self.state.containers_vended.load(Ordering::Relaxed),
            deferred_submits: self.state.deferred_submits.load(Ordering::Relaxed),
            pending_delete_flushes: self.state.pending_delete_flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RecordingDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDevice")
            .field("config", &self.config)
            .field("calls", &self.call_count())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        "recording"
    }

    fn create_default_context(&self) -> Box<dyn CommandContext> {
        let previous = self.state.default_contexts.fetch_add(1, Ordering::Relaxed);
        if previous > 0 {
            tracing::warn!(count = previous + 1, "multiple default contexts created on one device");
        }
        Box::new(RecordingContext {
            state: Arc::clone(&self.state),
            deferred: None,
        })
    }

    fn supports_execution_thread(&self) -> bool {
        self.config.execution_thread
    }

    fn supports_parallel_execute(&self) -> bool {
        self.config.parallel_execute
    }

    fn context_container(&self, index: usize, num: usize) -> Option<Box<dyn ContextContainer>> {
        if !self.config.parallel_execute || num > self.config.max_parallel_contexts || index >= num {
            return None;
        }
        self.state.containers_vended.fetch_add(1, Ordering::Relaxed);
        Some(Box::new(RecordingContainer {
            context: RecordingContext {
                state: Arc::clone(&self.state),
                deferred: Some(Vec::new()),
            },
            finished: false,
        }))
    }

    fn flush_pending_deletes(&self) {
        self.state.pending_delete_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn create_buffer(&self, size: u32) -> BufferHandle {
        let mut buffers = self.state.buffers.lock();
        buffers.push(vec![0; size as usize]);
        BufferHandle::new(u32::try_from(buffers.len() - 1).unwrap_or(u32::MAX))
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u32, size: u32) -> Vec<u8> {
        let contents = self.buffer_contents(buffer);
        let start = (offset as usize).min(contents.len());
        let end = (start + size as usize).min(contents.len());
        let mut out = contents[start..end].to_vec();
        out.resize(size as usize, 0);
        out
    }
}

/// A recording context: immediate when `deferred` is `None`.
pub struct RecordingContext {
    state: Arc<DeviceState>,
    deferred: Option<Vec<DeviceCall>>,
}

impl RecordingContext {
    fn push(&mut self, call: DeviceCall) {
        match &mut self.deferred {
            Some(buffered) => buffered.push(call),
            None => self.state.apply(call),
        }
    }
}

impl CommandContext for RecordingContext {
    fn begin_frame(&mut self) {
        self.push(DeviceCall::BeginFrame);
    }

    fn end_frame(&mut self) {
        self.push(DeviceCall::EndFrame);
    }

    fn begin_scene(&mut self) {
        self.push(DeviceCall::BeginScene);
    }

    fn end_scene(&mut self) {
        self.push(DeviceCall::EndScene);
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.push(DeviceCall::SetViewport(viewport));
    }

    fn set_stream_source(&mut self, stream: u32, buffer: BufferHandle, offset: u32) {
        self.push(DeviceCall::SetStreamSource { stream, buffer, offset });
    }

    fn draw_primitive(&mut self, args: DrawArgs) {
        self.push(DeviceCall::DrawPrimitive(args));
    }

    fn draw_indexed(&mut self, args: DrawIndexedArgs) {
        self.push(DeviceCall::DrawIndexed(args));
    }

    fn dispatch_compute(&mut self, groups: [u32; 3]) {
        self.push(DeviceCall::DispatchCompute(groups));
    }

    fn update_buffer(&mut self, buffer: BufferHandle, offset: u32, data: &[u8]) {
        self.push(DeviceCall::UpdateBuffer {
            buffer,
            offset,
            data: data.to_vec(),
        });
    }

    fn push_marker(&mut self, name: &str) {
        self.push(DeviceCall::PushMarker(name.to_string()));
    }

    fn pop_marker(&mut self) {
        self.push(DeviceCall::PopMarker);
    }
}

struct RecordingContainer {
    context: RecordingContext,
    finished: bool,
}

impl ContextContainer for RecordingContainer {
    fn context(&mut self) -> &mut dyn CommandContext {
        &mut self.context
    }

    fn finish_context(&mut self) {
        self.finished = true;
    }

    fn submit_and_free(self: Box<Self>, index: usize, num: usize, _parent: &mut dyn CommandContext) {
        assert!(self.finished, "deferred context {index}/{num} submitted unfinished");
        let RecordingContainer { context, .. } = *self;
        let state = context.state;
        for call in context.deferred.unwrap_or_default() {
            state.apply(call);
        }
        state.deferred_submits.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ContextLease;

    #[test]
    fn test_default_context_logs_immediately() {
        let device = RecordingDevice::default();
        let mut context = device.create_default_context();
        context.begin_frame();
        context.dispatch_compute([1, 2, 3]);
        assert_eq!(
            device.calls(),
            vec![DeviceCall::BeginFrame, DeviceCall::DispatchCompute([1, 2, 3])]
        );
    }

    #[test]
    fn test_deferred_calls_land_at_submit() {
        let device = RecordingDevice::default();
        let mut parent = device.create_default_context();
        let container = device.context_container(0, 1).unwrap();
        let mut lease = ContextLease::new(container, 0, 1);

        lease.context().push_marker("shadow");
        assert_eq!(device.call_count(), 0);

        parent.begin_scene();
        lease.finish();
        lease.submit(parent.as_mut());
        assert_eq!(
            device.calls(),
            vec![DeviceCall::BeginScene, DeviceCall::PushMarker("shadow".into())]
        );
        assert_eq!(device.stats().deferred_submits, 1);
    }

    #[test]
    fn test_container_refused_beyond_limit() {
        let device = RecordingDevice::new(RecordingDeviceConfig {
            max_parallel_contexts: 2,
            ..RecordingDeviceConfig::default()
        });
        assert!(device.context_container(0, 2).is_some());
        assert!(device.context_container(0, 3).is_none());
        assert!(RecordingDevice::new(RecordingDeviceConfig::serial_only())
            .context_container(0, 1)
            .is_none());
    }

    #[test]
    fn test_buffer_updates_are_applied() {
        let device = RecordingDevice::default();
        let buffer = device.create_buffer(8);
        let mut context = device.create_default_context();
        context.update_buffer(buffer, 2, &[9, 9]);
        assert_eq!(device.read_buffer(buffer, 0, 4), vec![0, 0, 9, 9]);
    }

    #[test]
    #[should_panic(expected = "submitted before its context was finished")]
    fn test_unfinished_lease_submit_is_fatal() {
        let device = RecordingDevice::default();
        let mut parent = device.create_default_context();
        let lease = ContextLease::new(device.context_container(0, 1).unwrap(), 0, 1);
        lease.submit(parent.as_mut());
    }
}
