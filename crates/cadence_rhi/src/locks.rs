//! Buffer lock bookkeeping.
//!
//! A write-only lock taken while the execution role is running cannot hand out the
//! real buffer memory. It hands out staging memory instead, and the unlock records
//! an upload into the command stream. Every other lock flushes the pipeline and
//! goes straight to the device.

use crate::backend::{BufferHandle, LockMode};
use std::collections::HashMap;

/// Staged bytes after which an unlock dispatches early.
pub const STAGING_DISPATCH_THRESHOLD: usize = 256 * 1024;

/// A locked buffer region, returned by `ImmediateCommandList::lock_buffer`.
#[derive(Debug)]
pub struct BufferLock {
    buffer: BufferHandle,
    offset: u32,
    mode: LockMode,
    data: Vec<u8>,
}

impl BufferLock {
    pub(crate) fn new(buffer: BufferHandle, offset: u32, mode: LockMode, data: Vec<u8>) -> Self {
        Self {
            buffer,
            offset,
            mode,
            data,
        }
    }

    /// Locked buffer.
    #[inline]
    #[must_use]
    pub const fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Byte offset of the region.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Lock intent.
    #[inline]
    #[must_use]
    pub const fn mode(&self) -> LockMode {
        self.mode
    }

    /// Region bytes. For a staged write lock these start zeroed.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Region bytes, for writing.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LockRecord {
    pub(crate) offset: u32,
    pub(crate) size: usize,
    pub(crate) mode: LockMode,
    pub(crate) staged: bool,
}

/// Outstanding locks, keyed by buffer. One lock per buffer at a time.
#[derive(Debug, Default)]
pub(crate) struct LockTracker {
    outstanding: HashMap<BufferHandle, LockRecord>,
    staged_bytes: usize,
}

impl LockTracker {
    /// Registers a lock.
    ///
    /// # Panics
    ///
    /// Fatal if `buffer` is already locked.
    pub(crate) fn lock(&mut self, buffer: BufferHandle, record: LockRecord) {
        if let Some(existing) = self.outstanding.get(&buffer) {
            tracing::error!(buffer = buffer.id(), ?existing, "buffer locked twice");
            panic!("buffer {} locked twice", buffer.id());
        }
        self.outstanding.insert(buffer, record);
    }

    /// Removes the lock matching `lock` and returns how it was taken.
    ///
    /// # Panics
    ///
    /// Fatal if the buffer is not locked, or was locked with another region or mode.
    pub(crate) fn unlock(&mut self, lock: &BufferLock) -> LockRecord {
        let buffer = lock.buffer();
        let Some(record) = self.outstanding.remove(&buffer) else {
            tracing::error!(buffer = buffer.id(), "unlock of a buffer that is not locked");
            panic!("buffer {} unlocked without a matching lock", buffer.id());
        };
        if record.offset != lock.offset() || record.size != lock.data().len() || record.mode != lock.mode() {
            tracing::error!(buffer = buffer.id(), ?record, "mismatched buffer unlock");
            panic!("buffer {} unlocked with a different region or mode than it was locked with", buffer.id());
        }
        record
    }

    /// Adds staged bytes. Returns true once the early dispatch threshold is crossed,
    /// and starts counting again.
    pub(crate) fn add_staged(&mut self, bytes: usize) -> bool {
        self.staged_bytes += bytes;
        if self.staged_bytes > STAGING_DISPATCH_THRESHOLD {
            self.staged_bytes = 0;
            return true;
        }
        false
    }

    /// Forgets staged bytes after a full flush.
    pub(crate) fn clear_staged(&mut self) {
        self.staged_bytes = 0;
    }

    /// Number of locked buffers.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: usize) -> LockRecord {
        LockRecord {
            offset: 0,
            size,
            mode: LockMode::WriteOnly,
            staged: true,
        }
    }

    #[test]
    fn test_lock_then_unlock() {
        let mut tracker = LockTracker::default();
        let buffer = BufferHandle::new(3);
        tracker.lock(buffer, record(16));
        assert_eq!(tracker.outstanding(), 1);

        let lock = BufferLock::new(buffer, 0, LockMode::WriteOnly, vec![0; 16]);
        assert!(tracker.unlock(&lock).staged);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "locked twice")]
    fn test_double_lock_is_fatal() {
        let mut tracker = LockTracker::default();
        tracker.lock(BufferHandle::new(1), record(4));
        tracker.lock(BufferHandle::new(1), record(4));
    }

    #[test]
    #[should_panic(expected = "without a matching lock")]
    fn test_unlock_without_lock_is_fatal() {
        let mut tracker = LockTracker::default();
        let lock = BufferLock::new(BufferHandle::new(1), 0, LockMode::ReadOnly, Vec::new());
        tracker.unlock(&lock);
    }

    #[test]
    #[should_panic(expected = "different region")]
    fn test_mismatched_unlock_is_fatal() {
        let mut tracker = LockTracker::default();
        tracker.lock(BufferHandle::new(1), record(4));
        let lock = BufferLock::new(BufferHandle::new(1), 0, LockMode::WriteOnly, vec![0; 8]);
        tracker.unlock(&lock);
    }

    #[test]
    fn test_staging_threshold() {
        let mut tracker = LockTracker::default();
        assert!(!tracker.add_staged(STAGING_DISPATCH_THRESHOLD));
        assert!(tracker.add_staged(1));
        assert!(!tracker.add_staged(1));
        tracker.clear_staged();
        assert!(!tracker.add_staged(STAGING_DISPATCH_THRESHOLD));
    }
}
