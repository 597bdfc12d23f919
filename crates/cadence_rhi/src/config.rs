//! # Tunables
//!
//! Every knob the executor consults, with defaults that match a shipping setup.
//!
//! Tunables are read from TOML once at startup and may be replaced between frames
//! through a [`TunablesHandle`]. Decisions that span several steps (the bypass
//! latch, one balance call) take a snapshot first and never re-read mid-decision.
//!
//! ```toml
//! worker_width = 8
//! min_draws_per_translate = 64
//! async_dispatch = true
//! ```

use crate::error::{ConfigError, ConfigResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Largest accepted worker width.
pub const MAX_WORKER_WIDTH: usize = 64;

/// Executor tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// Force bypass: record calls execute inline on the producer.
    pub bypass: bool,
    /// Allow parallel translation at all. Latched per frame.
    pub use_parallel_algorithms: bool,
    /// Worker threads, and the cap on deferred contexts per balance call.
    pub worker_width: usize,
    /// Translate into deferred contexts when the device supports it.
    pub use_deferred_contexts: bool,
    /// Merge adjacent small lists into one translate group.
    pub merge_small_deferred_contexts: bool,
    /// Draw budget of one merged translate group.
    pub min_draws_per_translate: u32,
    /// Fewer groups than this translate serially.
    pub min_lists_for_parallel_translate: usize,
    /// Memory budget, in KiB, of one group when balancing after tasks.
    pub min_list_size_for_parallel_translate_kb: usize,
    /// Defer partitioning until the recording tasks finish and size groups by memory.
    pub balance_translates_after_tasks: bool,
    /// Run dispatch tasks on the execution role instead of the producer's queue.
    pub async_dispatch: bool,
    /// Use a dedicated execution thread.
    pub use_execution_thread: bool,
    /// Debug: full flush after every dispatch.
    pub force_execution_flush: bool,
    /// Debug: full flush around every parallel submission.
    pub flush_on_queue_parallel_submit: bool,
    /// Stage write-only buffer locks in the command stream instead of flushing.
    pub buffer_write_locks: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            bypass: false,
            use_parallel_algorithms: true,
            worker_width: 8,
            use_deferred_contexts: true,
            merge_small_deferred_contexts: true,
            min_draws_per_translate: 64,
            min_lists_for_parallel_translate: 2,
            min_list_size_for_parallel_translate_kb: 32,
            balance_translates_after_tasks: false,
            async_dispatch: true,
            use_execution_thread: true,
            force_execution_flush: false,
            flush_on_queue_parallel_submit: false,
            buffer_write_locks: true,
        }
    }
}

impl Tunables {
    /// Everything inline on the producer. Useful for debugging ordering issues.
    #[must_use]
    pub fn bypass() -> Self {
        Self {
            bypass: true,
            ..Self::default()
        }
    }

    /// Execution thread on, but every parallel submission translates serially.
    #[must_use]
    pub fn serial_translate() -> Self {
        Self {
            use_parallel_algorithms: false,
            ..Self::default()
        }
    }

    /// Parses tunables from TOML. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input or unknown keys, and
    /// [`ConfigError::OutOfRange`] for values rejected by [`Tunables::validate`].
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let tunables: Self = toml::from_str(source)?;
        tunables.validate()?;
        Ok(tunables)
    }

    /// Reads and parses a TOML tunables file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`Tunables::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] naming the first offending knob.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=MAX_WORKER_WIDTH).contains(&self.worker_width) {
            return Err(ConfigError::OutOfRange {
                name: "worker_width",
                value: self.worker_width,
                min: 1,
                max: MAX_WORKER_WIDTH,
            });
        }
        if self.min_lists_for_parallel_translate > MAX_WORKER_WIDTH {
            return Err(ConfigError::OutOfRange {
                name: "min_lists_for_parallel_translate",
                value: self.min_lists_for_parallel_translate,
                min: 0,
                max: MAX_WORKER_WIDTH,
            });
        }
        Ok(())
    }
}

/// Shared, replaceable tunables.
#[derive(Clone, Debug, Default)]
pub struct TunablesHandle {
    inner: Arc<RwLock<Tunables>>,
}

impl TunablesHandle {
    /// Wraps `tunables` for sharing.
    #[must_use]
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tunables)),
        }
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> Tunables {
        self.inner.read().clone()
    }

    /// Edits the values in place. Takes effect at the next snapshot.
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut Tunables),
    {
        edit(&mut self.inner.write());
    }

    /// Replaces every value.
    pub fn replace(&self, tunables: Tunables) {
        *self.inner.write() = tunables;
    }
}

impl From<Tunables> for TunablesHandle {
    fn from(tunables: Tunables) -> Self {
        Self::new(tunables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let tunables = Tunables::default();
        assert_eq!(tunables.worker_width, 8);
        assert_eq!(tunables.min_lists_for_parallel_translate, 2);
        assert_eq!(tunables.min_list_size_for_parallel_translate_kb, 32);
        assert!(tunables.async_dispatch);
        assert!(tunables.merge_small_deferred_contexts);
        assert!(!tunables.bypass);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let tunables = Tunables::from_toml_str("worker_width = 4\nbypass = true\n").unwrap();
        assert_eq!(tunables.worker_width, 4);
        assert!(tunables.bypass);
        assert_eq!(tunables.min_draws_per_translate, 64);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let error = Tunables::from_toml_str("warp_speed = 9").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn test_out_of_range_worker_width() {
        let error = Tunables::from_toml_str("worker_width = 0").unwrap_err();
        assert!(matches!(error, ConfigError::OutOfRange { name: "worker_width", .. }));
    }

    #[test]
    fn test_missing_file() {
        let error = Tunables::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
    }

    #[test]
    fn test_handle_update_is_visible_to_next_snapshot() {
        let handle = TunablesHandle::default();
        let before = handle.snapshot();
        handle.update(|tunables| tunables.min_draws_per_translate = 8);
        assert_eq!(before.min_draws_per_translate, 64);
        assert_eq!(handle.snapshot().min_draws_per_translate, 8);
    }
}
