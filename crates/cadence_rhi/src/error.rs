//! # RHI Error Types
//!
//! Recoverable errors only exist at the edges: loading tunables and starting the
//! executor's threads. Broken pipeline invariants are fatal and panic.

use cadence_core::TaskGraphError;
use thiserror::Error;

/// Errors raised while loading or validating tunables.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The tunables file could not be read.
    #[error("failed to read tunables file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML could not be parsed into tunables.
    #[error("invalid tunables: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside its allowed range.
    #[error("tunable {name} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        /// Name of the knob.
        name: &'static str,
        /// Rejected value.
        value: usize,
        /// Smallest accepted value.
        min: usize,
        /// Largest accepted value.
        max: usize,
    },
}

/// Result type for tunables loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while creating the executor.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Tunables were rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The task graph could not start its threads.
    #[error("task graph startup failed: {0}")]
    TaskGraph(#[from] TaskGraphError),
}

/// Result type for executor operations.
pub type RhiResult<T> = Result<T, RhiError>;
