//! # Core Error Types
//!
//! Only thread creation can fail recoverably here. Everything else that goes wrong
//! in this crate is a broken invariant and panics.

use thiserror::Error;

/// Errors raised while starting the task graph.
#[derive(Error, Debug)]
pub enum TaskGraphError {
    /// The OS refused to create a thread.
    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        /// Name of the thread that failed to start.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for task graph operations.
pub type TaskGraphResult<T> = Result<T, TaskGraphError>;
