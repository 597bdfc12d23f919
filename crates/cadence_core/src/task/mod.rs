//! # Task Graph
//!
//! Named threads, prerequisite fences, `dont_complete_until`, and cooperative
//! waits. The engine's dispatch, execute and translate tasks are all built on this.

mod context;
mod graph;

pub use context::{NamedThread, TaskContext};
pub use graph::{TaskGraph, TaskGraphConfig, TaskGraphStats};
