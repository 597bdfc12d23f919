//! # Memory Management
//!
//! Command payloads (upload data, marker strings) live in a per-list arena and are
//! released in one shot when the list resets. Individual frees do not exist.

mod arena;

pub use arena::{Arena, ArenaSpan, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};
