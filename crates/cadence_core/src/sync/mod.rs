//! # Synchronization Primitives
//!
//! ## The Problem
//!
//! ```text
//! Producer:        records, dispatches, sometimes needs the device NOW
//! Execution role:  walks lists against the default context, batch by batch
//! Workers:         translate lists into deferred contexts
//! ```
//!
//! ## The Solution
//!
//! - [`Fence`]: one-shot completion tokens that order work across threads
//! - [`ExecutionLock`]: one batch at a time, and a way for the producer to stall it

mod execution_lock;
mod fence;

pub use execution_lock::{BatchGuard, ExecutionLock, StallGuard};
pub use fence::{Fence, FenceSignal};
