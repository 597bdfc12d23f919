//! # CADENCE Core
//!
//! Scheduling and memory primitives for the command-list engine:
//! - [`Arena`]: block-growing bump allocator owned by each command list
//! - [`Fence`] / [`FenceSignal`]: one-shot cross-thread completion tokens
//! - [`ExecutionLock`]: one execution batch at a time, with producer stalls
//! - [`TaskGraph`]: named threads, prerequisites and cooperative waits
//!
//! ## Architecture Rules
//!
//! 1. **No globals** - every primitive is an owned value or an explicit handle
//! 2. **One-shot completion** - a fence is signaled at most once, by construction
//! 3. **Deadlocks are fatal** - a wait that can never return panics instead
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence_core::{NamedThread, TaskGraph, TaskGraphConfig};
//!
//! let graph = TaskGraph::new(TaskGraphConfig::with_workers(4))?;
//! let done = graph.spawn(NamedThread::AnyWorker, &[], |_| println!("hello"));
//! graph.wait_until(&done, NamedThread::Producer);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod memory;
pub mod sync;
pub mod task;

pub use error::{TaskGraphError, TaskGraphResult};
pub use memory::{Arena, ArenaSpan};
pub use sync::{BatchGuard, ExecutionLock, Fence, FenceSignal, StallGuard};
pub use task::{NamedThread, TaskContext, TaskGraph, TaskGraphConfig, TaskGraphStats};
