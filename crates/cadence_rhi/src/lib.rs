//! # CADENCE RHI
//!
//! Deferred command-list recording and execution in front of a graphics device.
//!
//! ## Pipeline
//!
//! ```text
//! producer ──record──► ImmediateCommandList ──dispatch──► execution role ──► Device
//!                          ▲
//! workers ──record──► CommandList ──queue_*_submit──┘
//!                          └──► balancer ──► deferred contexts (parallel translate)
//! ```
//!
//! ## Architecture Rules
//!
//! 1. **Exactly once, in order** - a recorded command runs once, at its position
//! 2. **Executor is a service** - no globals; the immediate list owns an `Arc<Executor>`
//! 3. **Fatal on broken invariants** - deadlocks and misuse panic, nothing is retried
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence_rhi::{ImmediateCommandList, RecordCommands, Tunables};
//! use cadence_rhi::backend::recording::RecordingDevice;
//!
//! let device = RecordingDevice::default();
//! let mut immediate = ImmediateCommandList::new(Arc::new(device), Tunables::default())?;
//! immediate.begin_frame();
//! immediate.end_drawing_frame();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod backend;
pub mod balancer;
pub mod command;
pub mod command_list;
pub mod config;
mod dispatch;
pub mod error;
pub mod executor;
pub mod immediate;
pub mod locks;

pub use backend::{
    BufferHandle, CommandContext, ContextContainer, ContextLease, Device, DrawArgs,
    DrawIndexedArgs, LockMode, PrimitiveType, Viewport,
};
pub use balancer::{
    plan_by_memory, plan_translate_groups, BalanceThresholds, ParallelEntry, ParallelSubmission,
    TranslatePlan, Workload,
};
pub use command::{Command, CustomCommand, ExecuteEnv};
pub use command_list::{CommandList, ListSource, ListTracker, RecordCommands};
pub use config::{Tunables, TunablesHandle};
pub use error::{ConfigError, ConfigResult, RhiError, RhiResult};
pub use executor::{ExecutionStall, Executor, ExecutorStats};
pub use immediate::{FlushMode, ImmediateCommandList};
pub use locks::{BufferLock, STAGING_DISPATCH_THRESHOLD};
