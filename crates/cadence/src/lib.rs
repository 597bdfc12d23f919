//! # CADENCE
//!
//! Deferred command recording in front of a graphics device.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              CADENCE                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  FrameLoop            begin ─► record ─► end_drawing_frame          │
//! │     │                                                               │
//! │     ▼                                                               │
//! │  cadence_rhi          command lists, executor, balancer             │
//! │     │                                                               │
//! │     ▼                                                               │
//! │  cadence_core         arena, fences, execution lock, task graph     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `frame_loop`: Frame orchestration and timing

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod frame_loop;

pub use cadence_core as core;
pub use cadence_rhi as rhi;

pub use cadence_rhi::{
    CommandList, Device, FlushMode, ImmediateCommandList, ParallelEntry, ParallelSubmission,
    RecordCommands, Tunables, TunablesHandle, Workload,
};
pub use frame_loop::{FrameContext, FrameLoop, FrameLoopConfig, FrameStats, FrameStatsAccumulator};
