//! # Frame Loop
//!
//! ```text
//! Frame N:
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ 1. BEGIN FRAME                                                      │
//! │    └─ Record BeginFrame on the immediate list                       │
//! │                                                                     │
//! │ 2. RECORD                                                           │
//! │    ├─ Immediate commands on the producer                            │
//! │    └─ Worker-recorded lists queued as (parallel) submissions        │
//! │                                                                     │
//! │ 3. END DRAWING FRAME                                                │
//! │    ├─ Record EndFrame, fence it, dispatch                           │
//! │    └─ Wait on frame N-1's fence (at most one frame in flight)       │
//! │                                                                     │
//! │ 4. MEASURE                                                          │
//! │    └─ Record/submit timings, slow-frame warnings                    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_rhi::{Device, ImmediateCommandList, RecordCommands, RhiResult, Tunables};

/// Target frame time for 60 FPS.
pub const TARGET_FRAME_TIME: Duration = Duration::from_micros(16_666);

/// Frame time above which a frame is logged as slow.
pub const MAX_FRAME_TIME: Duration = Duration::from_millis(33);

/// Configuration for the frame loop.
#[derive(Clone, Debug)]
pub struct FrameLoopConfig {
    /// Pipeline tunables.
    pub tunables: Tunables,
    /// Log frames that exceed [`MAX_FRAME_TIME`].
    pub enable_timing_logs: bool,
    /// Target frames per second.
    pub target_fps: u32,
}

impl Default for FrameLoopConfig {
    fn default() -> Self {
        Self {
            tunables: Tunables::default(),
            enable_timing_logs: false,
            target_fps: 60,
        }
    }
}

/// Timings for one frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStats {
    /// Total frame time in microseconds.
    pub total_us: u64,
    /// Time spent in the record callback.
    pub record_us: u64,
    /// Time spent in `end_drawing_frame`, throttling included.
    pub submit_us: u64,
    /// Frame number.
    pub frame: u64,
    /// Commands left on the immediate list when the callback returned.
    pub pending_commands: usize,
}

/// What the record callback gets to work with.
pub struct FrameContext<'a> {
    /// The producer's list.
    pub immediate: &'a mut ImmediateCommandList,
    /// Current frame number.
    pub frame: u64,
    /// Seconds since the previous frame began, clamped to 0.1.
    pub delta_time: f32,
}

/// Drives an [`ImmediateCommandList`] one frame at a time.
pub struct FrameLoop {
    immediate: ImmediateCommandList,
    config: FrameLoopConfig,
    frame_count: u64,
    last_frame_time: Instant,
    stats: FrameStatsAccumulator,
}

impl FrameLoop {
    /// Starts the pipeline on `device`. The calling thread becomes the producer.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunables are invalid or the task graph cannot start.
    pub fn new(device: Arc<dyn Device>, config: FrameLoopConfig) -> RhiResult<Self> {
        let immediate = ImmediateCommandList::new(device, config.tunables.clone())?;
        tracing::info!(
            bypass = immediate.bypass(),
            target_fps = config.target_fps,
            "frame loop started"
        );
        Ok(Self {
            immediate,
            config,
            frame_count: 0,
            last_frame_time: Instant::now(),
            stats: FrameStatsAccumulator::new(),
        })
    }

    /// Runs one frame: `BeginFrame`, the callback, then `end_drawing_frame`.
    pub fn run_frame<F>(&mut self, record: F) -> FrameStats
    where
        F: FnOnce(&mut FrameContext<'_>),
    {
        let start = Instant::now();
        let delta_time = start.duration_since(self.last_frame_time).as_secs_f32().min(0.1);
        self.last_frame_time = start;

        self.immediate.begin_frame();
        let mut cx = FrameContext {
            immediate: &mut self.immediate,
            frame: self.frame_count,
            delta_time,
        };
        record(&mut cx);
        let pending_commands = self.immediate.num_commands();
        let recorded = Instant::now();

        self.immediate.end_drawing_frame();
        let finished = Instant::now();

        let stats = FrameStats {
            total_us: micros(finished - start),
            record_us: micros(recorded - start),
            submit_us: micros(finished - recorded),
            frame: self.frame_count,
            pending_commands,
        };
        self.end_frame(stats);
        stats
    }

    fn end_frame(&mut self, stats: FrameStats) {
        self.frame_count += 1;
        self.stats.record(stats);

        if self.config.enable_timing_logs && stats.total_us > micros(MAX_FRAME_TIME) {
            tracing::warn!(
                frame = stats.frame,
                total_us = stats.total_us,
                submit_us = stats.submit_us,
                "frame exceeded budget"
            );
        }
    }

    /// Frames completed so far.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The producer's list, for work outside a frame.
    #[inline]
    pub fn immediate(&mut self) -> &mut ImmediateCommandList {
        &mut self.immediate
    }

    /// Accumulated frame statistics.
    #[must_use]
    pub fn stats(&self) -> &FrameStatsAccumulator {
        &self.stats
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Accumulator for frame statistics.
#[derive(Clone, Debug)]
pub struct FrameStatsAccumulator {
    /// Total frames recorded.
    pub frames_recorded: u64,
    /// Sum of total frame times.
    pub total_us_sum: u64,
    /// Sum of record times.
    pub record_us_sum: u64,
    /// Sum of submit times.
    pub submit_us_sum: u64,
    /// Min frame time.
    pub min_frame_us: u64,
    /// Max frame time.
    pub max_frame_us: u64,
    /// Frames that exceeded [`TARGET_FRAME_TIME`].
    pub frames_over_budget: u64,
}

impl FrameStatsAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames_recorded: 0,
            total_us_sum: 0,
            record_us_sum: 0,
            submit_us_sum: 0,
            min_frame_us: u64::MAX,
            max_frame_us: 0,
            frames_over_budget: 0,
        }
    }

    /// Records a frame's statistics.
    pub fn record(&mut self, stats: FrameStats) {
        self.frames_recorded += 1;
        self.total_us_sum += stats.total_us;
        self.record_us_sum += stats.record_us;
        self.submit_us_sum += stats.submit_us;
        self.min_frame_us = self.min_frame_us.min(stats.total_us);
        self.max_frame_us = self.max_frame_us.max(stats.total_us);

        if stats.total_us > micros(TARGET_FRAME_TIME) {
            self.frames_over_budget += 1;
        }
    }

    /// Average frame time in milliseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg_frame_ms(&self) -> f64 {
        if self.frames_recorded == 0 {
            return 0.0;
        }
        (self.total_us_sum as f64 / self.frames_recorded as f64) / 1000.0
    }

    /// Share of frames over budget, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn over_budget_ratio(&self) -> f64 {
        if self.frames_recorded == 0 {
            return 0.0;
        }
        self.frames_over_budget as f64 / self.frames_recorded as f64
    }

    /// Logs a one-line summary.
    pub fn log_summary(&self) {
        tracing::info!(
            frames = self.frames_recorded,
            avg_ms = self.avg_frame_ms(),
            min_us = if self.frames_recorded == 0 { 0 } else { self.min_frame_us },
            max_us = self.max_frame_us,
            over_budget = self.frames_over_budget,
            "frame statistics"
        );
    }
}

impl Default for FrameStatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
