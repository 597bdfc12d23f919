//! # CADENCE Demo
//!
//! Drives a few frames through the pipeline against the call-recording device:
//! immediate draws, an async child list, and a parallel submission recorded on
//! the worker pool.
//!
//! ```text
//! cadence_demo [FRAMES] [TUNABLES.toml]
//! ```

use std::sync::Arc;

use cadence::rhi::backend::recording::RecordingDevice;
use cadence::rhi::{DrawArgs, PrimitiveType, Viewport};
use cadence::{FlushMode, FrameLoop, FrameLoopConfig, ParallelEntry, ParallelSubmission, RecordCommands, Tunables, Workload};

const WORKER_LISTS: u32 = 6;

fn draw(base_vertex: u32, num_primitives: u32) -> DrawArgs {
    DrawArgs {
        primitive: PrimitiveType::TriangleList,
        base_vertex,
        num_primitives,
        num_instances: 1,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let frames: u64 = match args.next() {
        Some(value) => value.parse()?,
        None => 120,
    };
    let tunables = match args.next() {
        Some(path) => Tunables::from_file(path)?,
        None => Tunables::default(),
    };

    let device = RecordingDevice::default();
    let config = FrameLoopConfig {
        tunables,
        enable_timing_logs: true,
        ..FrameLoopConfig::default()
    };
    let mut frame_loop = FrameLoop::new(Arc::new(device.clone()), config)?;

    let mut simulated_secs = 0.0_f64;
    for _ in 0..frames {
        frame_loop.run_frame(|cx| {
            simulated_secs += f64::from(cx.delta_time);
            let immediate = &mut *cx.immediate;
            immediate.set_viewport(Viewport::sized(1920, 1080));
            immediate.begin_scene();
            immediate.push_marker("opaque");

            let executor = Arc::clone(immediate.executor());
            let mut submission = ParallelSubmission::new();
            for list_index in 0..WORKER_LISTS {
                let draws = 16 + list_index * 24;
                let (recorded, list) = executor.spawn_recording(&[], move |list| {
                    for index in 0..draws {
                        list.draw_primitive(draw(index * 3, 1));
                    }
                });
                submission.push(ParallelEntry::new(list, Some(recorded), Workload::Known(draws)));
            }
            immediate.queue_parallel_async_command_list_submit(submission);

            immediate.pop_marker();
            immediate.push_marker("overlay");
            let mut overlay = immediate.create_command_list();
            overlay.draw_primitive(draw(0, 2));
            immediate.queue_command_list_submit(overlay);
            immediate.pop_marker();
            immediate.end_scene();
        });

        // Keep the log bounded; the demo only reports totals.
        let _ = device.take_calls();
    }

    frame_loop.immediate().flush(FlushMode::FlushExecutionAndDeletes);
    frame_loop.stats().log_summary();
    tracing::info!(frames, simulated_secs, "demo finished");

    let executor_stats = frame_loop.immediate().executor().stats();
    let device_stats = device.stats();
    tracing::info!(
        lists = executor_stats.lists_executed,
        commands = executor_stats.commands_executed,
        dispatches = executor_stats.dispatches,
        parallel_groups = executor_stats.parallel_groups,
        serial_submits = executor_stats.serial_submits,
        containers = device_stats.containers_vended,
        "pipeline statistics"
    );
    Ok(())
}
