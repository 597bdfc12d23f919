//! Frame loop smoke tests against the call-recording device.

use std::sync::Arc;

use cadence::rhi::backend::recording::{DeviceCall, RecordingDevice};
use cadence::rhi::DrawArgs;
use cadence::{FlushMode, FrameLoop, FrameLoopConfig, ParallelEntry, ParallelSubmission, RecordCommands, Tunables, Workload};

fn frame_calls(calls: &[DeviceCall]) -> Vec<&[DeviceCall]> {
    calls
        .split_inclusive(|call| *call == DeviceCall::EndFrame)
        .collect()
}

fn run(tunables: Tunables, frames: u64) -> Vec<DeviceCall> {
    let device = RecordingDevice::default();
    let config = FrameLoopConfig {
        tunables,
        ..FrameLoopConfig::default()
    };
    let mut frame_loop = FrameLoop::new(Arc::new(device.clone()), config).unwrap();

    for _ in 0..frames {
        frame_loop.run_frame(|cx| {
            let executor = Arc::clone(cx.immediate.executor());
            let mut submission = ParallelSubmission::new();
            for tag in 0..3u32 {
                let (recorded, list) = executor.spawn_recording(&[], move |list| {
                    list.draw_primitive(DrawArgs {
                        base_vertex: tag,
                        num_primitives: 1,
                        num_instances: 1,
                        ..DrawArgs::default()
                    });
                });
                submission.push(ParallelEntry::new(list, Some(recorded), Workload::Unknown));
            }
            cx.immediate.queue_parallel_async_command_list_submit(submission);
        });
    }
    frame_loop.immediate().flush(FlushMode::FlushExecution);
    assert_eq!(frame_loop.frame_count(), frames);
    device.calls()
}

#[test]
fn test_frames_reach_the_device_in_order() {
    let calls = run(Tunables::default(), 4);
    let frames = frame_calls(&calls);
    assert_eq!(frames.len(), 4);

    for frame in frames {
        assert_eq!(frame.first(), Some(&DeviceCall::BeginFrame));
        let bases: Vec<u32> = frame
            .iter()
            .filter_map(|call| match call {
                DeviceCall::DrawPrimitive(args) => Some(args.base_vertex),
                _ => None,
            })
            .collect();
        assert_eq!(bases, vec![0, 1, 2]);
    }
}

#[test]
fn test_bypass_and_buffered_frames_match() {
    assert_eq!(run(Tunables::default(), 3), run(Tunables::bypass(), 3));
}
