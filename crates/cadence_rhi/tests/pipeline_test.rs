//! Integration tests for recording, dispatch, fences, stalls and buffer locks.

use cadence_core::Fence;
use cadence_rhi::backend::recording::{DeviceCall, RecordingDevice, RecordingDeviceConfig};
use cadence_rhi::{
    Command, Device, DrawArgs, FlushMode, ImmediateCommandList, LockMode, ParallelEntry,
    ParallelSubmission, RecordCommands, Tunables, TunablesHandle, Workload,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn setup(tunables: Tunables) -> (RecordingDevice, ImmediateCommandList) {
    let device = RecordingDevice::default();
    let immediate = ImmediateCommandList::new(Arc::new(device.clone()), tunables).unwrap();
    (device, immediate)
}

fn draw(num_primitives: u32) -> DrawArgs {
    DrawArgs {
        num_primitives,
        num_instances: 1,
        ..DrawArgs::default()
    }
}

fn record_scene(recorder: &mut impl RecordCommands, tag: u32) {
    recorder.begin_scene();
    recorder.push_marker(&format!("scene {tag}"));
    recorder.draw_primitive(draw(tag));
    recorder.dispatch_compute(tag, 1, 1);
    recorder.pop_marker();
    recorder.end_scene();
}

fn scene_calls(tag: u32) -> Vec<DeviceCall> {
    vec![
        DeviceCall::BeginScene,
        DeviceCall::PushMarker(format!("scene {tag}")),
        DeviceCall::DrawPrimitive(draw(tag)),
        DeviceCall::DispatchCompute([tag, 1, 1]),
        DeviceCall::PopMarker,
        DeviceCall::EndScene,
    ]
}

fn has_marker(device: &RecordingDevice, name: &str) -> bool {
    device
        .calls()
        .iter()
        .any(|call| matches!(call, DeviceCall::PushMarker(marker) if marker == name))
}

#[test]
fn test_dispatched_commands_reach_device_in_order() {
    let (device, mut immediate) = setup(Tunables::default());
    assert!(!immediate.bypass());

    record_scene(&mut immediate, 1);
    record_scene(&mut immediate, 2);
    assert!(device.calls().is_empty(), "nothing runs before dispatch");

    immediate.flush(FlushMode::FlushExecution);

    let mut expected = scene_calls(1);
    expected.extend(scene_calls(2));
    assert_eq!(device.calls(), expected);
    assert_eq!(immediate.executor().stats().lists_executed, 1);
}

#[test]
fn test_child_lists_execute_at_their_submit_position() {
    let (device, mut immediate) = setup(Tunables::default());

    let mut child = immediate.create_command_list();
    record_scene(&mut child, 2);

    record_scene(&mut immediate, 1);
    immediate.queue_command_list_submit(child);
    record_scene(&mut immediate, 3);
    immediate.flush(FlushMode::FlushExecution);

    let expected: Vec<_> = [1, 2, 3].into_iter().flat_map(scene_calls).collect();
    assert_eq!(device.calls(), expected);
}

/// Drives every submission path once. Used to compare bypass with buffered runs.
fn run_script(immediate: &mut ImmediateCommandList) {
    immediate.begin_frame();
    record_scene(immediate, 1);

    let mut child = immediate.create_command_list();
    record_scene(&mut child, 2);
    immediate.queue_command_list_submit(child);

    let executor = Arc::clone(immediate.executor());
    let (recorded, source) = executor.spawn_recording(&[], |list| record_scene(list, 3));
    immediate.queue_async_command_list_submit(Some(recorded), source);

    let mut submission = ParallelSubmission::new();
    for tag in 4..8 {
        let (recorded, source) = executor.spawn_recording(&[], move |list| record_scene(list, tag));
        submission.push(ParallelEntry::new(source, Some(recorded), Workload::Unknown));
    }
    immediate.queue_parallel_async_command_list_submit(submission);

    record_scene(immediate, 8);
    immediate.end_drawing_frame();
    immediate.flush(FlushMode::FlushExecution);
}

#[test]
fn test_bypass_matches_buffered_execution() {
    let (buffered_device, mut buffered) = setup(Tunables::default());
    run_script(&mut buffered);

    let (bypass_device, mut bypass) = setup(Tunables::bypass());
    assert!(bypass.bypass());
    run_script(&mut bypass);

    let buffered_calls = buffered_device.calls();
    assert!(!buffered_calls.is_empty());
    assert_eq!(buffered_calls, bypass_device.calls());
    assert!(bypass.executor().stats().inline_commands > 0);
    assert_eq!(bypass.executor().stats().lists_executed, 0);
}

#[test]
fn test_bypass_records_nothing() {
    let (device, mut immediate) = setup(Tunables::bypass());
    record_scene(&mut immediate, 1);
    assert!(!immediate.has_commands());
    assert_eq!(device.calls(), scene_calls(1));
}

#[test]
fn test_fence_completes_once_execution_reaches_it() {
    let (device, mut immediate) = setup(Tunables::default());
    record_scene(&mut immediate, 1);
    let fence = immediate.create_fence();
    assert!(!fence.is_complete(), "fence not dispatched yet");

    immediate.wait_on(&fence);
    assert!(fence.is_complete());
    assert_eq!(device.calls(), scene_calls(1));
}

#[test]
fn test_fence_wait_is_bounded() {
    let (_device, mut immediate) = setup(Tunables::default());
    let (gate, open) = Fence::new();
    immediate.custom(move |_| gate.wait());
    let fence = immediate.create_fence();
    immediate.dispatch();

    assert!(!fence.wait_timeout(Duration::from_millis(50)));
    open.signal();
    assert!(fence.wait_timeout(Duration::from_secs(5)));
}

#[test]
fn test_end_drawing_frame_keeps_one_frame_ahead() {
    let (device, mut immediate) = setup(Tunables::default());
    let (gate, open) = Fence::new();

    immediate.custom(move |_| gate.wait());
    immediate.end_drawing_frame();
    assert!(device.calls().is_empty(), "first frame is still blocked");

    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        open.signal();
    });

    let start = Instant::now();
    immediate.end_drawing_frame();
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(device.calls().contains(&DeviceCall::EndFrame));
    opener.join().unwrap();
}

#[test]
fn test_stall_blocks_execution_until_released() {
    let (device, mut immediate) = setup(Tunables::default());
    let executor = Arc::clone(immediate.executor());

    let (gate, open) = Fence::new();
    immediate.custom(move |_| gate.wait());
    immediate.dispatch();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        open.signal();
    });

    let stall = executor.stall_execution().expect("a batch is in flight");
    assert!(executor.is_stalled());
    opener.join().unwrap();

    record_scene(&mut immediate, 7);
    immediate.dispatch();
    thread::sleep(Duration::from_millis(30));
    assert!(!has_marker(&device, "scene 7"), "execution must wait for the stall");

    stall.with_context(|context| context.push_marker("stalled"));
    assert!(has_marker(&device, "stalled"));

    drop(stall);
    assert!(!executor.is_stalled());
    immediate.flush(FlushMode::FlushExecution);

    let calls = device.calls();
    let stalled = calls
        .iter()
        .position(|call| *call == DeviceCall::PushMarker("stalled".to_string()))
        .unwrap();
    let scene = calls
        .iter()
        .position(|call| *call == DeviceCall::PushMarker("scene 7".to_string()))
        .unwrap();
    assert!(stalled < scene);
    assert_eq!(executor.stats().stalls, 1);
}

#[test]
#[should_panic(expected = "execution stall")]
fn test_flush_while_holding_a_stall_is_fatal() {
    let (_device, mut immediate) = setup(Tunables::default());
    let executor = Arc::clone(immediate.executor());

    let (gate, open) = Fence::new();
    immediate.custom(move |_| gate.wait());
    immediate.dispatch();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        open.signal();
    });

    let _stall = executor.stall_execution().expect("a batch is in flight");
    opener.join().unwrap();

    immediate.begin_scene();
    immediate.flush(FlushMode::FlushExecution);
}

#[test]
fn test_stall_released_before_flush_drains() {
    let (device, mut immediate) = setup(Tunables::default());
    let executor = Arc::clone(immediate.executor());

    let (gate, open) = Fence::new();
    immediate.custom(move |_| gate.wait());
    immediate.dispatch();
    open.signal();

    if let Some(stall) = executor.stall_execution() {
        stall.with_context(|context| context.push_marker("stalled"));
    }
    record_scene(&mut immediate, 3);
    immediate.flush(FlushMode::FlushExecution);

    assert!(has_marker(&device, "scene 3"));
    assert!(!immediate.executor().tasks().is_poisoned());
}

#[test]
fn test_stall_with_idle_pipeline_is_none() {
    let (_device, mut immediate) = setup(Tunables::default());
    immediate.flush(FlushMode::FlushExecution);
    assert!(immediate.stall_execution().is_none());
    assert!(immediate.executor().is_completely_flushed());
}

#[test]
fn test_async_submit_waits_for_recording() {
    let (device, mut immediate) = setup(Tunables::default());
    let executor = Arc::clone(immediate.executor());

    let (gate, open) = Fence::new();
    let (recorded, source) = executor.spawn_recording(&[gate], |list| record_scene(list, 3));
    immediate.queue_async_command_list_submit(Some(recorded), source);
    record_scene(&mut immediate, 4);
    immediate.dispatch();

    thread::sleep(Duration::from_millis(20));
    assert!(device.calls().is_empty(), "later dispatches chain behind the child");

    open.signal();
    immediate.flush(FlushMode::FlushExecution);
    let expected: Vec<_> = [3, 4].into_iter().flat_map(scene_calls).collect();
    assert_eq!(device.calls(), expected);
}

#[test]
fn test_force_execution_flush_drains_every_dispatch() {
    let tunables = Tunables {
        force_execution_flush: true,
        ..Tunables::default()
    };
    let (device, mut immediate) = setup(tunables);
    record_scene(&mut immediate, 5);
    immediate.dispatch();
    assert_eq!(device.calls(), scene_calls(5));
}

#[test]
fn test_latch_enters_bypass_between_frames() {
    let device = RecordingDevice::default();
    let tunables = TunablesHandle::default();
    let mut immediate = ImmediateCommandList::new(Arc::new(device.clone()), tunables.clone()).unwrap();
    assert!(!immediate.bypass());

    tunables.update(|tunables| tunables.bypass = true);
    immediate.flush(FlushMode::FlushExecution);
    immediate.latch_bypass();
    assert!(immediate.bypass());
    assert_eq!(immediate.executor().stats().bypass_toggles, 1);
    assert!(device.stats().pending_delete_flushes >= 1);

    record_scene(&mut immediate, 9);
    assert_eq!(device.calls(), scene_calls(9));
}

#[test]
#[should_panic(expected = "bypass latched")]
fn test_latch_with_live_list_is_fatal() {
    let (_device, mut immediate) = setup(Tunables::default());
    let _pending = immediate.create_command_list();
    immediate.latch_bypass();
}

#[test]
#[should_panic(expected = "still alive")]
fn test_check_no_outstanding_lists() {
    let (_device, immediate) = setup(Tunables::default());
    immediate.executor().check_no_outstanding_lists();
    let _pending = immediate.create_command_list();
    immediate.executor().check_no_outstanding_lists();
}

#[test]
fn test_device_without_execution_thread_stays_bypassed() {
    let device = RecordingDevice::new(RecordingDeviceConfig {
        execution_thread: false,
        ..RecordingDeviceConfig::default()
    });
    let mut immediate = ImmediateCommandList::new(Arc::new(device.clone()), Tunables::default()).unwrap();
    assert!(immediate.bypass());
    immediate.latch_bypass();
    assert!(immediate.bypass());
}

#[test]
fn test_staged_write_lock_uploads_in_stream() {
    let (device, mut immediate) = setup(Tunables::default());
    let buffer = device.create_buffer(8);

    let mut lock = immediate.lock_buffer(buffer, 0, 8, LockMode::WriteOnly);
    assert_eq!(lock.data(), &[0; 8]);
    lock.data_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    immediate.unlock_buffer(lock);
    assert!(immediate.has_commands(), "staged unlock records an upload");

    immediate.flush(FlushMode::FlushExecution);
    assert_eq!(device.buffer_contents(buffer), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_read_lock_sees_recorded_uploads() {
    let (device, mut immediate) = setup(Tunables::default());
    let buffer = device.create_buffer(4);
    immediate.update_buffer(buffer, 0, &[9, 8, 7, 6]);

    let lock = immediate.lock_buffer(buffer, 0, 4, LockMode::ReadOnly);
    assert_eq!(lock.data(), &[9, 8, 7, 6]);
    immediate.unlock_buffer(lock);
}

#[test]
fn test_unstaged_write_lock_goes_straight_to_device() {
    let tunables = Tunables {
        buffer_write_locks: false,
        ..Tunables::default()
    };
    let (device, mut immediate) = setup(tunables);
    let buffer = device.create_buffer(4);

    let mut lock = immediate.lock_buffer(buffer, 0, 4, LockMode::WriteOnly);
    lock.data_mut().copy_from_slice(&[4, 4, 4, 4]);
    immediate.unlock_buffer(lock);
    assert!(!immediate.has_commands());
    assert_eq!(device.buffer_contents(buffer), vec![4, 4, 4, 4]);
}

#[test]
#[should_panic(expected = "locked twice")]
fn test_double_lock_is_fatal() {
    let (device, mut immediate) = setup(Tunables::default());
    let buffer = device.create_buffer(4);
    let _first = immediate.lock_buffer(buffer, 0, 4, LockMode::WriteOnly);
    let _second = immediate.lock_buffer(buffer, 0, 4, LockMode::WriteOnly);
}

#[test]
fn test_execution_role_self_wait_is_fatal() {
    let (_device, mut immediate) = setup(Tunables::default());
    let (never, _held) = Fence::new();
    let child = immediate.create_command_list();

    immediate.record(Command::WaitForAndSubmitSubList {
        fence: Some(never),
        list: child.into(),
    });
    immediate.dispatch();

    let tasks = immediate.executor().tasks();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !tasks.is_poisoned() {
        assert!(Instant::now() < deadline, "self-wait was not detected");
        thread::sleep(Duration::from_millis(5));
    }
    let message = tasks.fatal_message().unwrap();
    assert!(message.contains("still pending on the execution role"), "{message}");
}

#[test]
fn test_wait_on_from_execution_role_is_fatal() {
    let (_device, mut immediate) = setup(Tunables::default());
    let executor = Arc::clone(immediate.executor());
    let (fence, signal) = Fence::new();

    let waiter = fence.clone();
    immediate.custom(move |_| executor.wait_on(&waiter));
    immediate.record(Command::SignalFence(signal));
    immediate.dispatch();

    let tasks = immediate.executor().tasks();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !tasks.is_poisoned() {
        assert!(Instant::now() < deadline, "wait_on from the execution role was not detected");
        thread::sleep(Duration::from_millis(5));
    }
    let message = tasks.fatal_message().unwrap();
    assert!(message.contains("wait_on"), "{message}");
    assert!(!fence.is_complete());
}

#[test]
fn test_render_thread_task_fence() {
    let (_device, mut immediate) = setup(Tunables::default());
    assert!(immediate.render_thread_task_fence().is_none());

    let (gate, open) = Fence::new();
    immediate.add_render_thread_task(gate);
    let fence = immediate.render_thread_task_fence().unwrap();
    assert!(!fence.is_complete());

    open.signal();
    immediate.wait_for_tasks();
    assert!(fence.is_complete());
}
