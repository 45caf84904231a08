//! Context and engine teardown: queued frames are retired at destroy,
//! the sync point detaches, and fences outlive the engine that made them.

use std::time::Duration;

use fenceline::FenceEngine;
use fenceline_test::{wait_until, RecordingDevice, TestBuffer};

#[test]
fn destroy_signals_queued_frames_and_detaches() {
    let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");
    let buffer = TestBuffer::new();
    let context = buffer.bridge(&engine);

    // Hardware op that never completes keeps the frame queued.
    buffer.sync().take_write_op();
    engine
        .process(&[], &[buffer.slot()], None)
        .expect("submission");
    let fence = buffer
        .reservation()
        .exclusive_fence()
        .expect("fence attached");

    assert!(!wait_until(Duration::from_millis(50), || fence.is_signaled()));

    engine.destroy_context(context);
    assert!(fence.is_signaled(), "destroy must retire queued frames");
    assert!(buffer.sync().context().is_none());
}

#[test]
fn fences_outlive_the_engine() {
    let buffer = TestBuffer::new();
    let fence = {
        let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");
        let context = buffer.bridge(&engine);

        engine
            .process(&[], &[buffer.slot()], None)
            .expect("submission");
        let fence = buffer
            .reservation()
            .exclusive_fence()
            .expect("fence attached");
        assert!(wait_until(Duration::from_secs(5), || fence.is_signaled()));

        engine.destroy_context(context);
        fence
    };

    // The engine is gone; the fence handle stays valid and signaled.
    assert!(fence.is_signaled());
}

#[test]
fn hardware_completion_is_picked_up_by_the_liveness_sweep() {
    let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");
    let buffer = TestBuffer::new();
    let context = buffer.bridge(&engine);

    buffer.sync().take_write_op();
    engine
        .process(&[], &[buffer.slot()], None)
        .expect("submission");
    let fence = buffer
        .reservation()
        .exclusive_fence()
        .expect("fence attached");

    assert!(!wait_until(Duration::from_millis(50), || fence.is_signaled()));

    // Counter movement alone wakes nobody; the periodic sweep does.
    buffer.sync().complete_write_op();
    engine.check_all();
    assert!(wait_until(Duration::from_secs(5), || fence.is_signaled()));

    engine.destroy_context(context);
}
