//! Fences already handed to consumers must still signal when the
//! submission that published them fails downstream: releasing the batch
//! forces retirement without waiting for hardware completion.

use std::time::Duration;

use fenceline::FenceEngine;
use fenceline_test::{wait_until, RecordingDevice, TestBuffer};

#[test]
fn released_batch_signals_every_published_fence() {
    let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");

    let source = TestBuffer::new();
    let source_context = source.bridge(&engine);
    let dest = TestBuffer::new();
    let dest_context = dest.bridge(&engine);

    // Both hardware ops are queued but will never complete — the
    // submission failed after the fences were already published.
    source.sync().take_read_op();
    dest.sync().take_write_op();

    let src = [source.slot()];
    let dst = [dest.slot()];
    let tag = engine.process(&src, &dst, None).expect("submission");

    let read_fence = source
        .reservation()
        .shared_fences()
        .pop()
        .expect("read published a shared fence");
    let write_fence = dest
        .reservation()
        .exclusive_fence()
        .expect("write published an exclusive fence");

    assert!(
        !wait_until(Duration::from_millis(50), || read_fence.is_signaled()
            || write_fence.is_signaled()),
        "nothing may signal while hardware is outstanding"
    );

    engine.release(tag, &src, &dst);
    assert!(wait_until(Duration::from_secs(5), || {
        read_fence.is_signaled() && write_fence.is_signaled()
    }));

    engine.destroy_context(source_context);
    engine.destroy_context(dest_context);
}

#[test]
fn device_callbacks_fire_when_frames_retire() {
    let device = RecordingDevice::new();
    let engine = FenceEngine::new(device.clone()).expect("engine starts");
    let buffer = TestBuffer::new();
    let context = buffer.bridge(&engine);

    engine
        .process(&[], &[buffer.slot()], None)
        .expect("submission");

    assert!(wait_until(Duration::from_secs(5), || device.schedules() >= 1));
    engine.destroy_context(context);
}
