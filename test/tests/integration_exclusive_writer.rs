//! A reservation object records exactly one exclusive fence — the most
//! recently published write — and writes clear the shared set.

use std::sync::Arc;
use std::time::Duration;

use fenceline::FenceEngine;
use fenceline_test::{wait_until, RecordingDevice, TestBuffer};

#[test]
fn each_write_replaces_the_exclusive_fence() {
    let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");
    let buffer = TestBuffer::new();
    let context = buffer.bridge(&engine);

    let mut previous = None;
    for _ in 0..3 {
        engine
            .process(&[], &[buffer.slot()], None)
            .expect("submission");

        let current = buffer
            .reservation()
            .exclusive_fence()
            .expect("a write always leaves an exclusive fence");
        assert_eq!(buffer.reservation().shared_count(), 0);

        if let Some(previous) = previous {
            assert!(
                !Arc::ptr_eq(&previous, &current),
                "a new write must publish a new fence"
            );
        }
        previous = Some(current);
    }

    engine.destroy_context(context);
}

#[test]
fn reads_record_shared_fences_and_a_write_clears_them() {
    let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");
    let buffer = TestBuffer::new();
    let context = buffer.bridge(&engine);

    engine
        .process(&[buffer.slot()], &[], None)
        .expect("read submission");
    assert_eq!(buffer.reservation().shared_count(), 1);
    assert!(buffer.reservation().exclusive_fence().is_none());

    engine
        .process(&[], &[buffer.slot()], None)
        .expect("write submission");
    assert_eq!(buffer.reservation().shared_count(), 0);
    let exclusive = buffer
        .reservation()
        .exclusive_fence()
        .expect("write attached exclusive");

    assert!(wait_until(Duration::from_secs(5), || exclusive.is_signaled()));
    engine.destroy_context(context);
}
