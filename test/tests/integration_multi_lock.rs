//! Concurrent submissions over overlapping buffer sets listed in opposite
//! orders must all complete — the ticket protocol resolves the contention
//! instead of deadlocking.

use std::{sync::Arc, thread, time::Duration};

use fenceline::{Acquired, CancelToken, EngineError, Fence, FenceEngine, SyncSlot};
use fenceline_test::{RecordingDevice, TestBuffer};

#[test]
fn reversed_overlapping_batches_all_complete() {
    let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");

    let x = TestBuffer::new();
    let context_x = x.bridge(&engine);
    let y = TestBuffer::new();
    let context_y = y.bridge(&engine);

    const ROUNDS: usize = 200;

    let spawn_submitter = |engine: Arc<FenceEngine>, read: SyncSlot, write: SyncSlot| {
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                let src = [read.clone()];
                let dst = [write.clone()];
                let tag = engine.process(&src, &dst, None)?;
                engine.release(tag, &src, &dst);
            }
            Ok::<(), EngineError>(())
        })
    };

    // A locks {X, Y}; B locks {Y, X}.
    let a = spawn_submitter(engine.clone(), x.slot(), y.slot());
    let b = spawn_submitter(engine.clone(), y.slot(), x.slot());

    a.join().expect("submitter A panicked").expect("A failed");
    b.join().expect("submitter B panicked").expect("B failed");

    engine.destroy_context(context_x);
    engine.destroy_context(context_y);
}

#[test]
fn cancelled_acquisition_registers_nothing() {
    let engine = FenceEngine::new(RecordingDevice::new()).expect("engine starts");
    let buffer = TestBuffer::new();
    let context = buffer.bridge(&engine);

    // A foreign holder makes blocking fences possible, which is what makes
    // the lock acquisition interruptible in the first place.
    let foreign = Fence::external(fenceline::alloc_timeline(), 0);
    buffer.reservation().add_exclusive(foreign.clone());

    // An older ticket sits on the buffer's lock, so the submission has to
    // wait — and can be cancelled while doing so.
    let ticket = engine.acquire_ticket();
    assert_eq!(
        buffer
            .reservation()
            .ticket_lock()
            .try_acquire(&ticket, None),
        Ok(Acquired::Taken)
    );

    let cancel = CancelToken::new();
    let submitter = {
        let engine = engine.clone();
        let slot = buffer.slot();
        let cancel = cancel.clone();
        thread::spawn(move || engine.process(&[], &[slot], Some(&cancel)))
    };

    thread::sleep(Duration::from_millis(20));
    cancel.cancel();
    let result = submitter.join().expect("submitter panicked");
    assert_eq!(result, Err(EngineError::Interrupted));

    // Nothing was attached or registered while waiting.
    let exclusive = buffer
        .reservation()
        .exclusive_fence()
        .expect("foreign fence still attached");
    assert!(Arc::ptr_eq(&exclusive, &foreign));

    // Once the lock frees up, the same submission goes through.
    buffer.reservation().ticket_lock().release(&ticket);
    let tag = engine
        .process(&[], &[buffer.slot()], None)
        .expect("uncontended submission");
    assert!(!tag.is_none());

    foreign.signal();
    engine.release(tag, &[], &[buffer.slot()]);
    engine.destroy_context(context);
}
