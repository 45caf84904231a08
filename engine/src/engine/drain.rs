use std::sync::Arc;

use log::debug;

use crate::{
    engine::{
        context::{BlockedOn, FenceContext, FenceFrame},
        FenceEngine,
    },
    sync_point::SyncPoint,
    types::AccessKind,
    wrapping_counter::{counter_passed, counter_reached},
};

/// A frame is ready for evaluation once every legacy counter it snapshotted
/// has been reached. Source frames do not gate on the plain read counter;
/// their own operation is the read.
fn frame_is_ready(frame: &FenceFrame, sync: &SyncPoint) -> bool {
    (!frame.kind.is_destination()
        || counter_reached(sync.read_ops_complete(), frame.read_ops_pending))
        && counter_reached(sync.read_ops2_complete(), frame.read_ops2_pending)
        && counter_reached(sync.write_ops_complete(), frame.write_ops_pending)
}

// With blocking fences the pending value was snapshotted before the
// hardware op took its slot, so completion means the counter moved past
// it; without them the snapshot was taken afterwards and reaching it is
// enough.
fn read_op_is_complete(frame: &FenceFrame, sync: &SyncPoint) -> bool {
    if frame.have_blocking_fences {
        counter_passed(sync.read_ops_complete(), frame.read_ops_pending)
    } else {
        counter_reached(sync.read_ops_complete(), frame.read_ops_pending)
    }
}

fn write_op_is_complete(frame: &FenceFrame, sync: &SyncPoint) -> bool {
    if frame.have_blocking_fences {
        counter_passed(sync.write_ops_complete(), frame.write_ops_pending)
    } else {
        counter_reached(sync.write_ops_complete(), frame.write_ops_pending)
    }
}

/// The one-time ordering fixup: the frame took a slot on the pending
/// counter at registration; now that its blocking fences drained, mark
/// that slot complete so operations queued behind it may proceed. Clears
/// the blocked-on sub-state so the fixup cannot apply twice.
fn apply_fixup(frame: &mut FenceFrame, sync: &SyncPoint) {
    match frame.blocked_on {
        BlockedOn::Read => {
            frame.read_ops2_pending = frame.read_ops2_pending.wrapping_add(1);
            sync.set_read_ops2_complete(frame.read_ops2_pending);
        }
        BlockedOn::Write => {
            frame.write_ops_pending = frame.write_ops_pending.wrapping_add(1);
            sync.set_write_ops_complete(frame.write_ops_pending);
        }
        BlockedOn::None => {}
    }
    frame.blocked_on = BlockedOn::None;
}

/// One drain pass over a context's frame FIFO.
///
/// Retires head frames whose blocking fences have all signaled and whose
/// hardware completion condition holds (or which were force-unblocked),
/// strictly in registration order. A frame with a pending ordering fixup
/// has the fixup applied exactly once and is then re-evaluated in place.
/// Device callbacks are notified only after the context lock is released.
pub(crate) fn drain_context(engine: &Arc<FenceEngine>, context: &Arc<FenceContext>) {
    let mut notify_device = false;

    {
        let mut inner = context.lock_inner();
        loop {
            let mut reprocess = false;
            let mut retire = false;

            if let Some(frame) = inner.frames.front_mut() {
                if frame.gate_open() {
                    let ready = frame_is_ready(frame, context.sync());

                    if frame.unblock {
                        // Forced retirement: the submission failed
                        // downstream, so hardware completion may never
                        // arrive. The pending fixup is still applied when
                        // the counters allow it, keeping frames queued
                        // behind this one live.
                        notify_device = true;
                        if ready {
                            apply_fixup(frame, context.sync());
                        }
                        retire = true;
                    } else if ready {
                        notify_device = true;

                        match frame.blocked_on {
                            BlockedOn::Read | BlockedOn::Write => {
                                apply_fixup(frame, context.sync());
                                reprocess = true;
                            }
                            BlockedOn::None => {
                                retire = match frame.kind {
                                    AccessKind::Destination => {
                                        write_op_is_complete(frame, context.sync())
                                    }
                                    AccessKind::Source => {
                                        read_op_is_complete(frame, context.sync())
                                    }
                                };
                            }
                        }
                    }
                }
            }

            if retire {
                let frame = inner
                    .frames
                    .pop_front()
                    .expect("head frame evaluated above");
                debug!(
                    "context {}: retiring {:?} frame of batch {:?}",
                    context.key(),
                    frame.kind,
                    frame.tag
                );
                context.retire_frame(engine, frame);
            } else if !reprocess {
                break;
            }
        }
    }

    if notify_device {
        engine.device().schedule();
    }
}
