use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, Weak,
};

use crate::engine::context::FenceContext;

/// A legacy counter-based sync primitive.
///
/// Each buffer access through the legacy protocol takes a slot on one of
/// three pending counters (read, read2, write) at submission time, and the
/// hardware advances the matching complete counter when the operation
/// finishes. An operation's slot is satisfied once the complete counter
/// reaches the slot value, compared wrap-safe via
/// [`counter_reached`](crate::counter_reached).
///
/// A `SyncPoint` may be bridged to a [`FenceContext`], in which case
/// submissions that touch its buffer also publish fences.
pub struct SyncPoint {
    read_ops_pending: AtomicU32,
    read_ops_complete: AtomicU32,
    read_ops2_pending: AtomicU32,
    read_ops2_complete: AtomicU32,
    write_ops_pending: AtomicU32,
    write_ops_complete: AtomicU32,
    fence_context: Mutex<Weak<FenceContext>>,
}

impl SyncPoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            read_ops_pending: AtomicU32::new(0),
            read_ops_complete: AtomicU32::new(0),
            read_ops2_pending: AtomicU32::new(0),
            read_ops2_complete: AtomicU32::new(0),
            write_ops_pending: AtomicU32::new(0),
            write_ops_complete: AtomicU32::new(0),
            fence_context: Mutex::new(Weak::new()),
        })
    }

    /// Takes a read-op slot: post-increments the pending counter and
    /// returns the prior value.
    pub fn take_read_op(&self) -> u32 {
        self.read_ops_pending.fetch_add(1, Ordering::AcqRel)
    }

    /// Takes a read2-op slot: post-increments the pending counter and
    /// returns the prior value.
    pub fn take_read_op2(&self) -> u32 {
        self.read_ops2_pending.fetch_add(1, Ordering::AcqRel)
    }

    /// Takes a write-op slot: post-increments the pending counter and
    /// returns the prior value.
    pub fn take_write_op(&self) -> u32 {
        self.write_ops_pending.fetch_add(1, Ordering::AcqRel)
    }

    /// Advances the read-op complete counter by one. Called by the
    /// hardware-facing collaborator when a read operation finishes.
    pub fn complete_read_op(&self) -> u32 {
        self.read_ops_complete.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Advances the read2-op complete counter by one.
    pub fn complete_read_op2(&self) -> u32 {
        self.read_ops2_complete.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Advances the write-op complete counter by one.
    pub fn complete_write_op(&self) -> u32 {
        self.write_ops_complete.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn read_ops_pending(&self) -> u32 {
        self.read_ops_pending.load(Ordering::Acquire)
    }

    pub fn read_ops_complete(&self) -> u32 {
        self.read_ops_complete.load(Ordering::Acquire)
    }

    pub fn read_ops2_pending(&self) -> u32 {
        self.read_ops2_pending.load(Ordering::Acquire)
    }

    pub fn read_ops2_complete(&self) -> u32 {
        self.read_ops2_complete.load(Ordering::Acquire)
    }

    pub fn write_ops_pending(&self) -> u32 {
        self.write_ops_pending.load(Ordering::Acquire)
    }

    pub fn write_ops_complete(&self) -> u32 {
        self.write_ops_complete.load(Ordering::Acquire)
    }

    // Ordering fixups store an absolute value rather than incrementing:
    // the drain worker derives it from the frame's own slot snapshot.
    pub(crate) fn set_read_ops2_complete(&self, value: u32) {
        self.read_ops2_complete.store(value, Ordering::Release);
    }

    pub(crate) fn set_write_ops_complete(&self, value: u32) {
        self.write_ops_complete.store(value, Ordering::Release);
    }

    pub(crate) fn attach_context(&self, context: &Arc<FenceContext>) {
        *self.fence_context.lock().expect("sync point lock poisoned") = Arc::downgrade(context);
    }

    pub(crate) fn detach_context(&self) {
        *self.fence_context.lock().expect("sync point lock poisoned") = Weak::new();
    }

    /// The fence context bridging this sync point, if one was created.
    pub fn context(&self) -> Option<Arc<FenceContext>> {
        self.fence_context
            .lock()
            .expect("sync point lock poisoned")
            .upgrade()
    }
}

/// One entry of a submission's source or destination list: a sync handle
/// plus an enabled flag. Disabled slots are skipped entirely.
#[derive(Clone)]
pub struct SyncSlot {
    sync: Arc<SyncPoint>,
    enabled: bool,
}

impl SyncSlot {
    pub fn new(sync: Arc<SyncPoint>) -> Self {
        Self { sync, enabled: true }
    }

    pub fn disabled(sync: Arc<SyncPoint>) -> Self {
        Self { sync, enabled: false }
    }

    pub fn sync(&self) -> &Arc<SyncPoint> {
        &self.sync
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Iterates the enabled sync handles of a submission list.
pub(crate) fn enabled_syncs(slots: &[SyncSlot]) -> impl Iterator<Item = &Arc<SyncPoint>> {
    slots.iter().filter(|s| s.is_enabled()).map(|s| s.sync())
}
