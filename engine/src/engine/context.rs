use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use crate::{
    engine::{error::EngineError, FenceEngine},
    fence::{CallbackToken, EngineStats, Fence, FenceOwner},
    reservation::{NativeSyncHandle, ReservationObject},
    sync_point::SyncPoint,
    types::{AccessKind, Tag},
};

static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Sub-state of a frame that needed a synthetic ordering fixup: the legacy
/// pending counter it took a slot on must be advanced once its blocking
/// fences have drained, before real completion can be evaluated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockedOn {
    None,
    Read,
    Write,
}

/// Counts a frame's outstanding blocking fences. Shared with the fence
/// callbacks so a late signal stays safe no matter when the frame itself
/// is retired.
pub(crate) struct FrameGate {
    remaining: AtomicUsize,
    context: Weak<FenceContext>,
    engine: Weak<FenceEngine>,
}

impl FrameGate {
    fn blocking_signaled(self: &Arc<Self>) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let (Some(engine), Some(context)) = (self.engine.upgrade(), self.context.upgrade()) {
                engine.queue_drain(&context);
            }
        }
    }
}

struct BlockingSlot {
    fence: Arc<Fence>,
    token: CallbackToken,
}

/// One participation of one buffer access in one submitted batch.
pub(crate) struct FenceFrame {
    pub kind: AccessKind,
    pub tag: Tag,
    pub read_ops_pending: u32,
    pub read_ops2_pending: u32,
    pub write_ops_pending: u32,
    pub blocked_on: BlockedOn,
    blocking: Vec<BlockingSlot>,
    gate: Arc<FrameGate>,
    pub fence_to_signal: Option<Arc<Fence>>,
    pub unblock: bool,
    pub have_blocking_fences: bool,
}

impl FenceFrame {
    fn new(
        context: &Arc<FenceContext>,
        engine: &Arc<FenceEngine>,
        kind: AccessKind,
        tag: Tag,
        have_blocking_fences: bool,
    ) -> Self {
        Self {
            kind,
            tag,
            read_ops_pending: 0,
            read_ops2_pending: 0,
            write_ops_pending: 0,
            blocked_on: BlockedOn::None,
            blocking: Vec::new(),
            gate: Arc::new(FrameGate {
                remaining: AtomicUsize::new(0),
                context: Arc::downgrade(context),
                engine: Arc::downgrade(engine),
            }),
            fence_to_signal: None,
            unblock: false,
            have_blocking_fences,
        }
    }

    fn reserve_blocking(&mut self, count: usize) -> Result<(), EngineError> {
        self.blocking
            .try_reserve(count)
            .map_err(|_| EngineError::OutOfMemory {
                what: "blocking fence storage",
            })
    }

    /// Registers a completion callback on `fence` and holds a reference to
    /// it. Returns whether the callback was actually installed; a fence
    /// that already signaled contributes nothing to the gate.
    fn install_blocking(&mut self, fence: Arc<Fence>, stats: &Arc<EngineStats>) -> bool {
        self.gate.remaining.fetch_add(1, Ordering::AcqRel);

        let gate = self.gate.clone();
        let counter = stats.clone();
        match fence.add_callback(Box::new(move || {
            counter.callbacks_called.fetch_add(1, Ordering::Relaxed);
            gate.blocking_signaled();
        })) {
            Ok(token) => {
                stats.callbacks_installed.fetch_add(1, Ordering::Relaxed);
                self.blocking.push(BlockingSlot { fence, token });
                true
            }
            Err(_) => {
                self.gate.remaining.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    pub(crate) fn gate_open(&self) -> bool {
        self.gate.remaining.load(Ordering::Acquire) == 0
    }

    fn uninstall_blocking(&mut self) {
        for slot in self.blocking.drain(..) {
            if slot.fence.remove_callback(slot.token) {
                self.gate.remaining.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

pub(crate) struct ContextInner {
    pub frames: VecDeque<FenceFrame>,
}

/// Bridges one legacy sync primitive to the fence world: owns the FIFO of
/// pending frames for its buffer and the handle to the native import side.
///
/// The frame FIFO is processed strictly head-first by the drain worker; a
/// frame may only retire once every frame ahead of it has retired.
pub struct FenceContext {
    key: u64,
    sync: Arc<SyncPoint>,
    native: Arc<dyn NativeSyncHandle>,
    engine: Weak<FenceEngine>,
    inner: Mutex<ContextInner>,
    // Collapses redundant drain wakes; cleared before a pass runs so wakes
    // arriving mid-pass queue another pass.
    work_pending: AtomicBool,
    // Mutated only while the engine registry lock is held.
    on_notify_list: AtomicBool,
}

impl FenceContext {
    pub(crate) fn new(
        sync: Arc<SyncPoint>,
        native: Arc<dyn NativeSyncHandle>,
        engine: &Arc<FenceEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed),
            sync,
            native,
            engine: Arc::downgrade(engine),
            inner: Mutex::new(ContextInner {
                frames: VecDeque::new(),
            }),
            work_pending: AtomicBool::new(false),
            on_notify_list: AtomicBool::new(false),
        })
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn sync(&self) -> &Arc<SyncPoint> {
        &self.sync
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeSyncHandle> {
        &self.native
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().expect("fence context lock poisoned")
    }

    pub(crate) fn mark_work_queued(&self) -> bool {
        !self.work_pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_work_pending(&self) {
        self.work_pending.store(false, Ordering::Release);
    }

    pub(crate) fn is_on_notify_list(&self) -> bool {
        self.on_notify_list.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_notify_list(&self, on: bool) {
        self.on_notify_list.store(on, Ordering::Release);
    }

    /// Whether any frames are still queued. Used by the liveness sweep to
    /// prune the notify list.
    pub(crate) fn has_frames(&self) -> bool {
        !self.lock_inner().frames.is_empty()
    }

    /// Creates and registers one frame for this context's buffer. Caller
    /// holds the buffer's reservation ticket lock.
    pub(crate) fn process_one(
        self: &Arc<Self>,
        engine: &Arc<FenceEngine>,
        kind: AccessKind,
        tag: Tag,
        have_blocking_fences: bool,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock_inner();

        let Some(resv) = self.native.reservation_object() else {
            return Ok(());
        };

        let mut frame = FenceFrame::new(self, engine, kind, tag, have_blocking_fences);

        let blocked_on = match kind {
            AccessKind::Destination => {
                update_reservation_dst(engine, self.key, &mut frame, &resv)?
            }
            AccessKind::Source => update_reservation_src(engine, self.key, &mut frame, &resv)?,
        };
        assert!(
            blocked_on == BlockedOn::None || have_blocking_fences,
            "ordering fixup without blocking fences"
        );
        frame.blocked_on = blocked_on;

        // Without blocking fences the pending values are recorded after
        // they were advanced for the hardware op, rather than before; the
        // drain-side completion test differs accordingly.
        frame.read_ops_pending = self.sync.read_ops_pending();
        frame.read_ops2_pending = if frame.blocked_on == BlockedOn::Read {
            self.sync.take_read_op2()
        } else {
            self.sync.read_ops2_pending()
        };
        frame.write_ops_pending = if frame.blocked_on == BlockedOn::Write {
            self.sync.take_write_op()
        } else {
            self.sync.write_ops_pending()
        };

        inner.frames.push_back(frame);
        Ok(())
    }

    /// Marks every frame of `tag` for forced retirement.
    pub(crate) fn unblock_frames(&self, tag: Tag) {
        let mut inner = self.lock_inner();
        for frame in inner.frames.iter_mut() {
            if frame.tag == tag {
                frame.unblock = true;
            }
        }
    }

    /// Signals and frees one already-unlinked frame. Never touches the
    /// frame FIFO, so it may run with the context lock held.
    pub(crate) fn retire_frame(self: &Arc<Self>, engine: &FenceEngine, mut frame: FenceFrame) {
        if let Some(fence) = frame.fence_to_signal.take() {
            fence.signal();
            engine.queue_drain(self);
        }
        frame.uninstall_blocking();
    }

    /// Retires every queued frame, in order. Used at context destruction;
    /// the caller guarantees all in-flight operations were flushed.
    pub(crate) fn retire_all(self: &Arc<Self>, engine: &FenceEngine) {
        let mut inner = self.lock_inner();
        while let Some(frame) = inner.frames.pop_front() {
            self.retire_frame(engine, frame);
        }
    }
}

/// Blocking test on the submit path, where the frame's batch tag exists:
/// a fence never blocks its own context, nor any frame of the same batch
/// (self-deadlock avoidance when one buffer appears in both lists).
fn is_blocking_fence(fence: &Fence, context_key: u64, tag: Tag) -> bool {
    match fence.owner() {
        Some(owner) => owner.context_key != context_key && owner.tag != tag,
        None => true,
    }
}

/// Blocking test on the counting path, before a tag exists. Signaled
/// fences never block; engine fences block only when published through a
/// different context.
fn fence_would_block(fence: &Fence, context_key: u64) -> bool {
    if fence.is_signaled() {
        return false;
    }
    match fence.owner() {
        Some(owner) => owner.context_key != context_key,
        None => true,
    }
}

/// Scans a reservation object's attached fences for anything a new access
/// by `context_key` would have to wait for.
pub(crate) fn resv_would_block(
    resv: &ReservationObject,
    context_key: u64,
    is_destination: bool,
) -> bool {
    let shared = resv.shared_fences();

    let mut blocking = false;
    if is_destination {
        blocking = shared.iter().any(|f| fence_would_block(f, context_key));
    }

    if !blocking && shared.is_empty() {
        blocking = resv
            .exclusive_fence()
            .is_some_and(|f| fence_would_block(&f, context_key));
    }

    blocking
}

fn create_fence_to_signal(
    engine: &FenceEngine,
    context_key: u64,
    frame: &mut FenceFrame,
) -> Arc<Fence> {
    let fence = engine.new_fence(FenceOwner {
        context_key,
        tag: frame.tag,
    });
    frame.fence_to_signal = Some(fence.clone());
    fence
}

/// Destination (write) update: the new fence becomes the sole exclusive
/// fence, after every foreign fence currently attached has been tracked as
/// blocking. With no shared fences only the exclusive fence can block and
/// the fixup (if any) lands on the write counter; otherwise the shared set
/// blocks and the fixup lands on the read counter.
fn update_reservation_dst(
    engine: &FenceEngine,
    context_key: u64,
    frame: &mut FenceFrame,
    resv: &ReservationObject,
) -> Result<BlockedOn, EngineError> {
    let shared = resv.shared_fences();
    let fence_to_signal = create_fence_to_signal(engine, context_key, frame);

    if !frame.have_blocking_fences {
        resv.add_exclusive(fence_to_signal);
        return Ok(BlockedOn::None);
    }

    if shared.is_empty() {
        let mut installed = false;
        if let Some(exclusive) = resv.exclusive_fence() {
            if is_blocking_fence(&exclusive, context_key, frame.tag) {
                frame.reserve_blocking(1)?;
                installed = frame.install_blocking(exclusive, engine.stats());
            }
        }
        resv.add_exclusive(fence_to_signal);
        return Ok(if installed {
            BlockedOn::Write
        } else {
            BlockedOn::None
        });
    }

    let blocking: Vec<Arc<Fence>> = shared
        .iter()
        .filter(|f| is_blocking_fence(f, context_key, frame.tag))
        .cloned()
        .collect();

    let mut installed_any = false;
    if !blocking.is_empty() {
        frame.reserve_blocking(blocking.len())?;
        for fence in blocking {
            installed_any |= frame.install_blocking(fence, engine.stats());
        }
    }

    resv.add_exclusive(fence_to_signal);
    Ok(if installed_any {
        BlockedOn::Read
    } else {
        BlockedOn::None
    })
}

/// Source (read) update: the new fence joins the shared set. At most one
/// foreign fence needs tracking — the engine-owned shared fence of another
/// context, or the exclusive fence when the shared set is empty. A shared
/// slot is reserved only when no engine-owned fence already occupies one.
fn update_reservation_src(
    engine: &FenceEngine,
    context_key: u64,
    frame: &mut FenceFrame,
    resv: &ReservationObject,
) -> Result<BlockedOn, EngineError> {
    if !frame.have_blocking_fences {
        resv.reserve_shared(1)?;
        let fence_to_signal = create_fence_to_signal(engine, context_key, frame);
        resv.add_shared(fence_to_signal);
        return Ok(BlockedOn::None);
    }

    let shared = resv.shared_fences();
    let shared_count = shared.len();

    // One timeline holds at most one shared slot per buffer, so an
    // engine-owned entry means no new slot is needed, but it must be
    // waited on if it belongs to a different context.
    let mut reserve = true;
    let mut blocking_fence: Option<Arc<Fence>> = None;
    for fence in &shared {
        if fence.timeline() == engine.timeline() {
            reserve = false;
            if is_blocking_fence(fence, context_key, frame.tag) {
                blocking_fence = Some(fence.clone());
            }
            break;
        }
    }

    if reserve {
        resv.reserve_shared(1)?;
    }

    let fence_to_signal = create_fence_to_signal(engine, context_key, frame);

    if blocking_fence.is_none() && shared_count == 0 {
        if let Some(exclusive) = resv.exclusive_fence() {
            if is_blocking_fence(&exclusive, context_key, frame.tag) {
                blocking_fence = Some(exclusive);
            }
        }
    }

    let mut installed = false;
    if let Some(fence) = blocking_fence {
        frame.reserve_blocking(1)?;
        installed = frame.install_blocking(fence, engine.stats());
    }

    resv.add_shared(fence_to_signal);

    Ok(if !installed {
        BlockedOn::None
    } else if shared_count == 0 {
        BlockedOn::Write
    } else {
        BlockedOn::Read
    })
}
