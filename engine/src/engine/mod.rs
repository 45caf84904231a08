pub(crate) mod context;
mod drain;
pub mod error;
mod work_queue;

#[cfg(test)]
mod tests;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

use log::{debug, info, warn};

use crate::{
    cancel::CancelToken,
    engine::{
        context::{resv_would_block, FenceContext},
        error::EngineError,
        work_queue::{WorkItem, WorkQueue},
    },
    fence::{alloc_timeline, EngineStats, Fence, FenceOwner},
    multi_lock::{self, AcquireError, AcquireTicket, TicketLock},
    reservation::{BufferImport, ReservationObject},
    sync_point::{enabled_syncs, SyncPoint, SyncSlot},
    types::{AccessKind, Tag},
};

/// Process-wide collaborator notified after frames retire: completed work
/// may have unblocked further hardware operations.
pub trait DeviceCallbacks: Send + Sync {
    fn schedule(&self);
}

struct Registry {
    contexts: Vec<Weak<FenceContext>>,
    notify: Vec<Weak<FenceContext>>,
}

/// The engine's top-level handle.
///
/// Owns the context registry, the allocators (fence sequence numbers,
/// batch tags, lock tickets), and the drain worker. All entry points are
/// in-process calls; the submission path never blocks on hardware
/// completion.
pub struct FenceEngine {
    timeline: u64,
    device: Arc<dyn DeviceCallbacks>,
    stats: Arc<EngineStats>,
    seqno: AtomicU64,
    frame_tag: AtomicU32,
    lock_ticket: AtomicU64,
    registry: Mutex<Registry>,
    work: WorkQueue,
}

impl FenceEngine {
    pub fn new(device: Arc<dyn DeviceCallbacks>) -> Result<Arc<Self>, EngineError> {
        let engine = Arc::new(Self {
            timeline: alloc_timeline(),
            device,
            stats: Arc::new(EngineStats::default()),
            seqno: AtomicU64::new(0),
            frame_tag: AtomicU32::new(0),
            lock_ticket: AtomicU64::new(1),
            registry: Mutex::new(Registry {
                contexts: Vec::new(),
                notify: Vec::new(),
            }),
            work: WorkQueue::new(),
        });
        engine.work.start(Arc::downgrade(&engine))?;

        info!("fence engine initialized on timeline {}", engine.timeline);
        Ok(engine)
    }

    pub(crate) fn timeline(&self) -> u64 {
        self.timeline
    }

    pub(crate) fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub(crate) fn device(&self) -> &Arc<dyn DeviceCallbacks> {
        &self.device
    }

    pub(crate) fn new_fence(&self, owner: FenceOwner) -> Arc<Fence> {
        let seqno = self.seqno.fetch_add(1, Ordering::Relaxed);
        Fence::new_engine(self.timeline, seqno, owner, self.stats.clone())
    }

    fn next_tag(&self) -> Tag {
        loop {
            let raw = self.frame_tag.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if raw != 0 {
                return Tag::from_raw(raw);
            }
        }
    }

    /// A priority stamp for one multi-lock acquisition. Collaborators that
    /// attach their own fences to reservation objects take one of these to
    /// participate in the deadlock-avoidance protocol.
    pub fn acquire_ticket(&self) -> AcquireTicket {
        AcquireTicket::new(self.lock_ticket.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn queue_drain(&self, context: &Arc<FenceContext>) {
        if context.mark_work_queued() {
            self.work.submit(WorkItem::Drain(Arc::downgrade(context)));
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().expect("engine registry poisoned")
    }

    /// Creates a fence context bridging `sync` to the fence world.
    ///
    /// Fails with `InvalidParameters` when the import layer yields no
    /// native sync handle; nothing is leaked on failure.
    pub fn create_context(
        self: &Arc<Self>,
        sync: &Arc<SyncPoint>,
        import: &dyn BufferImport,
    ) -> Result<Arc<FenceContext>, EngineError> {
        let native = import
            .native_sync_handle()
            .ok_or(EngineError::InvalidParameters {
                reason: "buffer import has no native sync handle",
            })?;

        let context = FenceContext::new(sync.clone(), native, self);
        sync.attach_context(&context);
        self.lock_registry().contexts.push(Arc::downgrade(&context));

        info!("fence context {} created", context.key());
        Ok(context)
    }

    /// Destroys a fence context. The caller must have flushed all
    /// in-flight operations system-wide; any frames still queued are
    /// retired (signaled and freed) here. Destroying a context that is
    /// still referenced elsewhere is a programming-contract violation.
    pub fn destroy_context(&self, context: Arc<FenceContext>) {
        {
            let mut registry = self.lock_registry();
            registry
                .contexts
                .retain(|weak| weak.as_ptr() != Arc::as_ptr(&context));
            if context.is_on_notify_list() {
                registry
                    .notify
                    .retain(|weak| weak.as_ptr() != Arc::as_ptr(&context));
                context.set_on_notify_list(false);
            }
        }

        context.retire_all(self);
        context.sync().detach_context();

        // Wait out any drain pass already queued for this context before
        // checking that we hold the last reference.
        self.work.flush();

        info!("fence context {} destroyed", context.key());
        assert_eq!(
            Arc::strong_count(&context),
            1,
            "fence context still referenced at destroy"
        );
    }

    fn count_list(&self, slots: &[SyncSlot], is_destination: bool) -> (usize, bool) {
        let mut count = 0;
        let mut blocking = false;

        for sync in enabled_syncs(slots) {
            let Some(context) = sync.context() else {
                continue;
            };
            let Some(resv) = context.native().reservation_object() else {
                continue;
            };
            count += 1;
            if !blocking {
                blocking = resv_would_block(&resv, context.key(), is_destination);
            }
        }

        (count, blocking)
    }

    /// Counts the reservation objects a submission over these lists would
    /// touch, and whether any of them holds a fence the submission would
    /// have to wait for.
    pub fn count_participants(
        &self,
        sources: &[SyncSlot],
        dests: &[SyncSlot],
    ) -> (usize, bool) {
        let (src_count, src_blocking) = self.count_list(sources, false);
        let (dst_count, dst_blocking) = self.count_list(dests, true);
        (src_count + dst_count, src_blocking || dst_blocking)
    }

    fn collect_reservations(
        &self,
        sources: &[SyncSlot],
        dests: &[SyncSlot],
    ) -> Vec<Arc<ReservationObject>> {
        let mut resvs: Vec<Arc<ReservationObject>> = Vec::new();
        for sync in enabled_syncs(sources).chain(enabled_syncs(dests)) {
            let Some(context) = sync.context() else {
                continue;
            };
            let Some(resv) = context.native().reservation_object() else {
                continue;
            };
            if !resvs.iter().any(|known| Arc::ptr_eq(known, &resv)) {
                resvs.push(resv);
            }
        }
        resvs
    }

    fn notify_and_queue(&self, context: &Arc<FenceContext>) {
        let mut registry = self.lock_registry();
        if !context.is_on_notify_list() {
            registry.notify.push(Arc::downgrade(context));
            context.set_on_notify_list(true);
            self.queue_drain(context);
        }
    }

    fn register_list(
        self: &Arc<Self>,
        tag: Tag,
        slots: &[SyncSlot],
        kind: AccessKind,
        have_blocking_fences: bool,
    ) -> Result<(), EngineError> {
        for sync in enabled_syncs(slots) {
            let Some(context) = sync.context() else {
                continue;
            };
            let result = context.process_one(self, kind, tag, have_blocking_fences);
            self.notify_and_queue(&context);
            result?;
        }
        Ok(())
    }

    fn unblock_batch(&self, tag: Tag, sources: &[SyncSlot], dests: &[SyncSlot]) {
        for sync in enabled_syncs(sources).chain(enabled_syncs(dests)) {
            let Some(context) = sync.context() else {
                continue;
            };
            context.unblock_frames(tag);
            self.queue_drain(&context);
        }
    }

    /// Registers one submission's buffer accesses: locks every
    /// participating reservation object deadlock-free, publishes one fence
    /// per participating buffer (sources as shared, destinations as
    /// exclusive), records the dependencies each access must wait for, and
    /// queues the frames on their contexts' FIFOs.
    ///
    /// Returns the batch tag; `Tag::NONE` when no buffer bridges to a
    /// reservation object. Callers must pass the tag to
    /// [`release`](Self::release) once the downstream submission outcome is
    /// known — on failure that forces the published fences to signal.
    ///
    /// On error nothing remains registered un-unblocked: already-created
    /// frames of this batch are force-unblocked before the error surfaces.
    pub fn process(
        self: &Arc<Self>,
        sources: &[SyncSlot],
        dests: &[SyncSlot],
        cancel: Option<&CancelToken>,
    ) -> Result<Tag, EngineError> {
        let (count, have_blocking_fences) = self.count_participants(sources, dests);
        if count == 0 {
            return Ok(Tag::NONE);
        }

        let tag = self.next_tag();
        let resvs = self.collect_reservations(sources, dests);
        let ticket = self.acquire_ticket();
        let mut locks: Vec<Option<&TicketLock>> =
            resvs.iter().map(|resv| Some(resv.ticket_lock())).collect();

        // Without blocking fences this runs after the hardware op was
        // already queued; surfacing a retryable error then would be
        // inappropriate, so the wait is only interruptible when blocking
        // fences are possible.
        let cancel = if have_blocking_fences { cancel } else { None };
        multi_lock::lock_all(&mut locks, &ticket, cancel).map_err(|err| match err {
            AcquireError::Interrupted => EngineError::Interrupted,
            AcquireError::Backoff => unreachable!("lock_all retries backoff internally"),
        })?;

        let result = self
            .register_list(tag, sources, AccessKind::Source, have_blocking_fences)
            .and_then(|_| {
                self.register_list(tag, dests, AccessKind::Destination, have_blocking_fences)
            });

        multi_lock::unlock_all(&locks, &ticket);

        match result {
            Ok(()) => Ok(tag),
            Err(err) => {
                self.unblock_batch(tag, sources, dests);
                Err(err)
            }
        }
    }

    /// Force-unblocks every frame of `tag`, so its published fences signal
    /// without waiting for hardware completion. Safe to call with
    /// `Tag::NONE` (no-op) and idempotent otherwise; callers invoke this
    /// whenever the submission that followed [`process`](Self::process)
    /// failed downstream.
    pub fn release(&self, tag: Tag, sources: &[SyncSlot], dests: &[SyncSlot]) {
        if tag.is_none() {
            return;
        }
        debug!("releasing batch {:?}", tag);
        self.unblock_batch(tag, sources, dests);
    }

    /// Liveness sweep: queues a drain pass on every context that still has
    /// frames pending and prunes the rest from the notify list.
    pub fn check_all(&self) {
        let mut registry = self.registry.lock().expect("engine registry poisoned");
        let notify = std::mem::take(&mut registry.notify);
        for weak in notify {
            let Some(context) = weak.upgrade() else {
                continue;
            };
            if context.has_frames() {
                self.queue_drain(&context);
                registry.notify.push(weak);
            } else {
                context.set_on_notify_list(false);
            }
        }
    }
}

impl Drop for FenceEngine {
    fn drop(&mut self) {
        self.work.shutdown();

        let outstanding = self.stats.fences_outstanding.load(Ordering::Relaxed);
        if outstanding > 0 {
            warn!("{} fences leaked", outstanding);
        }
        debug!(
            "{} fences allocated, {} signaled, {} callbacks installed, {} called",
            self.stats.fences_allocated.load(Ordering::Relaxed),
            self.stats.fences_signaled.load(Ordering::Relaxed),
            self.stats.callbacks_installed.load(Ordering::Relaxed),
            self.stats.callbacks_called.load(Ordering::Relaxed),
        );

        let contexts_leaked = !self
            .registry
            .lock()
            .expect("engine registry poisoned")
            .contexts
            .is_empty();
        if contexts_leaked && !std::thread::panicking() {
            panic!("fence contexts leaked past engine shutdown");
        }
    }
}
