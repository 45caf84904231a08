use std::sync::{Arc, Mutex};

use crate::{engine::error::EngineError, fence::Fence, multi_lock::TicketLock};

/// Bridges an externally imported buffer into the engine. Implemented by
/// the import layer owning the buffer's page tables and identity.
pub trait BufferImport {
    /// The buffer's native synchronization handle, or `None` when the
    /// buffer cannot participate in cross-domain synchronization.
    fn native_sync_handle(&self) -> Option<Arc<dyn NativeSyncHandle>>;
}

/// Per-buffer native synchronization state held by the import layer.
pub trait NativeSyncHandle: Send + Sync {
    /// The buffer's reservation object, or `None` when no cross-domain
    /// synchronization is needed for this buffer.
    fn reservation_object(&self) -> Option<Arc<ReservationObject>>;
}

struct FenceSlots {
    exclusive: Option<Arc<Fence>>,
    shared: Vec<Arc<Fence>>,
}

/// Per-buffer record of the currently attached fences: at most one
/// exclusive fence and a set of shared fences.
///
/// The slots may be mutated only while the object's ticket lock is held
/// (the batch coordinator holds every participating lock for the duration
/// of a submission). Reads are allowed anytime and see a consistent
/// point-in-time snapshot.
pub struct ReservationObject {
    lock: TicketLock,
    slots: Mutex<FenceSlots>,
}

impl ReservationObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: TicketLock::new(),
            slots: Mutex::new(FenceSlots {
                exclusive: None,
                shared: Vec::new(),
            }),
        })
    }

    pub fn ticket_lock(&self) -> &TicketLock {
        &self.lock
    }

    pub fn exclusive_fence(&self) -> Option<Arc<Fence>> {
        self.slots
            .lock()
            .expect("reservation slots poisoned")
            .exclusive
            .clone()
    }

    pub fn shared_fences(&self) -> Vec<Arc<Fence>> {
        self.slots
            .lock()
            .expect("reservation slots poisoned")
            .shared
            .clone()
    }

    pub fn shared_count(&self) -> usize {
        self.slots
            .lock()
            .expect("reservation slots poisoned")
            .shared
            .len()
    }

    /// Pre-allocates room for additional shared fences, so a later
    /// [`add_shared`](Self::add_shared) cannot fail mid-update.
    pub fn reserve_shared(&self, additional: usize) -> Result<(), EngineError> {
        self.slots
            .lock()
            .expect("reservation slots poisoned")
            .shared
            .try_reserve(additional)
            .map_err(|_| EngineError::OutOfMemory {
                what: "shared fence slots",
            })
    }

    /// Attaches `fence` as the sole exclusive fence, dropping every shared
    /// fence. A destination (write) access serializes against everything
    /// recorded before it. Caller must hold the ticket lock.
    pub fn add_exclusive(&self, fence: Arc<Fence>) {
        let mut slots = self.slots.lock().expect("reservation slots poisoned");
        slots.exclusive = Some(fence);
        slots.shared.clear();
    }

    /// Attaches `fence` to the shared set. A fence from the same timeline
    /// replaces the previous one in place: one timeline can have at most
    /// one live shared access recorded per buffer. Caller must hold the
    /// ticket lock.
    pub fn add_shared(&self, fence: Arc<Fence>) {
        let mut slots = self.slots.lock().expect("reservation slots poisoned");
        if let Some(slot) = slots
            .shared
            .iter_mut()
            .find(|f| f.timeline() == fence.timeline())
        {
            *slot = fence;
        } else {
            slots.shared.push(fence);
        }
    }
}
