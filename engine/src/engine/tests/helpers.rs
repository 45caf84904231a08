use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    engine::{DeviceCallbacks, FenceEngine},
    reservation::{BufferImport, NativeSyncHandle, ReservationObject},
};

/// Waits until the drain worker has processed everything queued so far,
/// making worker-side state deterministic for the asserts that follow.
pub fn settle(engine: &FenceEngine) {
    engine.work.flush();
}

/// Import-layer stand-in: a buffer with a native sync handle and,
/// optionally, a reservation object behind it.
pub struct TestImport {
    resv: Option<Arc<ReservationObject>>,
}

impl TestImport {
    pub fn with_reservation() -> (Self, Arc<ReservationObject>) {
        let resv = ReservationObject::new();
        (
            Self {
                resv: Some(resv.clone()),
            },
            resv,
        )
    }

    pub fn without_reservation() -> Self {
        Self { resv: None }
    }
}

impl BufferImport for TestImport {
    fn native_sync_handle(&self) -> Option<Arc<dyn NativeSyncHandle>> {
        Some(Arc::new(TestNative {
            resv: self.resv.clone(),
        }))
    }
}

struct TestNative {
    resv: Option<Arc<ReservationObject>>,
}

impl NativeSyncHandle for TestNative {
    fn reservation_object(&self) -> Option<Arc<ReservationObject>> {
        self.resv.clone()
    }
}

/// An import with no native sync handle at all.
pub struct UnbridgedImport;

impl BufferImport for UnbridgedImport {
    fn native_sync_handle(&self) -> Option<Arc<dyn NativeSyncHandle>> {
        None
    }
}

/// Counts device-callback notifications from the drain worker.
pub struct CountingDevice {
    schedules: AtomicUsize,
}

impl CountingDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schedules: AtomicUsize::new(0),
        })
    }

    pub fn schedules(&self) -> usize {
        self.schedules.load(Ordering::SeqCst)
    }
}

impl DeviceCallbacks for CountingDevice {
    fn schedule(&self) {
        self.schedules.fetch_add(1, Ordering::SeqCst);
    }
}
