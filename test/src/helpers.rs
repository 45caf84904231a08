use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use fenceline::{
    BufferImport, DeviceCallbacks, FenceContext, FenceEngine, NativeSyncHandle, ReservationObject,
    SyncPoint, SyncSlot,
};

/// A buffer as the engine sees it: a legacy sync point plus the
/// reservation object its import side exposes.
pub struct TestBuffer {
    sync: Arc<SyncPoint>,
    resv: Arc<ReservationObject>,
}

struct TestNative {
    resv: Arc<ReservationObject>,
}

impl NativeSyncHandle for TestNative {
    fn reservation_object(&self) -> Option<Arc<ReservationObject>> {
        Some(self.resv.clone())
    }
}

impl BufferImport for TestBuffer {
    fn native_sync_handle(&self) -> Option<Arc<dyn NativeSyncHandle>> {
        Some(Arc::new(TestNative {
            resv: self.resv.clone(),
        }))
    }
}

impl Default for TestBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBuffer {
    pub fn new() -> Self {
        Self {
            sync: SyncPoint::new(),
            resv: ReservationObject::new(),
        }
    }

    pub fn sync(&self) -> &Arc<SyncPoint> {
        &self.sync
    }

    pub fn reservation(&self) -> &Arc<ReservationObject> {
        &self.resv
    }

    pub fn slot(&self) -> SyncSlot {
        SyncSlot::new(self.sync.clone())
    }

    /// Creates the fence context bridging this buffer into `engine`.
    pub fn bridge(&self, engine: &Arc<FenceEngine>) -> Arc<FenceContext> {
        engine
            .create_context(&self.sync, self)
            .expect("bridging a test buffer cannot fail")
    }
}

/// Counts drain-worker notifications that completed work may have
/// unblocked further hardware operations.
pub struct RecordingDevice {
    schedules: AtomicUsize,
}

impl RecordingDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schedules: AtomicUsize::new(0),
        })
    }

    pub fn schedules(&self) -> usize {
        self.schedules.load(Ordering::SeqCst)
    }
}

impl DeviceCallbacks for RecordingDevice {
    fn schedule(&self) {
        self.schedules.fetch_add(1, Ordering::SeqCst);
    }
}

/// Polls `predicate` until it holds or `timeout` elapses. Returns the
/// final predicate value.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return predicate();
        }
        thread::sleep(Duration::from_millis(1));
    }
}
