use std::{
    mem,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::types::Tag;

static NEXT_TIMELINE: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh fence timeline identifier. Each [`crate::FenceEngine`]
/// takes one at construction; collaborators producing their own fences
/// (e.g. a display pipeline) should allocate their own so their fences are
/// recognized as foreign.
pub fn alloc_timeline() -> u64 {
    NEXT_TIMELINE.fetch_add(1, Ordering::Relaxed)
}

/// Callback invoked when a fence signals. Runs on the signaling thread and
/// must not block or re-enter the engine.
pub type FenceCallback = Box<dyn FnOnce() + Send>;

/// Handle for a registered fence callback, used to remove it again.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CallbackToken(u64);

/// Returned by [`Fence::add_callback`] when the fence already signaled;
/// the callback was not registered and will never run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fence was already signaled when the callback was added")]
pub struct AlreadySignaled;

/// Identity of the engine context and batch that published a fence.
/// Fences without an owner are foreign and always treated as blocking.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FenceOwner {
    pub context_key: u64,
    pub tag: Tag,
}

/// Engine-wide fence accounting, reported at shutdown.
#[derive(Default)]
pub(crate) struct EngineStats {
    pub fences_allocated: AtomicUsize,
    pub fences_signaled: AtomicUsize,
    pub fences_outstanding: AtomicUsize,
    pub callbacks_installed: AtomicUsize,
    pub callbacks_called: AtomicUsize,
}

struct FenceState {
    signaled: bool,
    next_token: u64,
    callbacks: Vec<(u64, FenceCallback)>,
}

/// A single-shot, uniquely sequenced completion signal.
///
/// Shared by reference counting (`Arc`); holders may wait on it, poll it,
/// or register callbacks. Once signaled a fence never unsignals, and
/// sequence numbers within one timeline strictly increase in creation
/// order.
pub struct Fence {
    timeline: u64,
    seqno: u64,
    owner: Option<FenceOwner>,
    stats: Option<Arc<EngineStats>>,
    state: Mutex<FenceState>,
    signaled_cond: Condvar,
}

impl Fence {
    pub(crate) fn new_engine(
        timeline: u64,
        seqno: u64,
        owner: FenceOwner,
        stats: Arc<EngineStats>,
    ) -> Arc<Self> {
        stats.fences_allocated.fetch_add(1, Ordering::Relaxed);
        stats.fences_outstanding.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            timeline,
            seqno,
            owner: Some(owner),
            stats: Some(stats),
            state: Mutex::new(FenceState {
                signaled: false,
                next_token: 0,
                callbacks: Vec::new(),
            }),
            signaled_cond: Condvar::new(),
        })
    }

    /// Creates a fence owned by an external collaborator. Such fences are
    /// always treated as blocking by the engine until they signal.
    pub fn external(timeline: u64, seqno: u64) -> Arc<Self> {
        Arc::new(Self {
            timeline,
            seqno,
            owner: None,
            stats: None,
            state: Mutex::new(FenceState {
                signaled: false,
                next_token: 0,
                callbacks: Vec::new(),
            }),
            signaled_cond: Condvar::new(),
        })
    }

    pub fn timeline(&self) -> u64 {
        self.timeline
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub(crate) fn owner(&self) -> Option<&FenceOwner> {
        self.owner.as_ref()
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().expect("fence lock poisoned").signaled
    }

    /// Signals the fence, wakes all waiters, and runs every registered
    /// callback on the calling thread. Signaling twice is a no-op.
    pub fn signal(&self) {
        let callbacks = {
            let mut state = self.state.lock().expect("fence lock poisoned");
            if state.signaled {
                return;
            }
            state.signaled = true;
            mem::take(&mut state.callbacks)
        };
        self.signaled_cond.notify_all();

        if let Some(stats) = &self.stats {
            stats.fences_signaled.fetch_add(1, Ordering::Relaxed);
        }

        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Registers a callback to run when the fence signals. Fails if the
    /// fence has already signaled; the caller must then handle completion
    /// directly.
    pub fn add_callback(&self, callback: FenceCallback) -> Result<CallbackToken, AlreadySignaled> {
        let mut state = self.state.lock().expect("fence lock poisoned");
        if state.signaled {
            return Err(AlreadySignaled);
        }
        let token = CallbackToken(state.next_token);
        state.next_token += 1;
        state.callbacks.push((token.0, callback));
        Ok(token)
    }

    /// Removes a callback registered earlier. Returns `true` when the
    /// callback was removed before it ran, `false` when the fence signaled
    /// first (the callback has run or is running).
    pub fn remove_callback(&self, token: CallbackToken) -> bool {
        let mut state = self.state.lock().expect("fence lock poisoned");
        let before = state.callbacks.len();
        state.callbacks.retain(|(id, _)| *id != token.0);
        state.callbacks.len() != before
    }

    /// Blocks until the fence signals or the timeout elapses. Returns
    /// whether the fence signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("fence lock poisoned");
        while !state.signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .signaled_cond
                .wait_timeout(state, deadline - now)
                .expect("fence lock poisoned");
            state = next;
        }
        true
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            stats.fences_outstanding.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
