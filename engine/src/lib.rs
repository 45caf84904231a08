//! # Fenceline
//! A buffer synchronization engine: bridges legacy counter-based sync
//! primitives to single-shot fences, arbitrating the order in which
//! independent producers and consumers of a shared buffer may access it.
//!
//! One [`FenceContext`] exists per bridged sync primitive. Submitting a
//! batch through [`FenceEngine::process`] locks every participating
//! buffer's [`ReservationObject`] deadlock-free, publishes one [`Fence`]
//! per buffer access, and records the foreign fences each access must wait
//! for. A per-engine drain worker retires frames strictly in registration
//! order once their dependencies and hardware completion are satisfied —
//! the submission path itself never blocks on hardware.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod cancel;
mod engine;
mod fence;
mod multi_lock;
mod reservation;
mod sync_point;
mod types;
mod wrapping_counter;

pub use cancel::CancelToken;
pub use engine::{
    context::FenceContext,
    error::EngineError,
    DeviceCallbacks, FenceEngine,
};
pub use fence::{alloc_timeline, AlreadySignaled, CallbackToken, Fence, FenceCallback};
pub use multi_lock::{
    lock_all, unlock_all, AcquireError, AcquireTicket, Acquired, TicketLock,
};
pub use reservation::{BufferImport, NativeSyncHandle, ReservationObject};
pub use sync_point::{SyncPoint, SyncSlot};
pub use types::{AccessKind, Tag};
pub use wrapping_counter::{counter_passed, counter_reached};
