//! Deadlock-avoiding acquisition of many per-buffer locks.
//!
//! Every batch acquires all of its buffers' locks before touching any of
//! them, and concurrent batches may list the same buffers in different
//! orders. Plain mutexes would deadlock, so each acquisition carries a
//! monotonic priority ticket: a request against a lock held by an *older*
//! ticket backs off immediately, a request against a *younger* holder
//! waits. On backoff the caller releases everything, waits for the
//! contended lock first ([`TicketLock::acquire_slow`]), and retries the
//! whole sequence — bounding retries by the number of locks, since the
//! oldest active ticket is never asked to back off.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::Duration,
};

use thiserror::Error;

use crate::cancel::CancelToken;

// How often a waiting acquirer re-checks its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Errors surfaced while acquiring a [`TicketLock`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// The lock is held by a higher-priority (older) ticket. The caller
    /// must release every lock it holds, then retry starting with
    /// [`TicketLock::acquire_slow`] on this lock.
    #[error("lock held by a higher-priority ticket, caller must back off")]
    Backoff,

    /// The caller's cancel token fired while waiting. Nothing is held.
    #[error("lock acquisition interrupted by caller cancellation")]
    Interrupted,
}

/// Successful [`TicketLock::try_acquire`] outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The lock was taken by this call.
    Taken,
    /// This ticket already held the lock (duplicate entry in the batch).
    AlreadyHeld,
}

/// Priority stamp for one multi-lock acquisition sequence. Lower stamps are
/// older and win contention. Obtained from
/// [`crate::FenceEngine::acquire_ticket`] so stamps are totally ordered
/// across concurrent batches.
pub struct AcquireTicket {
    stamp: u64,
}

impl AcquireTicket {
    pub(crate) fn new(stamp: u64) -> Self {
        Self { stamp }
    }
}

/// A lock participating in the ticket-priority protocol.
pub struct TicketLock {
    holder: Mutex<Option<u64>>,
    freed: Condvar,
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketLock {
    pub fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            freed: Condvar::new(),
        }
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Option<u64>>,
        cancel: Option<&CancelToken>,
    ) -> Result<MutexGuard<'a, Option<u64>>, AcquireError> {
        match cancel {
            None => Ok(self.freed.wait(guard).expect("ticket lock poisoned")),
            Some(token) => {
                if token.is_cancelled() {
                    return Err(AcquireError::Interrupted);
                }
                let (guard, _) = self
                    .freed
                    .wait_timeout(guard, CANCEL_POLL)
                    .expect("ticket lock poisoned");
                Ok(guard)
            }
        }
    }

    /// Acquires the lock, backing off when the holder outranks the caller.
    pub fn try_acquire(
        &self,
        ticket: &AcquireTicket,
        cancel: Option<&CancelToken>,
    ) -> Result<Acquired, AcquireError> {
        let mut holder = self.holder.lock().expect("ticket lock poisoned");
        loop {
            match *holder {
                None => {
                    *holder = Some(ticket.stamp);
                    return Ok(Acquired::Taken);
                }
                Some(current) if current == ticket.stamp => return Ok(Acquired::AlreadyHeld),
                Some(current) if current < ticket.stamp => return Err(AcquireError::Backoff),
                Some(_) => {
                    holder = self.wait(holder, cancel)?;
                }
            }
        }
    }

    /// Waits for the lock unconditionally and takes it. Only valid when the
    /// caller holds no other lock (the backoff retry path).
    pub fn acquire_slow(
        &self,
        ticket: &AcquireTicket,
        cancel: Option<&CancelToken>,
    ) -> Result<(), AcquireError> {
        let mut holder = self.holder.lock().expect("ticket lock poisoned");
        loop {
            match *holder {
                None => {
                    *holder = Some(ticket.stamp);
                    return Ok(());
                }
                Some(current) if current == ticket.stamp => return Ok(()),
                Some(_) => {
                    holder = self.wait(holder, cancel)?;
                }
            }
        }
    }

    /// Releases the lock. Releasing a lock held by another ticket is a
    /// programming-contract violation.
    pub fn release(&self, ticket: &AcquireTicket) {
        let mut holder = self.holder.lock().expect("ticket lock poisoned");
        assert_eq!(
            holder.take(),
            Some(ticket.stamp),
            "ticket lock released by a non-holder"
        );
        drop(holder);
        self.freed.notify_all();
    }
}

fn release_range(locks: &[Option<&TicketLock>], ticket: &AcquireTicket, end: usize) {
    for lock in locks[..end].iter().flatten() {
        lock.release(ticket);
    }
}

fn lock_all_no_retry(
    locks: &mut [Option<&TicketLock>],
    ticket: &AcquireTicket,
    cancel: Option<&CancelToken>,
    contended: &mut Option<usize>,
) -> Result<(), AcquireError> {
    for index in 0..locks.len() {
        let Some(lock) = locks[index] else {
            continue;
        };
        if *contended == Some(index) {
            // Held already via acquire_slow on the previous round.
            *contended = None;
            continue;
        }

        match lock.try_acquire(ticket, cancel) {
            Ok(Acquired::Taken) => {}
            Ok(Acquired::AlreadyHeld) => {
                // Duplicate entry; drop it from the set so release skips it.
                locks[index] = None;
            }
            Err(err) => {
                release_range(locks, ticket, index);
                if let Some(held) = contended.take() {
                    // The slow-acquired lock sits later in the sequence and
                    // is still held.
                    if let Some(lock) = locks[held] {
                        lock.release(ticket);
                    }
                }
                if err == AcquireError::Backoff {
                    *contended = Some(index);
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Acquires every lock in `locks` under one ticket, retrying with the
/// backoff protocol until all are held or the caller is cancelled.
///
/// Entries may be `None` (skipped); duplicate entries collapse to a single
/// acquisition and are set to `None` in place. On success the caller owns
/// every remaining `Some` entry and must hand the slice back to
/// [`unlock_all`]. On error nothing is held.
pub fn lock_all(
    locks: &mut [Option<&TicketLock>],
    ticket: &AcquireTicket,
    cancel: Option<&CancelToken>,
) -> Result<(), AcquireError> {
    let mut contended: Option<usize> = None;
    loop {
        match lock_all_no_retry(locks, ticket, cancel, &mut contended) {
            Err(AcquireError::Backoff) => {
                let index = contended.expect("backoff must name the contended lock");
                let lock = locks[index].expect("contended entry cannot be empty");
                lock.acquire_slow(ticket, cancel)?;
            }
            result => return result,
        }
    }
}

/// Releases every lock still marked held in `locks`.
pub fn unlock_all(locks: &[Option<&TicketLock>], ticket: &AcquireTicket) {
    for lock in locks.iter().flatten() {
        lock.release(ticket);
    }
}
