//! Queue locks and cooperative cancellation
//!
//! Five named FIFO locks guard the worker pipeline. Each carries a
//! rank; acquiring a lock while the same task already holds one of
//! equal or higher rank is a programming error and panics. Canonical
//! order: `fill -> grid -> fund` and `reconcile -> grid -> fund`, with
//! `persist` as a leaf that may be taken under any of them.
//!
//! Rank tracking is task-local: run the consumer loop inside
//! [`with_lock_tracking`]. Contention from another task simply waits
//! in FIFO order.
//!
//! Acquisition takes a hard timeout and a cancel token; a timeout is
//! surfaced so the worker can schedule a resync instead of deadlocking.

use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::errors::{Error, Result};

/// Default hard timeout for lock acquisition.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(20);

tokio::task_local! {
    static HELD_RANKS: Cell<u32>;
}

/// Run a future with lock-order tracking enabled for its task.
pub async fn with_lock_tracking<F: Future>(fut: F) -> F::Output {
    HELD_RANKS.scope(Cell::new(0), fut).await
}

fn held_mask() -> u32 {
    HELD_RANKS.try_with(|c| c.get()).unwrap_or(0)
}

fn set_held_bit(bit: u32) {
    let _ = HELD_RANKS.try_with(|c| c.set(c.get() | bit));
}

fn clear_held_bit(bit: u32) {
    let _ = HELD_RANKS.try_with(|c| c.set(c.get() & !bit));
}

/// Cooperative cancellation signal, checked at I/O boundaries.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Owning half of a cancel pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation fires.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // handle dropped without cancelling: never fires
                std::future::pending::<()>().await;
            }
        }
    }

    /// Bail out if a cancel arrived (zombie-pass guard).
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// FIFO async mutex with a rank and a name.
#[derive(Debug)]
pub struct QueueLock {
    name: &'static str,
    rank: u8,
    inner: Arc<Mutex<()>>,
}

/// Held lock; releases and clears its rank bit on drop.
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
    bit: u32,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        clear_held_bit(self.bit);
    }
}

impl QueueLock {
    fn new(name: &'static str, rank: u8) -> Self {
        Self {
            name,
            rank,
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire with the canonical-order check, a hard timeout, and a
    /// cancel token.
    pub async fn acquire(&self, timeout: Duration, cancel: &CancelToken) -> Result<LockGuard> {
        let mask = held_mask();
        if mask >> self.rank != 0 {
            panic!(
                "lock order violation: acquiring '{}' (rank {}) while holding mask {:#b}",
                self.name, self.rank, mask
            );
        }

        let lock = self.inner.clone();
        tokio::select! {
            guard = lock.lock_owned() => {
                let bit = 1u32 << self.rank;
                set_held_bit(bit);
                Ok(LockGuard { _guard: guard, bit })
            }
            _ = tokio::time::sleep(timeout) => Err(Error::LockTimeout(self.name)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// The worker's five locks.
#[derive(Debug)]
pub struct LockSet {
    pub fill: QueueLock,
    pub reconcile: QueueLock,
    pub grid: QueueLock,
    pub fund: QueueLock,
    pub persist: QueueLock,
}

impl LockSet {
    pub fn new() -> Self {
        Self {
            fill: QueueLock::new("fill", 1),
            reconcile: QueueLock::new("reconcile", 1),
            grid: QueueLock::new("grid", 2),
            fund: QueueLock::new("fund", 3),
            persist: QueueLock::new("persist", 4),
        }
    }
}

impl Default for LockSet {
    fn default() -> Self {
        Self::new()
    }
}
