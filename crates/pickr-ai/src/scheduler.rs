//! First-come-first-served gate serialising whole batches.
//!
//! The remote quota is shared by every caller in the process, so a batch
//! (one concurrent group of chunk requests) holds the gate from its first
//! dispatch to its last completion. The gate is a fair `tokio::sync::Mutex`,
//! so waiters are admitted strictly in arrival order. There is no timeout:
//! a holder that never releases blocks everyone.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Process-wide batch gate. Construct once and share by reference (or `Arc`).
#[derive(Default)]
pub struct FairBatchScheduler {
    gate: Mutex<()>,
    waiting: AtomicUsize,
}

/// Proof of holding the gate. Dropping it releases the gate to the next waiter.
#[must_use = "dropping the permit releases the batch gate immediately"]
pub struct BatchPermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl BatchPermit<'_> {
    /// Release explicitly; equivalent to dropping the permit.
    pub fn release(self) {}
}

/// Counts one caller in the wait queue until it is admitted or gives up.
struct Queued<'a>(&'a AtomicUsize);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FairBatchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other batch holds the gate, then take it.
    pub async fn acquire(&self) -> BatchPermit<'_> {
        if let Ok(guard) = self.gate.try_lock() {
            return BatchPermit { _guard: guard };
        }

        let queue_length = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        let _queued = Queued(&self.waiting);
        debug!(queue_length, "batch queued behind active batch");
        let guard = self.gate.lock().await;
        debug!("batch gate handed to next waiter");
        BatchPermit { _guard: guard }
    }

    pub fn is_locked(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Callers currently waiting (abandoned waits are not counted).
    pub fn queue_length(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_for_queue(scheduler: &FairBatchScheduler, len: usize) {
        while scheduler.queue_length() < len {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn uncontended_acquire_and_release() {
        let scheduler = FairBatchScheduler::new();
        assert!(!scheduler.is_locked());

        let permit = scheduler.acquire().await;
        assert!(scheduler.is_locked());
        assert_eq!(scheduler.queue_length(), 0);

        permit.release();
        assert!(!scheduler.is_locked());
    }

    #[tokio::test]
    async fn waiters_admitted_in_arrival_order() {
        let scheduler = Arc::new(FairBatchScheduler::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = scheduler.acquire().await;

        let mut handles = Vec::new();
        for name in ["b", "c", "d"] {
            let waiter = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            let queued = scheduler.queue_length();
            handles.push(tokio::spawn(async move {
                let _permit = waiter.acquire().await;
                order.lock().unwrap().push(name);
            }));
            wait_for_queue(&scheduler, queued + 1).await;
        }

        assert_eq!(scheduler.queue_length(), 3);
        drop(first);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["b", "c", "d"]);
        assert_eq!(scheduler.queue_length(), 0);
        assert!(!scheduler.is_locked());
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_strand_gate() {
        let scheduler = FairBatchScheduler::new();
        let holder = scheduler.acquire().await;

        let attempt = tokio::time::timeout(Duration::from_millis(10), scheduler.acquire()).await;
        assert!(attempt.is_err(), "gate is held, acquire should time out");
        assert_eq!(scheduler.queue_length(), 0);

        drop(holder);
        assert!(!scheduler.is_locked());

        let again = tokio::time::timeout(Duration::from_millis(50), scheduler.acquire()).await;
        assert!(again.is_ok(), "gate should be free after holder released");
    }
}
