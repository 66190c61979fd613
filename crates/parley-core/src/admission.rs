use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::CoreError;
use crate::registry::ModelKind;

/// RAII guard that releases the gate's slot when dropped.
///
/// Callers must hold this until the corresponding inference call returns.
/// For blocking generation the permit is moved into the blocking task, so an
/// abandoned request keeps the slot until the model actually stops.
pub struct Permit {
    /// Owned permit; dropping this struct releases it back to the semaphore.
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Single-slot admission control in front of one model handle.
///
/// At most one inference call runs against the model at a time.  Waiters are
/// served in arrival order (tokio's semaphore is fair) and at most
/// `max_waiting` of them may queue; the next one is rejected with
/// [`CoreError::Busy`] instead of piling up behind a long generation.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    kind: ModelKind,
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_waiting: usize,
}

/// Decrements the waiter count however the wait ends (permit, error, drop).
struct WaitSlot<'a>(&'a AtomicUsize);

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    pub fn new(kind: ModelKind, max_waiting: usize) -> Self {
        Self {
            kind,
            semaphore: Arc::new(Semaphore::new(1)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_waiting,
        }
    }

    /// Take the slot if it is free right now.
    pub fn try_acquire(&self) -> Result<Permit, CoreError> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map(|permit| Permit { permit })
            .map_err(|_| CoreError::Busy {
                kind: self.kind,
                waiting: self.waiting(),
            })
    }

    /// Wait for the slot in FIFO order.
    pub async fn acquire(&self) -> Result<Permit, CoreError> {
        if let Ok(permit) = self.try_acquire() {
            return Ok(permit);
        }

        let ahead = self.waiting.fetch_add(1, Ordering::SeqCst);
        let _slot = WaitSlot(&self.waiting);
        if ahead >= self.max_waiting {
            return Err(CoreError::Busy {
                kind: self.kind,
                waiting: ahead,
            });
        }

        debug!(kind = %self.kind, ahead, "waiting for model slot");
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| Permit { permit })
            // The semaphore is never closed while the gate is alive.
            .map_err(|_| CoreError::Busy {
                kind: self.kind,
                waiting: ahead,
            })
    }

    /// Number of requests currently queued behind the running one.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// `true` when no inference call holds the slot.
    pub fn is_idle(&self) -> bool {
        self.semaphore.available_permits() == 1
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn permit_acquired_and_released() {
        let gate = AdmissionGate::new(ModelKind::Language, 4);

        let p1 = gate.try_acquire().expect("first permit");
        assert!(!gate.is_idle());
        assert!(
            gate.try_acquire().is_err(),
            "second permit should be denied while the first is held"
        );
        drop(p1);
        let _p2 = gate.try_acquire().expect("permit after release");
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let gate = AdmissionGate::new(ModelKind::Language, 8);
        let held = gate.acquire().await.unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let waiter = gate.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _permit = waiter.acquire().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Make sure waiter `i` is queued before spawning `i + 1`.
            while gate.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test]
    async fn full_queue_rejects_with_busy() {
        let gate = AdmissionGate::new(ModelKind::Speech, 1);
        let _held = gate.acquire().await.unwrap();

        let queued = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        while gate.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        let err = gate.acquire().await.unwrap_err();
        assert!(
            matches!(err, CoreError::Busy { kind: ModelKind::Speech, waiting: 1 }),
            "unexpected error: {err}"
        );
        queued.abort();
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_the_queue() {
        let gate = AdmissionGate::new(ModelKind::Language, 4);
        let held = gate.acquire().await.unwrap();

        let waiter = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(waiter.is_err(), "waiter should still be queued");
        assert_eq!(gate.waiting(), 0);

        drop(held);
        assert!(gate.try_acquire().is_ok());
    }
}
