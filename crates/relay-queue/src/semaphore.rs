use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("permit count must be at least 1")]
pub struct InvalidPermits;

/// Counted permits with a FIFO wait queue and dynamic resizing.
///
/// `available` is signed: shrinking capacity below the number of held
/// permits leaves a transient overage that releases drain before anyone can
/// acquire again. Current holders are never preempted.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    weak: Weak<Semaphore>,
}

#[derive(Debug)]
struct State {
    capacity: usize,
    available: i64,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Result<Arc<Self>, InvalidPermits> {
        if permits == 0 {
            return Err(InvalidPermits);
        }
        Ok(Arc::new_cyclic(|weak| Self {
            state: Mutex::new(State {
                capacity: permits,
                available: permits as i64,
                waiters: VecDeque::new(),
            }),
            weak: weak.clone(),
        }))
    }

    /// Take a permit, suspending in FIFO order when none is free.
    pub async fn acquire(&self) -> Lease {
        let wait = {
            let mut state = self.state.lock().expect("semaphore state poisoned");
            if state.available > 0 {
                state.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };
        if let Some(rx) = wait {
            // The sender side only closes if the semaphore is dropped, and a
            // dropped semaphore has no permits worth tracking.
            let _ = rx.await;
        }
        Lease::new(self.weak.clone())
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Lease> {
        let mut state = self.state.lock().expect("semaphore state poisoned");
        if state.available > 0 {
            state.available -= 1;
            Some(Lease::new(self.weak.clone()))
        } else {
            None
        }
    }

    /// Resize to `permits`. Growing wakes as many waiters as new permits;
    /// shrinking only lowers the ceiling for future acquires.
    pub fn update_permits(&self, permits: usize) -> Result<(), InvalidPermits> {
        if permits == 0 {
            return Err(InvalidPermits);
        }
        let mut state = self.state.lock().expect("semaphore state poisoned");
        let old = state.capacity as i64;
        state.capacity = permits;
        state.available += permits as i64 - old;
        while state.available > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.send(()).is_ok() {
                state.available -= 1;
            }
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().expect("semaphore state poisoned").capacity
    }

    pub fn available(&self) -> i64 {
        self.state
            .lock()
            .expect("semaphore state poisoned")
            .available
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("semaphore state poisoned");
        // With an overage after shrinking, the slot just shrinks the debt.
        if state.available < 0 {
            state.available += 1;
            return;
        }
        // Hand the permit straight to the longest-waiting acquirer.
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.available += 1;
    }
}

/// One held permit. Releasing twice is a no-op; dropping releases.
#[derive(Debug)]
pub struct Lease {
    semaphore: Weak<Semaphore>,
    released: AtomicBool,
}

impl Lease {
    fn new(semaphore: Weak<Semaphore>) -> Self {
        Self {
            semaphore,
            released: AtomicBool::new(false),
        }
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel)
            && let Some(semaphore) = self.semaphore.upgrade()
        {
            semaphore.release();
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[test]
    fn zero_permits_is_rejected() {
        assert_eq!(Semaphore::new(0).unwrap_err(), InvalidPermits);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let semaphore = Semaphore::new(1).unwrap();
        let held = semaphore.acquire().await;

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for label in ["first", "second", "third"] {
            let semaphore = semaphore.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let lease = semaphore.acquire().await;
                order_tx.send(label).unwrap();
                drop(lease);
            });
            // Give each waiter time to enter the queue before the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        held.release();
        for expected in ["first", "second", "third"] {
            let got = timeout(Duration::from_secs(1), order_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let semaphore = Semaphore::new(2).unwrap();
        let lease = semaphore.acquire().await;
        lease.release();
        lease.release();
        drop(lease);
        assert_eq!(semaphore.available(), 2);
    }

    #[tokio::test]
    async fn try_acquire_respects_the_bound() {
        let semaphore = Semaphore::new(2).unwrap();
        let a = semaphore.try_acquire().unwrap();
        let _b = semaphore.try_acquire().unwrap();
        assert!(semaphore.try_acquire().is_none());
        a.release();
        assert!(semaphore.try_acquire().is_some());
    }

    #[tokio::test]
    async fn growing_wakes_waiters() {
        let semaphore = Semaphore::new(1).unwrap();
        let _held = semaphore.acquire().await;

        let waiter = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        semaphore.update_permits(2).unwrap();
        let lease = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        drop(lease);
        assert_eq!(semaphore.capacity(), 2);
    }

    #[tokio::test]
    async fn shrinking_leaves_overage_until_releases_drain_it() {
        let semaphore = Semaphore::new(3).unwrap();
        let a = semaphore.acquire().await;
        let b = semaphore.acquire().await;
        let _c = semaphore.acquire().await;

        semaphore.update_permits(1).unwrap();
        assert_eq!(semaphore.available(), -2);
        assert!(semaphore.try_acquire().is_none());

        a.release();
        assert!(semaphore.try_acquire().is_none());
        b.release();
        assert_eq!(semaphore.available(), 0);
    }
}
