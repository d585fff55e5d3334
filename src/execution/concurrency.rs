//! Concurrency control for worker dispatch
//!
//! A permit pool on top of a tokio semaphore. The bound can change while
//! work is in flight: growing takes effect at once, shrinking retires free
//! permits immediately and the rest as they come back.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use super::cancelled;

struct Bound {
    limit: usize,
    /// Permits to forget when they are released
    debt: usize,
}

struct Shared {
    semaphore: Arc<Semaphore>,
    bound: Mutex<Bound>,
    in_flight: AtomicUsize,
}

impl Shared {
    fn release(&self, permit: OwnedSemaphorePermit) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut bound = self.bound.lock();
        if bound.debt > 0 {
            bound.debt -= 1;
            permit.forget();
        }
    }
}

#[derive(Clone)]
pub struct ConcurrencyController {
    shared: Arc<Shared>,
}

impl ConcurrencyController {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            shared: Arc::new(Shared {
                semaphore: Arc::new(Semaphore::new(limit)),
                bound: Mutex::new(Bound { limit, debt: 0 }),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.shared.bound.lock().limit
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.shared.semaphore.available_permits()
    }

    /// Wait for a permit. Returns `None` once the controller is closed.
    pub async fn acquire(&self) -> Option<ConcurrencyPermit> {
        let permit = self.shared.semaphore.clone().acquire_owned().await.ok()?;
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ConcurrencyPermit {
            permit: Some(permit),
            shared: self.shared.clone(),
        })
    }

    /// Like [`acquire`](Self::acquire), but gives up when `cancel` flips to
    /// true.
    pub async fn acquire_or_cancel(&self, cancel: &mut watch::Receiver<bool>) -> Option<ConcurrencyPermit> {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => None,
            permit = self.acquire() => permit,
        }
    }

    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let mut bound = self.shared.bound.lock();

        if limit > bound.limit {
            let grow = limit - bound.limit;
            let repaid = grow.min(bound.debt);
            bound.debt -= repaid;
            if grow > repaid {
                self.shared.semaphore.add_permits(grow - repaid);
            }
        } else {
            for _ in limit..bound.limit {
                match self.shared.semaphore.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(_) => bound.debt += 1,
                }
            }
        }

        bound.limit = limit;
    }

    /// Wake every waiter with `None`; used on shutdown
    pub fn close(&self) {
        self.shared.semaphore.close();
    }
}

/// One unit of dispatch capacity, returned on drop
pub struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl ConcurrencyPermit {
    pub fn release(self) {}
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.shared.release(permit);
        }
    }
}
