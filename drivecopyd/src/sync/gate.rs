use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Admission gate for transfers with a runtime-adjustable capacity.
///
/// The semaphore is sized for the maximum; permits above the current target
/// are taken out of circulation with `forget`. Invariant: permits held plus
/// permits available always equal the target.
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    min: usize,
    max: usize,
    target: Mutex<usize>,
}

impl ConcurrencyGate {
    pub fn new(min: usize, max: usize, start: usize) -> Self {
        let max = max.max(1);
        let min = min.clamp(1, max);
        let start = start.clamp(min, max);
        let permits = Arc::new(Semaphore::new(max));
        let withheld = u32::try_from(max - start).unwrap_or(u32::MAX);
        if let Ok(held) = permits.try_acquire_many(withheld) {
            held.forget();
        }
        Self {
            permits,
            min,
            max,
            target: Mutex::new(start),
        }
    }

    fn target_guard(&self) -> MutexGuard<'_, usize> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a free slot. The slot is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.permits.clone().acquire_owned().await
    }

    pub fn increase(&self) -> bool {
        let mut target = self.target_guard();
        if *target >= self.max {
            return false;
        }
        self.permits.add_permits(1);
        *target += 1;
        true
    }

    /// Reclaims one idle permit. Never waits: when every permit is in use the
    /// request is dropped and `false` is returned.
    pub fn decrease(&self) -> bool {
        let mut target = self.target_guard();
        if *target <= self.min {
            return false;
        }
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                *target -= 1;
                true
            }
            Err(_) => false,
        }
    }

    pub fn target(&self) -> usize {
        *self.target_guard()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }
}
