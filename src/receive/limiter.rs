//! Bounded concurrency for receive workers, adjustable while running.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

struct PermitPool {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl PermitPool {
    fn new(max: usize) -> Arc<Self> {
        let max = max.clamp(1, Semaphore::MAX_PERMITS);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        })
    }

    /// Waits until every permit of this pool has been returned.
    async fn drained(&self) {
        let count = u32::try_from(self.max).unwrap_or(u32::MAX);
        // A closed pool has nothing left to wait for.
        let _ = self.semaphore.acquire_many(count).await;
    }
}

pub struct ConcurrencyLimiter {
    pool: Mutex<Arc<PermitPool>>,
    /// Replaced pools that still have permits out.
    retired: Mutex<Vec<Arc<PermitPool>>>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            pool: Mutex::new(PermitPool::new(max_concurrency)),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn retired(&self) -> std::sync::MutexGuard<'_, Vec<Arc<PermitPool>>> {
        self.retired
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self) -> Arc<PermitPool> {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.current().max
    }

    /// Waits for a permit. The permit is released when dropped.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, Error> {
        loop {
            let pool = self.current();

            tokio::select! {
                permit = pool.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => return Ok(permit),
                    // The pool was replaced while waiting; retry on the new one.
                    Err(_) => continue,
                },
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Replaces the permit pool. New work uses the new pool right away; the old pool is
    /// closed once every permit taken from it has been returned.
    pub async fn set_max_concurrency(&self, max_concurrency: usize) {
        let old = {
            let mut pool = self
                .pool
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let old = std::mem::replace(&mut *pool, PermitPool::new(max_concurrency));
            self.retired().push(old.clone());
            old
        };

        tracing::debug!(from = old.max, to = max_concurrency, "Changing max concurrency");

        old.drained().await;
        old.semaphore.close();
        self.retired().retain(|pool| !Arc::ptr_eq(pool, &old));
    }

    /// Waits up to `timeout` for all permits to be returned, including those taken from pools
    /// that were replaced and are still draining.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut pools = self.retired().clone();
        pools.push(self.current());

        let drained = join_all(pools.iter().map(|pool| pool.drained()));
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}
