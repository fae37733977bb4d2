//! Bounded worker pool.
//!
//! A semaphore holds one permit per worker slot. The orchestrator only moves
//! a task to Running after it obtained a permit, and the worker releases the
//! permit once the task has left Running, so the number of Running tasks can
//! never exceed the pool capacity.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::registry::panic_message;

pub struct WorkerPool {
    slots: Arc<Semaphore>,
    capacity: usize,
    workers: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            workers: Mutex::new(JoinSet::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held by workers.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.slots.available_permits())
    }

    /// Claim a slot without waiting. `None` when the pool is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub async fn spawn<F>(&self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.workers.lock().await.spawn(worker);
    }

    /// Collect finished workers. Returns how many were reaped.
    pub async fn reap(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let mut reaped = 0;
        while let Some(joined) = workers.try_join_next() {
            reaped += 1;
            if let Err(e) = joined
                && e.is_panic()
            {
                tracing::error!("💥 Worker panicked: {}", panic_message(e.into_panic()));
            }
        }
        reaped
    }

    /// Workers not yet reaped, finished or not.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Wait up to `timeout` for every worker to finish.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut workers = self.workers.lock().await;
        let pending = workers.len();
        if pending > 0 {
            tracing::info!("⏳ Waiting for {} worker(s) to finish", pending);
        }
        tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok()
    }

    /// Abort every worker still held and wait for them to unwind.
    pub async fn abort_all(&self) -> usize {
        let mut workers = self.workers.lock().await;
        let count = workers.len();
        workers.abort_all();
        while workers.join_next().await.is_some() {}
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let pool = WorkerPool::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_permit_released_when_worker_finishes() {
        let pool = WorkerPool::new(1);
        let permit = pool.try_acquire().unwrap();
        pool.spawn(async move {
            let _permit = permit;
        })
        .await;

        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_drain_times_out_then_abort() {
        let pool = WorkerPool::new(1);
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .await;

        assert!(!pool.drain(Duration::from_millis(20)).await);
        assert_eq!(pool.abort_all().await, 1);
        assert_eq!(pool.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_reap_survives_worker_panic() {
        let pool = WorkerPool::new(1);
        pool.spawn(async { panic!("worker blew up") }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.reap().await, 1);
    }
}
