//! Bounded background worker pool.
//!
//! Stands in for the Python original's `ThreadPoolExecutor(max_workers=N)`:
//! callers `submit` a future, the pool runs at most `capacity` of them
//! concurrently via a counting semaphore, and `shutdown` either waits
//! for in-flight work to drain or cancels it immediately.
//!
//! Delivery order across submissions is not guaranteed — callers that
//! need ordering (e.g. the log streamer) encode it in the payload
//! itself (the chunk filename), not in pool semantics.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Submit a future to run on the pool. Blocks the *submitter* only
    /// long enough to acquire a permit, never for the future's own
    /// completion — matching the "never blocks the caller for network
    /// I/O" invariant for the log streamer's `write`.
    pub async fn submit<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let permit = self.semaphore.clone().acquire_owned().await;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            fut.await;
        });
        self.handles.lock().await.push(handle);
    }

    /// Wait for all submitted work to finish.
    pub async fn drain(&self) {
        let mut handles = self.handles.lock().await;
        for h in handles.drain(..) {
            let _ = h.await;
        }
    }

    /// Cancel all in-flight work without waiting — mirrors
    /// `executor.shutdown(wait=False, cancel_futures=True)`.
    pub async fn cancel(&self) {
        let mut handles = self.handles.lock().await;
        for h in handles.drain(..) {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn drains_all_submitted_work() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        pool.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn cancel_does_not_wait_for_completion() {
        let pool = WorkerPool::new(2);
        pool.submit(async move {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        })
        .await;
        // Should return promptly rather than waiting out the sleep.
        tokio::time::timeout(std::time::Duration::from_millis(500), pool.cancel())
            .await
            .expect("cancel should not block");
    }
}
