//! Bounded task pools
//!
//! Caps how many command or protocol tasks run at once without queueing
//! logic of its own: tasks spawn immediately and wait on a semaphore permit
//! before doing work, so completion order stays visible to callers through
//! the returned handles.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A fixed-width pool of concurrent tasks.
#[derive(Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl TaskPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            size: size.max(1),
        }
    }

    /// Spawn `work`; it begins once a permit is free.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // the semaphore is never closed, so acquisition only fails if it
            // is; run unbounded in that impossible case rather than panic
            let _permit = permits.acquire_owned().await.ok();
            work.await
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits currently free; zero when the pool is saturated.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
