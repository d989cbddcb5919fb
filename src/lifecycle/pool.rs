//! Background task pool
//!
//! Every background loop in the process is spawned here so shutdown can
//! drain them: `close_and_wait` returns only after all of them exited.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

#[derive(Clone, Default)]
pub struct TaskPool {
    tracker: TaskTracker,
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Number of tasks still running
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Waits for every spawned task to finish.
    pub async fn close_and_wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Task pool drained");
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("running", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_and_wait_drains_tasks() {
        let pool = TaskPool::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let finished = finished.clone();
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10 * i)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.close_and_wait().await;
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert!(pool.is_empty());
        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_empty_pool_drains_immediately() {
        let pool = TaskPool::new();
        tokio::time::timeout(Duration::from_secs(1), pool.close_and_wait())
            .await
            .expect("empty pool should drain at once");
    }
}
