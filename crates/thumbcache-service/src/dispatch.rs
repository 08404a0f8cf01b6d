//! The worker pool fetch jobs are dispatched to.

use std::future::Future;
use std::io;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// A fixed-size worker pool with an unbounded work queue.
///
/// Jobs are executed off the calling thread; [`spawn`](Self::spawn) enqueues
/// and returns immediately. There is no priority and no cancellation of
/// already dispatched jobs: stale results are filtered one layer up, in the
/// loader, rather than by killing in-flight work.
#[derive(Debug)]
pub struct WorkerPool {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl WorkerPool {
    /// Creates a pool owning its own runtime with `worker_threads` workers.
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("thumbcache-worker")
            .enable_all()
            .build()?;

        Ok(WorkerPool {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Wraps an already running runtime instead of owning one.
    pub fn from_handle(handle: Handle) -> Self {
        WorkerPool {
            handle,
            runtime: None,
        }
    }

    /// Submits a job for execution and returns immediately.
    pub fn spawn<F>(&self, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(job)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // the pool may be dropped from async context, where a blocking
            // shutdown would panic
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_executes_off_thread() {
        let pool = WorkerPool::new(2).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        pool.spawn(async move {
            tx.send(42u32).unwrap();
        });

        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_jobs_run_concurrently() {
        use std::time::Duration;

        let pool = WorkerPool::new(4).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel();

        // the first job only completes once the second one has run
        pool.spawn(async move {
            gate_rx.await.unwrap();
            tx.send(()).unwrap();
        });
        pool.spawn(async move {
            gate_tx.send(()).unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("jobs did not run concurrently")
            .unwrap();
    }
}
