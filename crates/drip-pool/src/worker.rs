//! Bounded worker pool for connection and request handling.
//!
//! A fixed set of worker tasks drains a bounded job queue. Submission is
//! non-blocking: when the queue is full the job runs on a one-shot task
//! instead, so accept loops stay responsive under burst.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const DEFAULT_WORKERS: usize = 50;
const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Fixed-size pool of worker tasks fed by a bounded queue.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool with `workers` tasks and a queue of `queue_size` jobs.
    /// Zero falls back to the defaults (50 workers, 1000 jobs).
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let queue_size = if queue_size == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            queue_size
        };

        let (tx, rx) = mpsc::channel::<Job>(queue_size);
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    /// Submit a job without blocking.
    ///
    /// Returns `true` if the job was queued. When the pool is closed or the
    /// queue is full the job is spawned directly and `false` is returned.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let job: Job = Box::pin(job);

        let Some(tx) = tx else {
            tokio::spawn(job);
            return false;
        };

        match tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job))
            | Err(mpsc::error::TrySendError::Closed(job)) => {
                debug!("worker pool saturated, spawning one-shot task");
                tokio::spawn(job);
                false
            }
        }
    }

    /// Close the pool and wait for queued jobs to finish. Idempotent.
    pub async fn close(&self) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(tx);

        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new(4, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_overflow_spawns_instead_of_blocking() {
        // One worker stuck on a slow job, queue of one.
        let pool = WorkerPool::new(1, 1);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            c.fetch_add(1, Ordering::SeqCst);
        });

        // Fill the queue, then overflow.
        let mut overflowed = false;
        for _ in 0..4 {
            let c = counter.clone();
            let queued = pool.submit(async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
            if !queued {
                overflowed = true;
            }
        }
        assert!(overflowed, "expected at least one overflow submission");

        tokio::time::sleep(Duration::from_millis(300)).await;
        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let pool = WorkerPool::new(2, 8);
        pool.close().await;
        pool.close().await;
        assert!(pool.is_closed());

        // Submissions after close still run, just not on pool workers.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let queued = pool.submit(async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!queued);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
