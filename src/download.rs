//! Fixed-size download worker pool.
//!
//! Jobs flow through a capacity-1 channel so the producer is back-pressured
//! to roughly one queued item beyond the workers' in-flight set. Workers
//! share the receiver behind an async mutex; no ordering is guaranteed
//! between jobs. Dropping the sender is the shutdown signal: workers drain
//! whatever is queued and exit.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

pub struct DownloadPool<T> {
    tx: mpsc::Sender<T>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> DownloadPool<T> {
    /// Spawn `count` workers, each invoking `worker(id, job)` per received
    /// job.
    pub fn spawn<F, Fut>(count: usize, worker: F) -> Self
    where
        F: Fn(usize, T) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let (tx, rx) = mpsc::channel::<T>(1);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..count)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let worker = worker.clone();
                tokio::spawn(async move {
                    loop {
                        // Release the receiver lock before running the job so
                        // the other workers can pick up the next one.
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => worker(id, job).await,
                            None => break,
                        }
                    }
                    debug!(worker = id, "download worker finished");
                })
            })
            .collect();

        Self { tx, workers }
    }

    /// Enqueue a job; blocks while the queue is full. Fails only if every
    /// worker has already exited.
    pub async fn submit(&self, job: T) -> Result<(), mpsc::error::SendError<T>> {
        self.tx.send(job).await
    }

    /// Signal completion and wait for the workers to drain the queue.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn processes_every_job() {
        let processed = Arc::new(AtomicUsize::new(0));
        let pool = {
            let processed = Arc::clone(&processed);
            DownloadPool::spawn(3, move |_id, _job: u32| {
                let processed = Arc::clone(&processed);
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        for job in 0..20u32 {
            pool.submit(job).await.unwrap();
        }
        pool.shutdown().await;

        assert_eq!(processed.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn results_flow_to_a_consumer() {
        let (result_tx, mut result_rx) = mpsc::channel::<u32>(1);
        let pool = DownloadPool::spawn(2, move |_id, job: u32| {
            let tx = result_tx.clone();
            async move {
                let _ = tx.send(job * 2).await;
            }
        });

        let consumer = tokio::spawn(async move {
            let mut total = 0u32;
            while let Some(value) = result_rx.recv().await {
                total += value;
            }
            total
        });

        for job in 1..=4u32 {
            pool.submit(job).await.unwrap();
        }
        pool.shutdown().await;

        // Workers dropped their result senders on exit, closing the channel.
        assert_eq!(consumer.await.unwrap(), 20);
    }

    #[tokio::test]
    async fn shutdown_with_no_jobs() {
        let pool = DownloadPool::spawn(2, |_id, _job: ()| async {});
        pool.shutdown().await;
    }
}
