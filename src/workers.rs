use std::future::Future;

use tokio::task::{AbortHandle, JoinSet};

/// Bounded spawn manager for download workers. Finished workers are
/// reaped opportunistically on every spawn so the set never grows
/// without bound.
pub struct WorkerPool {
    workers: JoinSet<()>,
    max_concurrent: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            workers: JoinSet::new(),
            max_concurrent,
        }
    }

    /// Spawn a worker, reaping completed ones first.
    pub fn spawn<F>(&mut self, worker: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap_finished();

        if self.workers.len() >= self.max_concurrent {
            log::warn!(
                "WorkerPool at capacity ({}), waiting for a worker to finish",
                self.max_concurrent
            );
            while self.workers.len() >= self.max_concurrent {
                if !self.try_join_one() {
                    // All workers still running; the new one queues on
                    // the runtime rather than being rejected.
                    log::warn!(
                        "All {} workers still running, spawning anyway",
                        self.max_concurrent
                    );
                    break;
                }
            }
        }
        self.workers.spawn(worker)
    }

    fn reap_finished(&mut self) {
        let mut reaped = 0;
        while self.try_join_one() {
            reaped += 1;
        }
        if reaped > 0 {
            log::debug!("Reaped {} finished workers", reaped);
        }
    }

    /// Non-blocking poll for one finished worker.
    fn try_join_one(&mut self) -> bool {
        use std::pin::Pin;
        use std::task::{Context, Poll};
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match Pin::new(&mut self.workers).poll_join_next(&mut cx) {
            Poll::Ready(Some(result)) => {
                if let Err(e) = result {
                    log::error!("Download worker panicked: {:?}", e);
                }
                true
            }
            Poll::Ready(None) | Poll::Pending => false,
        }
    }

    /// Wait for every worker to finish.
    pub async fn shutdown(&mut self) {
        log::info!(
            "Shutting down WorkerPool, waiting for {} workers",
            self.workers.len()
        );
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                log::error!("Worker failed during shutdown: {:?}", e);
            }
        }
        log::info!("WorkerPool shutdown complete");
    }

    pub fn abort_all(&mut self) {
        log::warn!("Aborting all {} workers", self.workers.len());
        self.workers.abort_all();
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            log::warn!(
                "WorkerPool dropped with {} active workers, aborting them",
                self.workers.len()
            );
            self.abort_all();
        }
    }
}
