use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::error_handling::types::SessionError;

/// How a [`WorkerPool::shutdown`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolShutdown {
    /// Every task finished within the graceful wait.
    Graceful,
    /// Queued work was cancelled and the rest finished within the forced wait.
    Forced,
    /// Tasks were still running after both waits; they were left to finish on their own.
    Incomplete,
}

/// Runs connection handlers for one session.
pub struct WorkerPool {
    tasks: Mutex<JoinSet<()>>,
    permits: Option<Arc<Semaphore>>,
    accepting: AtomicBool,
}

impl WorkerPool {
    /// `max_concurrency == 0` lets every submitted task run at once.
    pub fn new(max_concurrency: usize) -> Self {
        let permits = match max_concurrency {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Self {
            tasks: Mutex::new(JoinSet::new()),
            permits,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Schedules `task`. With a concurrency limit it may wait for a free slot before it
    /// starts; it is dropped without running if the pool is shut down in the meantime.
    pub async fn submit<F>(&self, task: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_accepting() {
            return Err(SessionError::PoolClosed);
        }

        let mut tasks = self.tasks.lock().await;
        if !self.is_accepting() {
            return Err(SessionError::PoolClosed);
        }
        reap(&mut tasks);

        match &self.permits {
            None => {
                tasks.spawn(task);
            }
            Some(permits) => {
                let permits = Arc::clone(permits);
                tasks.spawn(async move {
                    match permits.acquire_owned().await {
                        Ok(_permit) => task.await,
                        Err(_) => debug!("Worker pool closed before the task could start"),
                    }
                });
            }
        }

        Ok(())
    }

    pub async fn active_tasks(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        reap(&mut tasks);
        tasks.len()
    }

    /// Stops accepting work, waits up to `graceful` for running tasks, then cancels queued
    /// tasks and waits up to `forced` more. Running tasks are never aborted.
    pub async fn shutdown(&self, graceful: Duration, forced: Duration) -> PoolShutdown {
        self.accepting.store(false, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        info!("Shutting down worker pool ({} tasks)", tasks.len());

        if drain(&mut tasks, graceful).await {
            debug!("Worker pool terminated gracefully");
            return PoolShutdown::Graceful;
        }

        warn!(
            "Worker pool did not terminate within {:?}, cancelling queued tasks",
            graceful
        );
        if let Some(permits) = &self.permits {
            permits.close();
        }

        if drain(&mut tasks, forced).await {
            return PoolShutdown::Forced;
        }

        error!(
            "Worker pool still has {} running tasks after forced shutdown, detaching them",
            tasks.len()
        );
        tasks.detach_all();
        PoolShutdown::Incomplete
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        log_join_result(result);
    }
}

async fn drain(tasks: &mut JoinSet<()>, limit: Duration) -> bool {
    timeout(limit, async {
        while let Some(result) = tasks.join_next().await {
            log_join_result(result);
        }
    })
    .await
    .is_ok()
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Connection task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown() {
        let pool = WorkerPool::new(0);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = Arc::clone(&done);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        let outcome = pool
            .shutdown(Duration::from_secs(10), Duration::from_secs(5))
            .await;

        assert_eq!(outcome, PoolShutdown::Graceful);
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(pool.active_tasks().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_shutdown_cancels_queued_work() {
        let pool = WorkerPool::new(1);

        pool.submit(async {
            tokio::time::sleep(Duration::from_secs(12)).await;
        })
        .await
        .unwrap();

        // Holds a sender; dropping the never-started task drops it.
        let (tx, rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = tx.send(());
        })
        .await
        .unwrap();

        let outcome = pool
            .shutdown(Duration::from_secs(10), Duration::from_secs(5))
            .await;

        assert_eq!(outcome, PoolShutdown::Forced);
        assert!(rx.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_tasks_are_detached() {
        let pool = WorkerPool::new(0);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (finished_tx, finished_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
            let _ = finished_tx.send(());
        })
        .await
        .unwrap();

        let started = tokio::time::Instant::now();
        let outcome = pool
            .shutdown(Duration::from_secs(10), Duration::from_secs(5))
            .await;

        assert_eq!(outcome, PoolShutdown::Incomplete);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));

        // The detached task keeps running until its own work completes.
        release_tx.send(()).unwrap();
        assert!(finished_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(0);
        pool.shutdown(Duration::from_millis(10), Duration::from_millis(10))
            .await;

        assert!(!pool.is_accepting());
        let result = pool.submit(async {}).await;
        assert!(matches!(result, Err(SessionError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        let outcome = pool
            .shutdown(Duration::from_secs(5), Duration::from_secs(1))
            .await;

        assert_eq!(outcome, PoolShutdown::Graceful);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
