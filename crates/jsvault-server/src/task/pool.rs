//! Shared bounded worker pool for task sub-units.
//!
//! Jobs run on the blocking threads of a tokio runtime owned by the pool,
//! at most `max_workers` at a time. Admission is a semaphore with one
//! permit per running or queued job: when none is left,
//! [`WorkerPool::try_execute`] fails with `PoolSaturated` immediately
//! instead of blocking the submitter.

use jsvault_common::protocol::error::{JsVaultError, Result};
use jsvault_common::PoolSnapshot;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Semaphore, TryAcquireError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Largest accepted queue capacity.
pub const MAX_QUEUE_CAPACITY: usize = 65_536;

/// How long shutdown waits for admitted jobs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Configuration for the worker pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            queue_capacity: 512,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_workers == 0 {
            return Err("max workers must be greater than zero".to_string());
        }
        if self.max_workers > 1024 {
            return Err(format!("max workers must be <= 1024 (got {})", self.max_workers));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(format!(
                "queue capacity must be <= {} (got {})",
                MAX_QUEUE_CAPACITY, self.queue_capacity
            ));
        }
        Ok(())
    }

    fn admitted_jobs(&self) -> usize {
        self.max_workers + self.queue_capacity
    }
}

#[derive(Default)]
struct PoolStats {
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

pub struct WorkerPool {
    config: PoolConfig,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    /// One permit per admitted job, running or queued
    admission: Arc<Semaphore>,
    /// One permit per running job
    workers: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Start the pool's runtime. Worker threads are created on demand, up
    /// to `max_workers`.
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        config.validate().map_err(JsVaultError::InvalidRequest)?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_workers)
            .thread_name("task-worker")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        debug!(
            max_workers = config.max_workers,
            queue_capacity = config.queue_capacity,
            "Worker pool started"
        );

        Ok(Arc::new(Self {
            admission: Arc::new(Semaphore::new(config.admitted_jobs())),
            workers: Arc::new(Semaphore::new(config.max_workers)),
            config,
            runtime: Mutex::new(Some(runtime)),
            handle,
            stats: Arc::new(PoolStats::default()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn saturated(&self) -> JsVaultError {
        JsVaultError::PoolSaturated {
            max_workers: self.config.max_workers,
            queue_capacity: self.config.queue_capacity,
        }
    }

    fn shut_down() -> JsVaultError {
        JsVaultError::EngineUnavailable("worker pool is shut down".into())
    }

    /// Queue `job`, failing fast when the pool is saturated or shut down.
    pub fn try_execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::shut_down());
        }
        let admitted = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(self.saturated());
            }
            Err(TryAcquireError::Closed) => return Err(Self::shut_down()),
        };

        self.stats.queued.fetch_add(1, Ordering::SeqCst);
        let workers = self.workers.clone();
        let stats = self.stats.clone();
        self.handle.spawn(async move {
            let _admitted = admitted;
            let Ok(_worker) = workers.acquire_owned().await else {
                stats.queued.fetch_sub(1, Ordering::SeqCst);
                return;
            };

            stats.active.fetch_add(1, Ordering::SeqCst);
            stats.queued.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                if e.is_panic() {
                    error!("Worker job panicked");
                }
            }
            stats.active.fetch_sub(1, Ordering::SeqCst);
            stats.completed.fetch_add(1, Ordering::Relaxed);
        });
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let pool_size = if self.closed.load(Ordering::SeqCst) {
            0
        } else {
            self.config.max_workers
        };
        PoolSnapshot {
            max_workers: self.config.max_workers,
            queue_capacity: self.config.queue_capacity,
            pool_size,
            queue_depth: self.stats.queued.load(Ordering::SeqCst),
            active_count: self.stats.active.load(Ordering::SeqCst),
            completed_count: self.stats.completed.load(Ordering::Relaxed),
            rejected_count: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, wait (bounded) for admitted jobs to finish, then
    /// stop the pool's runtime.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let admitted = u32::try_from(self.config.admitted_jobs()).unwrap_or(u32::MAX);
        match tokio::time::timeout(SHUTDOWN_GRACE, self.admission.acquire_many(admitted)).await {
            Ok(Ok(drained)) => drained.forget(),
            Ok(Err(e)) => error!("Worker pool drain failed: {}", e),
            Err(_) => warn!(
                active = self.stats.active.load(Ordering::SeqCst),
                "Worker pool jobs still running after shutdown grace period"
            ),
        }
        self.admission.close();
        self.stop_runtime();
        debug!("Worker pool stopped");
    }

    fn stop_runtime(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which is not allowed inside async code
        self.stop_runtime();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_workers, 64);
        assert_eq!(config.queue_capacity, 512);
        assert!(PoolConfig::new().with_max_workers(0).validate().is_err());
        assert!(PoolConfig::new()
            .with_queue_capacity(MAX_QUEUE_CAPACITY + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(2).with_queue_capacity(4)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.try_execute(move || tx.send(i).unwrap()).unwrap();
        }
        let mut results: Vec<i32> = (0..4).map(|_| rx.recv().unwrap()).collect();
        results.sort();
        assert_eq!(results, vec![0, 1, 2, 3]);
        wait_until(|| pool.snapshot().completed_count == 4);
    }

    #[test]
    fn test_rejects_when_saturated() {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(2).with_queue_capacity(2)).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));

        let blocking_job = |release: Arc<Mutex<Receiver<()>>>| {
            move || {
                let _ = release.lock().unwrap().recv();
            }
        };

        for _ in 0..2 {
            pool.try_execute(blocking_job(release_rx.clone())).unwrap();
        }
        wait_until(|| pool.snapshot().active_count == 2);

        for _ in 0..2 {
            pool.try_execute(blocking_job(release_rx.clone())).unwrap();
        }
        let started = Instant::now();
        let result = pool.try_execute(blocking_job(release_rx.clone()));
        assert!(matches!(
            result,
            Err(JsVaultError::PoolSaturated { max_workers: 2, queue_capacity: 2 })
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.active_count, 2);
        assert_eq!(snapshot.queue_depth, 2);
        assert_eq!(snapshot.rejected_count, 1);

        drop(release_tx);
        wait_until(|| pool.snapshot().completed_count == 4);

        // Finished jobs hand their slots back
        pool.try_execute(|| {}).unwrap();
        wait_until(|| pool.snapshot().completed_count == 5);
    }

    #[test]
    fn test_never_runs_more_than_max_workers() {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(2).with_queue_capacity(6)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            pool.try_execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        wait_until(|| pool.snapshot().completed_count == 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(1).with_queue_capacity(2)).unwrap();
        pool.try_execute(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.try_execute(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.snapshot().pool_size, 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_jobs_then_rejects() {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(1)).unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        pool.try_execute(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(matches!(
            pool.try_execute(|| {}),
            Err(JsVaultError::EngineUnavailable(_))
        ));
        assert_eq!(pool.snapshot().pool_size, 0);
    }

    #[tokio::test]
    async fn test_dropping_inside_async_code_is_allowed() {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(1)).unwrap();
        pool.try_execute(|| {}).unwrap();
        drop(pool);
    }
}
