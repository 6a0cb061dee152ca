//! Process-wide table of live tasks.
//!
//! The registry owns every task from registration until it is reclaimed.
//! Reclamation happens in [`TaskRegistry::sweep`], which the background
//! sweeper runs on a fixed interval and the admin stop path runs on demand:
//! stopped tasks are removed, timed-out tasks are notified, given a short
//! grace period, stopped and then removed.

use jsvault_common::protocol::error::{JsVaultError, Result};
use jsvault_common::RegistrySnapshot;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::task::{Task, WorkerPool};

pub const TIMEOUT_MESSAGE: &str = "[timeout] task closed by server";
pub const ADMIN_STOP_MESSAGE: &str = "[admin forced stop]";

/// Configuration for the task registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Time between reclamation sweeps
    pub sweep_interval: Duration,
    /// Pause between the final notification and the forced stop
    pub timeout_grace: Duration,
    /// Minimum time between diagnostic summaries in the log
    pub summary_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3),
            timeout_grace: Duration::from_millis(5),
            summary_interval: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_timeout_grace(mut self, grace: Duration) -> Self {
        self.timeout_grace = grace;
        self
    }

    pub fn with_summary_interval(mut self, interval: Duration) -> Self {
        self.summary_interval = interval;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.sweep_interval.is_zero() {
            return Err("sweep interval must be greater than zero".to_string());
        }
        if self.timeout_grace >= self.sweep_interval {
            return Err("timeout grace must be shorter than the sweep interval".to_string());
        }
        Ok(())
    }
}

pub struct TaskRegistry {
    config: RegistryConfig,
    pool: Arc<WorkerPool>,
    tasks: DashMap<String, Arc<dyn Task>>,
    /// connection id -> task id
    bindings: DashMap<Uuid, String>,
    reclaimed_total: AtomicU64,
    last_summary: Mutex<Option<Instant>>,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRegistry {
    pub fn new(config: RegistryConfig, pool: Arc<WorkerPool>) -> Result<Arc<Self>> {
        config.validate().map_err(JsVaultError::InvalidRequest)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            pool,
            tasks: DashMap::new(),
            bindings: DashMap::new(),
            reclaimed_total: AtomicU64::new(0),
            last_summary: Mutex::new(None),
            shutdown,
            sweeper: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn insert(&self, task: Arc<dyn Task>) {
        let id = task.core().id().to_string();
        debug!(task_id = %id, task_type = task.core().task_type(), "Task registered");
        self.tasks.insert(id, task);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_bound(&self, connection_id: Uuid) -> bool {
        self.bindings.contains_key(&connection_id)
    }

    /// Bind a connection to a task. A connection belongs to one task.
    pub fn bind(&self, connection_id: Uuid, task_id: &str) {
        self.bindings.insert(connection_id, task_id.to_string());
    }

    pub fn task_for_connection(&self, connection_id: Uuid) -> Option<Arc<dyn Task>> {
        let task_id = self.bindings.get(&connection_id)?.value().clone();
        self.get(&task_id)
    }

    /// Forget a connection that has gone away.
    pub fn release_connection(&self, connection_id: Uuid) {
        if let Some((_, task_id)) = self.bindings.remove(&connection_id) {
            if let Some(task) = self.get(&task_id) {
                task.core().detach(connection_id);
            }
            debug!(connection = %connection_id, task_id = %task_id, "Connection released");
        }
    }

    fn remove(&self, id: &str) -> bool {
        let removed = self.tasks.remove(id).is_some();
        if removed {
            self.bindings.retain(|_, task_id| task_id != id);
        }
        removed
    }

    /// Reclaim stopped and timed-out tasks. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let entries: Vec<(String, Arc<dyn Task>)> = self
            .tasks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut stopped = Vec::new();
        let mut timed_out = Vec::new();
        for (id, task) in entries {
            let core = task.core();
            core.prune_closed();
            if core.is_stopped() {
                stopped.push(id);
            } else if core.is_timed_out(now) {
                info!(task_id = %id, "Task timed out");
                core.broadcast_error(TIMEOUT_MESSAGE);
                timed_out.push((id, task));
            }
        }

        if !timed_out.is_empty() {
            tokio::time::sleep(self.config.timeout_grace).await;
            for (id, task) in timed_out {
                task.stop();
                stopped.push(id);
            }
        }

        let reclaimed = stopped.iter().filter(|id| self.remove(id)).count();
        if reclaimed > 0 {
            self.reclaimed_total
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            debug!(reclaimed, remaining = self.tasks.len(), "Sweep reclaimed tasks");
        }

        self.maybe_log_summary(reclaimed);
        reclaimed
    }

    fn maybe_log_summary(&self, reclaimed: usize) {
        let now = Instant::now();
        let mut last = self
            .last_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let due = last
            .map(|last| now.saturating_duration_since(last) >= self.config.summary_interval)
            .unwrap_or(true);
        if due {
            *last = Some(now);
            drop(last);
            debug!("Task registry summary\n{}", self.snapshot_with(reclaimed).summary_text());
        }
    }

    /// Notify, stop and reclaim one task, returning the post-sweep snapshot.
    pub async fn stop_task(&self, id: &str) -> Result<RegistrySnapshot> {
        let task = self
            .get(id)
            .ok_or_else(|| JsVaultError::TaskNotFound(id.to_string()))?;
        info!(task_id = %id, "Stopping task on admin request");
        task.core().broadcast_error(ADMIN_STOP_MESSAGE);
        tokio::time::sleep(self.config.timeout_grace).await;
        task.stop();

        let reclaimed = self.sweep().await;
        Ok(self.snapshot_with(reclaimed))
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.snapshot_with(0)
    }

    fn snapshot_with(&self, reclaimed_count: usize) -> RegistrySnapshot {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .map(|entry| entry.value().core().info())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));

        RegistrySnapshot {
            session_count: tasks.iter().map(|task| task.session_count).sum(),
            task_count: tasks.len(),
            reclaimed_count,
            reclaimed_total: self.reclaimed_total.load(Ordering::Relaxed),
            pool: self.pool.snapshot(),
            tasks,
        }
    }

    /// Start the background sweeper. Calling this twice keeps the first one.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let registry = self.clone();
        let shutdown = self.shutdown.subscribe();
        *sweeper = Some(tokio::spawn(registry.run_sweeper(shutdown)));
    }

    async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval = ?self.config.sweep_interval, "Task sweeper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Task sweeper stopped");
    }

    /// Cancel the sweeper, stop every task and drain the worker pool.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                warn!("Task sweeper ended abnormally: {}", e);
            }
        }

        let tasks: Vec<Arc<dyn Task>> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        for task in &tasks {
            task.stop();
        }
        self.tasks.clear();
        self.bindings.clear();

        self.pool.shutdown().await;
        info!(stopped = tasks.len(), "Task registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Connection, Outbound, PoolConfig, TaskCore};
    use jsvault_common::TaskRequest;

    struct IdleTask {
        core: TaskCore,
        releases: AtomicU64,
    }

    impl Task for IdleTask {
        fn core(&self) -> &TaskCore {
            &self.core
        }

        fn do_start(self: Arc<Self>, _request: &TaskRequest, _valid: bool) -> Result<()> {
            Ok(())
        }

        fn do_stop(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> Arc<TaskRegistry> {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(2)).unwrap();
        TaskRegistry::new(RegistryConfig::default(), pool).unwrap()
    }

    fn idle_task(registry: &TaskRegistry, id: &str, timeout: Option<Duration>) -> Arc<IdleTask> {
        let task = Arc::new(IdleTask {
            core: TaskCore::new(id, "idle", timeout, registry.pool().clone()),
            releases: AtomicU64::new(0),
        });
        registry.insert(task.clone());
        task.clone().start(&TaskRequest::new("idle"), true).unwrap();
        task
    }

    fn text(frame: Option<Outbound>) -> String {
        match frame {
            Some(Outbound::Text(text)) => text,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RegistryConfig::default().validate().is_ok());
        assert!(RegistryConfig::new()
            .with_sweep_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_task_is_reclaimed_within_one_interval() {
        let registry = registry();
        let task = idle_task(&registry, "slow", Some(Duration::from_secs(5)));
        let (conn, mut rx) = Connection::new();
        task.core().attach(conn.clone());
        registry.bind(conn.id(), "slow");
        registry.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(registry.get("slow").is_some());

        // first sweep past the 5s mark runs at 6s
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(registry.get("slow").is_none());
        assert!(registry.task_for_connection(conn.id()).is_none());
        assert_eq!(task.releases.load(Ordering::SeqCst), 1);

        assert!(text(rx.recv().await).contains(TIMEOUT_MESSAGE));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(registry.snapshot().reclaimed_total, 1);

        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_without_timeout_survives_sweeps() {
        let registry = registry();
        idle_task(&registry, "forever", None);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(60)).await;
            assert_eq!(registry.sweep().await, 0);
        }
        assert!(registry.get("forever").is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_stopped_tasks() {
        let registry = registry();
        let task = idle_task(&registry, "done", None);
        task.stop();
        task.stop();

        assert_eq!(registry.sweep().await, 1);
        assert!(registry.is_empty());
        assert_eq!(task.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_task_notifies_and_reclaims() {
        let registry = registry();
        let task = idle_task(&registry, "admin", None);
        idle_task(&registry, "other", None);
        let (conn, mut rx) = Connection::new();
        task.core().attach(conn);

        let snapshot = registry.stop_task("admin").await.unwrap();
        assert_eq!(snapshot.reclaimed_count, 1);
        assert_eq!(snapshot.task_count, 1);
        assert_eq!(snapshot.tasks[0].id, "other");
        assert!(text(rx.recv().await).contains(ADMIN_STOP_MESSAGE));

        let err = registry.stop_task("admin").await.unwrap_err();
        assert!(matches!(err, JsVaultError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_release_connection_detaches_session() {
        let registry = registry();
        let task = idle_task(&registry, "shared", None);
        let (first, _first_rx) = Connection::new();
        let (second, _second_rx) = Connection::new();
        for conn in [&first, &second] {
            task.core().attach(conn.clone());
            registry.bind(conn.id(), "shared");
        }
        assert_eq!(registry.snapshot().session_count, 2);

        registry.release_connection(first.id());
        assert_eq!(task.core().session_count(), 1);
        assert!(registry.task_for_connection(first.id()).is_none());
        assert!(registry.task_for_connection(second.id()).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let registry = registry();
        registry.spawn_sweeper();
        let task = idle_task(&registry, "a", None);

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(task.core().is_stopped());
        assert_eq!(task.releases.load(Ordering::SeqCst), 1);
    }
}
