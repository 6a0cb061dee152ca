//! Task engine.
//!
//! A task is one long-lived unit of work that zero or more WebSocket
//! connections are attached to. Tasks share one bounded [`WorkerPool`] for
//! their sub-units and are owned by the [`TaskRegistry`], which reclaims
//! stopped and timed-out tasks on a fixed interval.
//!
//! Concrete tasks embed a [`TaskCore`] for the shared bookkeeping
//! (lifecycle, sessions, counters) and implement the [`Task`] hooks.

pub mod connection;
pub mod console;
pub mod debug;
pub mod pool;
pub mod registry;
pub mod session;

pub use connection::{Connection, Outbound};
pub use console::StreamingConsole;
pub use debug::{DebugRequest, DebugTask, DebugTaskFactory};
pub use pool::{PoolConfig, WorkerPool};
pub use registry::{RegistryConfig, TaskRegistry};
pub use session::{SessionHandler, TaskFactory};

use jsvault_common::protocol::error::{JsVaultError, Result};
use jsvault_common::{ConsoleLogRes, TaskInfo, TaskRequest};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle position of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Started = 1,
    Stopped = 2,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Started,
            _ => TaskState::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Started => "started",
            TaskState::Stopped => "stopped",
        }
    }
}

struct TaskInner {
    id: String,
    task_type: &'static str,
    timeout: Option<Duration>,
    state: AtomicU8,
    started_at: OnceLock<Instant>,
    sessions: RwLock<Vec<Arc<Connection>>>,
    running: AtomicU64,
    total: AtomicU64,
    pool: Arc<WorkerPool>,
}

/// Shared state of one task. Cheap to clone; clones refer to the same task.
#[derive(Clone)]
pub struct TaskCore {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.inner.id)
            .field("task_type", &self.inner.task_type)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskCore {
    /// `timeout` of `None` disables timeout reclamation.
    pub fn new(
        id: impl Into<String>,
        task_type: &'static str,
        timeout: Option<Duration>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: id.into(),
                task_type,
                timeout: timeout.filter(|timeout| !timeout.is_zero()),
                state: AtomicU8::new(TaskState::Created as u8),
                started_at: OnceLock::new(),
                sessions: RwLock::new(Vec::new()),
                running: AtomicU64::new(0),
                total: AtomicU64::new(0),
                pool,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn task_type(&self) -> &'static str {
        self.inner.task_type
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == TaskState::Stopped
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.inner.started_at.get().copied()
    }

    /// Sub-units currently executing.
    pub fn running_sub_units(&self) -> u64 {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Sub-units executing or waiting in the pool queue.
    pub fn total_sub_units(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    /// Created -> Started. Fails with `AlreadyStarted` on any later call.
    pub fn mark_started(&self) -> Result<()> {
        self.inner
            .state
            .compare_exchange(
                TaskState::Created as u8,
                TaskState::Started as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| JsVaultError::AlreadyStarted(self.inner.id.clone()))?;
        let _ = self.inner.started_at.set(Instant::now());
        debug!(task_id = %self.inner.id, "Task started");
        Ok(())
    }

    /// Move to Stopped. Returns `true` only for the call that did it.
    pub fn mark_stopped(&self) -> bool {
        let previous = self
            .inner
            .state
            .swap(TaskState::Stopped as u8, Ordering::SeqCst);
        previous != TaskState::Stopped as u8
    }

    /// Elapsed time since start has reached the timeout.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        match (self.inner.timeout, self.started_at()) {
            (Some(timeout), Some(started_at)) if !self.is_stopped() => {
                now.saturating_duration_since(started_at) >= timeout
            }
            _ => false,
        }
    }

    pub fn attach(&self, connection: Arc<Connection>) {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !sessions.iter().any(|existing| existing.id() == connection.id()) {
            sessions.push(connection);
        }
    }

    pub fn detach(&self, connection_id: Uuid) -> bool {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|connection| connection.id() != connection_id);
        sessions.len() != before
    }

    /// Drop connections whose peer has gone away.
    pub fn prune_closed(&self) -> usize {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|connection| connection.is_open());
        before - sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<Connection>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close and forget every attached connection.
    pub fn close_all_sessions(&self) {
        let sessions: Vec<Arc<Connection>> = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for connection in sessions {
            connection.close();
        }
    }

    /// Serialize `message` once and send it to every attached connection.
    /// Connections that fail to accept it are pruned.
    pub fn broadcast<T: Serialize>(&self, message: &T) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                error!(task_id = %self.inner.id, "Failed to serialize broadcast: {}", e);
                return;
            }
        };

        let mut failed = Vec::new();
        for connection in self.sessions() {
            if let Err(e) = connection.send_text(text.clone()) {
                warn!(task_id = %self.inner.id, connection = %connection.id(), "Dropping session: {}", e);
                failed.push(connection.id());
            }
        }
        for connection_id in failed {
            self.detach(connection_id);
        }
    }

    pub fn broadcast_error(&self, message: impl Into<String>) {
        self.broadcast(&ConsoleLogRes::error(message));
    }

    /// Run `job` on the shared pool.
    ///
    /// An error returned by the job is broadcast to every session. When the
    /// pool is saturated the rejection is broadcast as well and returned to
    /// the caller; the task itself stays alive.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.inner.total.fetch_add(1, Ordering::SeqCst);
        let core = self.clone();
        let submitted = self.inner.pool.try_execute(move || {
            core.inner.running.fetch_add(1, Ordering::SeqCst);
            let outcome = catch_unwind(AssertUnwindSafe(job));
            core.inner.running.fetch_sub(1, Ordering::SeqCst);
            core.inner.total.fetch_sub(1, Ordering::SeqCst);
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(task_id = %core.inner.id, "Sub-unit failed: {}", e);
                    core.broadcast_error(e.to_string());
                }
                Err(_) => {
                    error!(task_id = %core.inner.id, "Sub-unit panicked");
                    core.broadcast_error("task sub-unit panicked");
                }
            }
        });

        if let Err(e) = submitted {
            self.inner.total.fetch_sub(1, Ordering::SeqCst);
            warn!(task_id = %self.inner.id, "Sub-unit rejected: {}", e);
            self.broadcast_error(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Wait until every attached connection has closed, checking every `poll`.
    pub async fn await_all_sessions_closed(&self, poll: Duration) {
        loop {
            self.prune_closed();
            if self.session_count() == 0 {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.inner.id.clone(),
            task_type: self.inner.task_type.to_string(),
            state: self.state().as_str().to_string(),
            session_count: self.session_count(),
            running_sub_units: self.running_sub_units(),
            total_sub_units: self.total_sub_units(),
        }
    }
}

/// A unit of work driven by WebSocket sessions.
///
/// Implementors provide [`Task::core`] and the `do_*` hooks; the provided
/// [`Task::start`] and [`Task::stop`] enforce the lifecycle.
pub trait Task: Send + Sync {
    fn core(&self) -> &TaskCore;

    /// Called once, right after the task enters Started.
    fn do_start(self: Arc<Self>, request: &TaskRequest, valid: bool) -> Result<()>;

    /// Release hook, called exactly once when the task stops.
    fn do_stop(&self) {}

    /// A message from a connection already bound to this task.
    fn handle_message(
        &self,
        _connection: &Arc<Connection>,
        _request: &TaskRequest,
        _valid: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn start(self: Arc<Self>, request: &TaskRequest, valid: bool) -> Result<()> {
        self.core().mark_started()?;
        self.do_start(request, valid)
    }

    /// Idempotent: only the first call closes sessions and runs `do_stop`.
    fn stop(&self) {
        let core = self.core();
        if core.mark_stopped() {
            debug!(task_id = %core.id(), "Task stopped");
            core.close_all_sessions();
            self.do_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pool(max_workers: usize, queue_capacity: usize) -> Arc<WorkerPool> {
        WorkerPool::new(
            PoolConfig::new()
                .with_max_workers(max_workers)
                .with_queue_capacity(queue_capacity),
        )
        .unwrap()
    }

    struct CountingTask {
        core: TaskCore,
        releases: AtomicU64,
    }

    impl Task for CountingTask {
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

    fn counting_task() -> Arc<CountingTask> {
        Arc::new(CountingTask {
            core: TaskCore::new("t-1", "counting", None, pool(1, 4)),
            releases: AtomicU64::new(0),
        })
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let task = counting_task();
        let request = TaskRequest::new("counting");
        task.clone().start(&request, true).unwrap();
        let err = task.clone().start(&request, true).unwrap_err();
        assert!(matches!(err, JsVaultError::AlreadyStarted(id) if id == "t-1"));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let task = counting_task();
        let (conn, mut rx) = Connection::new();
        task.core().attach(conn.clone());
        task.clone().start(&TaskRequest::new("counting"), true).unwrap();

        task.stop();
        task.stop();

        assert_eq!(task.releases.load(Ordering::SeqCst), 1);
        assert_eq!(task.core().state(), TaskState::Stopped);
        assert_eq!(task.core().session_count(), 0);
        assert!(!conn.is_open());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_prunes_dead_connections() {
        let core = TaskCore::new("t-2", "counting", None, pool(1, 1));
        let (alive, mut alive_rx) = Connection::new();
        let (dead, dead_rx) = Connection::new();
        drop(dead_rx);
        core.attach(alive);
        core.attach(dead);

        core.broadcast_error("boom");

        assert_eq!(core.session_count(), 1);
        let Outbound::Text(text) = alive_rx.try_recv().unwrap() else {
            panic!("expected a text frame");
        };
        assert_eq!(text, r#"{"level":"error","message":"boom"}"#);
    }

    #[test]
    fn test_submit_counts_sub_units_and_reports_errors() {
        let core = TaskCore::new("t-3", "counting", None, pool(1, 1));
        let (conn, mut rx) = Connection::new();
        core.attach(conn);

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        core.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Err(JsVaultError::InvalidRequest("bad input".into()))
        })
        .unwrap();

        started_rx.recv().unwrap();
        assert_eq!(core.running_sub_units(), 1);
        assert_eq!(core.total_sub_units(), 1);

        drop(release_tx);
        let frame = rx.blocking_recv().unwrap();
        assert_eq!(
            frame,
            Outbound::Text(r#"{"level":"error","message":"Invalid request: bad input"}"#.into())
        );
        assert_eq!(core.total_sub_units(), 0);
    }

    #[test]
    fn test_saturation_is_broadcast_and_task_stays_alive() {
        let core = TaskCore::new("t-4", "counting", None, pool(1, 1));
        core.mark_started().unwrap();
        let (conn, mut rx) = Connection::new();
        core.attach(conn);

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        core.submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();
        started_rx.recv().unwrap();
        core.submit(|| Ok(())).unwrap();

        let err = core.submit(|| Ok(())).unwrap_err();
        assert!(matches!(err, JsVaultError::PoolSaturated { .. }));
        assert_eq!(core.state(), TaskState::Started);
        assert_eq!(core.total_sub_units(), 2);
        assert_eq!(core.running_sub_units(), 1);
        let Outbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected a text frame");
        };
        assert!(text.contains("Worker pool saturated"));
        drop(release_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_measured_from_start() {
        let core = TaskCore::new("t-5", "counting", Some(Duration::from_secs(5)), pool(1, 1));
        assert!(!core.is_timed_out(Instant::now()));
        core.mark_started().unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!core.is_timed_out(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(core.is_timed_out(Instant::now()));

        let untimed = TaskCore::new("t-6", "counting", Some(Duration::ZERO), pool(1, 1));
        untimed.mark_started().unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!untimed.is_timed_out(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_all_sessions_closed() {
        let core = TaskCore::new("t-7", "counting", None, pool(1, 1));
        let (conn, _rx) = Connection::new();
        core.attach(conn.clone());

        let waiter = {
            let core = core.clone();
            tokio::spawn(async move { core.await_all_sessions_closed(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!waiter.is_finished());

        conn.close();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
