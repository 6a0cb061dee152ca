//! Inbound WebSocket message routing.
//!
//! Every text frame goes through [`SessionHandler::on_text`]:
//!
//! - a `join` frame attaches the connection to an existing task;
//! - any frame on a connection already bound to a task goes to that task;
//! - any other frame creates a task through the [`TaskFactory`] and starts it.
//!
//! Validation failures are not fatal here; the result is passed on as the
//! `valid` flag and the task decides what to do with it.

use jsvault_common::protocol::error::{JsVaultError, Result};
use jsvault_common::{ConsoleLogRes, TaskRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::task::{Connection, Task, TaskRegistry};

/// Creates the concrete task for a connection's first message.
pub trait TaskFactory: Send + Sync {
    /// Payload check; `Err` carries a human-readable reason.
    fn validate(&self, _request: &TaskRequest) -> std::result::Result<(), String> {
        Ok(())
    }

    fn create_task(
        &self,
        connection: &Arc<Connection>,
        request: &TaskRequest,
        valid: bool,
    ) -> Result<Arc<dyn Task>>;
}

pub struct SessionHandler<F> {
    registry: Arc<TaskRegistry>,
    factory: F,
}

impl<F: TaskFactory> SessionHandler<F> {
    pub fn new(registry: Arc<TaskRegistry>, factory: F) -> Self {
        Self { registry, factory }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    fn send_error(connection: &Connection, message: impl Into<String>) {
        match serde_json::to_string(&ConsoleLogRes::error(message)) {
            Ok(text) => {
                if let Err(e) = connection.send_text(text) {
                    debug!(connection = %connection.id(), "Could not deliver error: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize error frame: {}", e),
        }
    }

    /// Handle one inbound text frame.
    pub fn on_text(&self, connection: &Arc<Connection>, text: &str) {
        let request: TaskRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(connection = %connection.id(), "Ignoring malformed message: {}", e);
                return;
            }
        };

        let valid = match self.factory.validate(&request) {
            Ok(()) => true,
            Err(reason) => {
                debug!(connection = %connection.id(), kind = %request.kind, "Validation failed: {}", reason);
                false
            }
        };

        if let Some(task) = self.registry.task_for_connection(connection.id()) {
            if let Err(e) = task.handle_message(connection, &request, valid) {
                warn!(task_id = %task.core().id(), "Message handling failed: {}", e);
                Self::send_error(connection, e.to_string());
            }
            return;
        }

        if request.is_join() {
            self.join(connection, &request);
            return;
        }

        if let Err(e) = self.create_and_start(connection, &request, valid) {
            warn!(connection = %connection.id(), "Task start failed: {}", e);
        }
    }

    fn join(&self, connection: &Arc<Connection>, request: &TaskRequest) {
        let Some(task_id) = request.task_id() else {
            Self::send_error(connection, "taskId is empty");
            connection.close();
            return;
        };

        match self.registry.get(task_id) {
            Some(task) if !task.core().is_stopped() => {
                task.core().attach(connection.clone());
                self.registry.bind(connection.id(), task_id);
                info!(connection = %connection.id(), task_id = %task_id, "Connection joined task");
            }
            _ => {
                Self::send_error(connection, JsVaultError::TaskNotFound(task_id.to_string()).to_string());
                connection.close();
            }
        }
    }

    fn create_and_start(
        &self,
        connection: &Arc<Connection>,
        request: &TaskRequest,
        valid: bool,
    ) -> Result<()> {
        let task = match self.factory.create_task(connection, request, valid) {
            Ok(task) => task,
            Err(e) => {
                Self::send_error(connection, e.to_string());
                connection.close();
                return Err(e);
            }
        };

        let task_id = task.core().id().to_string();
        self.registry.insert(task.clone());
        task.core().attach(connection.clone());
        self.registry.bind(connection.id(), &task_id);
        info!(connection = %connection.id(), task_id = %task_id, kind = %request.kind, "Task created");

        if let Err(e) = task.clone().start(request, valid) {
            Self::send_error(connection, e.to_string());
            task.stop();
            return Err(e);
        }
        Ok(())
    }

    /// The socket closed normally.
    pub fn on_close(&self, connection: &Arc<Connection>) {
        connection.mark_closed();
        self.registry.release_connection(connection.id());
    }

    /// The socket failed; treated like a close after logging.
    pub fn on_transport_error(&self, connection: &Arc<Connection>, error: &str) {
        warn!(connection = %connection.id(), "Transport error: {}", error);
        self.on_close(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Outbound, PoolConfig, RegistryConfig, TaskCore, WorkerPool};
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Task that records what it was started and messaged with.
    struct EchoTask {
        core: TaskCore,
        started_valid: Mutex<Option<bool>>,
        messages: AtomicUsize,
        fail_start: bool,
    }

    impl Task for EchoTask {
        fn core(&self) -> &TaskCore {
            &self.core
        }

        fn do_start(self: Arc<Self>, _request: &TaskRequest, valid: bool) -> Result<()> {
            *self.started_valid.lock().unwrap() = Some(valid);
            if self.fail_start {
                return Err(JsVaultError::InvalidRequest("cannot start".into()));
            }
            Ok(())
        }

        fn handle_message(
            &self,
            _connection: &Arc<Connection>,
            request: &TaskRequest,
            _valid: bool,
        ) -> Result<()> {
            self.messages.fetch_add(1, Ordering::SeqCst);
            if request.kind == "explode" {
                return Err(JsVaultError::InvalidRequest("explode".into()));
            }
            Ok(())
        }
    }

    struct EchoFactory {
        pool: Arc<WorkerPool>,
        created: Mutex<Vec<Arc<EchoTask>>>,
        fail_start: bool,
    }

    impl TaskFactory for EchoFactory {
        fn validate(&self, request: &TaskRequest) -> std::result::Result<(), String> {
            if request.body.contains_key("name") {
                Ok(())
            } else {
                Err("name is required".to_string())
            }
        }

        fn create_task(
            &self,
            _connection: &Arc<Connection>,
            _request: &TaskRequest,
            _valid: bool,
        ) -> Result<Arc<dyn Task>> {
            let index = self.created.lock().unwrap().len();
            let task = Arc::new(EchoTask {
                core: TaskCore::new(format!("echo-{}", index), "echo", None, self.pool.clone()),
                started_valid: Mutex::new(None),
                messages: AtomicUsize::new(0),
                fail_start: self.fail_start,
            });
            self.created.lock().unwrap().push(task.clone());
            Ok(task)
        }
    }

    fn handler(fail_start: bool) -> SessionHandler<EchoFactory> {
        let pool = WorkerPool::new(PoolConfig::new().with_max_workers(1)).unwrap();
        let registry = TaskRegistry::new(RegistryConfig::default(), pool.clone()).unwrap();
        SessionHandler::new(
            registry,
            EchoFactory {
                pool,
                created: Mutex::new(Vec::new()),
                fail_start,
            },
        )
    }

    fn next_json(rx: &mut UnboundedReceiver<Outbound>) -> JsonValue {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_first_message_creates_and_starts_task() {
        let handler = handler(false);
        let (conn, _rx) = Connection::new();
        handler.on_text(&conn, &json!({"type": "echo", "name": "a"}).to_string());

        let task = handler.registry().task_for_connection(conn.id()).unwrap();
        assert_eq!(task.core().id(), "echo-0");
        assert_eq!(task.core().session_count(), 1);
        let created = handler.factory.created.lock().unwrap();
        assert_eq!(*created[0].started_valid.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_invalid_payload_still_dispatches_with_flag() {
        let handler = handler(false);
        let (conn, _rx) = Connection::new();
        handler.on_text(&conn, r#"{"type": "echo"}"#);

        let created = handler.factory.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(*created[0].started_valid.lock().unwrap(), Some(false));
    }

    #[test]
    fn test_bound_connection_forwards_messages() {
        let handler = handler(false);
        let (conn, mut rx) = Connection::new();
        handler.on_text(&conn, r#"{"type": "echo", "name": "a"}"#);
        handler.on_text(&conn, r#"{"type": "more"}"#);
        handler.on_text(&conn, r#"{"type": "explode"}"#);

        let created = handler.factory.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].messages.load(Ordering::SeqCst), 2);
        assert_eq!(next_json(&mut rx)["message"], "Invalid request: explode");
        assert!(conn.is_open());
    }

    #[test]
    fn test_join_attaches_to_existing_task() {
        let handler = handler(false);
        let (owner, _owner_rx) = Connection::new();
        handler.on_text(&owner, r#"{"type": "echo", "name": "a"}"#);

        let (viewer, _viewer_rx) = Connection::new();
        handler.on_text(&viewer, r#"{"type": "join", "taskId": "echo-0"}"#);

        let task = handler.registry().get("echo-0").unwrap();
        assert_eq!(task.core().session_count(), 2);
        assert_eq!(handler.factory.created.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_join_unknown_task_reports_and_closes() {
        let handler = handler(false);
        let (conn, mut rx) = Connection::new();
        handler.on_text(&conn, r#"{"type": "join", "taskId": "missing"}"#);

        assert_eq!(next_json(&mut rx), json!({"level": "error", "message": "Task not found: missing"}));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(handler.registry().is_empty());
    }

    #[test]
    fn test_join_blank_task_id() {
        let handler = handler(false);
        let (conn, mut rx) = Connection::new();
        handler.on_text(&conn, r#"{"type": "join", "taskId": "   "}"#);

        assert_eq!(next_json(&mut rx)["message"], "taskId is empty");
        assert!(!conn.is_open());
    }

    #[test]
    fn test_failed_start_stops_task() {
        let handler = handler(true);
        let (conn, mut rx) = Connection::new();
        handler.on_text(&conn, r#"{"type": "echo", "name": "a"}"#);

        assert_eq!(next_json(&mut rx)["message"], "Invalid request: cannot start");
        let task = handler.registry().get("echo-0").unwrap();
        assert!(task.core().is_stopped());
        assert!(!conn.is_open());
    }

    #[test]
    fn test_malformed_frame_is_ignored() {
        let handler = handler(false);
        let (conn, mut rx) = Connection::new();
        handler.on_text(&conn, "not json");
        assert!(rx.try_recv().is_err());
        assert!(handler.registry().is_empty());
    }

    #[test]
    fn test_close_releases_binding() {
        let handler = handler(false);
        let (conn, _rx) = Connection::new();
        handler.on_text(&conn, r#"{"type": "echo", "name": "a"}"#);
        handler.on_close(&conn);

        assert!(handler.registry().task_for_connection(conn.id()).is_none());
        assert_eq!(handler.registry().get("echo-0").unwrap().core().session_count(), 0);
    }
}
