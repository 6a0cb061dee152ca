//! Interactive debug runs.
//!
//! A debug session loads one module in a private runtime, calls one of its
//! exported functions with no arguments and streams all console output to
//! the attached connections. The task stops itself after that single run
//! whether it succeeded or not.

use jsvault_common::protocol::error::{JsVaultError, Result};
use jsvault_common::TaskRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::folder::FolderProvider;
use crate::runtime::{EngineLimits, GlobalContext, ModuleRuntime, RuntimeOptions};
use crate::task::{Connection, StreamingConsole, Task, TaskCore, TaskFactory, WorkerPool};

pub const TASK_TYPE: &str = "debug-js";
pub const DEBUG_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload of the message that opens a debug session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugRequest {
    #[serde(alias = "bizType")]
    pub tenant: String,
    #[serde(alias = "groupName")]
    pub group: String,
    pub file_full_path: String,
    #[serde(alias = "fucName")]
    pub fn_name: String,
}

impl DebugRequest {
    pub fn from_request(request: &TaskRequest) -> Result<Self> {
        Ok(serde_json::from_value(JsonValue::Object(request.body.clone()))?)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.file_full_path.trim().is_empty() {
            return Err("fileFullPath is required".to_string());
        }
        if self.fn_name.trim().is_empty() {
            return Err("fnName is required".to_string());
        }
        Ok(())
    }
}

pub struct DebugTask {
    core: TaskCore,
    request: DebugRequest,
    runtime: Mutex<Option<ModuleRuntime>>,
}

impl DebugTask {
    pub fn request(&self) -> &DebugRequest {
        &self.request
    }

    fn runtime(&self) -> Result<ModuleRuntime> {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| JsVaultError::EngineUnavailable(format!("debug runtime for {} is released", self.core.id())))
    }

    fn run_once(&self, runtime: &ModuleRuntime) -> Result<()> {
        let path = &self.request.file_full_path;
        let fn_name = &self.request.fn_name;
        let module = runtime.use_module(path)?;
        if !module.has_callable(fn_name)? {
            return Err(JsVaultError::InvalidRequest(format!(
                "{} does not export a function named '{}'",
                path, fn_name
            )));
        }
        module.invoke(fn_name, Vec::new())?;
        Ok(())
    }
}

impl Task for DebugTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn do_start(self: Arc<Self>, _request: &TaskRequest, valid: bool) -> Result<()> {
        if !valid {
            let reason = self
                .request
                .validate()
                .err()
                .unwrap_or_else(|| "malformed debug request".to_string());
            return Err(JsVaultError::InvalidRequest(reason));
        }

        let runtime = self.runtime()?;
        let task = self.clone();
        let submitted = self.core.submit(move || {
            if let Err(e) = task.run_once(&runtime) {
                task.core.broadcast_error(e.to_string());
            }
            task.stop();
            Ok(())
        });

        // A debug task is a single run. A rejected submit (PoolSaturated) has
        // already been broadcast by the core, and no later submit exists to
        // finish the task, so it stops itself to release the debug runtime
        // and close its clients instead of idling until the timeout.
        if submitted.is_err() {
            self.stop();
        }
        Ok(())
    }

    fn do_stop(&self) {
        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            runtime.invalidate_all();
            debug!(task_id = %self.core.id(), "Debug runtime released");
        }
    }
}

/// Builds a [`DebugTask`] with a private runtime over a fresh folder.
pub struct DebugTaskFactory {
    folders: Arc<dyn FolderProvider>,
    pool: Arc<WorkerPool>,
    globals: GlobalContext,
    limits: EngineLimits,
}

impl DebugTaskFactory {
    pub fn new(folders: Arc<dyn FolderProvider>, pool: Arc<WorkerPool>) -> Self {
        Self {
            folders,
            pool,
            globals: GlobalContext::new(),
            limits: EngineLimits::debug(),
        }
    }

    pub fn with_globals(mut self, globals: GlobalContext) -> Self {
        self.globals = globals;
        self
    }

    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl TaskFactory for DebugTaskFactory {
    fn validate(&self, request: &TaskRequest) -> std::result::Result<(), String> {
        DebugRequest::from_request(request)
            .map_err(|e| e.to_string())?
            .validate()
    }

    fn create_task(
        &self,
        connection: &Arc<Connection>,
        request: &TaskRequest,
        valid: bool,
    ) -> Result<Arc<dyn Task>> {
        let debug_request = if valid {
            DebugRequest::from_request(request)?
        } else {
            DebugRequest::from_request(request).unwrap_or_default()
        };

        let id = format!("({}){}", Uuid::new_v4(), debug_request.file_full_path);
        let core = TaskCore::new(id.clone(), TASK_TYPE, Some(DEBUG_TIMEOUT), self.pool.clone());

        let folder = self.folders.open(&debug_request.tenant, &debug_request.group);
        let console = Arc::new(StreamingConsole::root(core.clone()));
        let runtime = ModuleRuntime::with_options(
            RuntimeOptions::new(id.clone(), folder, console)
                .with_globals(self.globals.clone())
                .with_limits(self.limits.clone()),
        )?;

        info!(
            task_id = %id,
            connection = %connection.id(),
            tenant = %debug_request.tenant,
            group = %debug_request.group,
            "Debug task created"
        );
        Ok(Arc::new(DebugTask {
            core,
            request: debug_request,
            runtime: Mutex::new(Some(runtime)),
        }))
    }
}
