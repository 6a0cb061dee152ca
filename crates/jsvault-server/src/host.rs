//! Wires the server together.
//!
//! A [`ScriptHost`] owns the production runtime and dispatcher for one
//! `(tenant, group)`, the task registry with its worker pool, and the debug
//! session handler. Scripts come from a [`Backend`]: an in-memory store
//! that publishes change events, or a directory on disk.

use jsvault_common::protocol::error::{JsVaultError, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServerConfig;
use crate::console::LogConsole;
use crate::dispatch::RequestDispatcher;
use crate::folder::{FileCache, FileSystemFolders, Folder, FolderProvider, MemoryFileStore, StoreFolder, StoreFolders};
use crate::invalidation::CacheInvalidator;
use crate::runtime::{RuntimeOptions, RuntimePool};
use crate::task::{DebugTaskFactory, SessionHandler, TaskRegistry, WorkerPool};

/// Where scripts are read from.
#[derive(Clone)]
pub enum Backend {
    Store(Arc<MemoryFileStore>),
    /// `<root>/<tenant>/<group>/...`
    FileSystem(PathBuf),
}

pub struct ScriptHost {
    config: ServerConfig,
    backend: Backend,
    dispatcher: Arc<RequestDispatcher>,
    registry: Arc<TaskRegistry>,
    sessions: Arc<SessionHandler<DebugTaskFactory>>,
    invalidator: Option<CacheInvalidator>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ScriptHost {
    pub fn new(config: ServerConfig, backend: Backend) -> Result<Self> {
        config.validate().map_err(JsVaultError::InvalidRequest)?;

        let (folder, folders, cache) = match &backend {
            Backend::Store(store) => {
                let cache = Arc::new(FileCache::new(store.clone()));
                let folder: Arc<dyn Folder> =
                    Arc::new(StoreFolder::new(&config.tenant, &config.group, cache.clone()));
                let folders: Arc<dyn FolderProvider> = Arc::new(StoreFolders::new(store.clone()));
                (folder, folders, Some(cache))
            }
            Backend::FileSystem(root) => {
                let folders: Arc<dyn FolderProvider> = Arc::new(FileSystemFolders::new(root.clone()));
                (folders.open(&config.tenant, &config.group), folders, None)
            }
        };

        let runtimes = RuntimePool::new(
            RuntimeOptions::new("http", folder.clone(), Arc::new(LogConsole::root("/")))
                .with_globals(config.globals.clone())
                .with_limits(config.limits.clone()),
            config.engines,
        )?;
        let invalidator = cache.map(|cache| {
            CacheInvalidator::new(cache, runtimes.clone(), &config.tenant, &config.group)
        });
        let dispatcher = Arc::new(RequestDispatcher::new(folder, runtimes));

        let pool = WorkerPool::new(config.pool.clone())?;
        let registry = TaskRegistry::new(config.registry.clone(), pool.clone())?;
        let factory = DebugTaskFactory::new(folders, pool)
            .with_globals(config.globals.clone())
            .with_limits(config.debug_limits.clone());
        let sessions = Arc::new(SessionHandler::new(registry.clone(), factory));

        Ok(Self {
            config,
            backend,
            dispatcher,
            registry,
            sessions,
            invalidator,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionHandler<DebugTaskFactory>> {
        &self.sessions
    }

    /// Start the reclamation sweeper and, for store backends, cache
    /// invalidation. Must run inside a tokio runtime.
    pub fn start(&self) {
        self.registry.spawn_sweeper();
        if let (Some(invalidator), Backend::Store(store)) = (&self.invalidator, &self.backend) {
            let handle = invalidator.clone().spawn(store.subscribe());
            self.background
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        info!(tenant = %self.config.tenant, group = %self.config.group, "Script host started");
    }

    /// Stop every task and background job.
    pub async fn shutdown(&self) {
        for handle in self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        self.registry.shutdown().await;
        self.dispatcher.runtimes().invalidate_all();
        info!("Script host stopped");
    }
}
