//! jsvault Server
//!
//! This crate hosts stored JavaScript as HTTP handlers and interactive
//! debug sessions, using the Boa JavaScript engine.
//!
//! - [`folder`]: the virtual script tree and its file cache
//! - [`runtime`]: the CommonJS module runtime
//! - [`task`]: the task engine behind WebSocket debug sessions
//! - [`dispatch`]: maps HTTP requests to script handlers
//! - [`http_server`]: the axum surface tying it together

pub mod config;
pub mod console;
pub mod dispatch;
pub mod folder;
pub mod host;
pub mod http_server;
pub mod invalidation;
pub mod runtime;
pub mod task;

pub use config::ServerConfig;
pub use dispatch::RequestDispatcher;
pub use host::{Backend, ScriptHost};
pub use http_server::HttpServer;
pub use runtime::{ModuleHandle, ModuleRuntime, RuntimePool};
pub use task::{TaskRegistry, WorkerPool};
