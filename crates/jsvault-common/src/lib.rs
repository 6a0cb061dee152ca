//! jsvault common types
//!
//! Shared protocol definitions for the jsvault script host:
//!
//! - **Protocol Layer**: error taxonomy, WebSocket task messages and
//!   storage change events
//! - **Model**: the virtual file records scripts are stored as
//! - **Paths**: logical path normalization used by every folder backend
//! - **Snapshot**: serializable diagnostics for the task registry

pub mod model;
pub mod path;
pub mod protocol;
pub mod snapshot;

pub use model::{NodeType, VirtualFile};
pub use protocol::*;
pub use snapshot::{PoolSnapshot, RegistrySnapshot, TaskInfo};
