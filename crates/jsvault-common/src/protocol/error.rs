use thiserror::Error;

#[derive(Error, Debug)]
pub enum JsVaultError {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module execution error in {path}: {diagnostic}")]
    ModuleExecution { path: String, diagnostic: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already started: {0}")]
    AlreadyStarted(String),

    #[error("Worker pool saturated (max workers {max_workers}, queue capacity {queue_capacity})")]
    PoolSaturated {
        max_workers: usize,
        queue_capacity: usize,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JavaScript engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JsVaultError {
    /// Builds a `ModuleExecution` error for `path`.
    pub fn execution(path: impl Into<String>, diagnostic: impl ToString) -> Self {
        JsVaultError::ModuleExecution {
            path: path.into(),
            diagnostic: diagnostic.to_string(),
        }
    }
}

impl From<std::net::AddrParseError> for JsVaultError {
    fn from(err: std::net::AddrParseError) -> Self {
        JsVaultError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JsVaultError>;
