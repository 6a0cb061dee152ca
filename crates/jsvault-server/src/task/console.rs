//! Console that streams every call to a task's sessions.

use jsvault_common::ConsoleLogRes;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::console::{render, Console, ConsoleLevel, ROOT_FILE_NAME};
use crate::task::TaskCore;

/// Forwards each console call, untruncated, as a [`ConsoleLogRes`] frame to
/// every connection attached to the owning task.
#[derive(Debug, Clone)]
pub struct StreamingConsole {
    file_path: String,
    file_name: String,
    core: TaskCore,
}

impl StreamingConsole {
    pub fn new(core: TaskCore, file_path: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            file_name: file_name.into(),
            core,
        }
    }

    pub fn root(core: TaskCore) -> Self {
        Self::new(core, "/", ROOT_FILE_NAME)
    }
}

impl Console for StreamingConsole {
    fn file_path(&self) -> &str {
        &self.file_path
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn write(&self, level: ConsoleLevel, args: &[JsonValue]) {
        self.core.broadcast(&ConsoleLogRes::console(
            level.as_str(),
            self.file_path.as_str(),
            self.file_name.as_str(),
            render(args),
            args.to_vec(),
        ));
    }

    fn create(&self, file_path: &str, file_name: &str) -> Arc<dyn Console> {
        Arc::new(Self::new(self.core.clone(), file_path, file_name))
    }
}
