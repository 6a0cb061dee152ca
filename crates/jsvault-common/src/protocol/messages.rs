//! WebSocket task protocol messages.
//!
//! Inbound frames are JSON objects tagged with `type`; the reserved type
//! [`JOIN_TYPE`] attaches the sending connection to an existing task. Every
//! other field is task specific and kept in [`TaskRequest::body`].
//!
//! Outbound frames are [`ConsoleLogRes`] values, either console events
//! streamed from a running script or lifecycle errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Message type that joins an existing task instead of creating one.
pub const JOIN_TYPE: &str = "join";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    #[serde(flatten)]
    pub body: Map<String, JsonValue>,
}

impl TaskRequest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            task_id: None,
            body: Map::new(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    pub fn is_join(&self) -> bool {
        self.kind == JOIN_TYPE
    }

    /// The task id with surrounding whitespace removed, if non-blank.
    pub fn task_id(&self) -> Option<&str> {
        self.task_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Outbound frame.
///
/// Console events fill every field; lifecycle errors only carry `level`
/// and `message`. Absent fields are omitted from the JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLogRes {
    pub level: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<JsonValue>>,
}

impl ConsoleLogRes {
    pub fn console(
        level: impl Into<String>,
        file_path: impl Into<String>,
        file_name: impl Into<String>,
        message: impl Into<String>,
        args: Vec<JsonValue>,
    ) -> Self {
        Self {
            level: level.into(),
            file_path: Some(file_path.into()),
            file_name: Some(file_name.into()),
            message: message.into(),
            args: Some(args),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            file_path: None,
            file_name: None,
            message: message.into(),
            args: None,
        }
    }
}
