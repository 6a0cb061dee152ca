//! Request/response values exchanged with a script's `service(ctx)`.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// The request half of `ctx`, visible to scripts as `ctx.request`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpExchange {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Lowercased header names
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON for JSON requests, a string otherwise, `null` when empty
    pub body: JsonValue,
}

impl HttpExchange {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = body;
        self
    }
}

/// What the script did with `ctx.response`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// `write` or `json` was called
    pub written: bool,
}

impl Default for ScriptResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: None,
            written: false,
        }
    }
}

impl ScriptResponse {
    /// Read the response state back from its JSON form.
    pub(crate) fn from_json(value: &JsonValue) -> Self {
        let mut response = Self::default();
        if let Some(status) = value
            .get("status")
            .and_then(JsonValue::as_u64)
            .and_then(|status| u16::try_from(status).ok())
        {
            response.status = status;
        }
        if let Some(headers) = value.get("headers").and_then(JsonValue::as_object) {
            for (name, header) in headers {
                response
                    .headers
                    .insert(name.clone(), crate::console::stringify(header));
            }
        }
        response.body = match value.get("body") {
            None | Some(JsonValue::Null) => None,
            Some(body) => Some(crate::console::stringify(body)),
        };
        response.written = value
            .get("written")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        response
    }
}

/// Result of one `service(ctx)` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOutcome {
    /// The return value; `None` when the script returned `undefined`
    pub result: Option<JsonValue>,
    pub response: ScriptResponse,
}
