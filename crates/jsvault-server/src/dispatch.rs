//! Script handlers for HTTP requests.
//!
//! A request that no native route claims is mapped to a handler module in
//! the folder, first match wins:
//!
//! 1. `<p>/<method>_controller.js`
//! 2. `<p>/controller.js`
//! 3. `<p>.js`, only when `<p>` has no extension
//!
//! where `<p>` is the request path with a trailing `.json` or `.action`
//! removed. The chosen module must export a callable `service`.

use jsvault_common::path;
use jsvault_common::protocol::error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::folder::Folder;
use crate::runtime::{HttpExchange, ModuleHandle, ModuleRuntime, PooledRuntime, RuntimePool, ServiceOutcome};

/// Set to the script path when a script handled the request.
pub const HANDLER_HEADER: &str = "use-http-request-js-handler";
/// Set to the script path when a native route shadowed it.
pub const OVERRIDE_HEADER: &str = "http-request-js-handler-be-override";

pub const SERVICE_FUNCTION: &str = "service";
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

const STRIPPED_SUFFIXES: [&str; 2] = [".json", ".action"];
const HANDLER_FILE_NAME: &str = "controller.js";

/// What to do with one request.
#[derive(Debug)]
pub enum Dispatch {
    /// No usable script; continue with normal routing
    Passthrough,
    /// A script exists but a native handler takes the request
    Overridden(String),
    Script(ModuleHandle),
}

/// Final HTTP response produced by a script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptReply {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl ScriptReply {
    /// A return value other than `undefined` becomes the JSON body unless
    /// the script wrote the response itself.
    pub fn from_outcome(script_path: &str, outcome: ServiceOutcome) -> Result<Self> {
        let ServiceOutcome { result, response } = outcome;
        let mut headers = response.headers;
        headers.insert(HANDLER_HEADER.to_string(), script_path.to_string());

        let body = match (response.written, result) {
            (true, _) => response.body.unwrap_or_default(),
            (false, Some(result)) => {
                headers.insert("content-type".to_string(), JSON_CONTENT_TYPE.to_string());
                serde_json::to_string(&result)?
            }
            (false, None) => String::new(),
        };

        Ok(Self {
            status: response.status,
            headers,
            body,
        })
    }
}

pub struct RequestDispatcher {
    folder: Arc<dyn Folder>,
    runtimes: RuntimePool,
}

impl RequestDispatcher {
    pub fn new(folder: Arc<dyn Folder>, runtimes: RuntimePool) -> Self {
        Self { folder, runtimes }
    }

    pub fn runtimes(&self) -> &RuntimePool {
        &self.runtimes
    }

    /// A runtime to handle one request on, waiting while all are busy.
    pub async fn acquire(&self) -> Result<PooledRuntime> {
        self.runtimes.acquire().await
    }

    fn exists(&self, candidate: &str) -> bool {
        match self.folder.resolve_script(candidate) {
            Ok(entry) => entry.is_some_and(|entry| {
                entry
                    .content
                    .as_deref()
                    .is_some_and(|content| !content.trim().is_empty())
            }),
            Err(e) => {
                warn!(path = %candidate, "Handler lookup failed: {}", e);
                false
            }
        }
    }

    /// The handler module for `method` and `request_path`, if one exists.
    pub fn candidate(&self, method: &str, request_path: &str) -> Option<String> {
        let mut base = request_path;
        for suffix in STRIPPED_SUFFIXES {
            if let Some(stripped) = base.strip_suffix(suffix) {
                base = stripped;
                break;
            }
        }
        let base = path::normalize(base);

        let method_handler = path::join(
            &base,
            &format!("{}_{}", method.to_ascii_lowercase(), HANDLER_FILE_NAME),
        );
        if self.exists(&method_handler) {
            return Some(method_handler);
        }

        let handler = path::join(&base, HANDLER_FILE_NAME);
        if self.exists(&handler) {
            return Some(handler);
        }

        if base != "/" && !path::has_extension(&base) {
            let script = format!("{}.js", base);
            if self.exists(&script) {
                return Some(script);
            }
        }
        None
    }

    /// Decide how to handle a request.
    ///
    /// The module is loaded on `runtime`, which must also serve the returned
    /// handle. `native_matched` is whether a native route claims the path.
    /// Errors come from loading the chosen module and should fail the
    /// request.
    pub fn prepare(
        &self,
        runtime: &ModuleRuntime,
        method: &str,
        request_path: &str,
        native_matched: bool,
    ) -> Result<Dispatch> {
        let Some(script_path) = self.candidate(method, request_path) else {
            return Ok(Dispatch::Passthrough);
        };

        let handle = runtime.use_module(&script_path)?;
        if !handle.has_callable(SERVICE_FUNCTION)? {
            debug!(path = %script_path, "Handler has no service function");
            return Ok(Dispatch::Passthrough);
        }
        if native_matched {
            warn!(path = %script_path, "Script handler overridden by native route");
            return Ok(Dispatch::Overridden(script_path));
        }
        Ok(Dispatch::Script(handle))
    }

    /// Call the handler's `service(ctx)` and build the reply.
    pub fn serve(&self, handle: &ModuleHandle, exchange: HttpExchange) -> Result<ScriptReply> {
        let outcome = handle.serve(exchange)?;
        ScriptReply::from_outcome(handle.path(), outcome)
    }
}
