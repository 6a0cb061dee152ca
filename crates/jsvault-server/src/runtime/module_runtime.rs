//! The module runtime.
//!
//! A [`ModuleRuntime`] owns one Boa [`Context`] on a dedicated engine
//! thread. The context holds garbage-collected values and cannot leave the
//! thread that created it, so every operation is a [`Command`] sent over a
//! channel and answered on a one-shot reply channel. All calls are
//! blocking; async callers should go through `spawn_blocking`.
//!
//! Commands are processed one at a time, so module initialization is
//! single-flight per runtime: a second `use` of a path that is still
//! loading waits behind the first and then hits the cache.

use boa_engine::{js_string, object::JsObject, value::JsValue, Context, JsString};
use jsvault_common::path;
use jsvault_common::protocol::error::{JsVaultError, Result};
use serde_json::Value as JsonValue;
use std::rc::Rc;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, trace};

use crate::console::Console;
use crate::folder::Folder;
use crate::runtime::bindings::{self, GlobalContext, EXCHANGE_FACTORY};
use crate::runtime::conversions::{json_args_to_js, json_to_js_value, js_value_to_json, js_value_to_optional_json};
use crate::runtime::exchange::{HttpExchange, ScriptResponse, ServiceOutcome};
use crate::runtime::limits::EngineLimits;
use crate::runtime::loader::{diagnostic, Loader};

type Reply<T> = mpsc::Sender<Result<T>>;

enum Command {
    Use {
        path: String,
        reply: Reply<u64>,
    },
    HasCallable {
        path: String,
        name: String,
        reply: Reply<bool>,
    },
    Invoke {
        path: String,
        name: String,
        args: Vec<JsonValue>,
        reply: Reply<Option<JsonValue>>,
    },
    Serve {
        path: String,
        exchange: HttpExchange,
        reply: Reply<ServiceOutcome>,
    },
    /// `None` clears the whole cache
    Invalidate { prefix: Option<String> },
    CachedPaths { reply: Reply<Vec<String>> },
}

/// Everything a runtime is constructed from.
#[derive(Clone)]
pub struct RuntimeOptions {
    pub name: String,
    pub folder: Arc<dyn Folder>,
    pub console: Arc<dyn Console>,
    pub globals: GlobalContext,
    pub limits: EngineLimits,
}

impl RuntimeOptions {
    pub fn new(name: impl Into<String>, folder: Arc<dyn Folder>, console: Arc<dyn Console>) -> Self {
        Self {
            name: name.into(),
            folder,
            console,
            globals: GlobalContext::default(),
            limits: EngineLimits::default(),
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

struct RuntimeShared {
    name: String,
    commands: mpsc::Sender<Command>,
}

/// Handle to a module runtime. Clones share the same engine thread; the
/// thread exits once the last clone is dropped.
#[derive(Clone)]
pub struct ModuleRuntime {
    shared: Arc<RuntimeShared>,
}

impl std::fmt::Debug for ModuleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl ModuleRuntime {
    /// Start a runtime with default globals and limits.
    pub fn new(name: impl Into<String>, folder: Arc<dyn Folder>, console: Arc<dyn Console>) -> Result<Self> {
        Self::with_options(RuntimeOptions::new(name, folder, console))
    }

    /// Start the engine thread and wait until its context is ready.
    pub fn with_options(options: RuntimeOptions) -> Result<Self> {
        options
            .limits
            .validate()
            .map_err(JsVaultError::InvalidRequest)?;

        let name = options.name.clone();
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("js-{}", name))
            .spawn(move || engine_main(options, inbox, ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| JsVaultError::EngineUnavailable(format!("engine '{}' exited during startup", name)))??;
        debug!(runtime = %name, "Module runtime started");

        Ok(Self {
            shared: Arc::new(RuntimeShared { name, commands }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn unavailable(&self) -> JsVaultError {
        JsVaultError::EngineUnavailable(format!("engine '{}' is not running", self.shared.name))
    }

    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::channel();
        self.shared
            .commands
            .send(build(reply))
            .map_err(|_| self.unavailable())?;
        response.recv().map_err(|_| self.unavailable())?
    }

    /// Load the module at the absolute logical `path`.
    ///
    /// A module that is already cached is not executed again.
    ///
    /// # Errors
    ///
    /// - `ModuleNotFound` if the folder has no file at `path`
    /// - `ModuleExecution` if the module (or anything it requires) fails
    pub fn use_module(&self, path: &str) -> Result<ModuleHandle> {
        let path = path::normalize(path);
        let load_id = self.request(|reply| Command::Use {
            path: path.clone(),
            reply,
        })?;
        Ok(ModuleHandle {
            runtime: self.clone(),
            path,
            load_id,
        })
    }

    /// Drop `path` and every module below it from the cache.
    pub fn invalidate(&self, path: &str) {
        let prefix = Some(path::normalize(path));
        if self.shared.commands.send(Command::Invalidate { prefix }).is_err() {
            trace!(runtime = %self.shared.name, "Invalidate on stopped runtime");
        }
    }

    pub fn invalidate_all(&self) {
        if self.shared.commands.send(Command::Invalidate { prefix: None }).is_err() {
            trace!(runtime = %self.shared.name, "Invalidate on stopped runtime");
        }
    }

    /// Paths currently in the module cache, sorted.
    pub fn cached_paths(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::CachedPaths { reply })
    }
}

/// A loaded module.
///
/// Handles compare equal when they refer to the same execution of the same
/// module.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    runtime: ModuleRuntime,
    path: String,
    load_id: u64,
}

impl PartialEq for ModuleHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.runtime.shared, &other.runtime.shared)
            && self.path == other.path
            && self.load_id == other.load_id
    }
}

impl Eq for ModuleHandle {}

impl ModuleHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn load_id(&self) -> u64 {
        self.load_id
    }

    /// Does the module export a function called `name`?
    pub fn has_callable(&self, name: &str) -> Result<bool> {
        self.runtime.request(|reply| Command::HasCallable {
            path: self.path.clone(),
            name: name.to_string(),
            reply,
        })
    }

    /// Call the exported function `name` with `this` bound to the exports.
    ///
    /// Returns `None` when the function returned `undefined`.
    pub fn invoke(&self, name: &str, args: Vec<JsonValue>) -> Result<Option<JsonValue>> {
        self.runtime.request(|reply| Command::Invoke {
            path: self.path.clone(),
            name: name.to_string(),
            args,
            reply,
        })
    }

    /// Call the exported `service(ctx)` with a request/response wrapper.
    pub fn serve(&self, exchange: HttpExchange) -> Result<ServiceOutcome> {
        self.runtime.request(|reply| Command::Serve {
            path: self.path.clone(),
            exchange,
            reply,
        })
    }
}

fn engine_main(options: RuntimeOptions, inbox: mpsc::Receiver<Command>, ready: mpsc::Sender<Result<()>>) {
    let RuntimeOptions {
        name,
        folder,
        console,
        globals,
        limits,
    } = options;

    let mut ctx = Context::default();
    limits.apply(&mut ctx);
    if let Err(e) = bindings::install_globals(&mut ctx, &globals) {
        let _ = ready.send(Err(e));
        return;
    }

    let mut engine = Engine {
        ctx,
        loader: Rc::new(Loader::new(folder, console)),
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    while let Ok(command) = inbox.recv() {
        engine.handle(command);
    }

    // Cached modules hold closures that hold the loader
    engine.loader.cache_mut().clear();
    debug!(runtime = %name, "Module runtime stopped");
}

struct Engine {
    ctx: Context,
    loader: Rc<Loader>,
}

impl Engine {
    fn handle(&mut self, command: Command) {
        // A dropped reply receiver means the caller went away; nothing to do
        match command {
            Command::Use { path, reply } => {
                let _ = reply.send(self.use_module(&path));
            }
            Command::HasCallable { path, name, reply } => {
                let _ = reply.send(self.callable(&path, &name).map(|(_, f)| f.is_some()));
            }
            Command::Invoke {
                path,
                name,
                args,
                reply,
            } => {
                let _ = reply.send(self.invoke(&path, &name, &args));
            }
            Command::Serve {
                path,
                exchange,
                reply,
            } => {
                let _ = reply.send(self.serve(&path, &exchange));
            }
            Command::Invalidate { prefix } => {
                let mut cache = self.loader.cache_mut();
                match prefix {
                    Some(prefix) => {
                        let removed = cache.remove_prefix(&prefix);
                        trace!(%prefix, removed, "Invalidated modules");
                    }
                    None => cache.clear(),
                }
            }
            Command::CachedPaths { reply } => {
                let _ = reply.send(Ok(self.loader.cache().paths()));
            }
        }
    }

    fn use_module(&mut self, path: &str) -> Result<u64> {
        Loader::load(&self.loader, path, &mut self.ctx)?;
        self.loader
            .load_id(path)
            .ok_or_else(|| JsVaultError::ModuleNotFound(path.to_string()))
    }

    /// The module's exports and its callable member `name`, if any.
    fn callable(&mut self, path: &str, name: &str) -> Result<(JsValue, Option<JsObject>)> {
        let module = Loader::load(&self.loader, path, &mut self.ctx)?;
        let exports = module
            .get(js_string!("exports"), &mut self.ctx)
            .map_err(|e| JsVaultError::execution(path, e))?;

        let member = match exports.as_object() {
            Some(object) => object
                .get(JsString::from(name), &mut self.ctx)
                .map_err(|e| JsVaultError::execution(path, e))?,
            None => JsValue::undefined(),
        };
        let function = member
            .as_object()
            .filter(|object| object.is_callable())
            .map(|object| object.clone());
        Ok((exports, function))
    }

    fn invoke(&mut self, path: &str, name: &str, args: &[JsonValue]) -> Result<Option<JsonValue>> {
        let (exports, function) = self.callable(path, name)?;
        let function = function.ok_or_else(|| {
            JsVaultError::InvalidRequest(format!("'{}' is not a function exported by {}", name, path))
        })?;

        let args = json_args_to_js(args, &mut self.ctx)?;
        let result = match function.call(&exports, &args, &mut self.ctx) {
            Ok(result) => result,
            Err(e) => return Err(JsVaultError::execution(path, diagnostic(&e, &mut self.ctx))),
        };
        js_value_to_optional_json(&result, &mut self.ctx)
    }

    fn serve(&mut self, path: &str, exchange: &HttpExchange) -> Result<ServiceOutcome> {
        let (exports, service) = self.callable(path, "service")?;
        let service = service.ok_or_else(|| {
            JsVaultError::InvalidRequest(format!("{} does not export a service function", path))
        })?;

        let factory = self
            .ctx
            .global_object()
            .get(JsString::from(EXCHANGE_FACTORY), &mut self.ctx)
            .map_err(|e| JsVaultError::EngineUnavailable(e.to_string()))?;
        let factory = factory
            .as_object()
            .filter(|object| object.is_callable())
            .map(|object| object.clone())
            .ok_or_else(|| JsVaultError::EngineUnavailable("exchange factory missing".into()))?;

        let request = json_to_js_value(&serde_json::to_value(exchange)?, &mut self.ctx)?;
        let wrapper = factory
            .call(&JsValue::undefined(), &[request], &mut self.ctx)
            .map_err(|e| JsVaultError::EngineUnavailable(e.to_string()))?;

        let result = match service.call(&exports, &[wrapper.clone()], &mut self.ctx) {
            Ok(result) => result,
            Err(e) => return Err(JsVaultError::execution(path, diagnostic(&e, &mut self.ctx))),
        };
        let result = js_value_to_optional_json(&result, &mut self.ctx)?;

        let response = match wrapper.as_object() {
            Some(object) => object
                .get(js_string!("response"), &mut self.ctx)
                .map_err(|e| JsVaultError::execution(path, e))?,
            None => JsValue::undefined(),
        };
        let response = ScriptResponse::from_json(&js_value_to_json(&response, &mut self.ctx)?);

        Ok(ServiceOutcome { result, response })
    }
}
