//! CommonJS module loader.
//!
//! Each module body is compiled as
//! `(function (exports, require, module, __filename, __dirname, console) { ... })`
//! and called once with `this === exports`. Finished modules go to the
//! [`ModuleCache`]; modules still executing sit in the `loading` table, and
//! a `require` that reaches one of them gets its partial `module` object
//! back, which is what makes circular requires terminate.

use boa_engine::{js_string, object::JsObject, value::JsValue, Context, JsError, JsString, Source};
use jsvault_common::path;
use jsvault_common::protocol::error::{JsVaultError, Result};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

use crate::console::Console;
use crate::folder::{Folder, FolderEntry};
use crate::runtime::bindings;
use crate::runtime::conversions::json_to_js_value;
use crate::runtime::module_cache::{ModuleCache, ResolvedModule};

pub(crate) struct Loader {
    folder: Arc<dyn Folder>,
    console: Arc<dyn Console>,
    cache: RefCell<ModuleCache>,
    loading: RefCell<HashMap<String, JsObject>>,
    next_load_id: Cell<u64>,
}

/// Engine error text, preferring the native `Kind: message` form.
pub(crate) fn diagnostic(err: &JsError, ctx: &mut Context) -> String {
    match err.try_native(ctx) {
        Ok(native) => native.to_string(),
        Err(_) => err.to_string(),
    }
}

impl Loader {
    pub(crate) fn new(folder: Arc<dyn Folder>, console: Arc<dyn Console>) -> Self {
        Self {
            folder,
            console,
            cache: RefCell::new(ModuleCache::new()),
            loading: RefCell::new(HashMap::new()),
            next_load_id: Cell::new(1),
        }
    }

    pub(crate) fn cache(&self) -> Ref<'_, ModuleCache> {
        self.cache.borrow()
    }

    pub(crate) fn cache_mut(&self) -> RefMut<'_, ModuleCache> {
        self.cache.borrow_mut()
    }

    /// Load id of a finished module, if cached.
    pub(crate) fn load_id(&self, path: &str) -> Option<u64> {
        self.cache.borrow().get(path).map(|module| module.load_id)
    }

    /// Map a `require` specifier to the path of an existing module.
    ///
    /// `/x` is absolute, `./x` and `../x` are relative to `from_directory`,
    /// and bare names are resolved from the root. Without an explicit
    /// `.js`/`.json` extension the candidates are `p`, `p.js`, `p.json`
    /// and `p/index.js`.
    pub(crate) fn resolve_specifier(&self, from_directory: &str, specifier: &str) -> Result<String> {
        let base = if specifier.starts_with('/') {
            path::normalize(specifier)
        } else if specifier.starts_with("./") || specifier.starts_with("../") {
            path::join(from_directory, specifier)
        } else {
            path::join("/", specifier)
        };

        let candidates = if base.ends_with(".js") || base.ends_with(".json") {
            vec![base.clone()]
        } else {
            vec![
                base.clone(),
                format!("{}.js", base),
                format!("{}.json", base),
                path::join(&base, "index.js"),
            ]
        };

        for candidate in candidates {
            if self.cache.borrow().get(&candidate).is_some()
                || self.loading.borrow().contains_key(&candidate)
            {
                return Ok(candidate);
            }
            if self.resolve_file(&candidate)?.is_some() {
                return Ok(candidate);
            }
        }
        Err(JsVaultError::ModuleNotFound(base))
    }

    fn resolve_file(&self, path: &str) -> Result<Option<FolderEntry>> {
        Ok(self.folder.resolve(path)?.filter(FolderEntry::is_file))
    }

    pub(crate) fn require(
        loader: &Rc<Self>,
        from_directory: &str,
        specifier: &str,
        ctx: &mut Context,
    ) -> Result<JsObject> {
        let path = loader.resolve_specifier(from_directory, specifier)?;
        Self::load(loader, &path, ctx)
    }

    /// Load the module at `path`, executing it at most once.
    ///
    /// Returns the CommonJS `module` object.
    pub(crate) fn load(loader: &Rc<Self>, path: &str, ctx: &mut Context) -> Result<JsObject> {
        let path = path::normalize(path);
        if let Some(module) = loader.cache.borrow().get(&path) {
            return Ok(module.module.clone());
        }
        if let Some(partial) = loader.loading.borrow().get(&path) {
            debug!(%path, "Circular require, returning partial exports");
            return Ok(partial.clone());
        }

        let entry = loader
            .resolve_file(&path)?
            .ok_or_else(|| JsVaultError::ModuleNotFound(path.clone()))?;

        let exports = JsObject::with_object_proto(ctx.intrinsics());
        let module = JsObject::with_object_proto(ctx.intrinsics());
        module
            .set(js_string!("exports"), exports.clone(), false, ctx)
            .map_err(|e| JsVaultError::execution(&path, e))?;
        module
            .set(js_string!("id"), JsString::from(path.as_str()), false, ctx)
            .map_err(|e| JsVaultError::execution(&path, e))?;

        loader.loading.borrow_mut().insert(path.clone(), module.clone());
        let source = entry.content.as_deref().unwrap_or_default();
        let result = if path.ends_with(".json") {
            Self::evaluate_json(&path, source, &module, ctx)
        } else {
            Self::evaluate(loader, &path, source, &module, exports, ctx)
        };
        loader.loading.borrow_mut().remove(&path);
        result?;

        let load_id = loader.next_load_id.get();
        loader.next_load_id.set(load_id + 1);
        loader.cache.borrow_mut().insert(ResolvedModule {
            path: path.clone(),
            module: module.clone(),
            load_id,
            version: entry.last_modified,
        });
        debug!(%path, load_id, "Loaded module");
        Ok(module)
    }

    fn evaluate(
        loader: &Rc<Self>,
        path: &str,
        source: &str,
        module: &JsObject,
        exports: JsObject,
        ctx: &mut Context,
    ) -> Result<()> {
        let (directory, file_name) = path::split_path(path);
        // Body starts on the wrapper's first line so line numbers match the source
        let wrapper = format!(
            "(function (exports, require, module, __filename, __dirname, console) {{{}\n}})",
            source
        );

        let function = match ctx.eval(Source::from_bytes(wrapper.as_bytes())) {
            Ok(function) => function,
            Err(e) => return Err(JsVaultError::execution(path, diagnostic(&e, ctx))),
        };
        let function = function
            .as_object()
            .filter(|object| object.is_callable())
            .map(|object| object.clone())
            .ok_or_else(|| JsVaultError::execution(path, "module wrapper is not callable"))?;

        let console = bindings::console_object(loader.console.create(&directory, &file_name), ctx)?;
        let require = bindings::require_function(loader.clone(), directory.clone(), ctx);
        let exports: JsValue = exports.into();
        let args = [
            exports.clone(),
            require,
            module.clone().into(),
            JsValue::new(JsString::from(path)),
            JsValue::new(JsString::from(directory.as_str())),
            console.into(),
        ];

        match function.call(&exports, &args, ctx) {
            Ok(_) => Ok(()),
            Err(e) => Err(JsVaultError::execution(path, diagnostic(&e, ctx))),
        }
    }

    fn evaluate_json(path: &str, source: &str, module: &JsObject, ctx: &mut Context) -> Result<()> {
        let json: serde_json::Value =
            serde_json::from_str(source).map_err(|e| JsVaultError::execution(path, e))?;
        let value = json_to_js_value(&json, ctx)?;
        module
            .set(js_string!("exports"), value, false, ctx)
            .map_err(|e| JsVaultError::execution(path, e))?;
        Ok(())
    }
}
