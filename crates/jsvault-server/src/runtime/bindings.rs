//! JavaScript bindings for jsvault
//!
//! Native functions and objects exposed to scripts:
//!
//! - `utils` global: `currentTimeMillis()`, `sleep(ms)`, `uuid()`,
//!   `format(pattern, ...args)` and `throwError(message)`
//! - configured [`GlobalContext`] values, one global each
//! - per-module `console` and `require` values, handed to each module body
//!   by the [`Loader`](super::loader::Loader)
//!
//! Native closures capture Rust state through `#[unsafe_ignore_trace]`
//! fields: the captured values never hold engine objects, so there is
//! nothing for the collector to trace.

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    property::Attribute,
    value::JsValue,
    Context, JsNativeError, JsResult, JsString, Source,
};
use boa_gc::{Finalize, Trace};
use chrono::Utc;
use jsvault_common::protocol::error::{JsVaultError, Result};
use serde_json::{Map, Value as JsonValue};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::console::{self, Console, ConsoleLevel};
use crate::runtime::conversions::{json_to_js_value, js_value_to_json};
use crate::runtime::loader::Loader;

/// Global that builds the `ctx` object passed to `service(ctx)`.
pub(crate) const EXCHANGE_FACTORY: &str = "__jsvaultExchange";

const EXCHANGE_PRELUDE: &str = r#"
Object.defineProperty(globalThis, '__jsvaultExchange', {
    enumerable: false,
    value: function (request) {
        var response = {
            status: 200,
            headers: {},
            body: undefined,
            written: false,
            setStatus: function (status) {
                this.status = status;
                return this;
            },
            setHeader: function (name, value) {
                this.headers[String(name).toLowerCase()] = String(value);
                return this;
            },
            write: function (text) {
                this.body = (this.written && this.body !== undefined ? this.body : '') + String(text);
                this.written = true;
                return this;
            },
            json: function (value) {
                this.setHeader('content-type', 'application/json;charset=UTF-8');
                this.body = JSON.stringify(value);
                this.written = true;
                return this;
            }
        };
        return { request: request, response: response };
    }
});
"#;

/// Values installed as globals in every context of a runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalContext {
    values: Map<String, JsonValue>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn values(&self) -> &Map<String, JsonValue> {
        &self.values
    }
}

fn install_error(e: impl std::fmt::Display) -> JsVaultError {
    JsVaultError::EngineUnavailable(format!("Failed to install bindings: {}", e))
}

/// Install the `utils` object, the configured globals and the HTTP
/// exchange factory.
pub(crate) fn install_globals(ctx: &mut Context, globals: &GlobalContext) -> Result<()> {
    let utils = JsObject::with_object_proto(ctx.intrinsics());
    let functions: [(&str, fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>); 5] = [
        ("currentTimeMillis", current_time_millis),
        ("sleep", sleep),
        ("uuid", random_uuid),
        ("format", format_pattern),
        ("throwError", throw_error),
    ];
    for (name, function) in functions {
        let function = FunctionObjectBuilder::new(ctx.realm(), NativeFunction::from_fn_ptr(function)).build();
        utils
            .set(JsString::from(name), function, false, ctx)
            .map_err(install_error)?;
    }
    ctx.register_global_property(js_string!("utils"), utils, Attribute::all())
        .map_err(install_error)?;

    for (name, value) in globals.values() {
        let value = json_to_js_value(value, ctx)?;
        ctx.register_global_property(JsString::from(name.as_str()), value, Attribute::all())
            .map_err(install_error)?;
    }

    ctx.eval(Source::from_bytes(EXCHANGE_PRELUDE))
        .map_err(install_error)?;
    Ok(())
}

fn current_time_millis(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::new(Utc::now().timestamp_millis() as f64))
}

fn sleep(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let millis = match args.first() {
        Some(value) => value.to_number(ctx)?,
        None => 0.0,
    };
    if millis.is_finite() && millis > 0.0 {
        std::thread::sleep(Duration::from_millis(millis as u64));
    }
    Ok(JsValue::undefined())
}

fn random_uuid(_this: &JsValue, _args: &[JsValue], _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::new(JsString::from(uuid::Uuid::new_v4().to_string().as_str())))
}

/// `format("{} of {}", 1, 2)` substitutes placeholders left to right;
/// surplus placeholders are kept verbatim.
fn format_pattern(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let pattern = match args.first() {
        Some(value) => value.to_string(ctx)?.to_std_string_escaped(),
        None => return Ok(JsValue::new(js_string!(""))),
    };

    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern.as_str();
    let mut values = args.iter().skip(1);
    while let Some(idx) = rest.find("{}") {
        out.push_str(&rest[..idx]);
        match values.next() {
            Some(value) => {
                let json = js_value_to_json(value, ctx)
                    .map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;
                out.push_str(&console::stringify(&json));
            }
            None => out.push_str("{}"),
        }
        rest = &rest[idx + 2..];
    }
    out.push_str(rest);
    Ok(JsValue::new(JsString::from(out.as_str())))
}

fn throw_error(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let message = match args.first() {
        Some(value) => value.to_string(ctx)?.to_std_string_escaped(),
        None => "error thrown by script".to_string(),
    };
    Err(JsNativeError::error().with_message(message).into())
}

#[derive(Trace, Finalize)]
struct ConsoleBinding {
    #[unsafe_ignore_trace]
    console: Arc<dyn Console>,
    #[unsafe_ignore_trace]
    level: ConsoleLevel,
}

fn console_call(_this: &JsValue, args: &[JsValue], binding: &ConsoleBinding, ctx: &mut Context) -> JsResult<JsValue> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(js_value_to_json(arg, ctx).unwrap_or_else(|e| JsonValue::String(e.to_string())));
    }
    binding.console.write(binding.level, &values);
    Ok(JsValue::undefined())
}

/// A `console` object whose methods write to `console`.
pub(crate) fn console_object(console: Arc<dyn Console>, ctx: &mut Context) -> Result<JsObject> {
    let object = JsObject::with_object_proto(ctx.intrinsics());
    for level in ConsoleLevel::ALL {
        let binding = ConsoleBinding {
            console: console.clone(),
            level,
        };
        let function = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(console_call, binding),
        )
        .build();
        object
            .set(JsString::from(level.as_str()), function, false, ctx)
            .map_err(install_error)?;
    }
    Ok(object)
}

#[derive(Trace, Finalize)]
struct RequireScope {
    #[unsafe_ignore_trace]
    loader: Rc<Loader>,
    /// Directory of the requiring module
    #[unsafe_ignore_trace]
    directory: String,
}

fn require(_this: &JsValue, args: &[JsValue], scope: &RequireScope, ctx: &mut Context) -> JsResult<JsValue> {
    let specifier = match args.first() {
        Some(value) if value.is_string() => value.to_string(ctx)?.to_std_string_escaped(),
        _ => {
            return Err(JsNativeError::typ()
                .with_message("require expects a module path string")
                .into())
        }
    };

    let module = Loader::require(&scope.loader, &scope.directory, &specifier, ctx)
        .map_err(|e| JsNativeError::error().with_message(e.to_string()))?;
    module.get(js_string!("exports"), ctx)
}

/// A `require` function resolving relative specifiers against `directory`.
pub(crate) fn require_function(loader: Rc<Loader>, directory: String, ctx: &mut Context) -> JsValue {
    FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(require, RequireScope { loader, directory }),
    )
    .build()
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_string(ctx: &mut Context, code: &str) -> String {
        ctx.eval(Source::from_bytes(code))
            .unwrap()
            .to_string(ctx)
            .unwrap()
            .to_std_string_escaped()
    }

    #[test]
    fn test_utils_format() {
        let mut ctx = Context::default();
        install_globals(&mut ctx, &GlobalContext::new()).unwrap();
        assert_eq!(
            eval_string(&mut ctx, "utils.format('{} of {} ({})', 1, 'two', { a: 1 })"),
            r#"1 of two ({"a":1})"#
        );
        assert_eq!(eval_string(&mut ctx, "utils.format('{} {}', 'x')"), "x {}");
    }

    #[test]
    fn test_utils_throw_error_is_catchable() {
        let mut ctx = Context::default();
        install_globals(&mut ctx, &GlobalContext::new()).unwrap();
        let message = eval_string(
            &mut ctx,
            "(function () { try { utils.throwError('nope'); } catch (e) { return e.message; } })()",
        );
        assert_eq!(message, "nope");
    }

    #[test]
    fn test_configured_globals_are_visible() {
        let mut ctx = Context::default();
        let globals = GlobalContext::new().with_value("settings", serde_json::json!({"region": "eu"}));
        install_globals(&mut ctx, &globals).unwrap();
        assert_eq!(eval_string(&mut ctx, "settings.region"), "eu");
    }

    #[test]
    fn test_exchange_factory_is_not_enumerable() {
        let mut ctx = Context::default();
        install_globals(&mut ctx, &GlobalContext::new()).unwrap();
        assert_eq!(
            eval_string(&mut ctx, "Object.keys(globalThis).indexOf('__jsvaultExchange')"),
            "-1"
        );
        assert_eq!(
            eval_string(&mut ctx, "__jsvaultExchange({}).response.json({ ok: true }).body"),
            r#"{"ok":true}"#
        );
    }
}
