//! JSON <-> JavaScript Value Conversions
//!
//! Bidirectional conversion between `serde_json::Value` and Boa's `JsValue`.
//! Everything that crosses the engine boundary (invocation arguments,
//! return values, console arguments, the HTTP exchange) goes through here,
//! so no caller outside `runtime` ever sees an engine value.
//!
//! # Type Mapping
//!
//! | JSON Type | JavaScript Type |
//! |-----------|-----------------|
//! | null | null / undefined |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! # Limitations
//!
//! - Only enumerable string keys are converted, as with `JSON.stringify`;
//!   `Error` objects additionally carry their `name` and `message`
//! - Functions convert to the string `"[Function]"`
//! - An object that contains itself converts the inner reference to
//!   `"[Circular]"`
//! - Nesting deeper than [`MAX_DEPTH`], arrays longer than
//!   [`MAX_ARRAY_LENGTH`] and values past [`MAX_NODES`] are cut off with
//!   the string `"[...]"`

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    value::JsValue,
    Context, JsString,
};
use jsvault_common::protocol::error::{JsVaultError, Result};
use serde_json::Value as JsonValue;

/// Maximum object/array nesting converted to JSON.
pub const MAX_DEPTH: usize = 32;
/// Array elements converted before the rest is cut off.
pub const MAX_ARRAY_LENGTH: usize = 10_000;
/// Values converted for one top-level value. Shared references are
/// converted once per occurrence, so this bounds graphs that fan out.
pub const MAX_NODES: usize = 100_000;

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;
const FUNCTION_PLACEHOLDER: &str = "[Function]";
const CIRCULAR_PLACEHOLDER: &str = "[Circular]";
const TRUNCATED_PLACEHOLDER: &str = "[...]";

fn engine_error(context: &str, e: impl std::fmt::Display) -> JsVaultError {
    JsVaultError::InvalidRequest(format!("{}: {}", context, e))
}

fn placeholder(text: &str) -> JsonValue {
    JsonValue::String(text.to_string())
}

/// Convert serde_json::Value to Boa JsValue.
///
/// # Errors
///
/// Returns `JsVaultError::InvalidRequest` if a number is out of range or
/// property creation fails.
pub fn json_to_js_value(json: &JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                return Ok(JsValue::new(i));
            }
            n.as_f64()
                .map(JsValue::new)
                .ok_or_else(|| JsVaultError::InvalidRequest("Number out of range".into()))
        }
        JsonValue::String(s) => Ok(JsValue::new(JsString::from(s.as_str()))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.iter().enumerate() {
                let js_value = json_to_js_value(v, ctx)?;
                js_array
                    .push(js_value, ctx)
                    .map_err(|e| engine_error(&format!("Failed to push array element {}", i), e))?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(JsString::from(key.as_str()), js_value, ctx)
                    .map_err(|e| engine_error(&format!("Failed to set property '{}'", key), e))?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Convert a list of JSON arguments for a call.
pub fn json_args_to_js(args: &[JsonValue], ctx: &mut Context) -> Result<Vec<JsValue>> {
    args.iter().map(|arg| json_to_js_value(arg, ctx)).collect()
}

/// Convert Boa JsValue to serde_json::Value.
///
/// - `undefined` and `null` → JSON `null`
/// - `Array` → JSON `array`, `Object` → JSON `object` (enumerable string keys)
/// - callables → `"[Function]"`
/// - `Symbol` → JSON `null`
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    JsonWriter::new().write(value, ctx)
}

struct JsonWriter {
    /// Objects on the path from the root to the value being converted
    ancestors: Vec<JsObject>,
    remaining: usize,
}

impl JsonWriter {
    fn new() -> Self {
        Self {
            ancestors: Vec::new(),
            remaining: MAX_NODES,
        }
    }

    fn write(&mut self, value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
        if self.remaining == 0 {
            return Ok(placeholder(TRUNCATED_PLACEHOLDER));
        }
        self.remaining -= 1;

        if value.is_undefined() || value.is_null() {
            return Ok(JsonValue::Null);
        }

        if let Some(b) = value.as_boolean() {
            return Ok(JsonValue::Bool(b));
        }

        if let Some(i) = value.as_i32() {
            return Ok(JsonValue::Number(i.into()));
        }

        if let Some(n) = value.as_number() {
            if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
                return Ok(JsonValue::Number((n as i64).into()));
            }
            // NaN and the infinities have no JSON form
            return Ok(serde_json::Number::from_f64(n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null));
        }

        if let Some(s) = value.as_string() {
            return Ok(JsonValue::String(s.to_std_string_escaped()));
        }

        if value.is_object() {
            let obj = value
                .as_object()
                .ok_or_else(|| JsVaultError::InvalidRequest("Value is object but couldn't get object reference".into()))?
                .clone();

            if obj.is_callable() {
                return Ok(placeholder(FUNCTION_PLACEHOLDER));
            }
            if self.ancestors.iter().any(|ancestor| JsObject::equals(ancestor, &obj)) {
                return Ok(placeholder(CIRCULAR_PLACEHOLDER));
            }
            if self.ancestors.len() >= MAX_DEPTH {
                return Ok(placeholder(TRUNCATED_PLACEHOLDER));
            }

            self.ancestors.push(obj.clone());
            let result = if obj.is_array() {
                self.write_array(&obj, ctx)
            } else {
                self.write_object(&obj, value, ctx)
            };
            self.ancestors.pop();
            return result;
        }

        Ok(JsonValue::Null)
    }

    fn write_array(&mut self, obj: &JsObject, ctx: &mut Context) -> Result<JsonValue> {
        let array = JsArray::from_object(obj.clone())
            .map_err(|e| engine_error("Object is not a valid array", e))?;

        let length = array
            .length(ctx)
            .map_err(|e| engine_error("Failed to get array length", e))?;
        let length = usize::try_from(length).unwrap_or(usize::MAX);
        let kept = length.min(MAX_ARRAY_LENGTH);

        let mut result = Vec::with_capacity(kept + 1);
        for i in 0..kept {
            let elem = array
                .get(i, ctx)
                .map_err(|e| engine_error(&format!("Failed to get array element {}", i), e))?;
            result.push(self.write(&elem, ctx)?);
        }
        if kept < length {
            result.push(placeholder(TRUNCATED_PLACEHOLDER));
        }
        Ok(JsonValue::Array(result))
    }

    fn write_object(&mut self, obj: &JsObject, value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
        let mut result = serde_json::Map::new();

        // `name` and `message` are inherited or non-enumerable on errors
        let error_ctor: JsValue = ctx.intrinsics().constructors().error().constructor().into();
        let is_error = value
            .instance_of(&error_ctor, ctx)
            .map_err(|e| engine_error("Failed to inspect object", e))?;
        if is_error {
            for key in ["name", "message"] {
                let prop_value = obj
                    .get(JsString::from(key), ctx)
                    .map_err(|e| engine_error(&format!("Failed to get property '{}'", key), e))?;
                result.insert(key.to_string(), self.write(&prop_value, ctx)?);
            }
        }

        for key in enumerable_keys(obj, ctx)? {
            let prop_value = obj
                .get(JsString::from(key.as_str()), ctx)
                .map_err(|e| engine_error(&format!("Failed to get property '{}'", key), e))?;
            let converted = self.write(&prop_value, ctx)?;
            result.insert(key, converted);
        }

        Ok(JsonValue::Object(result))
    }
}

/// `Object.keys(obj)`: own enumerable string keys in property order.
fn enumerable_keys(obj: &JsObject, ctx: &mut Context) -> Result<Vec<String>> {
    let object_ctor = ctx.intrinsics().constructors().object().constructor();
    let keys_fn = object_ctor
        .get(js_string!("keys"), ctx)
        .map_err(|e| engine_error("Failed to look up Object.keys", e))?;
    let keys_fn = keys_fn
        .as_object()
        .ok_or_else(|| JsVaultError::InvalidRequest("Object.keys is not a function".into()))?
        .clone();
    let keys = keys_fn
        .call(&JsValue::undefined(), &[JsValue::from(obj.clone())], ctx)
        .map_err(|e| engine_error("Failed to get object keys", e))?;
    let keys = keys
        .as_object()
        .ok_or_else(|| JsVaultError::InvalidRequest("Object.keys returned a non-object".into()))?
        .clone();
    let keys = JsArray::from_object(keys).map_err(|e| engine_error("Object.keys returned a non-array", e))?;

    let length = keys
        .length(ctx)
        .map_err(|e| engine_error("Failed to get key count", e))?;
    let length = usize::try_from(length).unwrap_or(0);
    let mut result = Vec::with_capacity(length.min(MAX_NODES));
    for i in 0..length {
        let key = keys
            .get(i, ctx)
            .map_err(|e| engine_error("Failed to read object key", e))?;
        if let Some(key) = key.as_string() {
            result.push(key.to_std_string_escaped());
        }
    }
    Ok(result)
}

/// `None` for `undefined`, the JSON form otherwise.
pub fn js_value_to_optional_json(value: &JsValue, ctx: &mut Context) -> Result<Option<JsonValue>> {
    if value.is_undefined() {
        return Ok(None);
    }
    js_value_to_json(value, ctx).map(Some)
}
