// src/sandbox/convert.rs — Conversions between messages, script values and host values
//
// Messages cross the boundary as JSON and become plugin-owned Rhai maps.
// Host objects stay host objects: they reach scripts as `HostObject` handles
// and are only copied when a script asks for a snapshot.

use rhai::{Array, Dynamic, Map};

use crate::infra::errors::HostError;
use crate::sandbox::object::{ObjectRef, PlainObject, Property, Value};

/// Object graphs deeper than this serialize as null.
const MAX_JSON_DEPTH: usize = 64;

/// Longest array-like a host function will materialize.
pub const MAX_ARRAY_LENGTH: usize = 10_000;

/// Largest `length` an array can report (2^32 - 1).
const MAX_LENGTH_VALUE: f64 = 4_294_967_295.0;

/// Prototypes given to objects created on behalf of plugin code.
#[derive(Clone)]
pub struct Prototypes {
    pub object: ObjectRef,
    pub array: ObjectRef,
}

impl Prototypes {
    pub fn new_object(&self) -> ObjectRef {
        ObjectRef::new(PlainObject::new("Object", Some(self.object.clone())))
    }

    pub fn new_array(&self, items: Vec<Value>) -> ObjectRef {
        let array = PlainObject::new("Array", Some(self.array.clone()));
        let len = items.len() as i64;
        for (i, item) in items.into_iter().enumerate() {
            array.insert(&i.to_string(), Property::data(item));
        }
        array.insert(
            "length",
            Property {
                value: Value::Int(len),
                writable: true,
                enumerable: false,
                configurable: false,
            },
        );
        ObjectRef::new(array)
    }
}

pub fn is_array(obj: &ObjectRef) -> bool {
    obj.class_name() == "Array"
}

/// `length` of an array-like, clamped to `0..=2^32-1`.
pub fn array_length(obj: &ObjectRef) -> u64 {
    let len = obj.get("length").to_number();
    if len.is_nan() || len <= 0.0 {
        0
    } else {
        len.trunc().min(MAX_LENGTH_VALUE) as u64
    }
}

/// Elements `0..length` of an array-like object.
///
/// `length` is plugin-writable, so anything past `MAX_ARRAY_LENGTH` is a
/// RangeError instead of an allocation.
pub fn array_items(obj: &ObjectRef) -> Result<Vec<Value>, HostError> {
    let len = array_length(obj);
    if len > MAX_ARRAY_LENGTH as u64 {
        return Err(HostError::Range(format!(
            "array length {len} exceeds the limit of {MAX_ARRAY_LENGTH}"
        )));
    }
    Ok((0..len).map(|i| obj.get(&i.to_string())).collect())
}

// ---------------------------------------------------------------------------
// JSON <-> Dynamic (messages)
// ---------------------------------------------------------------------------

/// Convert a serde_json::Value to a Rhai Dynamic.
pub fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(arr) => {
            let rhai_arr: Array = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(rhai_arr)
        }
        serde_json::Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.clone().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

/// Convert a Rhai Dynamic back to JSON. Host objects are snapshotted.
pub fn dynamic_to_json(value: &Dynamic) -> Result<serde_json::Value, HostError> {
    let value = value.flatten_clone();
    if value.is_unit() {
        return Ok(serde_json::Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(serde_json::Value::from(i));
    }
    if let Ok(f) = value.as_float() {
        return Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null));
    }
    if let Ok(c) = value.as_char() {
        return Ok(serde_json::Value::String(c.to_string()));
    }
    if value.is_string() {
        return Ok(serde_json::Value::String(value.into_string().unwrap_or_default()));
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        let items = arr.iter().map(dynamic_to_json).collect::<Result<_, _>>()?;
        return Ok(serde_json::Value::Array(items));
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in map.iter() {
            obj.insert(k.to_string(), dynamic_to_json(v)?);
        }
        return Ok(serde_json::Value::Object(obj));
    }
    if let Some(obj) = value.clone().try_cast::<ObjectRef>() {
        return value_to_json(&Value::Object(obj));
    }
    tracing::debug!("Dropping non-serializable script value of type {}", value.type_name());
    Ok(serde_json::Value::Null)
}

// ---------------------------------------------------------------------------
// Value <-> Dynamic (host values seen by scripts)
// ---------------------------------------------------------------------------

pub fn value_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Int(i) => Dynamic::from(i),
        Value::Float(f) => Dynamic::from(f),
        Value::Str(s) => Dynamic::from(s),
        Value::Object(o) => Dynamic::from(o),
    }
}

/// Script values handed to the host. Maps and arrays become fresh,
/// plugin-owned host objects.
pub fn dynamic_to_value(value: Dynamic, protos: &Prototypes) -> Value {
    let value = value.flatten();
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::Int(i);
    }
    if let Ok(f) = value.as_float() {
        return Value::Float(f);
    }
    if let Ok(c) = value.as_char() {
        return Value::Str(c.to_string());
    }
    if value.is_string() {
        return Value::Str(value.into_string().unwrap_or_default());
    }
    if value.is::<ObjectRef>() {
        return value.try_cast::<ObjectRef>().map(Value::Object).unwrap_or_default();
    }
    if value.is::<Array>() {
        let items = value
            .try_cast::<Array>()
            .unwrap_or_default()
            .into_iter()
            .map(|item| dynamic_to_value(item, protos))
            .collect();
        return Value::Object(protos.new_array(items));
    }
    if value.is::<Map>() {
        let obj = protos.new_object();
        for (k, v) in value.try_cast::<Map>().unwrap_or_default() {
            obj.set(k.as_str(), dynamic_to_value(v, protos));
        }
        return Value::Object(obj);
    }
    Value::Null
}

// ---------------------------------------------------------------------------
// Value <-> JSON (JSON built-in, snapshots)
// ---------------------------------------------------------------------------

pub fn value_to_json(value: &Value) -> Result<serde_json::Value, HostError> {
    value_to_json_at(value, 0)
}

fn value_to_json_at(value: &Value, depth: usize) -> Result<serde_json::Value, HostError> {
    if depth > MAX_JSON_DEPTH {
        return Ok(serde_json::Value::Null);
    }
    let json = match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Object(o) if o.is_callable() => serde_json::Value::Null,
        Value::Object(o) if is_array(o) => serde_json::Value::Array(
            array_items(o)?
                .iter()
                .map(|item| value_to_json_at(item, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(o) => {
            let mut map = serde_json::Map::new();
            for key in o.own_keys() {
                if let Some(prop) = o.get_own_property(&key) {
                    if prop.enumerable {
                        map.insert(key, value_to_json_at(&prop.value, depth + 1)?);
                    }
                }
            }
            serde_json::Value::Object(map)
        }
    };
    Ok(json)
}

pub fn json_to_value(value: &serde_json::Value, protos: &Prototypes) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Object(
            protos.new_array(items.iter().map(|v| json_to_value(v, protos)).collect()),
        ),
        serde_json::Value::Object(map) => {
            let obj = protos.new_object();
            for (k, v) in map {
                obj.set(k, json_to_value(v, protos));
            }
            Value::Object(obj)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
