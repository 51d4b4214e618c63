//! Conversion between JSON and wire values.
//!
//! JSON has fewer types than the wire format, so the mapping is lossy in one
//! direction:
//!
//! - integers that fit 32 bits become `Int`, larger ones `Long`
//! - objects with a `"@type"` key become records of that type
//! - maps whose keys are not all strings become arrays of `[key, value]`
//!   pairs
//! - bytes become arrays of numbers, chars one-character strings

use serde_json::{Map, Number};
use tagrpc_common::{PojoValue, Value};

/// Object key naming the record type of a JSON object.
pub const TYPE_KEY: &str = "@type";

pub fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => number_to_value(&n),
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(mut fields) => match fields.remove(TYPE_KEY) {
            Some(serde_json::Value::String(type_name)) => {
                let pojo = fields
                    .into_iter()
                    .fold(PojoValue::new(type_name), |pojo, (k, v)| pojo.with(k, json_to_value(v)));
                Value::Pojo(pojo)
            }
            other => {
                if let Some(type_value) = other {
                    fields.insert(TYPE_KEY.to_string(), type_value);
                }
                Value::Map(
                    fields
                        .into_iter()
                        .map(|(k, v)| (Value::String(k), json_to_value(v)))
                        .collect(),
                )
            }
        },
    }
}

fn number_to_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        match i32::try_from(i) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::Long(i),
        }
    } else {
        Value::Double(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn float_to_json(f: f64) -> serde_json::Value {
    Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

fn bytes_to_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::Value::Array(bytes.iter().map(|&b| serde_json::Value::from(b)).collect())
}

fn seq_to_json(items: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(items.iter().map(value_to_json).collect())
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Byte(n) => serde_json::Value::from(*n),
        Value::Short(n) => serde_json::Value::from(*n),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Long(n) => serde_json::Value::from(*n),
        Value::Float(f) => float_to_json(f64::from(*f)),
        Value::Double(f) => float_to_json(*f),
        Value::Char(c) => serde_json::Value::String(c.to_string()),
        Value::String(s) | Value::Class(s) | Value::TypeRef(s) => serde_json::Value::String(s.clone()),
        Value::Array { items, .. } | Value::List(items) | Value::Set(items) => seq_to_json(items),
        Value::Map(entries) => {
            if entries.iter().all(|(k, _)| matches!(k, Value::String(_))) {
                let object: Map<String, serde_json::Value> = entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), value_to_json(v)))
                    .collect();
                serde_json::Value::Object(object)
            } else {
                serde_json::Value::Array(
                    entries
                        .iter()
                        .map(|(k, v)| serde_json::Value::Array(vec![value_to_json(k), value_to_json(v)]))
                        .collect(),
                )
            }
        }
        Value::Entry(k, v) => serde_json::json!({ "key": value_to_json(k), "value": value_to_json(v) }),
        Value::Enum(e) => serde_json::Value::String(e.variant.clone()),
        Value::Pojo(pojo) => {
            let mut object = Map::new();
            object.insert(TYPE_KEY.to_string(), serde_json::Value::String(pojo.type_name().to_string()));
            for (name, field) in pojo.fields() {
                object.insert(name.clone(), value_to_json(field));
            }
            serde_json::Value::Object(object)
        }
        Value::Bytes(bytes) | Value::Serialized(bytes) => bytes_to_json(bytes),
    }
}

/// Parses the argument list of a call. A JSON array supplies one argument
/// per element; any other JSON value is a single argument.
pub fn parse_args(text: &str) -> serde_json::Result<Vec<Value>> {
    Ok(match serde_json::from_str(text)? {
        serde_json::Value::Array(items) => items.into_iter().map(json_to_value).collect(),
        single => vec![json_to_value(single)],
    })
}
