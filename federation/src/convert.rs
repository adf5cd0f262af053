//! JSON ↔ runtime-value mapping used by the gateway and the peer overlay.

use std::collections::HashMap;

use runtime::registry::StructRegistry;
use runtime::value::{StructValue, Value};

/// Key that marks a JSON object as a struct instance.
pub const TYPE_HINT: &str = "_type";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConvertError {
    #[error("cannot convert {0} to JSON-RPC parameters")]
    BadParams(String),

    #[error("struct {name} is missing field {field}")]
    MissingField { name: String, field: String },

    #[error("struct {name} has no field {field}")]
    UnknownField { name: String, field: String },
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
        Value::Struct(s) => {
            let mut out = serde_json::Map::with_capacity(s.fields.len() + 1);
            out.insert(
                TYPE_HINT.to_string(),
                serde_json::Value::String(s.type_name.clone()),
            );
            for (field, value) in &s.fields {
                out.insert(field.clone(), value_to_json(value));
            }
            serde_json::Value::Object(out)
        }
        // Functions and servers serialize to opaque tags and are never
        // deserialized.
        Value::Function(_) | Value::Server(_) | Value::ServerState(_) => {
            serde_json::Value::String(value.to_string())
        }
    }
}

pub fn json_to_value(
    json: &serde_json::Value,
    structs: &StructRegistry,
) -> Result<Value, ConvertError> {
    Ok(match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(json_to_value(item, structs)?);
            }
            Value::Array(out)
        }
        serde_json::Value::Object(map) => {
            let hint = map.get(TYPE_HINT).and_then(|v| v.as_str());
            if let Some(def) = hint.and_then(|name| structs.get(name)) {
                let mut fields = HashMap::with_capacity(def.fields.len());
                for (key, value) in map {
                    if key == TYPE_HINT {
                        continue;
                    }
                    if !def.fields.contains(key) {
                        return Err(ConvertError::UnknownField {
                            name: def.name.clone(),
                            field: key.clone(),
                        });
                    }
                    fields.insert(key.clone(), json_to_value(value, structs)?);
                }
                for field in &def.fields {
                    if !fields.contains_key(field) {
                        return Err(ConvertError::MissingField {
                            name: def.name.clone(),
                            field: field.clone(),
                        });
                    }
                }
                Value::Struct(StructValue {
                    type_name: def.name.clone(),
                    fields,
                })
            } else {
                let mut out = HashMap::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), json_to_value(value, structs)?);
                }
                Value::Object(out)
            }
        }
    })
}

pub fn json_args_to_values(
    args: &[serde_json::Value],
    structs: &StructRegistry,
) -> Result<Vec<Value>, ConvertError> {
    args.iter().map(|a| json_to_value(a, structs)).collect()
}

pub fn values_to_json_args(values: &[Value]) -> Vec<serde_json::Value> {
    values.iter().map(value_to_json).collect()
}

/// Maps named parameters to positional ones using the receiver's declared
/// parameter order. Missing names become null.
pub fn named_to_positional(
    params: &[String],
    named: &serde_json::Map<String, serde_json::Value>,
) -> Vec<serde_json::Value> {
    params
        .iter()
        .map(|param| named.get(param).cloned().unwrap_or(serde_json::Value::Null))
        .collect()
}
