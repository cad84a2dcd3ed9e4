//! Conversion between JSON and packrpc values for the command line.
//!
//! JSON integers become `Int` when they fit in 32 bits and `Long` otherwise;
//! other numbers become `Double`. Objects become maps with string keys.
//! Going the other way, binaries render as `{"binary": "<hex>"}`, timestamps
//! as `{"timestamp": <millis>}`, and non-string map keys use their display
//! form.

use packrpc_codec::Value;
use serde_json::{json, Map, Number};

use crate::exit::{CliError, CliResult, USAGE};

/// Parse call arguments. Anything other than an array, object or `null`
/// cannot be frame content.
pub fn parse_args(input: &str) -> CliResult<Value> {
    let parsed: serde_json::Value = serde_json::from_str(input)
        .map_err(|err| CliError::new(USAGE, format!("--args is not valid JSON: {err}")))?;
    let value = from_json(&parsed)?;
    if !(value.is_container() || value.is_null()) {
        return Err(CliError::new(
            USAGE,
            format!("--args must be a JSON array, object or null, got {}", value.kind()),
        ));
    }
    Ok(value)
}

pub fn from_json(json: &serde_json::Value) -> CliResult<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => from_number(n)?,
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::List(items.iter().map(from_json).collect::<CliResult<_>>()?)
        }
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(key, value)| Ok((Value::String(key.clone()), from_json(value)?)))
                .collect::<CliResult<_>>()?,
        ),
    })
}

fn from_number(n: &Number) -> CliResult<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(match i32::try_from(i) {
            Ok(small) => Value::Int(small),
            Err(_) => Value::Long(i),
        });
    }
    if n.is_u64() {
        return Err(CliError::new(
            USAGE,
            format!("integer {n} does not fit in a signed 64-bit value"),
        ));
    }
    n.as_f64()
        .map(Value::Double)
        .ok_or_else(|| CliError::new(USAGE, format!("unsupported number {n}")))
}

pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Short(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::Long(v) => json!(v),
        Value::Float(v) => float_json(f64::from(*v)),
        Value::Double(v) => float_json(*v),
        Value::Timestamp(ms) => json!({ "timestamp": ms }),
        Value::String(s) => json!(s),
        Value::Binary(bytes) => json!({ "binary": hex::encode(bytes) }),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => {
            let mut object = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                object.insert(key, to_json(value));
            }
            serde_json::Value::Object(object)
        }
    }
}

// NaN and infinities have no JSON form.
fn float_json(v: f64) -> serde_json::Value {
    Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}
