//! Conversion between JSON envelope values and [`CacheValue`].
//!
//! JSON has no byte-array type, so raw bytes travel as a single-member
//! object `{"$binary": "<base64>"}`.

use crate::domain::CacheValue;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Map, Number, Value};
use shared::{Error, Result};

pub const BINARY_TAG: &str = "$binary";

pub fn decode_value(value: &Value) -> Result<CacheValue> {
    match value {
        Value::Bool(b) => Ok(CacheValue::Bool(*b)),
        Value::String(s) => Ok(CacheValue::Text(s.clone())),
        Value::Number(n) => decode_number(n),
        Value::Object(map) => decode_binary(map),
        Value::Array(_) => Err(Error::UnsupportedValueType("array".to_string())),
        Value::Null => Err(Error::UnsupportedValueType("null".to_string())),
    }
}

pub fn encode_value(value: &CacheValue) -> Result<Value> {
    let encoded = match value {
        CacheValue::Bool(b) => Value::Bool(*b),
        CacheValue::Int(i) => Value::Number((*i).into()),
        CacheValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| Error::UnsupportedValueType(format!("non-finite float {f}")))?,
        CacheValue::Text(s) => Value::String(s.clone()),
        CacheValue::Bytes(bytes) => {
            let mut tagged = Map::new();
            tagged.insert(BINARY_TAG.to_string(), Value::String(STANDARD.encode(bytes)));
            Value::Object(tagged)
        }
    };
    Ok(encoded)
}

fn decode_number(n: &Number) -> Result<CacheValue> {
    if let Some(i) = n.as_i64() {
        return Ok(CacheValue::Int(i));
    }
    if n.is_u64() {
        return Err(Error::UnsupportedValueType(format!(
            "integer {n} exceeds 64-bit signed range"
        )));
    }
    n.as_f64()
        .map(CacheValue::Float)
        .ok_or_else(|| Error::UnsupportedValueType(format!("number {n}")))
}

fn decode_binary(map: &Map<String, Value>) -> Result<CacheValue> {
    match (map.len(), map.get(BINARY_TAG)) {
        (1, Some(Value::String(encoded))) => STANDARD
            .decode(encoded)
            .map(CacheValue::Bytes)
            .map_err(|e| Error::UnsupportedValueType(format!("invalid base64 payload: {e}"))),
        _ => Err(Error::UnsupportedValueType("object".to_string())),
    }
}
