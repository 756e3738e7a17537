//! Fallible field extraction from decoded msgpack values.
//!
//! Bodies and headers are msgpack maps keyed by small integers. Every accessor
//! here returns a named [`ProtocolError`] on a shape mismatch instead of
//! assuming the server sent what it should have.

use crate::error::ProtocolError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rmpv::Value;
use std::io::{Cursor, Write};
use uuid::Uuid;

/// A decoded msgpack map with integer keys.
pub type Map = Vec<(Value, Value)>;

/// msgpack extension type carrying a binary UUID.
const MP_UUID: i8 = 2;

/// Decodes a body that must be a map. An empty buffer is an empty map.
pub fn decode_map(buf: &[u8]) -> Result<Map, ProtocolError> {
    if buf.is_empty() {
        return Ok(Map::new());
    }
    let mut cursor = Cursor::new(buf);
    match rmpv::decode::read_value(&mut cursor)? {
        Value::Map(map) => Ok(map),
        _ => Err(ProtocolError::MalformedBody("body is not a map")),
    }
}

/// Encodes a value into `wr`.
pub fn encode_value<W: Write>(wr: &mut W, value: &Value) -> Result<(), ProtocolError> {
    rmpv::encode::write_value(wr, value)?;
    Ok(())
}

/// Builds an integer-keyed map value.
pub fn map_value(entries: Vec<(u64, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

/// Returns the value stored under `key`, if any.
pub fn get(map: &[(Value, Value)], key: u64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| k.as_u64() == Some(key))
        .map(|(_, v)| v)
}

fn require(map: &[(Value, Value)], key: u64) -> Result<&Value, ProtocolError> {
    get(map, key).ok_or(ProtocolError::MissingField(key))
}

pub fn opt_u64(map: &[(Value, Value)], key: u64) -> Result<Option<u64>, ProtocolError> {
    get(map, key)
        .map(|v| v.as_u64().ok_or(ProtocolError::ExpectedNumber(key)))
        .transpose()
}

pub fn get_u64(map: &[(Value, Value)], key: u64) -> Result<u64, ProtocolError> {
    require(map, key)?
        .as_u64()
        .ok_or(ProtocolError::ExpectedNumber(key))
}

pub fn get_u32(map: &[(Value, Value)], key: u64) -> Result<u32, ProtocolError> {
    u32::try_from(get_u64(map, key)?).map_err(|_| ProtocolError::ExpectedNumber(key))
}

pub fn opt_u32(map: &[(Value, Value)], key: u64) -> Result<Option<u32>, ProtocolError> {
    opt_u64(map, key)?
        .map(|v| u32::try_from(v).map_err(|_| ProtocolError::ExpectedNumber(key)))
        .transpose()
}

pub fn opt_f64(map: &[(Value, Value)], key: u64) -> Result<Option<f64>, ProtocolError> {
    get(map, key)
        .map(|v| match v {
            Value::F64(f) => Ok(*f),
            Value::F32(f) => Ok(f64::from(*f)),
            other => other
                .as_u64()
                .map(|n| n as f64)
                .ok_or(ProtocolError::ExpectedNumber(key)),
        })
        .transpose()
}

pub fn get_str(map: &[(Value, Value)], key: u64) -> Result<&str, ProtocolError> {
    require(map, key)?
        .as_str()
        .ok_or(ProtocolError::ExpectedString(key))
}

pub fn opt_str(map: &[(Value, Value)], key: u64) -> Result<Option<&str>, ProtocolError> {
    get(map, key)
        .map(|v| v.as_str().ok_or(ProtocolError::ExpectedString(key)))
        .transpose()
}

pub fn opt_bool(map: &[(Value, Value)], key: u64) -> Result<Option<bool>, ProtocolError> {
    get(map, key)
        .map(|v| v.as_bool().ok_or(ProtocolError::ExpectedBool(key)))
        .transpose()
}

pub fn get_array(map: &[(Value, Value)], key: u64) -> Result<&[Value], ProtocolError> {
    require(map, key)?
        .as_array()
        .map(Vec::as_slice)
        .ok_or(ProtocolError::ExpectedArray(key))
}

/// Like [`get_array`], but a missing key is an empty array.
pub fn array_or_empty(map: &[(Value, Value)], key: u64) -> Result<&[Value], ProtocolError> {
    match get(map, key) {
        Some(v) => v
            .as_array()
            .map(Vec::as_slice)
            .ok_or(ProtocolError::ExpectedArray(key)),
        None => Ok(&[]),
    }
}

pub fn opt_map(map: &[(Value, Value)], key: u64) -> Result<Option<&Map>, ProtocolError> {
    get(map, key)
        .map(|v| v.as_map().ok_or(ProtocolError::ExpectedMap(key)))
        .transpose()
}

/// Interprets `value` as a UUID: either its canonical string form or the
/// msgpack UUID extension.
pub fn value_to_uuid(value: &Value, key: u64) -> Result<Uuid, ProtocolError> {
    match value {
        Value::String(s) => s
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(ProtocolError::ExpectedUuid(key)),
        Value::Ext(MP_UUID, bytes) => {
            Uuid::from_slice(bytes).map_err(|_| ProtocolError::ExpectedUuid(key))
        }
        _ => Err(ProtocolError::ExpectedUuid(key)),
    }
}

pub fn get_uuid(map: &[(Value, Value)], key: u64) -> Result<Uuid, ProtocolError> {
    value_to_uuid(require(map, key)?, key)
}

pub fn opt_uuid(map: &[(Value, Value)], key: u64) -> Result<Option<Uuid>, ProtocolError> {
    get(map, key).map(|v| value_to_uuid(v, key)).transpose()
}

/// Encodes a UUID the way the server expects it in request bodies.
pub fn uuid_value(uuid: &Uuid) -> Value {
    Value::from(uuid.hyphenated().to_string())
}

/// Reads tuple field `idx` as a string.
pub fn field_str(tuple: &[Value], idx: usize) -> Result<&str, ProtocolError> {
    tuple
        .get(idx)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::ExpectedString(idx as u64))
}

/// Reads tuple field `idx` as an unsigned integer.
pub fn field_u64(tuple: &[Value], idx: usize) -> Result<u64, ProtocolError> {
    tuple
        .get(idx)
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::ExpectedNumber(idx as u64))
}

/// Reads tuple field `idx` as a UUID.
pub fn field_uuid(tuple: &[Value], idx: usize) -> Result<Uuid, ProtocolError> {
    let value = tuple
        .get(idx)
        .ok_or(ProtocolError::ExpectedUuid(idx as u64))?;
    value_to_uuid(value, idx as u64)
}

/// Renders a msgpack value as JSON for display.
///
/// Map keys become strings, binary becomes base64, UUID extensions become
/// their hyphenated form and non-finite floats become `null`.
pub fn to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
            (Some(u), _) => Json::from(u),
            (None, Some(n)) => Json::from(n),
            _ => Json::Null,
        },
        Value::F32(f) => float_json(f64::from(*f)),
        Value::F64(f) => float_json(*f),
        Value::String(s) => match s.as_str() {
            Some(text) => Json::String(text.to_string()),
            None => Json::String(STANDARD.encode(s.as_bytes())),
        },
        Value::Binary(bytes) => Json::String(STANDARD.encode(bytes)),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (key_string(k), to_json(v)))
                .collect(),
        ),
        Value::Ext(MP_UUID, bytes) => match Uuid::from_slice(bytes) {
            Ok(uuid) => Json::String(uuid.to_string()),
            Err(_) => ext_json(MP_UUID, bytes),
        },
        Value::Ext(kind, bytes) => ext_json(*kind, bytes),
    }
}

fn float_json(f: f64) -> serde_json::Value {
    serde_json::Number::from_f64(f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

fn ext_json(kind: i8, bytes: &[u8]) -> serde_json::Value {
    serde_json::json!({ "ext": kind, "data": STANDARD.encode(bytes) })
}

fn key_string(key: &Value) -> String {
    match key.as_str() {
        Some(s) => s.to_string(),
        None => key.to_string(),
    }
}
