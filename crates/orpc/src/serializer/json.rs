// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! json codec, bridged through [`serde_json::Value`].
//!
//! JSON has no tags, so kinds outside its model ride in single-key
//! sentinel dictionaries: `{"$date": secs}`, `{"$binary": "<base64>"}`,
//! `{"$fd": n}`, `{"$error": {...}}`.

use crate::error::{Error, Result};
use crate::object::{ErrorObject, Kind, Object};
use crate::serializer::Serializer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use std::ops::ControlFlow;

/// The `json` codec.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, obj: &Object) -> Result<Vec<u8>> {
        let value = to_value(obj)?;
        serde_json::to_vec(&value).map_err(|e| Error::Invalid(format!("json encode: {}", e)))
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Object> {
        let value: Value = serde_json::from_slice(buf)
            .map_err(|e| Error::Invalid(format!("json decode: {}", e)))?;
        Ok(from_value(&value))
    }
}

fn to_value(obj: &Object) -> Result<Value> {
    let value = match obj.kind() {
        Kind::Null => Value::Null,
        Kind::Bool => json!(obj.as_bool().unwrap_or_default()),
        Kind::Uint64 => json!(obj.as_u64().unwrap_or_default()),
        Kind::Int64 => json!(obj.as_i64().unwrap_or_default()),
        Kind::Double => json!(obj.as_f64().unwrap_or_default()),
        Kind::String => json!(obj.as_str().unwrap_or_default()),
        Kind::Date => json!({ "$date": obj.as_date().unwrap_or_default() }),
        Kind::Binary => {
            json!({ "$binary": BASE64.encode(obj.as_bytes().unwrap_or_default()) })
        }
        Kind::Fd => json!({ "$fd": obj.as_fd().unwrap_or(-1) }),
        Kind::Error => {
            let dict = obj
                .as_error()
                .map(ErrorObject::to_dictionary)
                .unwrap_or_else(Object::dictionary);
            json!({ "$error": to_value(&dict)? })
        }
        Kind::Array => {
            let mut items = Vec::with_capacity(obj.len());
            let mut failed = None;
            obj.apply(|_, item| match to_value(item) {
                Ok(v) => {
                    items.push(v);
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    failed = Some(e);
                    ControlFlow::Break(())
                }
            });
            if let Some(e) = failed {
                return Err(e);
            }
            Value::Array(items)
        }
        Kind::Dictionary => {
            let mut entries = Map::new();
            let mut failed = None;
            obj.dict_apply(|key, item| match to_value(item) {
                Ok(v) => {
                    entries.insert(key.to_string(), v);
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    failed = Some(e);
                    ControlFlow::Break(())
                }
            });
            if let Some(e) = failed {
                return Err(e);
            }
            Value::Object(entries)
        }
    };
    Ok(value)
}

fn from_value(value: &Value) -> Object {
    match value {
        Value::Null => Object::null(),
        Value::Bool(v) => Object::boolean(*v),
        // Signedness is canonicalized on decode: non-negative integers
        // come back as uint64.
        Value::Number(n) => n
            .as_u64()
            .map(Object::uint64)
            .or_else(|| n.as_i64().map(Object::int64))
            .or_else(|| n.as_f64().map(Object::double))
            .unwrap_or_else(Object::null),
        Value::String(s) => Object::string(s.as_str()),
        Value::Array(items) => Object::array_from(items.iter().map(from_value)),
        Value::Object(entries) => from_map(entries),
    }
}

fn from_map(entries: &Map<String, Value>) -> Object {
    if entries.len() == 1 {
        if let Some(sentinel) = from_sentinel(entries) {
            return sentinel;
        }
    }
    let dict = Object::dictionary();
    for (key, item) in entries {
        dict.dict_set(key.as_str(), from_value(item));
    }
    dict
}

fn from_sentinel(entries: &Map<String, Value>) -> Option<Object> {
    if let Some(secs) = entries.get("$date") {
        return Some(secs.as_i64().map(Object::date).unwrap_or_else(Object::null));
    }
    if let Some(data) = entries.get("$binary") {
        return Some(
            data.as_str()
                .and_then(|s| BASE64.decode(s).ok())
                .map(Object::binary)
                .unwrap_or_else(Object::null),
        );
    }
    if let Some(fd) = entries.get("$fd") {
        let fd = fd.as_i64().unwrap_or(-1) as i32;
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            log::warn!("json: fd {} not duplicable", fd);
            return Some(Object::null());
        }
        return Some(Object::fd(dup));
    }
    if let Some(inner) = entries.get("$error") {
        let dict = from_value(inner);
        if dict.kind() == Kind::Dictionary {
            return Some(Object::error(ErrorObject::from_dictionary(&dict)));
        }
        return Some(Object::null());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_sentinel() {
        let codec = JsonSerializer;
        let buf = codec.serialize(&Object::date(77)).unwrap();
        assert_eq!(buf, br#"{"$date":77}"#);
        assert_eq!(codec.deserialize(&buf).unwrap().as_date(), Some(77));
    }

    #[test]
    fn plain_dictionary_with_dollar_free_keys() {
        let codec = JsonSerializer;
        let dict = Object::dictionary();
        dict.dict_set("date", Object::from("not a sentinel"));
        let back = codec.deserialize(&codec.serialize(&dict).unwrap()).unwrap();
        assert_eq!(back, dict);
    }

    #[test]
    fn integer_signedness_canonicalized() {
        let codec = JsonSerializer;
        let back = codec.deserialize(b"[5, -5]").unwrap();
        assert_eq!(back.get(0).unwrap().as_u64(), Some(5));
        assert_eq!(back.get(1).unwrap().as_i64(), Some(-5));
    }

    #[test]
    fn error_sentinel_roundtrip() {
        let codec = JsonSerializer;
        let err = ErrorObject::new(libc::ETIMEDOUT, "slow");
        let buf = codec.serialize(&Object::error(err.clone())).unwrap();
        let back = codec.deserialize(&buf).unwrap();
        assert_eq!(back.as_error(), Some(&err));
    }
}
