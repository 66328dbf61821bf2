// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! yaml codec, bridged through [`serde_yaml::Value`].
//!
//! Kinds with no native YAML representation use local tags: `!date`
//! (epoch seconds), `!binary` (base64), `!fd` (descriptor number),
//! `!error` (dictionary form).

use crate::error::{Error, Result};
use crate::object::{ErrorObject, Kind, Object};
use crate::serializer::Serializer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};
use std::ops::ControlFlow;

/// The `yaml` codec.
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn serialize(&self, obj: &Object) -> Result<Vec<u8>> {
        let value = to_value(obj)?;
        let text = serde_yaml::to_string(&value)
            .map_err(|e| Error::Invalid(format!("yaml encode: {}", e)))?;
        Ok(text.into_bytes())
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Object> {
        let value: Value = serde_yaml::from_slice(buf)
            .map_err(|e| Error::Invalid(format!("yaml decode: {}", e)))?;
        Ok(from_value(&value))
    }
}

fn tagged(tag: &str, value: Value) -> Value {
    Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new(tag),
        value,
    }))
}

fn to_value(obj: &Object) -> Result<Value> {
    let value = match obj.kind() {
        Kind::Null => Value::Null,
        Kind::Bool => Value::from(obj.as_bool().unwrap_or_default()),
        Kind::Uint64 => Value::from(obj.as_u64().unwrap_or_default()),
        Kind::Int64 => Value::from(obj.as_i64().unwrap_or_default()),
        Kind::Double => Value::from(obj.as_f64().unwrap_or_default()),
        Kind::String => Value::from(obj.as_str().unwrap_or_default()),
        Kind::Date => tagged("date", Value::from(obj.as_date().unwrap_or_default())),
        Kind::Binary => tagged(
            "binary",
            Value::from(BASE64.encode(obj.as_bytes().unwrap_or_default())),
        ),
        Kind::Fd => tagged("fd", Value::from(i64::from(obj.as_fd().unwrap_or(-1)))),
        Kind::Error => {
            let dict = obj
                .as_error()
                .map(ErrorObject::to_dictionary)
                .unwrap_or_else(Object::dictionary);
            tagged("error", to_value(&dict)?)
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
            Value::Sequence(items)
        }
        Kind::Dictionary => {
            let mut mapping = Mapping::new();
            let mut failed = None;
            obj.dict_apply(|key, item| match to_value(item) {
                Ok(v) => {
                    mapping.insert(Value::from(key), v);
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
            Value::Mapping(mapping)
        }
    };
    Ok(value)
}

pub(crate) fn from_value(value: &Value) -> Object {
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
        Value::Sequence(items) => Object::array_from(items.iter().map(from_value)),
        Value::Mapping(mapping) => {
            let dict = Object::dictionary();
            for (key, item) in mapping {
                match key.as_str() {
                    Some(key) => {
                        dict.dict_set(key, from_value(item));
                    }
                    None => log::warn!("yaml: dropping non-string mapping key"),
                }
            }
            dict
        }
        Value::Tagged(t) => from_tagged(t),
    }
}

fn from_tagged(t: &TaggedValue) -> Object {
    if t.tag == "date" {
        return t
            .value
            .as_i64()
            .map(Object::date)
            .unwrap_or_else(Object::null);
    }
    if t.tag == "binary" {
        return t
            .value
            .as_str()
            .and_then(|s| BASE64.decode(s).ok())
            .map(Object::binary)
            .unwrap_or_else(Object::null);
    }
    if t.tag == "fd" {
        let fd = t.value.as_i64().unwrap_or(-1) as i32;
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            log::warn!("yaml: fd {} not duplicable", fd);
            return Object::null();
        }
        return Object::fd(dup);
    }
    if t.tag == "error" {
        let dict = from_value(&t.value);
        if dict.kind() == Kind::Dictionary {
            return Object::error(ErrorObject::from_dictionary(&dict));
        }
    }
    log::warn!("yaml: unknown tag {}", t.tag);
    Object::null()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_carries_local_tag() {
        let codec = YamlSerializer;
        let buf = codec.serialize(&Object::date(1234)).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.contains("!date"), "got: {}", text);
        assert_eq!(codec.deserialize(&buf).unwrap().as_date(), Some(1234));
    }

    #[test]
    fn binary_is_base64() {
        let codec = YamlSerializer;
        let buf = codec.serialize(&Object::binary(vec![1, 2, 3])).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.contains("!binary"), "got: {}", text);
        let back = codec.deserialize(&buf).unwrap();
        assert_eq!(back.as_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn unknown_tag_decodes_to_null() {
        let codec = YamlSerializer;
        let back = codec.deserialize(b"!mystery 17\n").unwrap();
        assert!(back.is_null());
    }

    #[test]
    fn error_roundtrip() {
        let codec = YamlSerializer;
        let err = ErrorObject::new(libc::ERANGE, "too big");
        let buf = codec.serialize(&Object::error(err.clone())).unwrap();
        let back = codec.deserialize(&buf).unwrap();
        assert_eq!(back.as_error(), Some(&err));
    }
}
