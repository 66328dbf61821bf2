// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! msgpack codec, bridged through [`rmpv::Value`].
//!
//! Kinds with no native msgpack representation ride on extension
//! types:
//!
//! | ext | payload                                   | kind  |
//! |-----|-------------------------------------------|-------|
//! | 1   | seconds since epoch, LE u32               | date  |
//! | 2   | descriptor number, LE u32 (same process)  | fd    |
//! | 4   | nested msgpack document (re-enters codec) | error |
//!
//! Unknown extension tags decode to a null object; the decode itself
//! does not fail, the incident is logged.

use crate::error::{Error, Result};
use crate::object::{ErrorObject, Kind, Object};
use crate::serializer::Serializer;
use rmpv::Value;
use std::ops::ControlFlow;

const EXT_DATE: i8 = 1;
const EXT_FD: i8 = 2;
const EXT_NESTED: i8 = 4;

/// The `msgpack` codec.
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize(&self, obj: &Object) -> Result<Vec<u8>> {
        let value = to_value(obj)?;
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(buf)
    }

    fn deserialize(&self, buf: &[u8]) -> Result<Object> {
        let mut cursor = buf;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| Error::Invalid(format!("msgpack decode: {}", e)))?;
        Ok(from_value(&value))
    }
}

fn to_value(obj: &Object) -> Result<Value> {
    let value = match obj.kind() {
        Kind::Null => Value::Nil,
        Kind::Bool => Value::from(obj.as_bool().unwrap_or_default()),
        Kind::Uint64 => Value::from(obj.as_u64().unwrap_or_default()),
        Kind::Int64 => Value::from(obj.as_i64().unwrap_or_default()),
        Kind::Double => Value::from(obj.as_f64().unwrap_or_default()),
        Kind::String => Value::from(obj.as_str().unwrap_or_default()),
        Kind::Binary => {
            Value::Binary(obj.as_bytes().map(<[u8]>::to_vec).unwrap_or_default())
        }
        Kind::Date => {
            let secs = obj.as_date().unwrap_or_default();
            let secs = u32::try_from(secs)
                .map_err(|_| Error::Invalid(format!("date {} outside u32 range", secs)))?;
            Value::Ext(EXT_DATE, secs.to_le_bytes().to_vec())
        }
        Kind::Fd => {
            let fd = obj.as_fd().unwrap_or(-1);
            let fd = u32::try_from(fd)
                .map_err(|_| Error::Invalid(format!("fd {} not encodable", fd)))?;
            Value::Ext(EXT_FD, fd.to_le_bytes().to_vec())
        }
        Kind::Error => {
            let dict = obj
                .as_error()
                .map(ErrorObject::to_dictionary)
                .unwrap_or_else(Object::dictionary);
            let nested = to_value(&dict)?;
            let mut payload = Vec::new();
            rmpv::encode::write_value(&mut payload, &nested)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            Value::Ext(EXT_NESTED, payload)
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
            let mut entries = Vec::with_capacity(obj.len());
            let mut failed = None;
            obj.dict_apply(|key, item| match to_value(item) {
                Ok(v) => {
                    entries.push((Value::from(key), v));
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
            Value::Map(entries)
        }
    };
    Ok(value)
}

fn from_value(value: &Value) -> Object {
    match value {
        Value::Nil => Object::null(),
        Value::Boolean(v) => Object::boolean(*v),
        // The wire does not carry signedness for in-range values:
        // non-negative integers come back as uint64.
        Value::Integer(i) => i
            .as_u64()
            .map(Object::uint64)
            .or_else(|| i.as_i64().map(Object::int64))
            .unwrap_or_else(Object::null),
        Value::F32(v) => Object::double(f64::from(*v)),
        Value::F64(v) => Object::double(*v),
        Value::String(s) => Object::string(s.as_str().unwrap_or_default()),
        Value::Binary(b) => Object::binary(b.clone()),
        Value::Array(items) => Object::array_from(items.iter().map(from_value)),
        Value::Map(entries) => {
            let dict = Object::dictionary();
            for (key, item) in entries {
                match key.as_str() {
                    Some(key) => {
                        dict.dict_set(key, from_value(item));
                    }
                    None => log::warn!("msgpack: dropping non-string dictionary key"),
                }
            }
            dict
        }
        Value::Ext(tag, payload) => from_ext(*tag, payload),
    }
}

fn from_ext(tag: i8, payload: &[u8]) -> Object {
    match tag {
        EXT_DATE => match payload.try_into() {
            Ok(bytes) => Object::date(i64::from(u32::from_le_bytes(bytes))),
            Err(_) => {
                log::warn!("msgpack: date ext with {} byte payload", payload.len());
                Object::null()
            }
        },
        EXT_FD => match payload.try_into() {
            Ok(bytes) => {
                let fd = u32::from_le_bytes(bytes) as i32;
                // Same-process bridge: take our own reference so both
                // sides own their descriptor independently.
                let dup = unsafe { libc::dup(fd) };
                if dup < 0 {
                    log::warn!("msgpack: fd {} not duplicable", fd);
                    Object::null()
                } else {
                    Object::fd(dup)
                }
            }
            Err(_) => {
                log::warn!("msgpack: fd ext with {} byte payload", payload.len());
                Object::null()
            }
        },
        EXT_NESTED => {
            let mut cursor = payload;
            match rmpv::decode::read_value(&mut cursor) {
                Ok(nested) => {
                    let dict = from_value(&nested);
                    if dict.kind() == Kind::Dictionary {
                        Object::error(ErrorObject::from_dictionary(&dict))
                    } else {
                        log::warn!("msgpack: nested ext did not hold a dictionary");
                        Object::null()
                    }
                }
                Err(e) => {
                    log::warn!("msgpack: nested ext decode failed: {}", e);
                    Object::null()
                }
            }
        }
        other => {
            log::warn!("msgpack: unknown extension tag {}", other);
            Object::null()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_uses_ext_1() {
        let codec = MsgpackSerializer;
        let buf = codec.serialize(&Object::date(86400)).unwrap();
        // fixext4: 0xd6, tag, 4-byte LE payload
        assert_eq!(buf[0], 0xd6);
        assert_eq!(buf[1], EXT_DATE as u8);
        assert_eq!(&buf[2..6], &86400u32.to_le_bytes());
        let back = codec.deserialize(&buf).unwrap();
        assert_eq!(back.as_date(), Some(86400));
    }

    #[test]
    fn unknown_ext_decodes_to_null() {
        let codec = MsgpackSerializer;
        // fixext1 with an unassigned tag
        let buf = [0xd4u8, 0x7f, 0x00];
        let back = codec.deserialize(&buf).unwrap();
        assert!(back.is_null());
    }

    #[test]
    fn error_object_nests() {
        let codec = MsgpackSerializer;
        let err = ErrorObject::new(libc::ENOENT, "missing")
            .with_extra(Object::array_from([Object::from("a")]));
        let buf = codec.serialize(&Object::error(err.clone())).unwrap();
        let back = codec.deserialize(&buf).unwrap();
        assert_eq!(back.as_error(), Some(&err));
    }

    #[test]
    fn fd_roundtrip_duplicates_descriptor() {
        let codec = MsgpackSerializer;
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { libc::close(fds[1]) };
        let obj = Object::fd(fds[0]);
        let buf = codec.serialize(&obj).unwrap();
        let back = codec.deserialize(&buf).unwrap();
        let fd = back.as_fd().expect("fd object");
        // A fresh descriptor referring to the same pipe.
        assert_ne!(fd, fds[0]);
        assert_eq!(unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0, true);
    }

    #[test]
    fn out_of_range_date_is_einval() {
        let codec = MsgpackSerializer;
        let err = codec.serialize(&Object::date(-1)).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }
}
