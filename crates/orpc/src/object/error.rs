// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The `error` object kind.
//!
//! Carried both as the result of failed calls and as the out-parameter
//! of validators. On the wire it is a dictionary with well-known keys;
//! in memory it is a plain struct so call sites can match on the code
//! without digging through a container.

use crate::object::Object;
use std::fmt;

/// A structured error value: POSIX-style code, human-readable message,
/// optional extra payload and optional stack trace frames.
#[derive(Debug, Clone)]
pub struct ErrorObject {
    /// POSIX-style error code (`libc::EINVAL`, ...).
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Optional payload, e.g. the aggregated validation error array.
    pub extra: Option<Object>,
    /// Optional array of stack frames. Never attached implicitly;
    /// errors crossing the wire carry only what the producer set.
    pub stacktrace: Option<Object>,
}

impl ErrorObject {
    /// Create an error with code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            extra: None,
            stacktrace: None,
        }
    }

    /// Attach an extra payload.
    pub fn with_extra(mut self, extra: Object) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Attach stack trace frames.
    pub fn with_stacktrace(mut self, frames: Object) -> Self {
        self.stacktrace = Some(frames);
        self
    }

    /// Render as a plain dictionary for codecs that have no native
    /// error representation.
    pub fn to_dictionary(&self) -> Object {
        let dict = Object::dictionary();
        dict.dict_set("code", Object::from(i64::from(self.code)));
        dict.dict_set("message", Object::from(self.message.as_str()));
        if let Some(extra) = &self.extra {
            dict.dict_set("extra", extra.clone());
        }
        if let Some(frames) = &self.stacktrace {
            dict.dict_set("stacktrace", frames.clone());
        }
        dict
    }

    /// Rebuild from the dictionary rendering. Missing or mistyped keys
    /// fall back to an EIO shell rather than failing the decode.
    pub fn from_dictionary(dict: &Object) -> Self {
        let code = dict
            .dict_get("code")
            .and_then(|o| o.as_i64())
            .unwrap_or_else(|| i64::from(libc::EIO)) as i32;
        let message = dict
            .dict_get("message")
            .and_then(|o| o.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            code,
            message,
            extra: dict.dict_get("extra"),
            stacktrace: dict.dict_get("stacktrace"),
        }
    }
}

impl PartialEq for ErrorObject {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.message == other.message
            && self.extra == other.extra
            && self.stacktrace == other.stacktrace
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_roundtrip() {
        let err = ErrorObject::new(libc::EINVAL, "bad argument")
            .with_extra(Object::from("details"));
        let dict = err.to_dictionary();
        let back = ErrorObject::from_dictionary(&dict);
        assert_eq!(back, err);
    }

    #[test]
    fn missing_keys_fall_back() {
        let back = ErrorObject::from_dictionary(&Object::dictionary());
        assert_eq!(back.code, libc::EIO);
        assert!(back.message.is_empty());
        assert!(back.extra.is_none());
    }
}
