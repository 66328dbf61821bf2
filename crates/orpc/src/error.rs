// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for ORPC operations.
//!
//! Every failure is classified into a POSIX-style code so it can cross
//! the wire as an `error` object ([`ErrorObject`]) without losing its
//! category. [`Error::code`] performs the mapping; the reverse
//! direction goes through [`Error::from`].

use crate::object::ErrorObject;
use std::fmt;

/// Result type for ORPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ORPC operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed input: bad IDL, unknown type, argument mismatch (EINVAL).
    Invalid(String),

    /// Missing type, method, interface or file (ENOENT).
    NotFound(String),

    /// Index out of bounds (ERANGE).
    OutOfRange(String),

    /// Operation not implemented or not applicable (ENOTSUP).
    Unsupported(String),

    /// No transport claims the URI scheme (ENXIO).
    NoTransport(String),

    /// Peer went away with the call outstanding (ECONNRESET).
    ConnectionReset,

    /// Call did not complete within its deadline (ETIMEDOUT).
    TimedOut,

    /// Call was aborted locally or by the peer (ECANCELED).
    Canceled,

    /// Underlying I/O failure (EIO).
    Io(std::io::Error),

    /// Error object received from the peer, carried verbatim.
    Remote(ErrorObject),
}

impl Error {
    /// POSIX-style code for this error, as carried on the wire.
    pub fn code(&self) -> i32 {
        match self {
            Self::Invalid(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::OutOfRange(_) => libc::ERANGE,
            Self::Unsupported(_) => libc::ENOTSUP,
            Self::NoTransport(_) => libc::ENXIO,
            Self::ConnectionReset => libc::ECONNRESET,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::Canceled => libc::ECANCELED,
            Self::Io(_) => libc::EIO,
            Self::Remote(e) => e.code,
        }
    }

    /// Convert into the wire representation.
    pub fn into_error_object(self) -> ErrorObject {
        match self {
            Self::Remote(e) => e,
            other => ErrorObject::new(other.code(), other.to_string()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "Invalid argument: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::OutOfRange(msg) => write!(f, "Out of range: {}", msg),
            Self::Unsupported(msg) => write!(f, "Not supported: {}", msg),
            Self::NoTransport(scheme) => write!(f, "No transport for scheme: {}", scheme),
            Self::ConnectionReset => write!(f, "Connection reset by peer"),
            Self::TimedOut => write!(f, "Call timed out"),
            Self::Canceled => write!(f, "Call canceled"),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Remote(e) => write!(f, "Remote error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ErrorObject> for Error {
    fn from(e: ErrorObject) -> Self {
        // Well-known codes map back onto their local variants so callers
        // can match on them without inspecting the wire object.
        match e.code {
            c if c == libc::ETIMEDOUT => Self::TimedOut,
            c if c == libc::ECANCELED => Self::Canceled,
            c if c == libc::ECONNRESET => Self::ConnectionReset,
            _ => Self::Remote(e),
        }
    }
}
