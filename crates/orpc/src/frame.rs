// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire frames.
//!
//! Frames are encoder-neutral: a [`Frame`] renders to an [`Object`]
//! dictionary and any registered codec turns that into octets. The
//! dictionary shape is `{ns, name, id?, args}` with `ns` separating
//! the call machinery (`rpc`) from event delivery (`events`).
//!
//! Call ids are per-connection, monotonically increasing and never
//! reused within a connection's lifetime.

use crate::error::{Error, Result};
use crate::object::{ErrorObject, Object};

/// A logical protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client -> server: invoke `method` with `args` (an array).
    Call {
        id: u64,
        path: String,
        interface: Option<String>,
        method: String,
        args: Object,
    },
    /// Server -> client: single result, terminal.
    Response { id: u64, result: Object },
    /// Server -> client: streaming chunk, non-terminal.
    Fragment { id: u64, seqno: u64, value: Object },
    /// Server -> client: successful end of stream, terminal.
    End { id: u64, seqno: u64 },
    /// Either direction: failure, terminal.
    Error { id: u64, error: ErrorObject },
    /// Client -> server: produce the next fragment.
    Continue { id: u64 },
    /// Either direction: cancel, terminal.
    Abort { id: u64 },
    /// One-way broadcast; carries no id.
    Event {
        path: String,
        interface: String,
        name: String,
        args: Object,
    },
    /// Control: start receiving matching events.
    Subscribe {
        path: String,
        interface: String,
        name: String,
    },
    /// Control: stop receiving matching events.
    Unsubscribe {
        path: String,
        interface: String,
        name: String,
    },
}

const NS_RPC: &str = "rpc";
const NS_EVENTS: &str = "events";

impl Frame {
    /// The call id, for frames that carry one.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Call { id, .. }
            | Self::Response { id, .. }
            | Self::Fragment { id, .. }
            | Self::End { id, .. }
            | Self::Error { id, .. }
            | Self::Continue { id }
            | Self::Abort { id } => Some(*id),
            Self::Event { .. } | Self::Subscribe { .. } | Self::Unsubscribe { .. } => None,
        }
    }

    /// Render into the dictionary wire shape.
    pub fn to_object(&self) -> Object {
        let envelope = Object::dictionary();
        let (ns, name, args) = match self {
            Self::Call {
                id,
                path,
                interface,
                method,
                args,
            } => {
                envelope.dict_set("id", Object::uint64(*id));
                let body = Object::dictionary();
                body.dict_set("path", Object::from(path.as_str()));
                if let Some(interface) = interface {
                    body.dict_set("interface", Object::from(interface.as_str()));
                }
                body.dict_set("method", Object::from(method.as_str()));
                body.dict_set("args", args.clone());
                (NS_RPC, "call", body)
            }
            Self::Response { id, result } => {
                envelope.dict_set("id", Object::uint64(*id));
                (NS_RPC, "response", result.clone())
            }
            Self::Fragment { id, seqno, value } => {
                envelope.dict_set("id", Object::uint64(*id));
                let body = Object::dictionary();
                body.dict_set("seqno", Object::uint64(*seqno));
                body.dict_set("fragment", value.clone());
                (NS_RPC, "fragment", body)
            }
            Self::End { id, seqno } => {
                envelope.dict_set("id", Object::uint64(*id));
                let body = Object::dictionary();
                body.dict_set("seqno", Object::uint64(*seqno));
                (NS_RPC, "end", body)
            }
            Self::Error { id, error } => {
                envelope.dict_set("id", Object::uint64(*id));
                (NS_RPC, "error", error.to_dictionary())
            }
            Self::Continue { id } => {
                envelope.dict_set("id", Object::uint64(*id));
                (NS_RPC, "continue", Object::null())
            }
            Self::Abort { id } => {
                envelope.dict_set("id", Object::uint64(*id));
                (NS_RPC, "abort", Object::null())
            }
            Self::Event {
                path,
                interface,
                name,
                args,
            } => {
                let body = Object::dictionary();
                body.dict_set("path", Object::from(path.as_str()));
                body.dict_set("interface", Object::from(interface.as_str()));
                body.dict_set("name", Object::from(name.as_str()));
                body.dict_set("args", args.clone());
                (NS_EVENTS, "event", body)
            }
            Self::Subscribe {
                path,
                interface,
                name,
            } => (NS_EVENTS, "subscribe", subscription_body(path, interface, name)),
            Self::Unsubscribe {
                path,
                interface,
                name,
            } => (
                NS_EVENTS,
                "unsubscribe",
                subscription_body(path, interface, name),
            ),
        };
        envelope.dict_set("ns", Object::from(ns));
        envelope.dict_set("name", Object::from(name));
        envelope.dict_set("args", args);
        envelope
    }

    /// Parse the dictionary wire shape. EINVAL on anything malformed.
    pub fn from_object(obj: &Object) -> Result<Frame> {
        let ns = required_str(obj, "ns")?;
        let name = required_str(obj, "name")?;
        let args = obj.dict_get("args").unwrap_or_else(Object::null);
        match (ns.as_str(), name.as_str()) {
            (NS_RPC, "call") => Ok(Frame::Call {
                id: required_id(obj)?,
                path: required_str(&args, "path")?,
                interface: args
                    .dict_get("interface")
                    .and_then(|i| i.as_str().map(str::to_string)),
                method: required_str(&args, "method")?,
                args: args.dict_get("args").unwrap_or_else(Object::array),
            }),
            (NS_RPC, "response") => Ok(Frame::Response {
                id: required_id(obj)?,
                result: args,
            }),
            (NS_RPC, "fragment") => Ok(Frame::Fragment {
                id: required_id(obj)?,
                seqno: required_u64(&args, "seqno")?,
                value: args.dict_get("fragment").unwrap_or_else(Object::null),
            }),
            (NS_RPC, "end") => Ok(Frame::End {
                id: required_id(obj)?,
                seqno: required_u64(&args, "seqno")?,
            }),
            (NS_RPC, "error") => Ok(Frame::Error {
                id: required_id(obj)?,
                error: ErrorObject::from_dictionary(&args),
            }),
            (NS_RPC, "continue") => Ok(Frame::Continue {
                id: required_id(obj)?,
            }),
            (NS_RPC, "abort") => Ok(Frame::Abort {
                id: required_id(obj)?,
            }),
            (NS_EVENTS, "event") => Ok(Frame::Event {
                path: required_str(&args, "path")?,
                interface: required_str(&args, "interface")?,
                name: required_str(&args, "name")?,
                args: args.dict_get("args").unwrap_or_else(Object::null),
            }),
            (NS_EVENTS, "subscribe") => {
                let (path, interface, name) = subscription_fields(&args)?;
                Ok(Frame::Subscribe {
                    path,
                    interface,
                    name,
                })
            }
            (NS_EVENTS, "unsubscribe") => {
                let (path, interface, name) = subscription_fields(&args)?;
                Ok(Frame::Unsubscribe {
                    path,
                    interface,
                    name,
                })
            }
            (ns, name) => Err(Error::Invalid(format!("unknown frame {}/{}", ns, name))),
        }
    }
}

fn subscription_body(path: &str, interface: &str, name: &str) -> Object {
    let body = Object::dictionary();
    body.dict_set("path", Object::from(path));
    body.dict_set("interface", Object::from(interface));
    body.dict_set("name", Object::from(name));
    body
}

fn subscription_fields(args: &Object) -> Result<(String, String, String)> {
    Ok((
        required_str(args, "path")?,
        required_str(args, "interface")?,
        required_str(args, "name")?,
    ))
}

fn required_str(obj: &Object, key: &str) -> Result<String> {
    obj.dict_get(key)
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| Error::Invalid(format!("frame missing '{}'", key)))
}

fn required_u64(obj: &Object, key: &str) -> Result<u64> {
    obj.dict_get(key)
        .and_then(|v| v.as_integer())
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| Error::Invalid(format!("frame missing '{}'", key)))
}

fn required_id(obj: &Object) -> Result<u64> {
    required_u64(obj, "id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer;

    fn roundtrip(frame: &Frame) {
        let obj = frame.to_object();
        let parsed = Frame::from_object(&obj).unwrap();
        assert_eq!(&parsed, frame);
        // And through the default codec.
        let codec = serializer::find("msgpack").unwrap();
        let wire = codec.serialize(&obj).unwrap();
        let decoded = codec.deserialize(&wire).unwrap();
        assert_eq!(Frame::from_object(&decoded).unwrap(), *frame);
    }

    #[test]
    fn call_roundtrip() {
        roundtrip(&Frame::Call {
            id: 1,
            path: "/".into(),
            interface: Some("com.example.Calculator".into()),
            method: "add".into(),
            args: Object::array_from([Object::uint64(2), Object::uint64(3)]),
        });
    }

    #[test]
    fn streaming_frames_roundtrip() {
        roundtrip(&Frame::Fragment {
            id: 9,
            seqno: 4,
            value: Object::from("chunk"),
        });
        roundtrip(&Frame::End { id: 9, seqno: 5 });
        roundtrip(&Frame::Continue { id: 9 });
        roundtrip(&Frame::Abort { id: 9 });
    }

    #[test]
    fn error_frame_roundtrip() {
        roundtrip(&Frame::Error {
            id: 3,
            error: ErrorObject::new(libc::ENOENT, "Method not found"),
        });
    }

    #[test]
    fn event_frames_have_no_id() {
        let frame = Frame::Event {
            path: "/".into(),
            interface: "com.ex.Bus".into(),
            name: "tick".into(),
            args: Object::uint64(42),
        };
        assert_eq!(frame.id(), None);
        roundtrip(&frame);
        roundtrip(&Frame::Subscribe {
            path: "/".into(),
            interface: "com.ex.Bus".into(),
            name: "tick".into(),
        });
    }

    #[test]
    fn malformed_frame_is_einval() {
        let obj = Object::dictionary();
        obj.dict_set("ns", Object::from("rpc"));
        obj.dict_set("name", Object::from("no-such"));
        let err = Frame::from_object(&obj).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }
}
