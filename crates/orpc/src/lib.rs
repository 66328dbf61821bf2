// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # ORPC - Object-based RPC runtime
//!
//! A pure Rust RPC runtime built around a dynamic, reference-counted
//! object model and an IDL-driven type system. Producers register
//! methods on a [`Context`]; consumers invoke them over a
//! [`Connection`] and exchange self-describing, typed values.
//!
//! ## Quick Start
//!
//! ```no_run
//! use orpc::{Connection, Context, Object, Response, Result, Server};
//!
//! fn main() -> Result<()> {
//!     // Server side: a context with one method.
//!     let context = Context::builder().build();
//!     context.register_func("Builtin.ping", "liveness probe", |_call, _args| {
//!         Ok(Object::null())
//!     });
//!     let _server = Server::create("loopback://demo", &context)?;
//!
//!     // Client side.
//!     let conn = Connection::connect("loopback://demo")?;
//!     match conn.call("Builtin.ping", &[])?.wait()? {
//!         Response::Single(result) => assert!(result.is_null()),
//!         Response::Stream(_) => unreachable!(),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Application Layer                        |
//! |        Context (methods, instances) | Connection API         |
//! +--------------------------------------------------------------+
//! |                       Call Engine                            |
//! |  outbound handles | inbound dispatch | fragments | events    |
//! +--------------------------------------------------------------+
//! |              Object Model & Typing Layer                     |
//! |  tagged values | IDL types | generics | validation           |
//! +--------------------------------------------------------------+
//! |                  Codecs & Transports                         |
//! |  msgpack / yaml / json | loopback | pluggable registries     |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Object`] | Reference-counted dynamic value |
//! | [`TypingContext`] | IDL tables: types, interfaces, validators |
//! | [`Context`] | Method registry plus dispatch worker pool |
//! | [`Connection`] | Per-peer calls, events, framing |
//! | [`Server`] | Listener routing inbound calls into a context |
//!
//! ## Features
//!
//! - Streaming calls with per-fragment flow control and cancellation
//! - Structural validation of arguments and results at call
//!   boundaries, driven by YAML IDL files with generics
//! - Pluggable codecs (`msgpack`, `yaml`, `json`) and transports
//! - Event fan-out with per-connection subscription filtering

/// Outbound/inbound call handles and state machines.
pub mod call;
/// Per-peer connection state: calls, events, framing.
pub mod connection;
/// Method registry, instance tree and dispatch worker pool.
pub mod context;
/// Error types and POSIX-style code mapping.
pub mod error;
/// Wire frames and their dictionary rendering.
pub mod frame;
/// The dynamic object model.
pub mod object;
/// Named codecs mapping object trees to octet buffers.
pub mod serializer;
/// Server lifecycle: listen, accept, broadcast.
pub mod server;
/// Transport traits, registry and the loopback transport.
pub mod transport;
/// The IDL-driven type system.
pub mod typing;

pub use call::{Call, CallStatus, CallStream, InboundCall, Response};
pub use connection::Connection;
pub use context::Context;
pub use error::{Error, Result};
pub use object::{ErrorObject, Object};
pub use server::{Server, ServerEvent};
pub use typing::TypingContext;
