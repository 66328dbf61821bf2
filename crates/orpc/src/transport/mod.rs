// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport layer.
//!
//! A transport claims one or more URI schemes and turns URIs into
//! [`Link`]s (client side) or [`Listener`]s (server side). Transports
//! live in a process-global registry; scheme resolution happens at
//! connection/server creation and fails with ENXIO when no transport
//! claims the scheme.
//!
//! The in-process [`loopback`] transport is registered by default. It
//! carries frames, descriptors and current-process credentials and is
//! the reference implementation of these traits; network transports
//! plug in through [`register_transport`].

pub mod loopback;

pub use loopback::LoopbackTransport;

use crate::error::{Error, Result};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock, RwLock};

/// Peer credentials, for transports able to supply them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// One received message: the frame octets, any passed descriptors and
/// the sender's credentials when the transport knows them.
#[derive(Debug)]
pub struct Message {
    pub buf: Vec<u8>,
    pub fds: Vec<RawFd>,
    pub creds: Option<Credentials>,
}

/// An established bidirectional frame channel.
pub trait Link: Send + Sync {
    /// Send one frame, with optional descriptors.
    fn send_msg(&self, buf: &[u8], fds: &[RawFd]) -> Result<()>;

    /// Receive the next frame; blocks. ECONNRESET once the peer is
    /// gone or the link was aborted.
    fn recv_msg(&self) -> Result<Message>;

    /// Unblock any pending `recv_msg` on this side.
    fn abort(&self) -> Result<()>;

    /// Underlying descriptor, for transports that have one.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Tear the link down; the peer observes ECONNRESET.
    fn close(&self) -> Result<()>;
}

impl fmt::Debug for dyn Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("raw_fd", &self.raw_fd()).finish()
    }
}

/// A bound listening endpoint.
pub trait Listener: Send + Sync {
    /// Accept the next inbound link; blocks. ECONNRESET once closed.
    fn accept(&self) -> Result<Arc<dyn Link>>;

    /// Stop accepting; pending and future `accept` calls fail.
    fn close(&self) -> Result<()>;
}

impl fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").finish()
    }
}

/// A named transport claiming URI schemes.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// URI schemes this transport claims.
    fn schemes(&self) -> &'static [&'static str];

    /// Establish a client link to `uri`.
    fn connect(&self, uri: &str) -> Result<Arc<dyn Link>>;

    /// Bind a listener on `uri`.
    fn listen(&self, uri: &str) -> Result<Arc<dyn Listener>>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("name", &self.name()).finish()
    }
}

fn registry() -> &'static RwLock<Vec<Arc<dyn Transport>>> {
    static REGISTRY: OnceLock<RwLock<Vec<Arc<dyn Transport>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(vec![Arc::new(LoopbackTransport) as Arc<dyn Transport>]))
}

/// Register a transport, replacing any prior one with the same name.
pub fn register_transport(transport: Arc<dyn Transport>) {
    if let Ok(mut reg) = registry().write() {
        log::debug!("transport registry: registered '{}'", transport.name());
        reg.retain(|t| t.name() != transport.name());
        reg.push(transport);
    }
}

/// The scheme part of a URI. EINVAL when there is none.
pub fn uri_scheme(uri: &str) -> Result<&str> {
    uri.split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| Error::Invalid(format!("URI '{}' has no scheme", uri)))
}

/// Resolve a URI to the transport claiming its scheme. ENXIO on miss.
pub fn find_transport(uri: &str) -> Result<Arc<dyn Transport>> {
    let scheme = uri_scheme(uri)?;
    registry()
        .read()
        .ok()
        .and_then(|reg| {
            reg.iter()
                .find(|t| t.schemes().contains(&scheme))
                .cloned()
        })
        .ok_or_else(|| Error::NoTransport(scheme.to_string()))
}
