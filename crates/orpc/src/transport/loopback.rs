// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process loopback transport.
//!
//! URIs look like `loopback://<endpoint>`. Listeners park in a
//! process-global endpoint table; `connect` builds a crossbeam channel
//! pair and hands the server half to the listener. Descriptors pass
//! through untouched (same process) and every message carries the
//! current process's credentials.

use crate::error::{Error, Result};
use crate::transport::{uri_scheme, Credentials, Link, Listener, Message, Transport};
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

enum Packet {
    Data(Message),
    Shutdown,
}

fn endpoints() -> &'static DashMap<String, Sender<Arc<LoopbackLink>>> {
    static ENDPOINTS: OnceLock<DashMap<String, Sender<Arc<LoopbackLink>>>> = OnceLock::new();
    ENDPOINTS.get_or_init(DashMap::new)
}

fn local_credentials() -> Credentials {
    // SAFETY: getters with no failure modes.
    unsafe {
        Credentials {
            uid: libc::getuid(),
            gid: libc::getgid(),
            pid: libc::getpid(),
        }
    }
}

fn endpoint_of(uri: &str) -> Result<String> {
    let scheme = uri_scheme(uri)?;
    if scheme != "loopback" {
        return Err(Error::Invalid(format!("not a loopback URI: '{}'", uri)));
    }
    let endpoint = &uri[scheme.len() + 3..];
    if endpoint.is_empty() {
        return Err(Error::Invalid(format!("loopback URI '{}' names no endpoint", uri)));
    }
    Ok(endpoint.to_string())
}

/// One half of an in-process link.
pub struct LoopbackLink {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    /// Local injection path so `abort` can unblock our own receiver.
    self_tx: Sender<Packet>,
    closed: AtomicBool,
}

impl LoopbackLink {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = unbounded::<Packet>();
        let (b_tx, b_rx) = unbounded::<Packet>();
        let a = Arc::new(Self {
            tx: b_tx.clone(),
            rx: a_rx,
            self_tx: a_tx.clone(),
            closed: AtomicBool::new(false),
        });
        let b = Arc::new(Self {
            tx: a_tx,
            rx: b_rx,
            self_tx: b_tx,
            closed: AtomicBool::new(false),
        });
        (a, b)
    }
}

impl Link for LoopbackLink {
    fn send_msg(&self, buf: &[u8], fds: &[RawFd]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset);
        }
        let msg = Message {
            buf: buf.to_vec(),
            fds: fds.to_vec(),
            creds: Some(local_credentials()),
        };
        self.tx
            .send(Packet::Data(msg))
            .map_err(|_| Error::ConnectionReset)
    }

    fn recv_msg(&self) -> Result<Message> {
        match self.rx.recv() {
            Ok(Packet::Data(msg)) => Ok(msg),
            Ok(Packet::Shutdown) | Err(_) => Err(Error::ConnectionReset),
        }
    }

    fn abort(&self) -> Result<()> {
        // Unblocks our own recv; the peer is untouched.
        let _ = self.self_tx.send(Packet::Shutdown);
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.tx.send(Packet::Shutdown);
        let _ = self.self_tx.send(Packet::Shutdown);
        Ok(())
    }
}

/// A parked loopback endpoint.
pub struct LoopbackListener {
    endpoint: String,
    accept_rx: Receiver<Arc<LoopbackLink>>,
    closed: AtomicBool,
}

impl Listener for LoopbackListener {
    fn accept(&self) -> Result<Arc<dyn Link>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset);
        }
        match self.accept_rx.recv() {
            Ok(link) => Ok(link as Arc<dyn Link>),
            Err(_) => Err(Error::ConnectionReset),
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the sender disconnects pending accepts.
        endpoints().remove(&self.endpoint);
        Ok(())
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The `loopback` transport.
pub struct LoopbackTransport;

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["loopback"]
    }

    fn connect(&self, uri: &str) -> Result<Arc<dyn Link>> {
        let endpoint = endpoint_of(uri)?;
        let accept_tx = endpoints()
            .get(&endpoint)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("loopback endpoint '{}'", endpoint)))?;
        let (client, server) = LoopbackLink::pair();
        accept_tx
            .send(server)
            .map_err(|_| Error::ConnectionReset)?;
        Ok(client as Arc<dyn Link>)
    }

    fn listen(&self, uri: &str) -> Result<Arc<dyn Listener>> {
        let endpoint = endpoint_of(uri)?;
        let (accept_tx, accept_rx) = unbounded();
        // Entry API keeps bind-then-bind atomic.
        match endpoints().entry(endpoint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Invalid(format!(
                "loopback endpoint '{}' already bound",
                endpoint
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(accept_tx);
                Ok(Arc::new(LoopbackListener {
                    endpoint,
                    accept_rx,
                    closed: AtomicBool::new(false),
                }) as Arc<dyn Listener>)
            }
        }
    }
}
