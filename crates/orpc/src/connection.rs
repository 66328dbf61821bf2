// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer connection state.
//!
//! A connection owns one transport link, a receive-loop thread that
//! decodes frames and drives the call state machines, and one worker
//! thread that delivers events and async-call callbacks in arrival
//! order. Outbound calls park in a table keyed by id; inbound calls
//! are handed to the context's worker pool.
//!
//! # Example
//!
//! ```no_run
//! use orpc::connection::Connection;
//! use orpc::call::Response;
//! use orpc::object::Object;
//!
//! # fn main() -> orpc::Result<()> {
//! let conn = Connection::connect("loopback://demo")?;
//! match conn.call("Builtin.ping", &[])?.wait()? {
//!     Response::Single(result) => assert!(result.is_null()),
//!     Response::Stream(_) => unreachable!(),
//! }
//! # Ok(())
//! # }
//! ```

use crate::call::{Call, CallCallback, CallHandle, InboundCall, Job, Response};
use crate::context::{Context, TYPING_INTERFACE};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::object::{ErrorObject, Object};
use crate::serializer::{self, Serializer};
use crate::server::Server;
use crate::transport::{find_transport, Credentials, Link};
use crate::typing::TypingContext;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Per-event-tuple handler.
pub type EventHandler = Arc<dyn Fn(&Object) + Send + Sync>;

type EventKey = (String, String, String);

/// Builder for client connections.
pub struct ConnectionBuilder {
    uri: String,
    codec: String,
    typing: Option<Arc<TypingContext>>,
    context: Option<Arc<Context>>,
}

impl ConnectionBuilder {
    /// Codec name (default `msgpack`).
    pub fn serializer(mut self, name: &str) -> Self {
        self.codec = name.to_string();
        self
    }

    /// Typing context for typed argument serialization and
    /// `download_idl`.
    pub fn typing(mut self, typing: Arc<TypingContext>) -> Self {
        self.typing = Some(typing);
        self
    }

    /// Context for serving inbound calls on this (client) connection.
    pub fn context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn connect(self) -> Result<Arc<Connection>> {
        let transport = find_transport(&self.uri)?;
        let link = transport.connect(&self.uri)?;
        let codec = serializer::find(&self.codec)?;
        let typing = self
            .typing
            .or_else(|| self.context.as_ref().and_then(|c| c.typing().cloned()));
        Ok(Connection::spawn(link, codec, typing, self.context, None))
    }
}

/// One peer: outstanding calls, event subscriptions, framing.
pub struct Connection {
    link: Arc<dyn Link>,
    codec: Arc<dyn Serializer>,
    next_id: AtomicU64,
    outbound: DashMap<u64, Arc<CallHandle>>,
    inbound: DashMap<u64, Arc<InboundCall>>,
    /// Tuples we subscribed to; receipt filter.
    local_subs: Mutex<HashSet<EventKey>>,
    /// Tuples the peer subscribed to; send filter.
    peer_subs: Mutex<HashSet<EventKey>>,
    handlers: Mutex<HashMap<EventKey, Vec<EventHandler>>>,
    worker_tx: crossbeam::channel::Sender<Job>,
    typing: Option<Arc<TypingContext>>,
    context: Option<Arc<Context>>,
    peer_creds: OnceLock<Credentials>,
    closed: AtomicBool,
    torn_down: AtomicBool,
    server: Mutex<Option<Weak<Server>>>,
}

impl Connection {
    /// Connect with defaults: msgpack codec, no typing, no context.
    pub fn connect(uri: &str) -> Result<Arc<Connection>> {
        Self::builder(uri).connect()
    }

    pub fn builder(uri: &str) -> ConnectionBuilder {
        ConnectionBuilder {
            uri: uri.to_string(),
            codec: "msgpack".to_string(),
            typing: None,
            context: None,
        }
    }

    /// Server-side construction for an accepted link.
    pub(crate) fn accept(
        link: Arc<dyn Link>,
        codec: Arc<dyn Serializer>,
        context: Arc<Context>,
        server: Weak<Server>,
    ) -> Arc<Connection> {
        let typing = context.typing().cloned();
        Self::spawn(link, codec, typing, Some(context), Some(server))
    }

    fn spawn(
        link: Arc<dyn Link>,
        codec: Arc<dyn Serializer>,
        typing: Option<Arc<TypingContext>>,
        context: Option<Arc<Context>>,
        server: Option<Weak<Server>>,
    ) -> Arc<Connection> {
        let (worker_tx, worker_rx) = crossbeam::channel::unbounded::<Job>();
        let conn = Arc::new(Connection {
            link,
            codec,
            next_id: AtomicU64::new(1),
            outbound: DashMap::new(),
            inbound: DashMap::new(),
            local_subs: Mutex::new(HashSet::new()),
            peer_subs: Mutex::new(HashSet::new()),
            handlers: Mutex::new(HashMap::new()),
            worker_tx,
            typing,
            context,
            peer_creds: OnceLock::new(),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            server: Mutex::new(server),
        });
        std::thread::Builder::new()
            .name("orpc-conn-events".to_string())
            .spawn(move || {
                while let Ok(job) = worker_rx.recv() {
                    job();
                }
            })
            .expect("spawn event worker");
        {
            let conn = conn.clone();
            std::thread::Builder::new()
                .name("orpc-conn-recv".to_string())
                .spawn(move || conn.recv_loop())
                .expect("spawn receive loop");
        }
        conn
    }

    /// Peer credentials, once the transport has supplied them.
    pub fn credentials(&self) -> Option<Credentials> {
        self.peer_creds.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Outbound calls
    // ------------------------------------------------------------------

    /// Invoke `method` at the root path. The method name may be
    /// `Interface.method`-qualified.
    pub fn call(self: &Arc<Self>, method: &str, args: &[Object]) -> Result<Call> {
        let handle = self.start_call("/", None, method, args, None)?;
        Ok(Call::new(self.clone(), handle))
    }

    /// Invoke a method on a specific path and interface.
    pub fn call_on(
        self: &Arc<Self>,
        path: &str,
        interface: Option<&str>,
        method: &str,
        args: &[Object],
    ) -> Result<Call> {
        let handle = self.start_call(path, interface, method, args, None)?;
        Ok(Call::new(self.clone(), handle))
    }

    /// Invoke asynchronously: the callback observes every state
    /// transition on the connection worker thread. The returned call
    /// is detached (dropping it does not cancel); use
    /// [`Call::abort`] to cancel.
    pub fn call_async(
        self: &Arc<Self>,
        method: &str,
        args: &[Object],
        callback: CallCallback,
    ) -> Result<Call> {
        let handle = self.start_call("/", None, method, args, Some(callback))?;
        Ok(Call::new_detached(self.clone(), handle))
    }

    fn start_call(
        self: &Arc<Self>,
        path: &str,
        interface: Option<&str>,
        method: &str,
        args: &[Object],
        callback: Option<CallCallback>,
    ) -> Result<Arc<CallHandle>> {
        if self.is_closed() {
            return Err(Error::ConnectionReset);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = CallHandle::new(id, method.to_string(), callback, self.worker_tx.clone());
        self.outbound.insert(id, handle.clone());

        let wire_args = Object::array();
        for arg in args {
            let rendered = match &self.typing {
                Some(typing) => typing.serialize(arg)?,
                None => arg.clone(),
            };
            let _ = wire_args.append(rendered);
        }
        let frame = Frame::Call {
            id,
            path: path.to_string(),
            interface: interface.map(str::to_string),
            method: method.to_string(),
            args: wire_args,
        };
        if let Err(e) = self.send_frame(&frame) {
            self.outbound.remove(&id);
            return Err(e);
        }
        Ok(handle)
    }

    pub(crate) fn forget_call(&self, id: u64) {
        self.outbound.remove(&id);
    }

    pub(crate) fn send_frame(&self, frame: &Frame) -> Result<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(Error::ConnectionReset);
        }
        let buf = self.codec.serialize(&frame.to_object())?;
        self.link.send_msg(&buf, &[])
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe to `(path, interface, name)` and register a handler
    /// invoked on the connection worker thread for each matching
    /// event.
    pub fn subscribe(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        handler: EventHandler,
    ) -> Result<()> {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        self.local_subs.lock().insert(key.clone());
        self.handlers.lock().entry(key).or_default().push(handler);
        self.send_frame(&Frame::Subscribe {
            path: path.to_string(),
            interface: interface.to_string(),
            name: name.to_string(),
        })
    }

    /// Drop the subscription and every handler registered for it.
    pub fn unsubscribe(&self, path: &str, interface: &str, name: &str) -> Result<()> {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        self.local_subs.lock().remove(&key);
        self.handlers.lock().remove(&key);
        self.send_frame(&Frame::Unsubscribe {
            path: path.to_string(),
            interface: interface.to_string(),
            name: name.to_string(),
        })
    }

    /// Emit one event to this peer. Skipped (Ok) when the peer has
    /// not subscribed to the tuple.
    pub fn send_event(&self, path: &str, interface: &str, name: &str, args: Object) -> Result<()> {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        if !self.peer_subs.lock().contains(&key) {
            return Ok(());
        }
        self.send_frame(&Frame::Event {
            path: path.to_string(),
            interface: interface.to_string(),
            name: name.to_string(),
            args,
        })
    }

    // ------------------------------------------------------------------
    // Typing download
    // ------------------------------------------------------------------

    /// Pull every IDL file the peer has loaded into our typing
    /// context. Returns the number of files received.
    pub fn download_idl(self: &Arc<Self>) -> Result<usize> {
        let typing = self
            .typing
            .clone()
            .ok_or_else(|| Error::Invalid("connection has no typing context".into()))?;
        let call = self.call_on("/", Some(TYPING_INTERFACE), "download", &[])?;
        match call.wait()? {
            Response::Stream(stream) => {
                let mut count = 0usize;
                for item in stream {
                    let body = item?;
                    let text = body
                        .as_str()
                        .ok_or_else(|| Error::Invalid("IDL body is not a string".into()))?;
                    typing.load_str(format!("download/{}", count), text)?;
                    count += 1;
                }
                Ok(count)
            }
            Response::Single(_) => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close the connection. Outstanding outbound calls fail with
    /// ECONNRESET, inbound calls observe `aborted`, queued events are
    /// dropped.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.link.abort();
        let _ = self.link.close();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    fn recv_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let msg = match self.link.recv_msg() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            if let Some(creds) = msg.creds {
                let _ = self.peer_creds.set(creds);
            }
            let obj = match self.codec.deserialize(&msg.buf) {
                Ok(obj) => obj,
                Err(e) => {
                    log::warn!("connection: dropping undecodable frame: {}", e);
                    continue;
                }
            };
            match Frame::from_object(&obj) {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => log::warn!("connection: dropping malformed frame: {}", e),
            }
        }
        self.teardown();
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Call {
                id,
                path,
                interface,
                method,
                args,
            } => self.handle_call(id, path, interface, method, &args),
            Frame::Response { id, result } => {
                if let Some((_, handle)) = self.outbound.remove(&id) {
                    match self.decode_typed(result) {
                        Ok(result) => handle.on_response(result),
                        Err(e) => handle.on_error(e.into_error_object()),
                    }
                } else {
                    log::debug!("response for unknown call {}, ignored", id);
                }
            }
            Frame::Fragment { id, seqno, value } => {
                if let Some(handle) = self.outbound.get(&id).map(|h| h.value().clone()) {
                    match self.decode_typed(value) {
                        Ok(value) => handle.on_fragment(seqno, value),
                        Err(e) => handle.on_error(e.into_error_object()),
                    }
                } else {
                    log::debug!("fragment for unknown call {}, ignored", id);
                }
            }
            Frame::End { id, .. } => {
                if let Some((_, handle)) = self.outbound.remove(&id) {
                    handle.on_end();
                }
            }
            Frame::Error { id, error } => {
                if let Some((_, handle)) = self.outbound.remove(&id) {
                    handle.on_error(error);
                } else if let Some((_, call)) = self.inbound.remove(&id) {
                    call.on_abort();
                }
            }
            Frame::Continue { id } => {
                if let Some(call) = self.inbound.get(&id).map(|c| c.value().clone()) {
                    call.on_continue();
                }
            }
            Frame::Abort { id } => {
                if let Some((_, call)) = self.inbound.remove(&id) {
                    call.on_abort();
                } else if let Some((_, handle)) = self.outbound.remove(&id) {
                    handle.on_error(ErrorObject::new(libc::ECANCELED, "Aborted by peer"));
                }
                // Unknown id: ignored.
            }
            Frame::Event {
                path,
                interface,
                name,
                args,
            } => {
                let key = (path, interface, name);
                if !self.local_subs.lock().contains(&key) {
                    return;
                }
                let handlers: Vec<EventHandler> = self
                    .handlers
                    .lock()
                    .get(&key)
                    .cloned()
                    .unwrap_or_default();
                if handlers.is_empty() {
                    return;
                }
                let _ = self.worker_tx.send(Box::new(move || {
                    for handler in &handlers {
                        handler(&args);
                    }
                }));
            }
            Frame::Subscribe {
                path,
                interface,
                name,
            } => {
                self.peer_subs.lock().insert((path, interface, name));
            }
            Frame::Unsubscribe {
                path,
                interface,
                name,
            } => {
                self.peer_subs.lock().remove(&(path, interface, name));
            }
        }
    }

    fn handle_call(
        self: &Arc<Self>,
        id: u64,
        path: String,
        interface: Option<String>,
        method: String,
        args: &Object,
    ) {
        let Some(context) = self.context.clone() else {
            let _ = self.send_frame(&Frame::Error {
                id,
                error: ErrorObject::new(libc::ENOTSUP, "Peer does not serve calls"),
            });
            return;
        };
        let mut list = Vec::with_capacity(args.len());
        for i in 0..args.len() {
            let arg = args.get(i).unwrap_or_else(Object::null);
            match self.decode_typed(arg) {
                Ok(arg) => list.push(arg),
                Err(e) => {
                    let _ = self.send_frame(&Frame::Error {
                        id,
                        error: e.into_error_object(),
                    });
                    return;
                }
            }
        }
        let call = InboundCall::new(id, path, interface, method, list, Arc::downgrade(self));
        self.inbound.insert(id, call.clone());
        context.dispatch(call);
    }

    fn decode_typed(&self, obj: Object) -> Result<Object> {
        match &self.typing {
            Some(typing) => typing.deserialize(&obj),
            None => Ok(obj),
        }
    }

    pub(crate) fn finish_inbound(&self, id: u64) {
        self.inbound.remove(&id);
    }

    fn teardown(self: &Arc<Self>) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.store(true, Ordering::Release);

        let reset = ErrorObject::new(libc::ECONNRESET, "Connection reset");
        let outstanding: Vec<Arc<CallHandle>> = self
            .outbound
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.outbound.clear();
        for handle in outstanding {
            if !handle.status().is_terminal() {
                handle.on_error(reset.clone());
            }
        }

        let inbound: Vec<Arc<InboundCall>> = self
            .inbound
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inbound.clear();
        for call in inbound {
            call.on_abort();
        }

        self.handlers.lock().clear();
        self.local_subs.lock().clear();
        self.peer_subs.lock().clear();

        let server = self.server.lock().take();
        if let Some(server) = server.and_then(|weak| weak.upgrade()) {
            server.connection_closed(self);
        }
        let _ = self.link.close();
        log::debug!("connection torn down");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
