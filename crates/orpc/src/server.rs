// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server lifecycle: listen, accept, route into a context.
//!
//! A server binds a transport listener, runs one accept thread and
//! keeps its open connections behind a reader-writer lock (writers:
//! accept/remove, readers: broadcast iteration). Closing aborts every
//! connection and blocks until the list drains.

use crate::connection::Connection;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::object::Object;
use crate::serializer::{self, Serializer};
use crate::transport::{find_transport, Listener};
use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Connection lifecycle notifications delivered to the server event
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    ConnectionArrived,
    ConnectionTerminated,
}

/// Replaceable server event handler.
pub type ServerEventHandler = dyn Fn(&Arc<Connection>, ServerEvent) + Send + Sync;

/// A listening endpoint routing inbound calls into a [`Context`].
pub struct Server {
    uri: String,
    context: Weak<Context>,
    listener: Arc<dyn Listener>,
    codec: Arc<dyn Serializer>,
    connections: RwLock<Vec<Arc<Connection>>>,
    drain_lock: Mutex<()>,
    drain_cv: Condvar,
    closed: AtomicBool,
    event_handler: ArcSwapOption<Box<ServerEventHandler>>,
}

impl Server {
    /// Listen on `uri` and route calls into `context`, using the
    /// default msgpack codec.
    pub fn create(uri: &str, context: &Arc<Context>) -> Result<Arc<Server>> {
        Self::create_with_serializer(uri, context, "msgpack")
    }

    /// Listen with an explicit codec.
    pub fn create_with_serializer(
        uri: &str,
        context: &Arc<Context>,
        codec: &str,
    ) -> Result<Arc<Server>> {
        let transport = find_transport(uri)?;
        let codec = serializer::find(codec)?;
        let listener = transport.listen(uri)?;

        let server = Arc::new(Server {
            uri: uri.to_string(),
            context: Arc::downgrade(context),
            listener,
            codec,
            connections: RwLock::new(Vec::new()),
            drain_lock: Mutex::new(()),
            drain_cv: Condvar::new(),
            closed: AtomicBool::new(false),
            event_handler: ArcSwapOption::empty(),
        });
        context.attach_server(server.clone());

        {
            let server = server.clone();
            std::thread::Builder::new()
                .name("orpc-server-accept".to_string())
                .spawn(move || server.accept_loop())
                .expect("spawn accept loop");
        }
        log::debug!("server listening on {}", server.uri);
        Ok(server)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Replace the connection lifecycle handler.
    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(&Arc<Connection>, ServerEvent) + Send + Sync + 'static,
    {
        self.event_handler.store(Some(Arc::new(Box::new(handler))));
    }

    fn fire(&self, conn: &Arc<Connection>, event: ServerEvent) {
        if let Some(handler) = self.event_handler.load_full() {
            handler(conn, event);
        }
    }

    fn accept_loop(self: Arc<Self>) {
        loop {
            let link = match self.listener.accept() {
                Ok(link) => link,
                Err(_) => break,
            };
            if self.is_closed() {
                break;
            }
            let Some(context) = self.context.upgrade() else {
                break;
            };
            let conn =
                Connection::accept(link, self.codec.clone(), context, Arc::downgrade(&self));
            self.connections.write().push(conn.clone());
            log::debug!("server {}: connection arrived", self.uri);
            self.fire(&conn, ServerEvent::ConnectionArrived);
        }
        log::debug!("server {}: accept loop ended", self.uri);
    }

    /// Close the server: detach from the context, stop accepting,
    /// abort every connection and wait until the list drains.
    /// Err(NotFound) when the server is no longer attached.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| Error::NotFound("context already gone".into()))?;
        context.detach_server(self)?;

        self.closed.store(true, Ordering::Release);
        let _ = self.listener.close();

        let connections: Vec<Arc<Connection>> = self.connections.read().clone();
        for conn in connections {
            let _ = conn.close();
        }

        let mut guard = self.drain_lock.lock();
        while !self.connections.read().is_empty() {
            self.drain_cv.wait(&mut guard);
        }
        Ok(())
    }

    /// Send an event frame to every open, subscribed connection. One
    /// failing connection does not stop the broadcast. No-op once
    /// closed.
    pub fn broadcast_event(&self, path: &str, interface: &str, name: &str, args: Object) {
        if self.is_closed() {
            return;
        }
        let connections: Vec<Arc<Connection>> = self.connections.read().clone();
        for conn in connections {
            if let Err(e) = conn.send_event(path, interface, name, args.clone()) {
                log::warn!("server {}: event send failed: {}", self.uri, e);
            }
        }
    }

    pub(crate) fn connection_closed(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut connections = self.connections.write();
            let before = connections.len();
            connections.retain(|c| !Arc::ptr_eq(c, conn));
            connections.len() < before
        };
        if removed {
            log::debug!("server {}: connection terminated", self.uri);
            self.fire(conn, ServerEvent::ConnectionTerminated);
            let _guard = self.drain_lock.lock();
            self.drain_cv.notify_all();
        }
    }
}
