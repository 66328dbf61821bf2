// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The context: method registry, instance tree and worker pool.
//!
//! Inbound calls are dispatched onto a shared pool of worker threads.
//! Each worker resolves the method, runs pre-call validation when the
//! typing layer declares the method, invokes the implementation and
//! sends the closing frame.
//!
//! # Example
//!
//! ```
//! use orpc::context::Context;
//! use orpc::object::Object;
//!
//! let ctx = Context::builder().build();
//! ctx.register_func("Builtin.ping", "liveness probe", |_call, _args| {
//!     Ok(Object::null())
//! });
//! ```

use crate::call::{InboundCall, Job};
use crate::object::{ErrorObject, Object};
use crate::server::Server;
use crate::typing::TypingContext;
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// The advertised typing discovery interface.
pub const TYPING_INTERFACE: &str = "com.twoporeguys.librpc.Typing";

/// What a method implementation produces: a single result, or an
/// error object sent verbatim to the caller. Streaming producers
/// yield through the call handle and return `Ok(Object::null())`.
pub type MethodResult = std::result::Result<Object, ErrorObject>;

/// A registered method implementation.
pub type MethodFn = dyn Fn(&Arc<InboundCall>, &[Object]) -> MethodResult + Send + Sync;

/// Registry entry for one method.
pub struct MethodDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub func: Arc<MethodFn>,
}

/// One addressable node in the instance tree.
pub struct Instance {
    path: String,
    description: Option<String>,
    methods: DashMap<String, Arc<MethodDescriptor>>,
}

impl Instance {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Register a method on this instance, replacing any prior entry.
    pub fn register_func<F>(&self, name: &str, description: &str, func: F)
    where
        F: Fn(&Arc<InboundCall>, &[Object]) -> MethodResult + Send + Sync + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Arc::new(MethodDescriptor {
                name: name.to_string(),
                description: Some(description.to_string()),
                func: Arc::new(func),
            }),
        );
    }

    fn find(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).map(|d| d.value().clone())
    }
}

struct ThreadPool {
    tx: Option<crossbeam::channel::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    fn new(size: usize) -> Self {
        let (tx, rx) = crossbeam::channel::unbounded::<Job>();
        let workers = (0..size)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("orpc-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    workers: usize,
    typing: Option<Arc<TypingContext>>,
}

impl ContextBuilder {
    /// Worker pool size (default 4).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Attach a typing context; enables call validation and the
    /// typing download service.
    pub fn typing(mut self, typing: Arc<TypingContext>) -> Self {
        self.typing = Some(typing);
        self
    }

    pub fn build(self) -> Arc<Context> {
        let context = Arc::new(Context {
            methods: DashMap::new(),
            instances: DashMap::new(),
            pool: ThreadPool::new(self.workers),
            servers: Mutex::new(Vec::new()),
            typing: self.typing,
        });
        context.register_instance("/", "root instance");
        if let Some(typing) = context.typing.clone() {
            context.register_func(
                &format!("{}.download", TYPING_INTERFACE),
                "stream the body of every loaded IDL file",
                move |call, _args| {
                    for body in typing.file_bodies() {
                        if call.yield_fragment(Object::string(body)).is_err() {
                            return Err(ErrorObject::new(libc::ECANCELED, "download aborted"));
                        }
                    }
                    Ok(Object::null())
                },
            );
        }
        context
    }
}

/// Registry of methods and instances plus the dispatch worker pool.
pub struct Context {
    methods: DashMap<String, Arc<MethodDescriptor>>,
    instances: DashMap<String, Arc<Instance>>,
    pool: ThreadPool,
    servers: Mutex<Vec<Arc<Server>>>,
    typing: Option<Arc<TypingContext>>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder {
            workers: 4,
            typing: None,
        }
    }

    /// Shorthand for `builder().build()`.
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    pub fn typing(&self) -> Option<&Arc<TypingContext>> {
        self.typing.as_ref()
    }

    /// Register a global method, replacing any prior entry with the
    /// same name. Use `Interface.method` names to make the method
    /// addressable (and validatable) through its interface.
    pub fn register_func<F>(&self, name: &str, description: &str, func: F)
    where
        F: Fn(&Arc<InboundCall>, &[Object]) -> MethodResult + Send + Sync + 'static,
    {
        if self.methods.contains_key(name) {
            log::debug!("context: replacing method '{}'", name);
        }
        self.methods.insert(
            name.to_string(),
            Arc::new(MethodDescriptor {
                name: name.to_string(),
                description: Some(description.to_string()),
                func: Arc::new(func),
            }),
        );
    }

    /// Remove a method. ENOENT when absent.
    pub fn unregister_method(&self, name: &str) -> Result<()> {
        self.methods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("method '{}'", name)))
    }

    /// Create (or fetch) the instance at `path`.
    pub fn register_instance(&self, path: &str, description: &str) -> Arc<Instance> {
        self.instances
            .entry(path.to_string())
            .or_insert_with(|| {
                Arc::new(Instance {
                    path: path.to_string(),
                    description: Some(description.to_string()),
                    methods: DashMap::new(),
                })
            })
            .clone()
    }

    pub fn find_instance(&self, path: &str) -> Option<Arc<Instance>> {
        self.instances.get(path).map(|i| i.value().clone())
    }

    fn resolve(&self, call: &InboundCall) -> Option<Arc<MethodDescriptor>> {
        let qualified = call
            .interface()
            .map(|iface| format!("{}.{}", iface, call.method()));
        if let Some(instance) = self.find_instance(call.path()) {
            if let Some(desc) = qualified.as_deref().and_then(|q| instance.find(q)) {
                return Some(desc);
            }
            if let Some(desc) = instance.find(call.method()) {
                return Some(desc);
            }
        }
        if let Some(desc) = qualified.as_deref().and_then(|q| self.methods.get(q)) {
            return Some(desc.clone());
        }
        self.methods.get(call.method()).map(|d| d.value().clone())
    }

    /// Enqueue an inbound call on the worker pool.
    pub(crate) fn dispatch(self: &Arc<Self>, call: Arc<InboundCall>) {
        let context = self.clone();
        self.pool.execute(Box::new(move || context.run_call(&call)));
    }

    fn run_call(&self, call: &Arc<InboundCall>) {
        let Some(descriptor) = self.resolve(call) else {
            call.respond_error(ErrorObject::new(libc::ENOENT, "Method not found"));
            return;
        };

        let interface = call
            .interface()
            .and_then(|name| self.typing.as_ref().map(|t| (t, name)))
            .and_then(|(typing, name)| typing.find_interface(name).map(|i| (typing.clone(), i)));

        // Pre-call hook: argument validation. The implementation is
        // not invoked on failure.
        if let Some((typing, iface)) = &interface {
            if let Err(error) = typing.validate_method_args(iface, call.method(), call.args()) {
                call.respond_error(error);
                return;
            }
        }

        match (descriptor.func)(call, call.args()) {
            Ok(value) => {
                if call.is_streaming() {
                    if !value.is_null() {
                        log::debug!(
                            "method '{}': discarding return value of streaming call",
                            descriptor.name
                        );
                    }
                    call.finish_stream();
                    return;
                }
                // Post-call hook: result validation.
                if let Some((typing, iface)) = &interface {
                    if let Err(error) =
                        typing.validate_method_result(iface, call.method(), &value)
                    {
                        log::warn!(
                            "method '{}': result failed validation",
                            descriptor.name
                        );
                        call.respond_error(error);
                        return;
                    }
                }
                call.respond(value);
            }
            Err(error) => {
                if call.aborted() && error.code == libc::ECANCELED {
                    log::debug!("method '{}': unwound after abort", descriptor.name);
                    return;
                }
                call.respond_error(error);
            }
        }
    }

    pub(crate) fn attach_server(&self, server: Arc<Server>) {
        self.servers.lock().push(server);
    }

    /// Detach a server. Err(NotFound) when it was never attached.
    pub(crate) fn detach_server(&self, server: &Arc<Server>) -> Result<()> {
        let mut servers = self.servers.lock();
        let before = servers.len();
        servers.retain(|s| !Arc::ptr_eq(s, server));
        if servers.len() == before {
            return Err(Error::NotFound("server not attached".into()));
        }
        Ok(())
    }

    /// Broadcast an event through every attached server.
    pub fn broadcast_event(&self, path: &str, interface: &str, name: &str, args: Object) {
        let servers: Vec<Arc<Server>> = self.servers.lock().clone();
        for server in servers {
            server.broadcast_event(path, interface, name, args.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_overwrites_and_unregister_errors_when_absent() {
        let ctx = Context::builder().workers(1).build();
        ctx.register_func("echo", "first", |_c, args| {
            Ok(args.first().cloned().unwrap_or_else(Object::null))
        });
        ctx.register_func("echo", "second", |_c, _a| Ok(Object::from(2i64)));
        assert!(ctx.unregister_method("echo").is_ok());
        let err = ctx.unregister_method("echo").unwrap_err();
        assert_eq!(err.code(), libc::ENOENT);
    }

    #[test]
    fn typing_context_registers_download_method() {
        let typing = TypingContext::new();
        let ctx = Context::builder().workers(1).typing(typing).build();
        assert!(ctx
            .methods
            .contains_key("com.twoporeguys.librpc.Typing.download"));
    }

    #[test]
    fn instances_hold_their_own_methods() {
        let ctx = Context::builder().workers(1).build();
        let instance = ctx.register_instance("/sensors", "sensor node");
        instance.register_func("read", "read sample", |_c, _a| Ok(Object::from(1.5)));
        assert!(ctx.find_instance("/sensors").is_some());
        assert!(ctx.find_instance("/actuators").is_none());
        assert!(instance.find("read").is_some());
    }
}
