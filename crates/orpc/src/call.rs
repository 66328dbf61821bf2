// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Call handles: the state machines driving outbound and inbound
//! calls.
//!
//! An outbound call parks a [`CallHandle`] keyed by id on its
//! connection; incoming frames drive the handle until a terminal
//! state. Streaming results surface as a [`CallStream`] iterator that
//! requests each next fragment with a `continue` frame.
//!
//! An inbound call mirrors the producer side: `yield_fragment` sends
//! one fragment and blocks until the peer's `continue` catches up or
//! the call is aborted.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::object::{ErrorObject, Object};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outbound call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Frame sent, nothing received yet.
    InProgress,
    /// At least one fragment arrived; more may follow.
    MoreAvailable,
    /// Terminal: single response or end-of-stream received.
    Done,
    /// Terminal: error, cancellation, timeout or transport failure.
    Error,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// Async completion callback: invoked with the status and the latest
/// result or fragment for every transition.
pub type CallCallback = Arc<dyn Fn(CallStatus, Option<Object>) + Send + Sync>;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct CallState {
    pub status: CallStatus,
    pub result: Option<Object>,
    pub fragments: VecDeque<Object>,
    pub error: Option<ErrorObject>,
    /// Expired locally; the peer still believes the call is live.
    pub timed_out: bool,
}

/// Shared state of one outbound call.
pub struct CallHandle {
    id: u64,
    method: String,
    state: Mutex<CallState>,
    cond: Condvar,
    callback: Option<CallCallback>,
    worker: crossbeam::channel::Sender<Job>,
}

impl CallHandle {
    pub(crate) fn new(
        id: u64,
        method: String,
        callback: Option<CallCallback>,
        worker: crossbeam::channel::Sender<Job>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            method,
            state: Mutex::new(CallState {
                status: CallStatus::InProgress,
                result: None,
                fragments: VecDeque::new(),
                error: None,
                timed_out: false,
            }),
            cond: Condvar::new(),
            callback,
            worker,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn status(&self) -> CallStatus {
        self.state.lock().status
    }

    fn emit(&self, status: CallStatus, value: Option<Object>) {
        if let Some(cb) = &self.callback {
            let cb = cb.clone();
            let _ = self.worker.send(Box::new(move || cb(status, value)));
        }
    }

    pub(crate) fn on_response(&self, result: Object) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            log::debug!("call {}: response after terminal state, dropped", self.id);
            return;
        }
        st.status = CallStatus::Done;
        st.result = Some(result.clone());
        self.cond.notify_all();
        drop(st);
        self.emit(CallStatus::Done, Some(result));
    }

    pub(crate) fn on_fragment(&self, seqno: u64, value: Object) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            log::debug!(
                "call {}: fragment {} after terminal state, dropped",
                self.id,
                seqno
            );
            return;
        }
        st.status = CallStatus::MoreAvailable;
        st.fragments.push_back(value.clone());
        self.cond.notify_all();
        drop(st);
        self.emit(CallStatus::MoreAvailable, Some(value));
    }

    pub(crate) fn on_end(&self) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            log::debug!("call {}: end after terminal state, dropped", self.id);
            return;
        }
        st.status = CallStatus::Done;
        self.cond.notify_all();
        drop(st);
        self.emit(CallStatus::Done, None);
    }

    pub(crate) fn on_error(&self, error: ErrorObject) {
        let mut st = self.state.lock();
        if st.status.is_terminal() {
            log::debug!("call {}: error after terminal state, dropped", self.id);
            return;
        }
        st.status = CallStatus::Error;
        st.error = Some(error.clone());
        self.cond.notify_all();
        drop(st);
        self.emit(CallStatus::Error, Some(Object::error(error)));
    }
}

/// Result of a completed call: one value, or a fragment stream.
pub enum Response {
    Single(Object),
    Stream(CallStream),
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Single(obj) => f.debug_tuple("Single").field(obj).finish(),
            Response::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// An outbound call in flight.
///
/// Dropping a call whose state is still live abandons it: an `abort`
/// frame tells the producer to stop.
pub struct Call {
    conn: Arc<Connection>,
    handle: Arc<CallHandle>,
    armed: AtomicBool,
}

impl Call {
    pub(crate) fn new(conn: Arc<Connection>, handle: Arc<CallHandle>) -> Self {
        Self {
            conn,
            handle,
            armed: AtomicBool::new(true),
        }
    }

    /// Async variant: completion is reported through the callback, so
    /// dropping the handle must not cancel the call.
    pub(crate) fn new_detached(conn: Arc<Connection>, handle: Arc<CallHandle>) -> Self {
        Self {
            conn,
            handle,
            armed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn status(&self) -> CallStatus {
        self.handle.status()
    }

    /// Block until the call leaves `InProgress`.
    pub fn wait(self) -> Result<Response> {
        self.wait_inner(None)
    }

    /// Block with a deadline. On expiry the local state becomes
    /// `Error` (ETIMEDOUT) and the call is abandoned.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Response> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(self, timeout: Option<Duration>) -> Result<Response> {
        self.armed.store(false, Ordering::Release);
        let handle = self.handle.clone();
        let conn = self.conn.clone();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let mut st = handle.state.lock();
        while st.status == CallStatus::InProgress {
            match deadline {
                None => handle.cond.wait(&mut st),
                Some(deadline) => {
                    if handle.cond.wait_until(&mut st, deadline).timed_out()
                        && st.status == CallStatus::InProgress
                    {
                        st.status = CallStatus::Error;
                        st.error = Some(ErrorObject::new(libc::ETIMEDOUT, "Call timed out"));
                        st.timed_out = true;
                        drop(st);
                        handle.emit(CallStatus::Error, None);
                        abandon(&conn, &handle);
                        return Err(Error::TimedOut);
                    }
                }
            }
        }
        match st.status {
            CallStatus::Done => {
                if !st.fragments.is_empty() {
                    // The whole stream arrived before we looked.
                    drop(st);
                    return Ok(Response::Stream(CallStream {
                        conn,
                        handle,
                        finished: false,
                    }));
                }
                let result = st.result.take().unwrap_or_else(Object::null);
                drop(st);
                conn.forget_call(handle.id());
                Ok(Response::Single(result))
            }
            CallStatus::MoreAvailable => {
                drop(st);
                Ok(Response::Stream(CallStream {
                    conn,
                    handle,
                    finished: false,
                }))
            }
            CallStatus::Error => {
                let error = st
                    .error
                    .take()
                    .unwrap_or_else(|| ErrorObject::new(libc::EIO, "call failed"));
                drop(st);
                conn.forget_call(handle.id());
                Err(Error::from(error))
            }
            CallStatus::InProgress => unreachable!("loop exits only on transition"),
        }
    }

    /// Cancel the call. The state becomes `Error` (ECANCELED) and the
    /// async callback, if any, fires once more.
    pub fn abort(&self) -> Result<()> {
        self.armed.store(false, Ordering::Release);
        let _ = self.conn.send_frame(&Frame::Abort {
            id: self.handle.id(),
        });
        self.handle
            .on_error(ErrorObject::new(libc::ECANCELED, "Call aborted"));
        self.conn.forget_call(self.handle.id());
        Ok(())
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }
        let live = {
            let st = self.handle.state.lock();
            !st.status.is_terminal() || st.timed_out
        };
        if live {
            abandon(&self.conn, &self.handle);
        } else {
            self.conn.forget_call(self.handle.id());
        }
    }
}

/// Abandon a call the peer still considers live: tell it to stop and
/// drop the local bookkeeping.
fn abandon(conn: &Arc<Connection>, handle: &Arc<CallHandle>) {
    let _ = conn.send_frame(&Frame::Abort { id: handle.id() });
    {
        let mut st = handle.state.lock();
        if !st.status.is_terminal() {
            st.status = CallStatus::Error;
            st.error = Some(ErrorObject::new(libc::ECANCELED, "Call aborted"));
            handle.cond.notify_all();
        }
    }
    conn.forget_call(handle.id());
}

/// Iterator over streaming fragments.
///
/// Each consumed fragment is acknowledged with a `continue` frame;
/// iteration ends on `end` (returning `None`) or yields one final
/// `Err` on failure.
pub struct CallStream {
    conn: Arc<Connection>,
    handle: Arc<CallHandle>,
    finished: bool,
}

impl std::fmt::Debug for CallStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("id", &self.handle.id())
            .field("finished", &self.finished)
            .finish()
    }
}

impl CallStream {
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn status(&self) -> CallStatus {
        self.handle.status()
    }

    /// Cancel the stream without draining it.
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        abandon(&self.conn, &self.handle);
    }
}

impl Iterator for CallStream {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let handle = self.handle.clone();
        let mut st = handle.state.lock();
        loop {
            if let Some(value) = st.fragments.pop_front() {
                let live = !st.status.is_terminal();
                drop(st);
                if live {
                    let _ = self.conn.send_frame(&Frame::Continue {
                        id: self.handle.id(),
                    });
                }
                return Some(Ok(value));
            }
            match st.status {
                CallStatus::Done => {
                    drop(st);
                    self.finished = true;
                    self.conn.forget_call(self.handle.id());
                    return None;
                }
                CallStatus::Error => {
                    let error = st
                        .error
                        .take()
                        .unwrap_or_else(|| ErrorObject::new(libc::EIO, "stream failed"));
                    drop(st);
                    self.finished = true;
                    self.conn.forget_call(self.handle.id());
                    return Some(Err(Error::from(error)));
                }
                CallStatus::InProgress | CallStatus::MoreAvailable => {
                    handle.cond.wait(&mut st);
                }
            }
        }
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.handle.status().is_terminal() {
            abandon(&self.conn, &self.handle);
        } else {
            self.conn.forget_call(self.handle.id());
        }
    }
}

struct InboundState {
    producer_seqno: u64,
    consumer_seqno: u64,
    streaming: bool,
    responded: bool,
    aborted: bool,
}

/// Server-side handle tracking one inbound call.
pub struct InboundCall {
    id: u64,
    path: String,
    interface: Option<String>,
    method: String,
    args: Vec<Object>,
    conn: Weak<Connection>,
    state: Mutex<InboundState>,
    cond: Condvar,
}

impl InboundCall {
    pub(crate) fn new(
        id: u64,
        path: String,
        interface: Option<String>,
        method: String,
        args: Vec<Object>,
        conn: Weak<Connection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            path,
            interface,
            method,
            args,
            conn,
            state: Mutex::new(InboundState {
                producer_seqno: 0,
                consumer_seqno: 0,
                streaming: false,
                responded: false,
                aborted: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Object] {
        &self.args
    }

    /// Has the peer (or the connection teardown) cancelled this call?
    pub fn aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let conn = self.conn.upgrade().ok_or(Error::ConnectionReset)?;
        conn.send_frame(frame)
    }

    /// Send one fragment, then block until the consumer requests the
    /// next one. `Err(Canceled)` once the call is aborted; the
    /// producer is expected to unwind.
    pub fn yield_fragment(&self, value: Object) -> Result<()> {
        let seqno = {
            let mut st = self.state.lock();
            if st.aborted {
                return Err(Error::Canceled);
            }
            if st.responded {
                return Err(Error::Invalid("call already responded".into()));
            }
            st.streaming = true;
            let seqno = st.producer_seqno;
            st.producer_seqno += 1;
            seqno
        };
        self.send(&Frame::Fragment {
            id: self.id,
            seqno,
            value,
        })?;
        let mut st = self.state.lock();
        while st.consumer_seqno < st.producer_seqno && !st.aborted {
            self.cond.wait(&mut st);
        }
        if st.aborted {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn respond(&self, result: Object) {
        if !self.mark_responded("response") {
            return;
        }
        if let Err(e) = self.send(&Frame::Response {
            id: self.id,
            result,
        }) {
            log::debug!("inbound call {}: response send failed: {}", self.id, e);
        }
        self.forget();
    }

    pub(crate) fn respond_error(&self, error: ErrorObject) {
        if !self.mark_responded("error") {
            return;
        }
        if let Err(e) = self.send(&Frame::Error { id: self.id, error }) {
            log::debug!("inbound call {}: error send failed: {}", self.id, e);
        }
        self.forget();
    }

    pub(crate) fn finish_stream(&self) {
        let seqno = {
            let st = self.state.lock();
            st.producer_seqno
        };
        if !self.mark_responded("end") {
            return;
        }
        if let Err(e) = self.send(&Frame::End { id: self.id, seqno }) {
            log::debug!("inbound call {}: end send failed: {}", self.id, e);
        }
        self.forget();
    }

    /// Drop the connection-side bookkeeping once the terminal frame
    /// is out; late `continue`/`abort` frames are then ignored.
    fn forget(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.finish_inbound(self.id);
        }
    }

    /// Claim the single terminal frame. A second responder loses and
    /// the duplicate is dropped.
    fn mark_responded(&self, what: &str) -> bool {
        let mut st = self.state.lock();
        if st.aborted {
            log::debug!("inbound call {}: {} after abort, dropped", self.id, what);
            return false;
        }
        if st.responded {
            log::debug!("inbound call {}: duplicate {}, dropped", self.id, what);
            return false;
        }
        st.responded = true;
        true
    }

    pub(crate) fn on_continue(&self) {
        let mut st = self.state.lock();
        if st.responded {
            log::debug!("inbound call {}: continue after terminal, ignored", self.id);
            return;
        }
        st.consumer_seqno += 1;
        self.cond.notify_all();
    }

    pub(crate) fn on_abort(&self) {
        let mut st = self.state.lock();
        st.aborted = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_drop_late_frames() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let handle = CallHandle::new(1, "m".into(), None, tx);
        handle.on_response(Object::from(1i64));
        assert_eq!(handle.status(), CallStatus::Done);
        // Late frames must not disturb the terminal state.
        handle.on_fragment(0, Object::from(2i64));
        handle.on_error(ErrorObject::new(libc::EIO, "late"));
        assert_eq!(handle.status(), CallStatus::Done);
        assert_eq!(handle.state.lock().result, Some(Object::from(1i64)));
    }

    #[test]
    fn fragments_queue_in_order() {
        let (tx, _rx) = crossbeam::channel::unbounded();
        let handle = CallHandle::new(2, "m".into(), None, tx);
        handle.on_fragment(0, Object::from(1i64));
        handle.on_fragment(1, Object::from(2i64));
        assert_eq!(handle.status(), CallStatus::MoreAvailable);
        let st = handle.state.lock();
        assert_eq!(st.fragments.len(), 2);
        assert_eq!(st.fragments[0], Object::from(1i64));
    }

    #[test]
    fn callback_fires_per_transition() {
        let (tx, rx) = crossbeam::channel::unbounded::<Job>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb: CallCallback = {
            let seen = seen.clone();
            Arc::new(move |status, _| seen.lock().push(status))
        };
        let handle = CallHandle::new(3, "m".into(), Some(cb), tx);
        handle.on_fragment(0, Object::null());
        handle.on_end();
        while let Ok(job) = rx.try_recv() {
            job();
        }
        assert_eq!(
            *seen.lock(),
            vec![CallStatus::MoreAvailable, CallStatus::Done]
        );
    }
}
