// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios over the loopback transport.

use orpc::call::CallStatus;
use orpc::connection::Connection;
use orpc::context::Context;
use orpc::object::Object;
use orpc::server::{Server, ServerEvent};
use orpc::typing::TypingContext;
use orpc::{Error, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CALC_IDL: &str = r#"
meta:
  version: 1
  namespace: com.example

interface Calculator:
  method add:
    arguments:
      - name: a
        type: int64
      - name: b
        type: int64
    return: int64
"#;

fn calc_typing() -> Arc<TypingContext> {
    let typing = TypingContext::new();
    typing.load_str("calc.yaml", CALC_IDL).unwrap();
    typing
}

#[test]
fn ping_returns_null() {
    let context = Context::builder().workers(2).build();
    context.register_func("Builtin.ping", "liveness probe", |_call, _args| {
        Ok(Object::null())
    });
    let _server = Server::create("loopback://it-ping", &context).unwrap();

    let conn = Connection::connect("loopback://it-ping").unwrap();
    let call = conn.call("Builtin.ping", &[]).unwrap();
    match call.wait().unwrap() {
        Response::Single(result) => assert!(result.is_null()),
        Response::Stream(_) => panic!("ping must not stream"),
    }
}

#[test]
fn unknown_method_is_enoent() {
    let context = Context::builder().workers(1).build();
    let _server = Server::create("loopback://it-enoent", &context).unwrap();

    let conn = Connection::connect("loopback://it-enoent").unwrap();
    let err = conn.call("no.such.method", &[]).unwrap().wait().unwrap_err();
    assert_eq!(err.code(), libc::ENOENT);
}

#[test]
fn typed_add_validates_arguments() {
    let context = Context::builder().workers(2).typing(calc_typing()).build();
    context.register_func("com.example.Calculator.add", "add two int64", |_call, args| {
        let a = args[0].as_integer().unwrap_or_default();
        let b = args[1].as_integer().unwrap_or_default();
        Ok(Object::int64(a + b))
    });
    let _server = Server::create("loopback://it-add", &context).unwrap();

    let conn = Connection::connect("loopback://it-add").unwrap();

    // Valid call goes through and returns 5.
    let call = conn
        .call_on(
            "/",
            Some("com.example.Calculator"),
            "add",
            &[Object::int64(2), Object::int64(3)],
        )
        .unwrap();
    match call.wait().unwrap() {
        Response::Single(result) => assert_eq!(result.as_integer(), Some(5)),
        Response::Stream(_) => panic!("add must not stream"),
    }

    // Invalid call is rejected without reaching the implementation.
    let call = conn
        .call_on(
            "/",
            Some("com.example.Calculator"),
            "add",
            &[Object::from("x"), Object::int64(3)],
        )
        .unwrap();
    let err = call.wait().unwrap_err();
    assert_eq!(err.code(), libc::EINVAL);
    let Error::Remote(remote) = err else {
        panic!("expected a remote error");
    };
    assert_eq!(remote.message, "Validation failed");
    let extra = remote.extra.expect("validation error array");
    assert_eq!(extra.len(), 1);
    let entry = extra.get(0).unwrap();
    let path = entry.dict_get("path").unwrap();
    assert_eq!(path.as_str(), Some(".0"));
    let message = entry.dict_get("message").unwrap();
    assert_eq!(
        message.as_str(),
        Some("Incompatible type string, should be int64")
    );
}

#[test]
fn argument_count_mismatch_rejected() {
    let invoked = Arc::new(AtomicBool::new(false));
    let context = Context::builder().workers(1).typing(calc_typing()).build();
    {
        let invoked = invoked.clone();
        context.register_func("com.example.Calculator.add", "add", move |_call, _args| {
            invoked.store(true, Ordering::SeqCst);
            Ok(Object::int64(0))
        });
    }
    let _server = Server::create("loopback://it-arity", &context).unwrap();

    let conn = Connection::connect("loopback://it-arity").unwrap();
    let err = conn
        .call_on("/", Some("com.example.Calculator"), "add", &[Object::int64(1)])
        .unwrap()
        .wait()
        .unwrap_err();
    assert_eq!(err.code(), libc::EINVAL);
    assert!(!invoked.load(Ordering::SeqCst));
}

#[test]
fn streaming_yields_fragments_in_order() {
    let context = Context::builder().workers(2).build();
    context.register_func("count", "yield 1, 2, 3", |call, _args| {
        for i in 1..=3i64 {
            if call.yield_fragment(Object::int64(i)).is_err() {
                return Err(orpc::ErrorObject::new(libc::ECANCELED, "aborted"));
            }
        }
        Ok(Object::null())
    });
    let _server = Server::create("loopback://it-stream", &context).unwrap();

    let conn = Connection::connect("loopback://it-stream").unwrap();
    let call = conn.call("count", &[]).unwrap();
    let Response::Stream(stream) = call.wait().unwrap() else {
        panic!("expected a stream");
    };
    let mut got = Vec::new();
    let mut stream = stream;
    for item in stream.by_ref() {
        got.push(item.unwrap().as_integer().unwrap());
    }
    assert_eq!(got, vec![1, 2, 3]);
    assert_eq!(stream.status(), CallStatus::Done);
}

#[test]
fn timeout_aborts_server_side_call() {
    let aborted_at = Arc::new(parking_lot::Mutex::new(None::<Instant>));
    let context = Context::builder().workers(2).build();
    {
        let aborted_at = aborted_at.clone();
        context.register_func("slow", "sleep 500ms", move |call, _args| {
            for _ in 0..50 {
                if call.aborted() {
                    *aborted_at.lock() = Some(Instant::now());
                    return Err(orpc::ErrorObject::new(libc::ECANCELED, "aborted"));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(Object::null())
        });
    }
    let _server = Server::create("loopback://it-timeout", &context).unwrap();

    let conn = Connection::connect("loopback://it-timeout").unwrap();
    let started = Instant::now();
    let err = conn
        .call("slow", &[])
        .unwrap()
        .wait_timeout(Duration::from_millis(50))
        .unwrap_err();
    let timed_out_at = Instant::now();
    assert!(matches!(err, Error::TimedOut));
    assert_eq!(err.code(), libc::ETIMEDOUT);
    assert!(started.elapsed() < Duration::from_millis(400));

    // The producer must observe the abort promptly after the expiry.
    let deadline = Instant::now() + Duration::from_millis(500);
    loop {
        if let Some(at) = *aborted_at.lock() {
            assert!(at.duration_since(timed_out_at) < Duration::from_millis(100));
            break;
        }
        assert!(Instant::now() < deadline, "server never observed the abort");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn explicit_abort_cancels_call() {
    let context = Context::builder().workers(2).build();
    context.register_func("hang", "sleep until aborted", |call, _args| {
        while !call.aborted() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(orpc::ErrorObject::new(libc::ECANCELED, "aborted"))
    });
    let _server = Server::create("loopback://it-abort", &context).unwrap();

    let conn = Connection::connect("loopback://it-abort").unwrap();
    let call = conn.call("hang", &[]).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    call.abort().unwrap();
    assert_eq!(call.status(), CallStatus::Error);
}

#[test]
fn event_broadcast_reaches_both_subscribers() {
    let context = Context::builder().workers(2).build();
    let server = Server::create("loopback://it-events", &context).unwrap();

    let (tx1, rx1) = crossbeam::channel::unbounded::<i64>();
    let (tx2, rx2) = crossbeam::channel::unbounded::<i64>();

    let conn1 = Connection::connect("loopback://it-events").unwrap();
    conn1
        .subscribe(
            "/",
            "com.ex.Bus",
            "tick",
            Arc::new(move |args| {
                let _ = tx1.send(args.as_integer().unwrap_or(-1));
            }),
        )
        .unwrap();

    let conn2 = Connection::connect("loopback://it-events").unwrap();
    conn2
        .subscribe(
            "/",
            "com.ex.Bus",
            "tick",
            Arc::new(move |args| {
                let _ = tx2.send(args.as_integer().unwrap_or(-1));
            }),
        )
        .unwrap();

    // Let the subscribe frames land before broadcasting.
    std::thread::sleep(Duration::from_millis(50));
    server.broadcast_event("/", "com.ex.Bus", "tick", Object::uint64(42));

    assert_eq!(rx1.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    assert_eq!(rx2.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    // Exactly one event each.
    assert!(rx1.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(rx2.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn unsubscribed_connection_sees_nothing() {
    let context = Context::builder().workers(1).build();
    let server = Server::create("loopback://it-nosub", &context).unwrap();

    let (tx, rx) = crossbeam::channel::unbounded::<i64>();
    let conn = Connection::connect("loopback://it-nosub").unwrap();
    conn.subscribe(
        "/",
        "com.ex.Bus",
        "tick",
        Arc::new(move |args| {
            let _ = tx.send(args.as_integer().unwrap_or(-1));
        }),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    conn.unsubscribe("/", "com.ex.Bus", "tick").unwrap();
    std::thread::sleep(Duration::from_millis(50));

    server.broadcast_event("/", "com.ex.Bus", "tick", Object::uint64(7));
    assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
}

#[test]
fn call_async_reports_completion() {
    let context = Context::builder().workers(2).build();
    context.register_func("echo", "return the first argument", |_call, args| {
        Ok(args.first().cloned().unwrap_or_else(Object::null))
    });
    let _server = Server::create("loopback://it-async", &context).unwrap();

    let conn = Connection::connect("loopback://it-async").unwrap();
    let (tx, rx) = crossbeam::channel::unbounded::<(CallStatus, Option<Object>)>();
    let _call = conn
        .call_async(
            "echo",
            &[Object::int64(7)],
            Arc::new(move |status, value| {
                let _ = tx.send((status, value));
            }),
        )
        .unwrap();

    let (status, value) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(status, CallStatus::Done);
    assert_eq!(value.and_then(|v| v.as_integer()), Some(7));
    // Terminal means terminal: no further callbacks.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn call_async_abort_fires_callback_once() {
    let context = Context::builder().workers(2).build();
    context.register_func("hang", "sleep until aborted", |call, _args| {
        while !call.aborted() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(orpc::ErrorObject::new(libc::ECANCELED, "aborted"))
    });
    let _server = Server::create("loopback://it-async-abort", &context).unwrap();

    let conn = Connection::connect("loopback://it-async-abort").unwrap();
    let (tx, rx) = crossbeam::channel::unbounded::<CallStatus>();
    let call = conn
        .call_async(
            "hang",
            &[],
            Arc::new(move |status, _value| {
                let _ = tx.send(status);
            }),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    call.abort().unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        CallStatus::Error
    );
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn typing_download_pulls_idl_files() {
    let context = Context::builder().workers(2).typing(calc_typing()).build();
    let _server = Server::create("loopback://it-download", &context).unwrap();

    let client_typing = TypingContext::new();
    assert!(client_typing.find_interface("com.example.Calculator").is_none());
    let conn = Connection::builder("loopback://it-download")
        .typing(client_typing.clone())
        .connect()
        .unwrap();
    let count = conn.download_idl().unwrap();
    assert_eq!(count, 1);
    assert!(client_typing.find_interface("com.example.Calculator").is_some());
}

#[test]
fn server_close_drains_connections() {
    let context = Context::builder().workers(2).build();
    context.register_func("Builtin.ping", "ping", |_c, _a| Ok(Object::null()));
    let server = Server::create("loopback://it-close", &context).unwrap();

    let conn1 = Connection::connect("loopback://it-close").unwrap();
    let conn2 = Connection::connect("loopback://it-close").unwrap();
    conn1.call("Builtin.ping", &[]).unwrap().wait().unwrap();
    conn2.call("Builtin.ping", &[]).unwrap().wait().unwrap();
    assert_eq!(server.connection_count(), 2);

    server.close().unwrap();
    assert_eq!(server.connection_count(), 0);
    assert!(server.is_closed());

    // Closing twice fails: the server is no longer attached.
    let err = server.close().unwrap_err();
    assert_eq!(err.code(), libc::ENOENT);

    // The clients observe the reset: either at send time or through
    // the outstanding-call sweep.
    let err = match conn1.call("Builtin.ping", &[]) {
        Err(e) => e,
        Ok(call) => call.wait().unwrap_err(),
    };
    assert_eq!(err.code(), libc::ECONNRESET);
}

#[test]
fn server_event_handler_sees_lifecycle() {
    let context = Context::builder().workers(1).build();
    let server = Server::create("loopback://it-lifecycle", &context).unwrap();
    let (tx, rx) = crossbeam::channel::unbounded::<ServerEvent>();
    server.set_event_handler(move |_conn, event| {
        let _ = tx.send(event);
    });

    let conn = Connection::connect("loopback://it-lifecycle").unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        ServerEvent::ConnectionArrived
    );
    conn.close().unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        ServerEvent::ConnectionTerminated
    );
}

#[test]
fn peer_credentials_are_exposed() {
    let context = Context::builder().workers(1).build();
    context.register_func("Builtin.ping", "ping", |_c, _a| Ok(Object::null()));
    let server = Server::create("loopback://it-creds", &context).unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    server.set_event_handler(move |conn, event| {
        if event == ServerEvent::ConnectionArrived {
            let _ = tx.send(conn.clone());
        }
    });

    let conn = Connection::connect("loopback://it-creds").unwrap();
    conn.call("Builtin.ping", &[]).unwrap().wait().unwrap();

    let server_conn = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    // The first inbound message carried our own credentials.
    let deadline = Instant::now() + Duration::from_secs(1);
    let creds = loop {
        if let Some(creds) = server_conn.credentials() {
            break creds;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(creds.pid, unsafe { libc::getpid() });
    assert_eq!(creds.uid, unsafe { libc::getuid() });
}
