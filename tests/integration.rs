//! End-to-end tests: two connections (or a connection against a raw wire
//! peer) over an in-memory duplex pipe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use muxwire::protocol::{build_packet, BodyType, Decoded, Packet, PacketDecoder};
use muxwire::{BodyValue, CallError, Connection, MuxError, Registry};

fn connect(a: Registry, b: Registry) -> (Connection, Connection) {
    let (left, right) = duplex(256 * 1024);
    (
        Connection::builder(a).spawn(left),
        Connection::builder(b).spawn(right),
    )
}

/// A peer speaking raw packet bytes, for wire-level scenarios a well-behaved
/// `Connection` cannot produce.
struct RawPeer {
    io: DuplexStream,
    decoder: PacketDecoder,
    queue: VecDeque<Decoded>,
}

impl RawPeer {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            decoder: PacketDecoder::new(),
            queue: VecDeque::new(),
        }
    }

    async fn next_packet(&mut self) -> Packet {
        loop {
            if let Some(item) = self.queue.pop_front() {
                match item {
                    Decoded::Packet(p) => return p,
                    Decoded::Goodbye => panic!("unexpected goodbye"),
                }
            }
            let mut buf = [0u8; 8192];
            let n = self.io.read(&mut buf).await.unwrap();
            assert!(n > 0, "unexpected EOF from connection under test");
            self.queue.extend(self.decoder.push(&buf[..n]).unwrap());
        }
    }

    async fn next_goodbye(&mut self) {
        loop {
            if let Some(item) = self.queue.pop_front() {
                match item {
                    Decoded::Goodbye => return,
                    Decoded::Packet(_) => continue,
                }
            }
            let mut buf = [0u8; 8192];
            let n = self.io.read(&mut buf).await.unwrap();
            assert!(n > 0, "unexpected EOF while waiting for goodbye");
            self.queue.extend(self.decoder.push(&buf[..n]).unwrap());
        }
    }

    async fn write_packet(&mut self, pkt: &Packet) {
        self.io.write_all(&build_packet(pkt)).await.unwrap();
        self.io.flush().await.unwrap();
    }
}

fn to_call_error(e: MuxError) -> CallError {
    e.into_call_error()
}

#[tokio::test]
async fn async_call_resolves_with_value() {
    let mut registry = Registry::new();
    registry.register_async("echo", |args| async move {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    });

    let (client, _server) = connect(Registry::new(), registry);

    let reply: String = client.call_async("echo", vec![json!("hello")]).await.unwrap();
    assert_eq!(reply, "hello");
}

#[tokio::test]
async fn handler_error_resolves_as_remote_error() {
    let mut registry = Registry::new();
    registry.register_async("fail", |_args| async move {
        Err(CallError::new("intentional"))
    });

    let (client, _server) = connect(Registry::new(), registry);

    let result: muxwire::Result<Value> = client.call_async("fail", vec![]).await;
    match result {
        Err(MuxError::Remote(e)) => {
            assert_eq!(e.message, "intentional");
            assert_eq!(e.name, "Error");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn crafted_error_response_resolves_as_error() {
    // The raw peer answers with the literal error object body.
    let (client_io, raw_io) = duplex(64 * 1024);
    let client = Connection::builder(Registry::new()).spawn(client_io);
    let mut raw = RawPeer::new(raw_io);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<Value>("anything", vec![]).await }
    });

    let request = raw.next_packet().await;
    let body = Bytes::from(
        serde_json::to_vec(&json!({"message": "intentional", "name": "Error"})).unwrap(),
    );
    raw.write_packet(&Packet::response(-request.id, body)).await;

    match call.await.unwrap() {
        Err(MuxError::Remote(e)) => assert_eq!(e.message, "intentional"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_method_is_rejected_in_band() {
    let (client, _server) = connect(Registry::new(), Registry::new());

    let result: muxwire::Result<Value> = client.call_async("nope", vec![]).await;
    match result {
        Err(MuxError::Remote(e)) => assert!(e.message.contains("no such method")),
        other => panic!("expected remote error, got {other:?}"),
    }

    // The connection survives a rejected call.
    assert!(client.is_open());
}

#[tokio::test]
async fn kind_mismatch_is_rejected_in_band() {
    let mut registry = Registry::new();
    registry.register_source("tail", |_args, tx| async move {
        tx.send_json(&1).await.ok();
        Ok(())
    });

    let (client, _server) = connect(Registry::new(), registry);

    let result: muxwire::Result<Value> = client.call_async("tail", vec![]).await;
    match result {
        Err(MuxError::Remote(e)) => assert!(e.message.contains("declared source")),
        other => panic!("expected remote error, got {other:?}"),
    }

    // Calling with the declared kind still works afterwards.
    let mut rx = client.source("tail", vec![]).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Some(BodyValue::Json(json!(1))));
    assert_eq!(rx.recv().await.unwrap(), None);
}

#[tokio::test]
async fn source_delivers_values_in_order_then_ends() {
    let mut registry = Registry::new();
    registry.register_source("count", |args, tx| async move {
        let n = args[0].as_i64().unwrap_or(0);
        for i in 1..=n {
            tx.send_json(&i).await.map_err(to_call_error)?;
        }
        Ok(())
    });

    let (client, _server) = connect(Registry::new(), registry);

    let rx = client.source("count", vec![json!(3)]).await.unwrap();
    let items = rx.collect().await.unwrap();
    assert_eq!(
        items,
        vec![
            BodyValue::Json(json!(1)),
            BodyValue::Json(json!(2)),
            BodyValue::Json(json!(3)),
        ]
    );
}

#[tokio::test]
async fn source_error_end_reaches_the_consumer() {
    let mut registry = Registry::new();
    registry.register_source("broken", |_args, tx| async move {
        tx.send_json(&"one").await.map_err(to_call_error)?;
        Err(CallError::new("stream blew up"))
    });

    let (client, _server) = connect(Registry::new(), registry);

    let mut rx = client.source("broken", vec![]).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Some(BodyValue::Json(json!("one"))));
    match rx.recv().await {
        Err(MuxError::Remote(e)) => assert_eq!(e.message, "stream blew up"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn sink_delivers_every_item_in_order() {
    let store: Arc<Mutex<Vec<BodyValue>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Notify::new());

    let mut registry = Registry::new();
    {
        let store = store.clone();
        let done = done.clone();
        registry.register_sink("collect", move |_args, mut rx| {
            let store = store.clone();
            let done = done.clone();
            async move {
                while let Some(v) = rx.recv().await.map_err(to_call_error)? {
                    store.lock().unwrap().push(v);
                }
                done.notify_one();
                Ok(())
            }
        });
    }

    let (client, _server) = connect(Registry::new(), registry);

    let tx = client.sink("collect", vec![]).await.unwrap();
    tx.send_json(&"a").await.unwrap();
    tx.send("raw text").await.unwrap();
    tx.send(Bytes::from_static(b"\x00\x01")).await.unwrap();
    tx.end().await.unwrap();

    done.notified().await;

    let items = store.lock().unwrap().clone();
    assert_eq!(
        items,
        vec![
            BodyValue::Json(json!("a")),
            BodyValue::Text("raw text".to_string()),
            BodyValue::Binary(Bytes::from_static(b"\x00\x01")),
        ]
    );
}

#[tokio::test]
async fn sends_after_end_fail() {
    let mut registry = Registry::new();
    registry.register_sink("drain", |_args, mut rx| async move {
        while rx.recv().await.map_err(to_call_error)?.is_some() {}
        Ok(())
    });

    let (client, _server) = connect(Registry::new(), registry);

    let tx = client.sink("drain", vec![]).await.unwrap();
    tx.send_json(&1).await.unwrap();
    tx.end().await.unwrap();

    let result = tx.send_json(&2).await;
    assert!(matches!(result, Err(MuxError::ConnectionClosed)));
}

#[tokio::test]
async fn duplex_echoes_both_directions() {
    let mut registry = Registry::new();
    registry.register_duplex("chat", |_args, tx, mut rx| async move {
        while let Some(v) = rx.recv().await.map_err(to_call_error)? {
            tx.send(v).await.map_err(to_call_error)?;
        }
        Ok(())
    });

    let (client, _server) = connect(Registry::new(), registry);

    let (tx, mut rx) = client.duplex("chat", vec![]).await.unwrap();

    tx.send_json(&"ping").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Some(BodyValue::Json(json!("ping"))));

    tx.send_json(&"pong").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Some(BodyValue::Json(json!("pong"))));

    // Ending our write side drains the handler, which then ends its own.
    tx.end().await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), None);
}

#[tokio::test]
async fn overlapping_calls_complete_out_of_order() {
    let release = Arc::new(Notify::new());

    let mut registry = Registry::new();
    {
        let release = release.clone();
        registry.register_async("slow", move |_args| {
            let release = release.clone();
            async move {
                release.notified().await;
                Ok(json!("slow done"))
            }
        });
    }
    registry.register_async("fast", |_args| async move { Ok(json!("fast done")) });

    let (client, _server) = connect(Registry::new(), registry);

    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<String>("slow", vec![]).await }
    });

    // The fast call completes while the slow one is still outstanding.
    let fast: String = client.call_async("fast", vec![]).await.unwrap();
    assert_eq!(fast, "fast done");
    assert!(!slow.is_finished());

    release.notify_one();
    assert_eq!(slow.await.unwrap().unwrap(), "slow done");
}

#[tokio::test]
async fn duplicate_response_is_ignored() {
    let (client_io, raw_io) = duplex(64 * 1024);
    let client = Connection::builder(Registry::new()).spawn(client_io);
    let mut raw = RawPeer::new(raw_io);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<String>("m", vec![]).await }
    });

    let request = raw.next_packet().await;
    let first = Bytes::from(serde_json::to_vec(&json!("first")).unwrap());
    let second = Bytes::from(serde_json::to_vec(&json!("second")).unwrap());
    raw.write_packet(&Packet::response(-request.id, first)).await;
    raw.write_packet(&Packet::response(-request.id, second)).await;

    // Exactly one delivery, and it is the first response.
    assert_eq!(call.await.unwrap().unwrap(), "first");

    // The duplicate did not hurt the connection.
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<String>("m2", vec![]).await }
    });
    let request = raw.next_packet().await;
    let body = Bytes::from(serde_json::to_vec(&json!("again")).unwrap());
    raw.write_packet(&Packet::response(-request.id, body)).await;
    assert_eq!(call.await.unwrap().unwrap(), "again");
}

#[tokio::test]
async fn response_split_into_single_bytes_still_resolves() {
    let (client_io, raw_io) = duplex(64 * 1024);
    let client = Connection::builder(Registry::new()).spawn(client_io);
    let mut raw = RawPeer::new(raw_io);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<i64>("m", vec![]).await }
    });

    let request = raw.next_packet().await;
    let bytes = build_packet(&Packet::response(
        -request.id,
        Bytes::from_static(b"12345"),
    ));
    for byte in bytes {
        raw.io.write_all(&[byte]).await.unwrap();
        raw.io.flush().await.unwrap();
    }

    assert_eq!(call.await.unwrap().unwrap(), 12345);
}

#[tokio::test]
async fn abort_delivers_connection_closed_to_outstanding_call() {
    let mut registry = Registry::new();
    registry.register_async("hang", |_args| async move {
        std::future::pending::<()>().await;
        unreachable!()
    });

    let (client, _server) = connect(Registry::new(), registry);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<Value>("hang", vec![]).await }
    });

    // Let the request hit the wire before tearing down.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.close_with_error("operator abort");

    match call.await.unwrap() {
        Err(MuxError::ConnectionClosed) => {}
        other => panic!("expected connection closed, got {other:?}"),
    }
    assert!(!client.is_open());
}

#[tokio::test]
async fn peer_goodbye_aborts_outstanding_work() {
    let mut registry = Registry::new();
    registry.register_async("hang", |_args| async move {
        std::future::pending::<()>().await;
        unreachable!()
    });

    let (client, server) = connect(Registry::new(), registry);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<Value>("hang", vec![]).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    server.close().await.unwrap();

    match call.await.unwrap() {
        Err(MuxError::ConnectionClosed) => {}
        other => panic!("expected connection closed, got {other:?}"),
    }
    client.closed().await;
    assert!(!client.is_open());
}

#[tokio::test]
async fn goodbye_aborts_open_streams() {
    let mut registry = Registry::new();
    registry.register_source("forever", |_args, tx| async move {
        tx.send_json(&1).await.map_err(to_call_error)?;
        std::future::pending::<()>().await;
        unreachable!()
    });

    let (client, server) = connect(Registry::new(), registry);

    let mut rx = client.source("forever", vec![]).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Some(BodyValue::Json(json!(1))));

    server.close().await.unwrap();

    match rx.recv().await {
        Err(MuxError::ConnectionClosed) => {}
        other => panic!("expected connection closed, got {other:?}"),
    }
}

#[tokio::test]
async fn graceful_close_drains_pending_call() {
    let (client_io, raw_io) = duplex(64 * 1024);
    let client = Connection::builder(Registry::new()).spawn(client_io);
    let mut raw = RawPeer::new(raw_io);

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call_async::<String>("m", vec![]).await }
    });

    let request = raw.next_packet().await;

    // Close while the call is still in flight: goodbye goes out, but the
    // connection stays up until the in-flight id resolves.
    client.close().await.unwrap();
    raw.next_goodbye().await;
    assert!(client.is_open());

    let body = Bytes::from(serde_json::to_vec(&json!("late answer")).unwrap());
    raw.write_packet(&Packet::response(-request.id, body)).await;

    assert_eq!(call.await.unwrap().unwrap(), "late answer");
    client.closed().await;
    assert!(!client.is_open());
}

#[tokio::test]
async fn concrete_packet_roundtrip_scenarios() {
    // {id: 2, stream: true, end: false, binary "hello"}
    let pkt = Packet::data(2, BodyType::Binary, Bytes::from_static(b"hello"));
    let mut decoder = PacketDecoder::new();
    let items = decoder.push(&build_packet(&pkt)).unwrap();
    assert_eq!(items.len(), 1);
    match &items[0] {
        Decoded::Packet(p) => {
            assert_eq!(p.id, 2);
            assert!(p.is_stream());
            assert!(!p.is_end());
            assert_eq!(p.body_type(), BodyType::Binary);
            assert_eq!(&p.body[..], b"hello");
        }
        Decoded::Goodbye => panic!("unexpected goodbye"),
    }

    // {id: -3, stream: false, end: true, JSON error object}
    let err = CallError::new("intentional");
    let body = Bytes::from(serde_json::to_vec(&err).unwrap());
    let pkt = Packet::response(-3, body);
    let items = decoder.push(&build_packet(&pkt)).unwrap();
    match &items[0] {
        Decoded::Packet(p) => {
            assert_eq!(p.id, -3);
            assert!(!p.is_stream());
            assert!(p.is_end());
            let back: CallError = serde_json::from_slice(&p.body).unwrap();
            assert_eq!(back.message, "intentional");
        }
        Decoded::Goodbye => panic!("unexpected goodbye"),
    }
}

#[tokio::test]
async fn concurrent_streams_stay_independent() {
    let mut registry = Registry::new();
    registry.register_source("range", |args, tx| async move {
        let from = args[0].as_i64().unwrap_or(0);
        let to = args[1].as_i64().unwrap_or(0);
        for i in from..to {
            tx.send_json(&i).await.map_err(to_call_error)?;
        }
        Ok(())
    });

    let (client, _server) = connect(Registry::new(), registry);

    let a = client.source("range", vec![json!(0), json!(50)]).await.unwrap();
    let b = client.source("range", vec![json!(100), json!(150)]).await.unwrap();

    let (a_items, b_items) = tokio::join!(a.collect(), b.collect());
    let a_items = a_items.unwrap();
    let b_items = b_items.unwrap();

    assert_eq!(a_items.len(), 50);
    assert_eq!(b_items.len(), 50);
    assert_eq!(a_items[0], BodyValue::Json(json!(0)));
    assert_eq!(b_items[0], BodyValue::Json(json!(100)));
    // Per-id order holds even though the streams interleave on the wire.
    assert_eq!(a_items[49], BodyValue::Json(json!(49)));
    assert_eq!(b_items[49], BodyValue::Json(json!(149)));
}
