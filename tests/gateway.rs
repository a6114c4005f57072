//! End-to-end tests against a scripted local gateway.

use flate2::{Compress, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use gateway_shard::{
    BackoffConfig, Encoding, GatewayConfig, GatewayConfigBuilder, GatewayHandler, InMemoryCache,
    Intents, Member, MemberRequest, ShardConnection, ShardEvent, ShardHandle, Snowflake,
};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

struct Recorder {
    events: mpsc::UnboundedSender<ShardEvent>,
}

impl GatewayHandler for Recorder {
    async fn on_event(&self, _shard_id: u32, event: ShardEvent) {
        let _ = self.events.send(event);
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

fn builder(url: &str) -> GatewayConfigBuilder {
    GatewayConfig::builder("test-token")
        .gateway_url(url)
        .encoding(Encoding::Json)
        .compress(false)
        .intents(Intents::GUILDS)
        .backoff(BackoffConfig {
            floor: Duration::from_millis(50),
            max: Duration::from_millis(200),
        })
}

fn connection(
    url: &str,
) -> (
    ShardConnection<Recorder, InMemoryCache>,
    mpsc::UnboundedReceiver<ShardEvent>,
) {
    connection_with(builder(url).build().unwrap())
}

fn connection_with(
    config: GatewayConfig,
) -> (
    ShardConnection<Recorder, InMemoryCache>,
    mpsc::UnboundedReceiver<ShardEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connection = ShardConnection::new(
        0,
        config,
        Arc::new(InMemoryCache::new()),
        Arc::new(Recorder { events: tx }),
    );
    (connection, rx)
}

/// Server side of a `zlib-stream` transport
struct Deflater(Compress);

impl Deflater {
    fn new() -> Self {
        Self(Compress::new(flate2::Compression::default(), true))
    }

    fn frame(&mut self, value: Value) -> Vec<u8> {
        let bytes = value.to_string().into_bytes();
        let mut out = Vec::with_capacity(bytes.len() + 1024);
        self.0
            .compress_vec(&bytes, &mut out, FlushCompress::Sync)
            .unwrap();
        out
    }
}

async fn send_json(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn hello(ws: &mut ServerSocket) {
    send_json(ws, json!({ "op": 10, "d": { "heartbeat_interval": 45000 } })).await;
}

/// Read client frames until one with `op` arrives.
async fn expect_op(ws: &mut ServerSocket, op: u64) -> Value {
    loop {
        let message = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["op"] == op {
                return frame;
            }
        }
    }
}

fn ready_frame(url: &str) -> Value {
    json!({
        "op": 0,
        "t": "READY",
        "s": 1,
        "d": {
            "session_id": "s1",
            "resume_gateway_url": url,
            "user": { "id": "1", "username": "bot" },
            "guilds": []
        }
    })
}

async fn ready(ws: &mut ServerSocket, url: &str) {
    send_json(ws, ready_frame(url)).await;
}

async fn close(ws: &mut ServerSocket, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    };
    let _ = ws.close(Some(frame)).await;
}

/// Drain the socket until the client goes away.
async fn drain(mut ws: ServerSocket) {
    while let Some(Ok(_)) = ws.next().await {}
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<ShardEvent>,
    matches: impl Fn(&ShardEvent) -> bool,
) -> ShardEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_identify_ready_and_disconnect() {
    let (listener, url) = bind().await;
    let (connection, mut events) = connection(&url);
    let handle = connection.handle();
    let task = tokio::spawn(connection.run());

    let mut ws = accept(&listener).await;
    hello(&mut ws).await;
    let heartbeat = expect_op(&mut ws, 1).await;
    assert_eq!(heartbeat["d"], Value::Null);
    let identify = expect_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["token"], "test-token");
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert_eq!(identify["d"]["compress"], false);
    ready(&mut ws, &url).await;

    wait_for(&mut events, |e| matches!(e, ShardEvent::Ready)).await;
    assert!(handle.latency().is_none());

    let server = tokio::spawn(drain(ws));
    handle.disconnect().await.unwrap();

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok());
    server.await.unwrap();
}

#[tokio::test]
async fn test_resumes_after_server_close() {
    let (listener, url) = bind().await;
    let (connection, mut events) = connection(&url);
    let handle = connection.handle();
    let metrics = connection.metrics();
    let task = tokio::spawn(connection.run());

    let mut ws = accept(&listener).await;
    hello(&mut ws).await;
    expect_op(&mut ws, 2).await;
    ready(&mut ws, &url).await;
    send_json(
        &mut ws,
        json!({ "op": 0, "t": "CUSTOM_EVENT", "s": 2, "d": { "value": 1 } }),
    )
    .await;
    wait_for(&mut events, |e| matches!(e, ShardEvent::Unknown { .. })).await;
    close(&mut ws, 4000).await;
    drop(ws);

    let mut ws = accept(&listener).await;
    hello(&mut ws).await;
    let resume = expect_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["session_id"], "s1");
    assert_eq!(resume["d"]["seq"], 2);
    send_json(&mut ws, json!({ "op": 0, "t": "RESUMED", "s": 3, "d": {} })).await;

    wait_for(&mut events, |e| matches!(e, ShardEvent::Resumed)).await;
    assert_eq!(metrics.identifies(), 1);
    assert_eq!(metrics.resumes(), 1);

    let server = tokio::spawn(drain(ws));
    handle.disconnect().await.unwrap();
    assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    server.await.unwrap();
}

#[tokio::test]
async fn test_fatal_close_ends_run_with_error() {
    let (listener, url) = bind().await;
    let (connection, mut events) = connection(&url);
    let task = tokio::spawn(connection.run());

    let mut ws = accept(&listener).await;
    hello(&mut ws).await;
    expect_op(&mut ws, 2).await;
    close(&mut ws, 4004).await;

    let error = timeout(WAIT, task).await.unwrap().unwrap().unwrap_err();
    assert!(error.is_fatal());
    wait_for(&mut events, |e| matches!(e, ShardEvent::Disconnect { error: Some(_) })).await;
}

#[tokio::test]
async fn test_member_request_resolves_over_the_wire() {
    let (listener, url) = bind().await;
    let (connection, mut events) = connection(&url);
    let handle = connection.handle();
    let task = tokio::spawn(connection.run());

    let mut ws = accept(&listener).await;
    hello(&mut ws).await;
    expect_op(&mut ws, 2).await;
    ready(&mut ws, &url).await;
    wait_for(&mut events, |e| matches!(e, ShardEvent::Ready)).await;

    let request = {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle
                .request_guild_members(
                    "g1",
                    MemberRequest {
                        user_ids: Some(vec![Snowflake::from("5")]),
                        ..Default::default()
                    },
                )
                .await
        })
    };

    let frame = expect_op(&mut ws, 8).await;
    assert_eq!(frame["d"]["guild_id"], "g1");
    let nonce = frame["d"]["nonce"].as_str().unwrap().to_string();
    send_json(
        &mut ws,
        json!({
            "op": 0,
            "t": "GUILD_MEMBERS_CHUNK",
            "s": 2,
            "d": {
                "guild_id": "g1",
                "members": [{ "user": { "id": "5", "username": "five" }, "roles": [] }],
                "chunk_index": 0,
                "chunk_count": 1,
                "nonce": nonce
            }
        }),
    )
    .await;

    let members = timeout(WAIT, request).await.unwrap().unwrap().unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id().as_str(), "5");

    let server = tokio::spawn(drain(ws));
    handle.disconnect().await.unwrap();
    assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    server.await.unwrap();
}

/// Asks for guild members from inside the READY callback.
struct MemberFetcher {
    handle: OnceLock<ShardHandle>,
    members: mpsc::UnboundedSender<Vec<Member>>,
}

impl GatewayHandler for MemberFetcher {
    async fn on_event(&self, _shard_id: u32, event: ShardEvent) {
        if !matches!(event, ShardEvent::Ready) {
            return;
        }
        let Some(handle) = self.handle.get() else {
            return;
        };
        let request = MemberRequest {
            user_ids: Some(vec![Snowflake::from("5")]),
            ..Default::default()
        };
        if let Ok(members) = handle.request_guild_members("g1", request).await {
            let _ = self.members.send(members);
        }
    }
}

#[tokio::test]
async fn test_handler_can_await_member_request() {
    let (listener, url) = bind().await;
    let (tx, mut members) = mpsc::unbounded_channel();
    let handler = Arc::new(MemberFetcher {
        handle: OnceLock::new(),
        members: tx,
    });
    let connection = ShardConnection::new(
        0,
        builder(&url).build().unwrap(),
        Arc::new(InMemoryCache::new()),
        handler.clone(),
    );
    let handle = connection.handle();
    handler.handle.set(handle.clone()).unwrap();
    let task = tokio::spawn(connection.run());

    let mut ws = accept(&listener).await;
    hello(&mut ws).await;
    expect_op(&mut ws, 2).await;
    ready(&mut ws, &url).await;

    // Sent while the handler is still inside its READY callback
    let frame = expect_op(&mut ws, 8).await;
    let nonce = frame["d"]["nonce"].as_str().unwrap().to_string();
    send_json(
        &mut ws,
        json!({
            "op": 0,
            "t": "GUILD_MEMBERS_CHUNK",
            "s": 2,
            "d": {
                "guild_id": "g1",
                "members": [{ "user": { "id": "5", "username": "five" }, "roles": [] }],
                "chunk_index": 0,
                "chunk_count": 1,
                "nonce": nonce
            }
        }),
    )
    .await;

    let members = timeout(WAIT, members.recv()).await.unwrap().unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id().as_str(), "5");

    let server = tokio::spawn(drain(ws));
    handle.disconnect().await.unwrap();
    assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    server.await.unwrap();
}

#[tokio::test]
async fn test_silent_gateway_times_out_and_retries() {
    let (listener, url) = bind().await;
    let (connection, mut events) = connection_with(
        builder(&url)
            .connect_timeout(Duration::from_millis(300))
            .build()
            .unwrap(),
    );
    let handle = connection.handle();
    let metrics = connection.metrics();
    let task = tokio::spawn(connection.run());

    // Never says HELLO
    let silent = accept(&listener).await;
    let silent = tokio::spawn(drain(silent));
    let event = wait_for(&mut events, |e| matches!(e, ShardEvent::Disconnect { .. })).await;
    assert!(matches!(
        event,
        ShardEvent::Disconnect {
            error: Some(gateway_shard::Error::ConnectTimeout)
        }
    ));

    let mut ws = accept(&listener).await;
    hello(&mut ws).await;
    expect_op(&mut ws, 2).await;
    ready(&mut ws, &url).await;
    wait_for(&mut events, |e| matches!(e, ShardEvent::Ready)).await;
    assert_eq!(metrics.identifies(), 1);

    let server = tokio::spawn(drain(ws));
    handle.disconnect().await.unwrap();
    assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    server.await.unwrap();
    silent.await.unwrap();
}

#[tokio::test]
async fn test_compressed_session_with_split_frames() {
    let (listener, url) = bind().await;
    let (connection, mut events) =
        connection_with(builder(&url).compress(true).build().unwrap());
    let handle = connection.handle();
    let task = tokio::spawn(connection.run());

    let mut ws = accept(&listener).await;
    let mut deflater = Deflater::new();

    // HELLO split inside the trailing marker
    let hello = deflater.frame(json!({ "op": 10, "d": { "heartbeat_interval": 45000 } }));
    let (head, tail) = hello.split_at(hello.len() - 2);
    ws.send(Message::Binary(head.to_vec())).await.unwrap();
    ws.send(Message::Binary(tail.to_vec())).await.unwrap();

    let identify = expect_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["compress"], true);

    let ready = deflater.frame(ready_frame(&url));
    for chunk in ready.chunks(5) {
        ws.send(Message::Binary(chunk.to_vec())).await.unwrap();
    }
    wait_for(&mut events, |e| matches!(e, ShardEvent::Ready)).await;

    let custom =
        deflater.frame(json!({ "op": 0, "t": "CUSTOM_EVENT", "s": 2, "d": { "value": 7 } }));
    ws.send(Message::Binary(custom)).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, ShardEvent::Unknown { .. })).await;
    let ShardEvent::Unknown { name, data } = event else {
        unreachable!();
    };
    assert_eq!(name, "CUSTOM_EVENT");
    assert_eq!(data["value"], 7);

    let server = tokio::spawn(drain(ws));
    handle.disconnect().await.unwrap();
    assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    server.await.unwrap();
}

#[tokio::test]
async fn test_corrupt_compressed_stream_reconnects_and_resumes() {
    let (listener, url) = bind().await;
    let (connection, mut events) =
        connection_with(builder(&url).compress(true).build().unwrap());
    let handle = connection.handle();
    let metrics = connection.metrics();
    let task = tokio::spawn(connection.run());

    let mut ws = accept(&listener).await;
    let mut deflater = Deflater::new();
    ws.send(Message::Binary(
        deflater.frame(json!({ "op": 10, "d": { "heartbeat_interval": 45000 } })),
    ))
    .await
    .unwrap();
    expect_op(&mut ws, 2).await;
    ws.send(Message::Binary(deflater.frame(ready_frame(&url))))
        .await
        .unwrap();
    wait_for(&mut events, |e| matches!(e, ShardEvent::Ready)).await;

    ws.send(Message::Binary(b"not zlib at all\x00\x00\xff\xff".to_vec()))
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ShardEvent::Disconnect { error: Some(_) })
    })
    .await;
    drop(ws);

    // The new transport starts a fresh inflate context
    let mut ws = accept(&listener).await;
    let mut deflater = Deflater::new();
    ws.send(Message::Binary(
        deflater.frame(json!({ "op": 10, "d": { "heartbeat_interval": 45000 } })),
    ))
    .await
    .unwrap();
    let resume = expect_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["session_id"], "s1");
    ws.send(Message::Binary(
        deflater.frame(json!({ "op": 0, "t": "RESUMED", "s": 2, "d": {} })),
    ))
    .await
    .unwrap();
    wait_for(&mut events, |e| matches!(e, ShardEvent::Resumed)).await;
    assert_eq!(metrics.resumes(), 1);

    let server = tokio::spawn(drain(ws));
    handle.disconnect().await.unwrap();
    assert!(timeout(WAIT, task).await.unwrap().unwrap().is_ok());
    server.await.unwrap();
}
