//! End-to-end tests against a running server on an ephemeral port.

use futures_util::{SinkExt, StreamExt};
use nebula_core::TracingSink;
use nebula_protocol::{codec, codes, Frame};
use nebula_server::config::Config;
use nebula_server::handlers::{self, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::build(config, Arc::new(TracingSink)).await;

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(handlers::serve(listener, state, async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            shutdown: Some(tx),
            handle,
        }
    }

    fn url(&self, format: &str) -> String {
        format!("ws://{}/ws?format={format}", self.addr)
    }

    async fn connect(&self, format: &str) -> Client {
        let (mut client, _) = connect_async(self.url(format)).await.unwrap();
        let connected = recv(&mut client).await;
        assert!(matches!(connected, Frame::Connected { .. }), "got {connected:?}");
        client
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
        let body = serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()));
        (status, body)
    }

    async fn online(&self) -> u64 {
        let (status, body) = self.get("/presence").await;
        assert_eq!(status, 200);
        body["online"].as_u64().unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn json_config() -> Config {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config
}

async fn send(client: &mut Client, frame: &Frame, binary: bool) {
    let message = if binary {
        Message::Binary(codec::encode(frame).unwrap().to_vec())
    } else {
        Message::Text(codec::encode_text(frame).unwrap())
    };
    client.send(message).await.unwrap();
}

/// Next protocol frame, skipping transport-level pings.
async fn recv(client: &mut Client) -> Frame {
    loop {
        let message = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        match message {
            Message::Text(text) => return codec::decode_text(&text).unwrap(),
            Message::Binary(data) => return codec::decode(&data).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

/// Wait for the server's close frame and return its reason.
async fn recv_close(client: &mut Client) -> String {
    loop {
        let message = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .unwrap();
        if let Message::Close(frame) = message {
            return frame.map(|f| f.reason.to_string()).unwrap_or_default();
        }
    }
}

async fn wait_for_online(server: &TestServer, expected: u64) {
    for _ in 0..50 {
        if server.online().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("online count never reached {expected}");
}

#[tokio::test]
async fn test_ping_pong_and_presence() {
    let server = TestServer::start(json_config()).await;

    let mut first = server.connect("json").await;
    let mut second = server.connect("json").await;
    assert_eq!(server.online().await, 2);

    send(&mut first, &Frame::event_with_ack(1, "ping", vec![]), false).await;
    assert_eq!(recv(&mut first).await, Frame::pong());
    assert_eq!(recv(&mut first).await, Frame::ack(1));

    second.close(None).await.unwrap();
    wait_for_online(&server, 1).await;

    first.close(None).await.unwrap();
    wait_for_online(&server, 0).await;

    server.stop().await;
}

#[tokio::test]
async fn test_msgpack_join_and_emit() {
    let server = TestServer::start(json_config()).await;

    let mut alice = server.connect("msgpack").await;
    let mut bob = server.connect("msgpack").await;

    send(&mut alice, &Frame::event_with_ack(1, "join", vec![json!("lobby")]), true).await;
    assert_eq!(recv(&mut alice).await, Frame::ack(1));
    send(&mut bob, &Frame::event_with_ack(1, "join", vec![json!("lobby")]), true).await;
    assert_eq!(recv(&mut bob).await, Frame::ack(1));

    let payload = json!({"text": "hello"});
    send(
        &mut alice,
        &Frame::event_with_ack(2, "emit", vec![json!("lobby"), json!("message"), payload.clone()]),
        true,
    )
    .await;

    assert_eq!(recv(&mut alice).await, Frame::ack(2));
    assert_eq!(recv(&mut bob).await, Frame::event("message", vec![payload]));

    server.stop().await;
}

#[tokio::test]
async fn test_rate_limited_events_keep_connection_open() {
    let mut config = json_config();
    config.rate_limit.burst = 5;
    config.rate_limit.refill_per_sec = 0.01;
    let server = TestServer::start(config).await;

    let mut client = server.connect("json").await;
    for id in 1..=8 {
        send(&mut client, &Frame::event_with_ack(id, "cursor", vec![json!(id)]), false).await;
    }

    let mut acked = 0;
    let mut limited = 0;
    for _ in 0..8 {
        match recv(&mut client).await {
            Frame::Ack { .. } => acked += 1,
            Frame::Error { code, event, .. } => {
                assert_eq!(code, codes::RATE_LIMITED);
                assert_eq!(event.as_deref(), Some("cursor"));
                limited += 1;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!((acked, limited), (5, 3));

    // Other events have their own budget.
    send(&mut client, &Frame::ping(), false).await;
    assert_eq!(recv(&mut client).await, Frame::pong());

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_and_oversized_messages() {
    let mut config = json_config();
    config.limits.max_message_size = 256;
    let server = TestServer::start(config).await;

    let mut client = server.connect("json").await;

    client.send(Message::Text("not a frame".into())).await.unwrap();
    assert!(matches!(
        recv(&mut client).await,
        Frame::Error { code: codes::INVALID_FRAME, .. }
    ));

    client.send(Message::Text("x".repeat(1_000))).await.unwrap();
    match recv(&mut client).await {
        Frame::Error { code, message, .. } => {
            assert_eq!(code, codes::INVALID_FRAME);
            assert!(message.contains("exceeds"), "{message}");
        }
        other => panic!("unexpected frame {other:?}"),
    }

    send(&mut client, &Frame::event_with_ack(3, "join", vec![json!("")]), false).await;
    assert!(matches!(
        recv(&mut client).await,
        Frame::Error { id: 3, code: codes::INVALID_EVENT, .. }
    ));

    send(&mut client, &Frame::event_with_ack(4, "join", vec![json!("$system")]), false).await;
    assert!(matches!(
        recv(&mut client).await,
        Frame::Error { id: 4, code: codes::ROOM_ERROR, .. }
    ));

    send(&mut client, &Frame::ping(), false).await;
    assert_eq!(recv(&mut client).await, Frame::pong());

    server.stop().await;
}

#[tokio::test]
async fn test_http_routes() {
    let server = TestServer::start(json_config()).await;

    let (status, body) = server.get("/").await;
    assert_eq!(status, 200);
    assert_eq!(body, Value::String("ok".into()));

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
    assert_eq!(body["store"]["kind"], "memory");

    match connect_async(server.url("xml")).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|(_, r)| r.status())),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let mut config = json_config();
    config.limits.max_connections = 1;
    let server = TestServer::start(config).await;

    let _first = server.connect("json").await;
    match connect_async(server.url("json")).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
        other => panic!("expected HTTP 503, got {:?}", other.map(|(_, r)| r.status())),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let mut config = json_config();
    config.heartbeat.timeout_ms = 200;
    let server = TestServer::start(config).await;

    let mut client = server.connect("json").await;
    assert_eq!(recv_close(&mut client).await, "idle timeout");
    wait_for_online(&server, 0).await;

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = TestServer::start(json_config()).await;

    let mut client = server.connect("json").await;
    let addr = server.addr;
    server.stop().await;

    assert_eq!(recv_close(&mut client).await, "server shutdown");
    assert!(TcpStream::connect(addr).await.is_err());
}
