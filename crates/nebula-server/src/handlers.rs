//! HTTP and WebSocket handlers for the Nebula server.
//!
//! This module handles the connection lifecycle and message processing.

use crate::config::Config;
use crate::metrics::{self, MetricsSink};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use nebula_core::{broadcast, store, DisconnectReason, EventSink, Gateway, Session};
use nebula_protocol::{codec, Frame, ProtocolError, WireFormat};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for sessions to release their presence.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The gateway.
    pub gateway: Arc<Gateway>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Open the presence store and scale-out adapter, then build and start
    /// the gateway.
    pub async fn build(config: Config, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let keys = config.key_space();
        let redis_url = config.redis_url.as_deref();

        let store = store::open(redis_url, keys.clone(), config.store_timeout(), sink.as_ref()).await;
        let adapter = broadcast::connect(
            redis_url,
            &keys.broadcast_channel(),
            config.store_timeout(),
            sink.as_ref(),
        )
        .await;

        let gateway = Gateway::builder(store)
            .config(config.gateway_config())
            .broadcast(adapter)
            .sink(sink)
            .build();
        gateway.start();

        Arc::new(Self { gateway, config })
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/presence", get(presence_handler))
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop the gateway.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let gateway = Arc::clone(&state.gateway);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            // Open sockets keep axum from finishing; ask sessions to close.
            gateway.stop(SHUTDOWN_GRACE).await;
        })
        .await
        .context("Server error")?;

    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = AppState::build(config, Arc::new(MetricsSink)).await;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Nebula server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    serve(listener, state, shutdown_signal()).await?;

    info!("Nebula server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Liveness probe.
pub async fn root_handler() -> &'static str {
    "ok"
}

/// Health check handler.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let presence = state.gateway.presence();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.gateway.instance_id(),
        "connections": state.gateway.connection_count(),
        "store": {
            "kind": presence.store().name(),
            "shared": presence.store().is_shared(),
            "degraded": presence.is_degraded(),
        },
    }))
}

/// Online count across every instance sharing the presence store.
pub async fn presence_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.gateway.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            warn!(error = %e, "Presence snapshot failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// WebSocket query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Outbound wire format.
    #[serde(default)]
    pub format: WireFormat,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.gateway.connection_count() >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection refused, gateway at capacity"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.format))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, format: WireFormat) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox, mut outbound) = mpsc::unbounded_channel();

    let mut session = match state.gateway.connect(outbox).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Connection refused");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    debug!(connection = %session.id(), format = ?format, "WebSocket connected");

    let mut shutdown = session.shutdown_signal();
    let idle_timeout = state.config.idle_timeout();
    let max_message_size = state.config.limits.max_message_size;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Message processing loop
    let reason = loop {
        tokio::select! {
            biased;

            () = shutdown.recv() => break DisconnectReason::ServerShutdown,

            // Frames queued by the gateway for this connection
            Some(frame) = outbound.recv() => {
                if let Err(e) = send_frame(&mut sender, &frame, format).await {
                    break DisconnectReason::TransportError(e.to_string());
                }
            }

            () = &mut idle => break DisconnectReason::IdleTimeout,

            // Receive from WebSocket
            msg = receiver.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_message(data.len(), "inbound");
                        if data.len() > max_message_size {
                            reject_oversized(&session, data.len(), max_message_size);
                            continue;
                        }

                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);
                        handle_buffer(&mut session, &mut read_buffer, max_message_size).await;
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message(text.len(), "inbound");
                        if text.len() > max_message_size {
                            reject_oversized(&session, text.len(), max_message_size);
                            continue;
                        }

                        let start = Instant::now();
                        match codec::decode_text(&text) {
                            Ok(frame) => {
                                session.handle(frame).await;
                            }
                            Err(e) => session.reject_frame(e.to_string()),
                        }
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break DisconnectReason::TransportError("failed to send pong".to_string());
                        }
                        session.heartbeat();
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %session.id(), "WebSocket closed by client");
                        break DisconnectReason::ClientClosed;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %session.id(), error = %e, "WebSocket error");
                        break DisconnectReason::TransportError(e.to_string());
                    }
                }
            }
        }
    };

    if matches!(
        reason,
        DisconnectReason::IdleTimeout | DisconnectReason::ServerShutdown
    ) {
        while let Ok(frame) = outbound.try_recv() {
            if send_frame(&mut sender, &frame, format).await.is_err() {
                break;
            }
        }
        let code = match reason {
            DisconnectReason::ServerShutdown => close_code::AWAY,
            _ => close_code::NORMAL,
        };
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await;
    }

    close_session(session, reason).await;
}

async fn close_session(session: Session, reason: DisconnectReason) {
    let id = session.id().to_string();
    session.close(reason).await;
    debug!(connection = %id, "WebSocket disconnected");
}

/// Decode and handle every complete frame in the read buffer.
async fn handle_buffer(session: &mut Session, read_buffer: &mut BytesMut, max_message_size: usize) {
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => {
                session.handle(frame).await;
            }
            Ok(None) => break,
            Err(ProtocolError::FrameTooLarge(size)) => {
                read_buffer.clear();
                reject_oversized(session, size, max_message_size);
                break;
            }
            // The malformed frame was consumed; keep going.
            Err(e) => session.reject_frame(e.to_string()),
        }
    }

    // A partial frame that can never fit.
    if read_buffer.len() > max_message_size {
        let size = read_buffer.len();
        read_buffer.clear();
        reject_oversized(session, size, max_message_size);
    }
}

fn reject_oversized(session: &Session, size: usize, limit: usize) {
    warn!(connection = %session.id(), size, limit, "Message too large");
    session.reject_frame(format!("message of {size} bytes exceeds limit of {limit} bytes"));
}

/// Send a frame to the WebSocket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
    format: WireFormat,
) -> Result<()> {
    let message = match format {
        WireFormat::Msgpack => Message::Binary(codec::encode(frame)?.to_vec()),
        WireFormat::Json => Message::Text(codec::encode_text(frame)?),
    };
    let len = match &message {
        Message::Binary(data) => data.len(),
        Message::Text(text) => text.len(),
        _ => 0,
    };
    metrics::record_message(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nebula_core::TracingSink;

    async fn test_state() -> Arc<AppState> {
        AppState::build(Config::default(), Arc::new(TracingSink)).await
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_handler() {
        assert_eq!(root_handler().await, "ok");
    }

    #[tokio::test]
    async fn test_presence_handler_counts_sessions() {
        let state = test_state().await;
        let response = presence_handler(State(Arc::clone(&state))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({ "online": 0 }));

        let (tx, _rx) = mpsc::unbounded_channel();
        let session = state.gateway.connect(tx).await.unwrap();
        let response = presence_handler(State(Arc::clone(&state))).await;
        assert_eq!(body_json(response).await, serde_json::json!({ "online": 1 }));

        session.close(DisconnectReason::ClientClosed).await;
    }

    #[tokio::test]
    async fn test_health_handler() {
        let state = test_state().await;
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["instance_id"], state.gateway.instance_id());
        assert_eq!(body["store"]["kind"], "memory");
        assert_eq!(body["store"]["shared"], false);
        assert_eq!(body["store"]["degraded"], false);
    }

    #[tokio::test]
    async fn test_handle_buffer_rejects_garbage_and_continues() {
        let state = test_state().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = state.gateway.connect(tx).await.unwrap();
        let _connected = rx.try_recv().unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0, 0, 0, 2, 0xc1, 0xc1]);
        buffer.extend_from_slice(&codec::encode(&Frame::ping()).unwrap());
        handle_buffer(&mut session, &mut buffer, 1024).await;

        assert!(matches!(
            rx.try_recv().unwrap(),
            Frame::Error { code: nebula_protocol::codes::INVALID_FRAME, .. }
        ));
        assert_eq!(rx.try_recv().unwrap(), Frame::pong());
        assert!(buffer.is_empty());

        session.close(DisconnectReason::ClientClosed).await;
    }
}
