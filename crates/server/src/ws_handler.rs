//! WebSocket endpoint at `GET /ws/chat`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokenrelay_protocol::{encode_server, ServerEvent};
use tokio::sync::mpsc;

use crate::emitter::ServerEventEmitter;
use crate::state::{ChatState, ConnectionGuard};

const OUTBOUND_CAPACITY: usize = 256;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ChatState>>,
) -> Result<impl IntoResponse, StatusCode> {
    let slot = state.try_acquire().ok_or_else(|| {
        tracing::warn!("connection limit reached; refusing WebSocket upgrade");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, slot)))
}

/// Drive a single WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<ChatState>, _slot: ConnectionGuard) {
    let (mut ws_writer, mut ws_reader) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CAPACITY);
    let emitter = ServerEventEmitter::new(state.context.clone(), out_tx.clone());
    let connection = emitter.connection_id().to_string();

    let writer_handle = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            match encode_server(&event) {
                Ok(text) => {
                    if ws_writer.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("failed to encode {}: {}", event.name(), e);
                }
            }
        }
    });

    let heartbeat_tx = out_tx.clone();
    let period = state.config.heartbeat_interval;
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            if heartbeat_tx.send(ServerEvent::Ping).await.is_err() {
                break;
            }
        }
    });

    tracing::info!(connection = %connection, "WebSocket connection opened");

    while let Some(msg) = ws_reader.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("WebSocket read error: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => emitter.handle_frame(&text).await,
            Message::Close(_) => break,
            _ => {} // axum answers protocol pings
        }
    }

    heartbeat_handle.abort();
    emitter.close();
    drop(emitter);
    drop(out_tx);

    // Cancelled generations still hold senders while they unwind.
    let writer_abort = writer_handle.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle)
        .await
        .is_err()
    {
        writer_abort.abort();
    }

    tracing::info!(connection = %connection, "WebSocket connection closed");
}
