//! WebSocket transport: bridges an axum `WebSocket` to the engine's
//! transport-agnostic [`collab_core::Server`].

use crate::AppState;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use collab_core::{CloseCode, Server, Transport, TransportError, YrsReplica};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Document name to attach to. Required.
    pub doc: String,
    /// Opaque bearer token, forwarded verbatim to `onAuthenticate` hooks.
    pub token: Option<String>,
}

/// Adapts one axum WebSocket's outbound half to the engine's [`Transport`]
/// trait: `send`/`close` push onto an unbounded channel a writer task drains,
/// keeping the socket's single write half uncontended.
struct AxumTransport {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl collab_core::Transport for AxumTransport {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(Message::Binary(bytes.into()))
            .map_err(|e| TransportError(e.to_string()))
    }

    async fn close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code: code.as_u16(),
            reason: reason.to_string().into(),
        };
        let _ = self.tx.send(Message::Close(Some(frame)));
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let transport = Arc::new(AxumTransport { tx });
    let server: Arc<Server<YrsReplica>> = state.server.clone();

    let conn = match server.accept(transport.clone(), query.token.as_deref()).await {
        Ok(conn) => conn,
        Err((code, reason)) => {
            tracing::info!(reason = %reason, "connection rejected");
            transport.close(code, &reason).await;
            writer.abort();
            return;
        }
    };

    if let Err(e) = server.attach_document(&conn, &query.doc).await {
        tracing::warn!(doc = %query.doc, error = %e, "failed to attach document");
        conn.transport.close(CloseCode::ServerError, "failed to load document").await;
        writer.abort();
        return;
    }

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Binary(bytes) => {
                if let Err((code, reason)) = server.handle_message(&conn, &bytes).await {
                    tracing::warn!(reason = %reason, "protocol error, closing connection");
                    conn.transport.close(code, &reason).await;
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    server.disconnect(&conn).await;
    writer.abort();
}
