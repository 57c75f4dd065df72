//! WebSocket endpoint: one [`Session`] per connection.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::server::AppState;

use super::orchestrator::{Session, SessionContext};
use super::protocol::{ServerMessage, INVALID_JSON};

/// Outbound messages buffered per client before the relay waits.
const OUTBOUND_BUFFER: usize = 256;

/// How long queued output may take to flush after the client leaves.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let ctx = state.session_context();
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Drive one client connection until it closes.
pub async fn handle_socket(socket: WebSocket, ctx: SessionContext) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let (mut session, mut completions) = Session::new(ctx, tx);
    tracing::info!(session_id = %session.id(), "client connected");
    session.send(ServerMessage::welcome()).await;

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                Some(Ok(Message::Binary(_))) => {
                    session.send(ServerMessage::error(INVALID_JSON)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "websocket error");
                    break;
                }
            },
            Some(completion) = completions.recv() => {
                session.handle_tool_completion(completion).await;
            }
        }
    }

    session.close().await;
    tracing::info!(session_id = %session.id(), "client disconnected");
    drop(session);

    if tokio::time::timeout(FLUSH_TIMEOUT, send_task).await.is_err() {
        tracing::debug!("outbound flush timed out");
    }
}
