//! WebSocket delivery.
//!
//! One task per socket: it registers with the hub, drains the outbound
//! queue onto the socket, and watches liveness with ping/pong. All registry
//! changes go through the [`Hub`] handle.

use crate::AppState;
use crate::hub::{HubError, LeaveReason};
use crate::registry::Outbound;
use axum::Json;
use axum::extract::ws::{
    CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use ratroom_core::{Decoded, RatId, decode};
use std::time::Duration;
use tokio::time::{Instant, interval_at};

/// GET /ws-connect/{rat_id}
pub(crate) async fn ws_connect(
    Path(rat_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let rat_id: RatId = match rat_id.parse() {
        Ok(id) => id,
        Err(e) => {
            tracing::info!("Rejected handshake: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid rat id" })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, rat_id, state))
}

async fn handle_socket(mut socket: WebSocket, rat_id: RatId, state: AppState) {
    let registered = tokio::time::timeout(
        state.config.handshake_timeout(),
        state.hub.register(rat_id.as_str()),
    )
    .await
    .unwrap_or(Err(HubError::Timeout));

    let registration = match registered {
        Ok(registration) => registration,
        Err(e) => {
            tracing::warn!(rat_id = %rat_id, "Handshake failed: {}", e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Utf8Bytes::from_static("registration failed"),
                })))
                .await;
            return;
        }
    };

    let id = registration.id;
    let reason = pump(
        socket,
        registration.outbound,
        state.config.ping_interval(),
        state.config.pong_timeout(),
    )
    .await;

    tracing::debug!(rat_id = %rat_id, id, ?reason, "Socket finished");
    state.hub.unregister(id, reason);
}

/// Move frames between the socket and the outbound queue until either
/// side ends.
async fn pump(
    socket: WebSocket,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
    ping_interval: Duration,
    pong_timeout: Duration,
) -> LeaveReason {
    let (mut sink, mut stream) = socket.split();
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            item = outbound.recv() => {
                match item {
                    Some(Outbound::Frame(text)) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            return LeaveReason::Error;
                        }
                    }
                    Some(Outbound::Close(reason)) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: Utf8Bytes::from_static(reason.as_str()),
                            })))
                            .await;
                        return LeaveReason::Evicted;
                    }
                    None => return LeaveReason::Evicted,
                }
            }

            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        return LeaveReason::Error;
                    }
                    None => return LeaveReason::Closed,
                };
                last_seen = Instant::now();

                match msg {
                    Message::Text(text) => match decode(text.as_str()) {
                        Ok(Decoded::Message(msg)) => {
                            tracing::debug!(kind = msg.kind(), "Ignoring client message");
                        }
                        Ok(Decoded::Unknown(kind)) => {
                            tracing::debug!(kind = %kind, "Ignoring unknown client message");
                        }
                        Err(e) => {
                            tracing::debug!("Discarding client frame: {}", e);
                        }
                    },
                    Message::Close(_) => return LeaveReason::Closed,
                    _ => {}
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() > pong_timeout {
                    tracing::info!(
                        silent_ms = last_seen.elapsed().as_millis() as u64,
                        "Liveness timeout"
                    );
                    let _ = sink.send(Message::Close(None)).await;
                    return LeaveReason::Timeout;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return LeaveReason::Error;
                }
            }
        }
    }
}
