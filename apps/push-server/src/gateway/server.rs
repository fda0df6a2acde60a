//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time;

use crate::connection::{ClientType, Connection, SessionContext};
use crate::router::LocalRouter;
use crate::AppState;

use super::events::{
    ClientMessage, GatewayMessage, HandshakePayload, HeartbeatPayload, OP_HANDSHAKE, OP_HEARTBEAT,
};
use super::session::{run_writer, GatewaySession};

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_HANDSHAKEN: u16 = 4003;
const CLOSE_HANDSHAKE_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving HANDSHAKE after connection (seconds).
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: Wait for HANDSHAKE within timeout.
    let handshake = time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        read_handshake(&mut ws_rx),
    )
    .await;

    let payload = match handshake {
        Ok(Ok(payload)) => payload,
        Ok(Err((code, reason))) => {
            tracing::debug!(%reason, "gateway handshake failed");
            let _ = send_close(&mut ws_tx, code, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Step 2: Build the session and register its route.
    let context = session_context(&state, payload);
    let heartbeat = context.heartbeat;
    let (session, outbound_rx) = GatewaySession::new(context, state.config.write_high_water);
    let writer = tokio::spawn(run_writer(session.clone(), ws_tx, outbound_rx));

    session.enqueue(&GatewayMessage::handshake_ok(
        session.id(),
        heartbeat.as_millis() as u64,
    ));

    let client_type = session.session_context().client_type;
    let displaced = state
        .routers
        .register(session.user_id(), LocalRouter::new(session.clone()));
    if let Some(previous) = displaced {
        let previous = previous.connection();
        if previous.id() != session.id() {
            tracing::info!(
                user_id = %session.user_id(),
                client_type = %client_type,
                connection_id = %previous.id(),
                "kicking connection replaced by a new login"
            );
            previous.close("Logged in from another connection");
        }
    }

    tracing::info!(
        connection_id = %session.id(),
        user_id = %session.user_id(),
        client_type = %client_type,
        heartbeat_ms = heartbeat.as_millis() as u64,
        "gateway session established"
    );

    // Step 3: Run the read loop until the client leaves, misbehaves or is kicked.
    run_session(&session, ws_rx, heartbeat).await;

    session.mark_disconnected();
    state
        .routers
        .unregister_connection(session.user_id(), client_type, session.id());
    let _ = writer.await;

    tracing::info!(
        connection_id = %session.id(),
        user_id = %session.user_id(),
        "gateway session ended"
    );
}

async fn read_handshake(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<HandshakePayload, (u16, &'static str)> {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(?e, "ws read error during handshake");
                return Err((CLOSE_UNKNOWN_ERROR, "read error"));
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err((CLOSE_UNKNOWN_ERROR, "client closed")),
            _ => continue,
        };

        let client_msg: ClientMessage = serde_json::from_str(&text)
            .map_err(|_| (CLOSE_UNKNOWN_ERROR, "Invalid JSON"))?;

        if client_msg.op != OP_HANDSHAKE {
            return Err((CLOSE_NOT_HANDSHAKEN, "Expected HANDSHAKE"));
        }
        let payload: HandshakePayload = serde_json::from_value(client_msg.d)
            .map_err(|_| (CLOSE_HANDSHAKE_FAILED, "invalid handshake payload"))?;
        if payload.user_id.trim().is_empty() {
            return Err((CLOSE_HANDSHAKE_FAILED, "user_id is required"));
        }
        return Ok(payload);
    }
    Err((CLOSE_UNKNOWN_ERROR, "connection closed before handshake"))
}

fn session_context(state: &AppState, payload: HandshakePayload) -> SessionContext {
    let mut context = SessionContext::new(payload.user_id.trim());
    context.tags = payload.tags.into_iter().collect();
    context.client_type = ClientType::from_os_name(payload.os_name.as_deref());
    context.client_version = payload.client_version;
    context.os_name = payload.os_name;
    context.os_version = payload.os_version;
    context.heartbeat = state.config.heartbeat.negotiate(payload.heartbeat_ms);
    context
}

/// Main session loop: read client messages and enforce the heartbeat.
async fn run_session(
    session: &Arc<GatewaySession>,
    mut ws_rx: SplitStream<WebSocket>,
    heartbeat: Duration,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = heartbeat * 3 / 2;
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                session.close_with(CLOSE_UNKNOWN_ERROR, "Invalid JSON");
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                let payload: HeartbeatPayload = serde_json::from_value(client_msg.d)
                                    .unwrap_or(HeartbeatPayload { seq: 0 });
                                session.enqueue(&GatewayMessage::heartbeat_ack(payload.seq));
                            }
                            OP_HANDSHAKE => {
                                session.close_with(CLOSE_UNKNOWN_ERROR, "Already handshaken");
                                break;
                            }
                            _ => {
                                session.close_with(CLOSE_UNKNOWN_OPCODE, "Unknown opcode");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.id(), "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Kicked, or the writer hit a transport error.
            _ = session.closed().cancelled() => break,

            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.id(),
                        "heartbeat timeout, closing connection"
                    );
                    session.close_with(CLOSE_SESSION_TIMEOUT, "Heartbeat timeout");
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
