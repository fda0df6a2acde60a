//! Per-connection gateway session: the [`Connection`] the push core sends
//! through, backed by a bounded outbound queue and a writer task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use push_common::id::{prefix, prefixed_ulid};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, PushPayload, SendCompletion, SendError, SessionContext};

use super::events::GatewayMessage;

/// Close code used when the server kicks a connection.
pub const CLOSE_KICKED: u16 = 4008;

/// One item in a connection's outbound queue.
pub enum Outbound {
    Push {
        payload: Arc<PushPayload>,
        completion: SendCompletion,
    },
    Frame(String),
    Close { code: u16, reason: String },
}

/// State for a single handshaken WebSocket connection.
pub struct GatewaySession {
    /// Unique connection identifier (`conn_` prefixed ULID).
    id: String,
    context: SessionContext,
    connected: AtomicBool,
    outbound: mpsc::Sender<Outbound>,
    /// Cancelled when the connection goes away for any reason.
    closed: CancellationToken,
}

impl GatewaySession {
    /// Create a session whose outbound queue holds at most `high_water`
    /// frames. The receiver half goes to [`run_writer`].
    pub fn new(
        context: SessionContext,
        high_water: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(high_water.max(1));
        let session = Arc::new(Self {
            id: prefixed_ulid(prefix::CONNECTION),
            context,
            connected: AtomicBool::new(true),
            outbound,
            closed: CancellationToken::new(),
        });
        (session, rx)
    }

    pub fn user_id(&self) -> &str {
        &self.context.user_id
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.cancel();
    }

    /// Queue a close frame behind whatever is already waiting to be written
    /// and stop accepting pushes.
    pub fn close_with(&self, code: u16, reason: &str) {
        let _ = self.outbound.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.mark_disconnected();
    }

    /// Queue a control frame. Dropped if the queue is full.
    pub fn enqueue(&self, message: &GatewayMessage) -> bool {
        let Ok(json) = serde_json::to_string(message) else {
            return false;
        };
        self.outbound.try_send(Outbound::Frame(json)).is_ok()
    }
}

impl Connection for GatewaySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_writable(&self) -> bool {
        self.is_connected() && self.outbound.capacity() > 0
    }

    fn session_context(&self) -> &SessionContext {
        &self.context
    }

    fn send(&self, payload: Arc<PushPayload>, completion: SendCompletion) {
        if !self.is_connected() {
            completion.complete(Err(SendError::Closed));
            return;
        }
        match self.outbound.try_send(Outbound::Push { payload, completion }) {
            Ok(()) => {}
            Err(TrySendError::Full(Outbound::Push { completion, .. })) => {
                completion.complete(Err(SendError::Backpressure));
            }
            Err(TrySendError::Closed(Outbound::Push { completion, .. })) => {
                completion.complete(Err(SendError::Closed));
            }
            Err(_) => {}
        }
    }

    /// Kick the client: a KICK frame followed by a close frame.
    fn close(&self, reason: &str) {
        self.enqueue(&GatewayMessage::kick(reason));
        self.close_with(CLOSE_KICKED, reason);
    }
}

/// Drain the session's outbound queue into the socket.
///
/// Frames are written in queue order; a closed token only stops the writer
/// once the queue is empty. Pushes still queued when the writer stops are
/// dropped, which resolves their completions with [`SendError::Dropped`].
pub async fn run_writer(
    session: Arc<GatewaySession>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let mut seq = 0u64;
    loop {
        let outbound = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
            _ = session.closed.cancelled() => break,
        };

        match outbound {
            Outbound::Push { payload, completion } => {
                seq += 1;
                let result = match serde_json::to_string(&GatewayMessage::push(seq, &payload)) {
                    Ok(json) => ws_tx
                        .send(Message::Text(json.into()))
                        .await
                        .map_err(|e| SendError::Transport(e.to_string())),
                    Err(e) => Err(SendError::Transport(e.to_string())),
                };
                let failed = result.is_err();
                completion.complete(result);
                if failed {
                    session.mark_disconnected();
                    break;
                }
            }
            Outbound::Frame(json) => {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    session.mark_disconnected();
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
    tracing::debug!(connection_id = %session.id, "gateway writer stopped");
}
