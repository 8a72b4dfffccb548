use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use stepwright_common::{LoginPhase, SubjectStatus};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ApiError, AppState, principal};
use super::remote::ProgressPhase;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event types ──────────────────────────────────────────────────────

/// Events published on a subject's editing channel. The first five are
/// relayed from the automation engine as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EditingEvent {
    FieldSelected(Value),
    FieldAdded(Value),
    FieldRemoved(Value),
    FieldValueChanged(Value),
    HighlightingReady(Value),

    SessionStarted {
        editing_url: String,
        expires_at: DateTime<Utc>,
        login_phase: Option<LoginPhase>,
    },
    SessionCancelled {
        status: SubjectStatus,
    },
    SessionExpired {
        status: SubjectStatus,
    },
    SessionConfirmed {
        status: SubjectStatus,
        step_count: usize,
    },
    /// The engine lost the session; the editor must restart.
    SessionLost {
        message: String,
    },
    DraftSaved {
        version: i64,
    },

    LoginExecutionProgress {
        phase: ProgressPhase,
        message: Option<String>,
        paused: bool,
    },
    LoginExecutionComplete {
        success: bool,
        error: Option<String>,
        final_url: Option<String>,
        added_step_orders: Vec<u32>,
    },
}

impl EditingEvent {
    /// Parse an engine notification by its kebab-case name.
    pub fn from_engine(name: &str, data: Value) -> Option<Self> {
        match name {
            "field-selected" => Some(Self::FieldSelected(data)),
            "field-added" => Some(Self::FieldAdded(data)),
            "field-removed" => Some(Self::FieldRemoved(data)),
            "field-value-changed" => Some(Self::FieldValueChanged(data)),
            "highlighting-ready" => Some(Self::HighlightingReady(data)),
            _ => None,
        }
    }
}

/// Wire envelope: `{"channel": "editing.<id>", "type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(flatten)]
    pub event: EditingEvent,
}

pub fn channel_name(subject_id: i64) -> String {
    format!("editing.{}", subject_id)
}

/// A serialized event tagged with the subject it belongs to.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub subject_id: i64,
    pub json: String,
}

pub type EventSender = broadcast::Sender<ChannelMessage>;

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and publish an event on the subject's channel.
/// Returns silently even if no clients are connected.
pub fn broadcast_event(tx: &EventSender, subject_id: i64, event: EditingEvent) {
    let envelope = Envelope {
        channel: channel_name(subject_id),
        event,
    };
    match serde_json::to_string(&envelope) {
        Ok(json) => {
            let _ = tx.send(ChannelMessage { subject_id, json });
        }
        Err(e) => {
            tracing::error!(subject_id, error = %e, "failed to serialize editing event");
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn subject_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let user_id = match principal(&headers) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    if let Err(e) = state.sessions.load_owned(user_id, subject_id).await {
        return ApiError::from(e).into_response();
    }
    let rx = state.events.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, subject_id, rx))
}

async fn handle_socket(socket: WebSocket, subject_id: i64, rx: broadcast::Receiver<ChannelMessage>) {
    let (sender, receiver) = socket.split();
    tracing::debug!(subject_id, "editor connected");
    run_socket_loop(sender, receiver, rx, subject_id).await;
    tracing::debug!(subject_id, "editor disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards only the given subject's events. If no Pong is received within
/// [`PONG_TIMEOUT`] after a Ping is sent, the connection is considered dead
/// and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<ChannelMessage>,
    subject_id: i64,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) if msg.subject_id == subject_id => {
                        if sender.send(Message::Text(msg.json.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(subject_id, skipped = n, "editor lagged behind event stream");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}
