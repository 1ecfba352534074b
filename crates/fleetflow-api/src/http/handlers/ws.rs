//! WebSocket endpoints.
//!
//! - `/ws/agent`: worker agents connect here. Text frames carry the agent
//!   protocol as JSON tagged by `type`. Each connection gets one writer
//!   task owning the sink; the dispatcher pushes through an mpsc link.
//! - `/ws/events`: streams every engine event as a JSON text frame,
//!   optionally filtered to one job or run id (`?subject=<uuid>`).
//!
//! Disconnecting from `/ws/events` has no effect on jobs. Dropping an agent
//! connection detaches the robot; its jobs stay assigned until it
//! re-registers or the health monitor declares it lost.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleetflow_types::protocol::{AgentMessage, DispatcherMessage};

use crate::state::AppState;

/// Frames buffered per agent connection in each direction.
const AGENT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Agent endpoint
// ---------------------------------------------------------------------------

/// Upgrade an agent connection. Mounted at `/ws/agent`.
pub async fn agent_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_connection(socket, state))
}

async fn handle_agent_connection(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<AgentMessage>(AGENT_BUFFER);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<DispatcherMessage>(AGENT_BUFFER);
    let closed = CancellationToken::new();

    let writer = {
        let closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = outbound_rx.recv() => message,
                    _ = closed.cancelled() => outbound_rx.try_recv().ok(),
                };
                let Some(message) = message else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode dispatcher frame");
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        })
    };

    let session = {
        let dispatcher = Arc::clone(&state.dispatcher);
        let closed = closed.clone();
        tokio::spawn(async move {
            let result = dispatcher.serve_agent(inbound_rx, outbound_tx).await;
            closed.cancel();
            result
        })
    };

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = ws_receiver.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!(error = %err, "agent websocket receive error");
                break;
            }
        };
        match serde_json::from_str::<AgentMessage>(text.as_str()) {
            Ok(message) => {
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(err) => tracing::warn!(error = %err, "ignoring malformed agent frame"),
        }
    }

    // Closing the inbound channel ends the session, which detaches the robot.
    drop(inbound_tx);
    match session.await {
        Ok(Ok(Some(robot_id))) => tracing::info!(robot_id = %robot_id, "agent disconnected"),
        Ok(Ok(None)) => tracing::debug!("agent disconnected before registering"),
        Ok(Err(err)) => tracing::warn!(error = %err, "agent session failed"),
        Err(err) => tracing::error!(error = %err, "agent session task panicked"),
    }
    closed.cancel();
    let _ = writer.await;
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    /// Only forward events about this job or run.
    pub subject: Option<Uuid>,
}

/// Incoming command from an event-stream client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Keep-alive ping. Server responds with `{"type":"pong"}`.
    Ping,
}

/// Upgrade an event-stream connection. Mounted at `/ws/events`.
pub async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_connection(socket, state, filter))
}

async fn handle_events_connection(socket: WebSocket, state: AppState, filter: EventFilter) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut events = state.dispatcher.events().subscribe_to(filter.subject);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to serialize event"),
                }
            }

            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsCommand>(text.as_str()) {
                            Ok(WsCommand::Ping) => {
                                let pong = Message::Text(r#"{"type":"pong"}"#.into());
                                if ws_sender.send(pong).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => tracing::debug!(error = %err, "ignoring unknown event-stream command"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "event websocket receive error");
                        break;
                    }
                }
            }
        }
    }
}
