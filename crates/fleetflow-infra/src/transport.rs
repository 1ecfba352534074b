//! Agent-side WebSocket transport.
//!
//! Connects a [`WorkerAgent`] to the dispatcher's `/ws/agent` endpoint and
//! reconnects with a fixed delay whenever the connection drops. Frames are
//! JSON text messages tagged by `type`. A single writer task owns the sink,
//! so frames from the session loop, heartbeats and job runs never
//! interleave.

use std::sync::Arc;
use std::time::Duration;

use fleetflow_core::fleet::WorkerAgent;
use fleetflow_types::protocol::{AgentMessage, DispatcherMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

/// Outbound frames buffered per connection.
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid frame: {0}")]
    Frame(#[from] serde_json::Error),
}

pub fn encode_frame(message: &AgentMessage) -> Result<WsMessage, TransportError> {
    Ok(WsMessage::Text(serde_json::to_string(message)?.into()))
}

pub fn decode_frame(text: &str) -> Result<DispatcherMessage, TransportError> {
    Ok(serde_json::from_str(text)?)
}

/// Keep `agent` connected to `server_url` until `cancel` fires.
pub async fn run_agent(
    agent: Arc<WorkerAgent>,
    server_url: String,
    reconnect_delay: Duration,
    cancel: CancellationToken,
) {
    let server_url = server_url.as_str();
    while !cancel.is_cancelled() {
        match connect_once(&agent, server_url, &cancel).await {
            Ok(()) if cancel.is_cancelled() => break,
            Ok(()) => tracing::warn!(url = server_url, "dispatcher connection closed"),
            Err(e) => tracing::warn!(url = server_url, error = %e, "dispatcher connection failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {
                tracing::info!(url = server_url, "reconnecting to dispatcher");
            }
        }
    }
    tracing::info!("agent transport stopped");
}

/// One connection lifetime: returns when either side closes.
async fn connect_once(
    agent: &Arc<WorkerAgent>,
    server_url: &str,
    cancel: &CancellationToken,
) -> Result<(), TransportError> {
    let (stream, _) = tokio_tungstenite::connect_async(server_url).await?;
    tracing::info!(url = server_url, "connected to dispatcher");
    let (mut ws_tx, mut ws_rx) = stream.split();

    let (to_agent, from_dispatcher) = mpsc::channel::<DispatcherMessage>(OUTBOUND_BUFFER);
    let (to_dispatcher, mut outbound) = mpsc::channel::<AgentMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode agent frame");
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(frame).await {
                tracing::warn!(error = %e, "failed to send agent frame");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let connection = cancel.child_token();
    let session = {
        let agent = Arc::clone(agent);
        let connection = connection.clone();
        tokio::spawn(async move { agent.run_session(from_dispatcher, to_dispatcher, connection).await })
    };

    let result = loop {
        let frame = tokio::select! {
            _ = connection.cancelled() => break Ok(()),
            frame = ws_rx.next() => frame,
        };
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(TransportError::from(e)),
        };
        match decode_frame(text.as_str()) {
            Ok(message) => {
                if to_agent.send(message).await.is_err() {
                    break Ok(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed dispatcher frame"),
        }
    };

    // Closing the inbound channel ends the session, which cancels local runs
    // and drops the last outbound sender, which stops the writer.
    drop(to_agent);
    connection.cancel();
    let _ = session.await;
    let _ = writer.await;
    result
}
