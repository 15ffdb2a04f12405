//! WebSocket mirror of the message bus
//!
//! Clients connect to /api/v1/ws. They first receive every retained
//! message and the current status snapshot, then each bus message as it
//! is published, framed as `{"topic": ..., "payload": ...}`.

use crate::AppState;
use audiotrigger_core::BusMessage;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

/// Frame sent to WebSocket clients
#[derive(Serialize)]
pub struct WsFrame<'a> {
    pub topic: &'a str,
    pub payload: &'a str,
}

fn frame_json(topic: &str, payload: &str) -> Option<String> {
    serde_json::to_string(&WsFrame { topic, payload }).ok()
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Retained messages followed by the current snapshot
fn initial_frames(state: &AppState) -> Vec<String> {
    let mut frames: Vec<String> = state
        .bus
        .retained()
        .iter()
        .filter_map(|m: &BusMessage| frame_json(&m.topic, &m.payload))
        .collect();
    let snapshot = state.status.current_snapshot();
    if let Ok(payload) = serde_json::to_string(snapshot.as_ref()) {
        if let Some(frame) = frame_json(&state.topics.status(), &payload) {
            frames.push(frame);
        }
    }
    frames
}

/// Handle an individual WebSocket connection
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Subscribe before the catch-up frames so nothing published in between is lost
    let mut rx = state.bus.subscribe();
    tracing::debug!(
        subscribers = state.bus.subscriber_count(),
        "WebSocket client connected"
    );

    for frame in initial_frames(&state) {
        if ws_sender.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let Some(frame) = frame_json(&message.topic, &message.payload) else {
                        continue;
                    };
                    if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "WebSocket client lagging, messages skipped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Incoming messages are ignored apart from close
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    tracing::debug!("WebSocket client disconnected");
}
