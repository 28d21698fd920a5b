//! Live log/step streaming over WebSocket.
//!
//! Subscribes to the Log Bus for the run and forwards events as JSON text
//! frames until the client disconnects, the run reaches a terminal state, or
//! the subscriber falls too far behind and is disconnected for lagging.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::log_bus::LogBusEvent;
use crate::server::app::AppState;

pub async fn stream_logs(
    ws: WebSocketUpgrade,
    State(kernel): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, kernel, run_id))
}

async fn handle_socket(mut socket: WebSocket, kernel: AppState, run_id: Uuid) {
    let mut rx = kernel.bus.subscribe(run_id);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                        if let LogBusEvent::Log(_) = event {
                            if run_terminal(&kernel, run_id).await {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    kernel.bus.sweep(run_id);
}

async fn run_terminal(kernel: &AppState, run_id: Uuid) -> bool {
    kernel
        .run_lifecycle
        .get_run(run_id)
        .await
        .map(|r| r.state.is_terminal())
        .unwrap_or(false)
}
