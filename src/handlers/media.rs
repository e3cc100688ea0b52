//! Carrier media WebSocket handler.
//!
//! Accepts the carrier's WebSocket upgrade, pumps protocol frames between
//! the socket and a typed [`CarrierSession`], and runs one orchestrator for
//! the connection's lifetime.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::call::run_call;
use crate::carrier::{CarrierSession, StreamFrame};
use crate::state::AppState;

/// Frame channel depth between the socket pump and the session.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// `GET {media_path}`: the carrier connects its media stream here.
pub async fn media_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("carrier media stream upgrade requested");
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>) {
    let (out_tx, out_rx) = mpsc::channel::<StreamFrame>(FRAME_CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<StreamFrame>(FRAME_CHANNEL_CAPACITY);

    let session = CarrierSession::start(out_tx, in_rx);
    let pump = tokio::spawn(pump_socket(socket, in_tx, out_rx));

    let deps = state.call_deps().await;
    let record = run_call(deps, session).await;
    info!(
        call_id = %record.id,
        status = %record.status,
        outcome = record.outcome.as_deref().unwrap_or(""),
        duration = record.duration_seconds.unwrap_or(0),
        "call finished"
    );

    pump.abort();
}

/// Move frames between the WebSocket and the session's typed channels.
///
/// Socket text frames parse into [`StreamFrame`]s; frames from the session
/// serialize back out. When the session side closes its channel the socket
/// is closed gracefully.
async fn pump_socket(
    socket: WebSocket,
    in_tx: mpsc::Sender<StreamFrame>,
    mut out_rx: mpsc::Receiver<StreamFrame>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "outbound frame serialization failed");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json)).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<StreamFrame>(&text) {
                            Ok(frame) => {
                                if in_tx.send(frame).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "unrecognized carrier frame, skipping");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        // Dropping in_tx tells the session the carrier went
                        // away.
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "carrier socket error");
                        return;
                    }
                }
            }
        }
    }
}
