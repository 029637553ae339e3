//! WebSocket upgrade handler

use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::physics::Action;
use crate::game::policy::Policy;
use crate::game::{CoordinatorState, Frame, Inbound, ServerHandle};
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_secs_f64;
use crate::ws::protocol::{ClientMsg, ProtocolError, ServerMsg};

/// Room for the envelope around a base64 model payload
const ENVELOPE_SLACK: usize = 16 * 1024;
/// How long a closing connection may spend flushing the final snapshot
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max_message = state.config.game.max_model_bytes.div_ceil(3) * 4 + ENVELOPE_SLACK;
    ws.max_message_size(max_message)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4();
    info!(session_id = %session_id, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();
    let (direct_tx, direct_rx) = mpsc::channel(state.config.game.outbound_buffer);
    let frames_rx = state.server.subscribe();

    let connected = state
        .server
        .send(Inbound::Connected {
            session_id,
            outbound: direct_tx.clone(),
        })
        .await;
    if !connected {
        warn!(session_id = %session_id, "Coordinator unavailable, dropping connection");
        return;
    }

    run_session(session_id, &state, ws_sink, ws_stream, direct_tx, direct_rx, frames_rx).await;

    // Release the ship at the next tick boundary
    let _ = state.server.send(Inbound::Disconnected { session_id }).await;

    info!(session_id = %session_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    session_id: Uuid,
    state: &AppState,
    ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    direct_tx: mpsc::Sender<Frame>,
    direct_rx: mpsc::Receiver<Frame>,
    frames_rx: broadcast::Receiver<Frame>,
) {
    let rate_limiter = ConnectionRateLimiter::new(state.config.game.input_rate_limit);
    let max_model_bytes = state.config.game.max_model_bytes;
    let mut shutdown = state.shutdown.clone();

    let mut writer = tokio::spawn(write_frames(
        session_id,
        state.server.clone(),
        ws_sink,
        direct_rx,
        frames_rx,
    ));

    let mut shutting_down = *shutdown.borrow();

    // Reader loop: WebSocket -> coordinator
    while !shutting_down {
        let next = tokio::select! {
            next = ws_stream.next() => next,
            _ = shutdown.changed() => {
                shutting_down = true;
                continue;
            }
        };

        let Some(result) = next else {
            break;
        };

        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(session_id = %session_id, "Rate limited input message");
                    continue;
                }

                match ClientMsg::decode(&text) {
                    Ok(msg) => {
                        if !dispatch(session_id, msg, &state.server, &direct_tx, max_model_bytes)
                            .await
                        {
                            debug!(session_id = %session_id, "Inbound channel closed");
                            break;
                        }
                    }
                    Err(e) => reject(session_id, &state.server, &direct_tx, &e),
                }
            }
            Ok(Message::Binary(_)) => {
                reject(session_id, &state.server, &direct_tx, &ProtocolError::BinaryFrame);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                debug!(session_id = %session_id, "Received ping/pong");
            }
            Ok(Message::Close(_)) => {
                info!(session_id = %session_id, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    if shutting_down {
        // Let the writer deliver the final snapshot and close frame
        if tokio::time::timeout(FLUSH_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
    } else {
        writer.abort();
    }
}

/// Writer task: direct messages and broadcast snapshots -> WebSocket
async fn write_frames(
    session_id: Uuid,
    server: ServerHandle,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut direct_rx: mpsc::Receiver<Frame>,
    mut frames_rx: broadcast::Receiver<Frame>,
) {
    // Late joiners see the world immediately instead of waiting a tick
    if let Some(frame) = server.status().latest_snapshot() {
        if send_frame(&mut ws_sink, &frame).await.is_err() {
            return;
        }
    }

    loop {
        let (frame, from_broadcast) = tokio::select! {
            biased;
            direct = direct_rx.recv() => match direct {
                Some(frame) => (frame, false),
                None => break,
            },
            shared = frames_rx.recv() => match shared {
                Ok(frame) => (frame, true),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        session_id = %session_id,
                        lagged_count = n,
                        "Client lagged, skipping {} snapshots", n
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if let Err(e) = send_frame(&mut ws_sink, &frame).await {
            debug!(session_id = %session_id, error = %e, "WebSocket send failed");
            return;
        }

        // The final snapshot is broadcast after the coordinator enters draining
        if from_broadcast && server.status().state() == CoordinatorState::Draining {
            break;
        }
    }

    let _ = ws_sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::AWAY,
            reason: "server shutting down".into(),
        })))
        .await;
}

/// Forward a decoded message to the coordinator. Returns false once the coordinator is gone.
async fn dispatch(
    session_id: Uuid,
    msg: ClientMsg,
    server: &ServerHandle,
    direct_tx: &mpsc::Sender<Frame>,
    max_model_bytes: usize,
) -> bool {
    let inbound = match msg {
        ClientMsg::JoinMode { mode, name } => Inbound::JoinMode {
            session_id,
            mode,
            name,
        },
        ClientMsg::ManualAction { turn, thrust } => Inbound::ManualAction {
            session_id,
            action: Action::Steer { turn, thrust },
        },
        ClientMsg::CancelControl => Inbound::CancelControl { session_id },
        ClientMsg::ModelUpload { model_base64 } => {
            // Decoding and validation stay off the tick loop
            let loaded = tokio::task::spawn_blocking(move || {
                Policy::from_base64(&model_base64, max_model_bytes)
            })
            .await;

            match loaded {
                Ok(result) => policy_inbound(session_id, result),
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Model decode task failed");
                    reply(
                        session_id,
                        server,
                        direct_tx,
                        &ServerMsg::ModelUploadResponse {
                            success: false,
                            error: Some("model could not be processed".into()),
                        },
                    );
                    return true;
                }
            }
        }
    };

    server.send(inbound).await
}

fn policy_inbound(
    session_id: Uuid,
    result: Result<Policy, crate::game::policy::ModelLoadError>,
) -> Inbound {
    match result {
        Ok(policy) => Inbound::PolicyLoaded {
            session_id,
            policy: Box::new(policy),
        },
        Err(e) => Inbound::PolicyRejected {
            session_id,
            error: e.to_string(),
        },
    }
}

fn reject(
    session_id: Uuid,
    server: &ServerHandle,
    direct_tx: &mpsc::Sender<Frame>,
    e: &ProtocolError,
) {
    warn!(session_id = %session_id, code = e.code(), error = %e, "Rejected client message");
    reply(
        session_id,
        server,
        direct_tx,
        &ServerMsg::error(e.code(), e.to_string()),
    );
}

/// Queue a message for this connection only, stamped with the current tick
fn reply(session_id: Uuid, server: &ServerHandle, direct_tx: &mpsc::Sender<Frame>, msg: &ServerMsg) {
    let text = match msg.encode(server.status().tick(), unix_secs_f64()) {
        Ok(text) => text,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to encode reply");
            return;
        }
    };

    match direct_tx.try_send(Frame::from(text)) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(_)) => {
            warn!(session_id = %session_id, "Client queue full, dropping reply");
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    sink.send(Message::Text(frame.to_string())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::policy::tests::{encode, linear_artifact};
    use crate::game::TickCoordinator;
    use crate::ws::protocol::ControlMode;
    use serde_json::Value;

    fn messages(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn setup() -> (TickCoordinator, ServerHandle, Uuid, mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        let (coordinator, server) = TickCoordinator::new(GameConfig {
            world_seed: Some(3),
            ..GameConfig::default()
        });
        let (tx, rx) = mpsc::channel(32);
        let session_id = Uuid::new_v4();
        assert!(tokio_test::block_on(server.send(Inbound::Connected {
            session_id,
            outbound: tx.clone(),
        })));
        (coordinator, server, session_id, tx, rx)
    }

    #[test]
    fn malformed_upload_is_rejected_without_mode_change() {
        let (mut coordinator, server, session_id, tx, mut rx) = setup();

        let join = ClientMsg::JoinMode {
            mode: ControlMode::Manual,
            name: None,
        };
        let upload = ClientMsg::ModelUpload {
            model_base64: "this is not base64!".into(),
        };
        tokio_test::block_on(async {
            assert!(dispatch(session_id, join, &server, &tx, 1024).await);
            assert!(dispatch(session_id, upload, &server, &tx, 1024).await);
        });
        coordinator.tick();

        let replies = messages(&mut rx);
        let kinds: Vec<&str> = replies
            .iter()
            .map(|m| m["header"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, ["mode_confirmed", "model_upload_response", "action_request"]);
        assert_eq!(replies[1]["payload"]["success"], false);
        assert_eq!(replies[0]["payload"]["mode"], "manual");
    }

    #[test]
    fn valid_upload_is_installed() {
        let (mut coordinator, server, session_id, tx, mut rx) = setup();

        let upload = ClientMsg::ModelUpload {
            model_base64: encode(&linear_artifact(0, 0.5, 0.0)),
        };
        tokio_test::block_on(async {
            assert!(dispatch(session_id, upload, &server, &tx, 1 << 20).await);
        });
        coordinator.tick();

        let replies = messages(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["header"]["type"], "model_upload_response");
        assert_eq!(replies[0]["payload"]["success"], true);
        assert!(replies[0]["payload"].get("error").is_none());
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let encoded = encode(&linear_artifact(0, 0.5, 0.0));
        match policy_inbound(Uuid::nil(), Policy::from_base64(&encoded, 16)) {
            Inbound::PolicyRejected { error, .. } => assert!(error.contains("16")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn protocol_errors_go_to_the_sender() {
        let (_coordinator, server, session_id, tx, mut rx) = setup();

        reject(session_id, &server, &tx, &ProtocolError::BinaryFrame);

        let replies = messages(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["header"]["type"], "error");
        assert_eq!(replies[0]["payload"]["code"], "binary_frame");
        assert_eq!(replies[0]["header"]["tick"], 0);
    }
}
