//! The live status WebSocket.
//!
//! One task per socket: inbound frames are normalized into [`Command`]s
//! and applied through the manager; outbound snapshots and messages
//! arrive on the connection's channel and are forwarded verbatim. The
//! cleanup in the function tail runs on every exit path — graceful close,
//! protocol error, or send failure — so a dying transport always detaches
//! exactly once.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::connection::OUTBOUND_CAPACITY;
use crate::manager::AttachError;
use crate::protocol::{error_frame, Command};

use super::AppState;

#[derive(Deserialize)]
pub(super) struct WsParams {
    name: Option<String>,
}

pub(super) async fn ws_endpoint(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, code, params.name))
}

async fn handle_socket(socket: WebSocket, state: AppState, code: String, name: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let attached = match state.manager.connect(&code, name, tx).await {
        Ok(attached) => attached,
        Err(err) => {
            reject(&mut ws_tx, &err).await;
            return;
        }
    };

    loop {
        tokio::select! {
            // Snapshots and messages -> socket
            out = rx.recv() => {
                match out {
                    Some(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Inbound commands
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Command::parse(text.as_str()) {
                            Some(Command::Status(cmd)) => {
                                state.manager
                                    .apply_status(&attached.session, &attached.name, cmd)
                                    .await;
                            }
                            Some(Command::ConfirmNotice) => {
                                state.manager
                                    .confirm_notice(&attached.session, &attached.name)
                                    .await;
                            }
                            Some(Command::ShortStatus(value)) => {
                                state.manager
                                    .set_short_status(&attached.session, &attached.name, value)
                                    .await;
                            }
                            Some(Command::ToggleTalkRequest) => {
                                state.manager
                                    .toggle_talk_request(&attached.session, &attached.name)
                                    .await;
                            }
                            Some(Command::Heartbeat) => {
                                state.manager
                                    .heartbeat(&attached.session, &attached.name)
                                    .await;
                                if ws_tx.send(Message::Text("heartbeat".into())).await.is_err() {
                                    break;
                                }
                            }
                            // Malformed input: ignore, keep the connection.
                            None => {
                                tracing::debug!(
                                    name = %attached.name,
                                    "ignoring malformed inbound frame"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state
        .manager
        .disconnect(&attached.session, &attached.name, attached.socket_id)
        .await;
}

/// Send the structured error frame, then close with a policy violation.
async fn reject<S>(ws_tx: &mut S, err: &AttachError)
where
    S: SinkExt<Message> + Unpin,
{
    let message = err.to_string();
    let _ = ws_tx.send(Message::Text(error_frame(&message).into())).await;
    let close = CloseFrame {
        code: close_code::POLICY,
        reason: message.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(close))).await;
}
