use std::{sync::Arc, time::Duration};

use {
    axum::{
        extract::{
            Path, Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        response::IntoResponse,
    },
    base64::Engine as _,
    burrow_common::Error,
    burrow_headless::ContainerMode,
    burrow_runtime::LifecycleStatus,
    futures::{SinkExt, StreamExt},
    serde::Deserialize,
    tracing::{debug, info, warn},
};

use crate::{error::ApiResult, state::AppState};

/// Server-initiated keepalive interval.
const PING_INTERVAL: Duration = Duration::from_secs(54);
/// Close the socket when nothing arrives from the client for this long.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
pub struct TerminalQuery {
    session_id: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
}

fn output_frame(data: &[u8]) -> Message {
    Message::Text(
        serde_json::json!({
            "type": "output",
            "encoding": "base64",
            "data": base64::engine::general_purpose::STANDARD.encode(data),
        })
        .to_string()
        .into(),
    )
}

fn error_frame(message: &str) -> Message {
    Message::Text(
        serde_json::json!({ "type": "error", "message": message })
            .to_string()
            .into(),
    )
}

fn tagged_frame(tag: &str) -> Message {
    Message::Text(serde_json::json!({ "type": tag }).to_string().into())
}

/// Interactive terminal channel: attach (or reattach) to the container's
/// PTY session and relay bytes both ways.
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<impl IntoResponse> {
    state.arbiter.ensure(&id, ContainerMode::Interactive)?;
    let container = state.controller.get(&id).await?;
    if container.status != LifecycleStatus::Running {
        return Err(Error::precondition("container is not running").into());
    }

    Ok(ws.on_upgrade(move |socket| {
        drive_terminal(socket, state, container.id, container.runtime_id, query)
    }))
}

async fn drive_terminal(
    socket: WebSocket,
    state: Arc<AppState>,
    container_id: String,
    runtime_id: String,
    query: TerminalQuery,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let cols = query.cols.unwrap_or(80);
    let rows = query.rows.unwrap_or(24);

    let session = match state
        .mux
        .get_or_create(&container_id, &runtime_id, query.session_id, cols, rows)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            let _ = ws_tx.send(error_frame(&e.to_string())).await;
            return;
        },
    };

    let client_id = uuid::Uuid::new_v4().to_string();
    let (mut output_rx, scrollback) = match state.mux.attach_client(&session.id, &client_id).await
    {
        Ok(attached) => attached,
        Err(e) => {
            let _ = ws_tx.send(error_frame(&e.to_string())).await;
            return;
        },
    };
    info!(session_id = %session.id, client_id = %client_id, "terminal client attached");

    // Accumulated scrollback first, then live frames.
    if !scrollback.is_empty() && ws_tx.send(output_frame(&scrollback)).await.is_err() {
        state.mux.remove_client(&session.id, &client_id).await;
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately

    let mut read_deadline = tokio::time::Instant::now() + READ_TIMEOUT;

    loop {
        tokio::select! {
            block = output_rx.recv() => {
                let Some(block) = block else {
                    // Session closed underneath us.
                    let _ = ws_tx.send(error_frame("session closed")).await;
                    break;
                };
                if ws_tx.send(output_frame(&block)).await.is_err() {
                    break;
                }
            },
            _ = ping.tick() => {
                if ws_tx.send(tagged_frame("ping")).await.is_err() {
                    break;
                }
            },
            _ = tokio::time::sleep_until(read_deadline) => {
                debug!(session_id = %session.id, "terminal read timeout");
                break;
            },
            incoming = ws_rx.next() => {
                let Some(Ok(message)) = incoming else { break };
                read_deadline = tokio::time::Instant::now() + READ_TIMEOUT;
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    Message::Ping(payload) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                        continue;
                    },
                    _ => continue,
                };
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Input { data }) => {
                        if let Err(e) = state.mux.write(&session.id, data.as_bytes()).await {
                            warn!(session_id = %session.id, error = %e, "pty write failed");
                            if ws_tx.send(error_frame(&e.to_string())).await.is_err() {
                                break;
                            }
                        }
                    },
                    Ok(ClientMessage::Resize { cols, rows }) => {
                        if cols == 0 || rows == 0 {
                            continue;
                        }
                        if let Err(e) = state.mux.resize(&session.id, cols, rows).await {
                            warn!(session_id = %session.id, error = %e, "pty resize failed");
                        }
                    },
                    Ok(ClientMessage::Ping) => {
                        if ws_tx.send(tagged_frame("pong")).await.is_err() {
                            break;
                        }
                    },
                    Err(e) => {
                        if ws_tx
                            .send(error_frame(&format!("invalid message: {e}")))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    },
                }
            },
        }
    }

    state.mux.remove_client(&session.id, &client_id).await;
    info!(session_id = %session.id, client_id = %client_id, "terminal client detached");
}
