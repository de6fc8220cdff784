use std::{sync::Arc, time::Duration};

use {
    axum::{
        extract::{
            Path, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        response::IntoResponse,
    },
    burrow_headless::{SessionEvent, SessionInfo},
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    serde::Deserialize,
    tokio::sync::mpsc,
    tracing::{debug, info},
};

use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(54);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const HISTORY_PAGE: usize = 20;

type WsSink = SplitSink<WebSocket, Message>;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    /// Open (or attach to) the container's headless session.
    Start { conversation_id: Option<String> },
    Prompt { text: String, model: Option<String> },
    Cancel,
    LoadMore { before_idx: i64 },
    ModeSwitch { mode: String },
    Ping,
}

/// What one select iteration produced; handled after the select so no
/// branch future borrow outlives it.
enum Step {
    Event(Option<SessionEvent>),
    Incoming(Option<Result<Message, axum::Error>>),
    Ping,
    Timeout,
}

fn frame(value: serde_json::Value) -> Message {
    Message::Text(value.to_string().into())
}

fn error_frame(message: &str) -> Message {
    frame(serde_json::json!({ "type": "error", "message": message }))
}

fn session_info_frame(info: &SessionInfo) -> Message {
    frame(serde_json::json!({ "type": "session_info", "session": info }))
}

fn event_frame(event: &SessionEvent) -> Message {
    match event {
        SessionEvent::Event { turn_id, payload } => frame(serde_json::json!({
            "type": "event",
            "turn_id": turn_id,
            "event": payload,
        })),
        SessionEvent::TurnComplete { turn } => frame(serde_json::json!({
            "type": "turn_complete",
            "turn": turn,
        })),
    }
}

/// Headless channel: drive the assistant programmatically over one
/// socket, with history paging and mid-turn replay on reconnect.
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| drive_headless(socket, state, id))
}

async fn drive_headless(socket: WebSocket, state: Arc<AppState>, container_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client_id = uuid::Uuid::new_v4().to_string();
    let mut attached: Option<(String, mpsc::Receiver<SessionEvent>)> = None;

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    let mut read_deadline = tokio::time::Instant::now() + READ_TIMEOUT;

    loop {
        let step = next_step(&mut attached, &mut ws_rx, &mut ping, read_deadline).await;
        match step {
            Step::Event(Some(event)) => {
                if ws_tx.send(event_frame(&event)).await.is_err() {
                    break;
                }
            },
            Step::Event(None) => {
                // The session closed underneath this client.
                attached = None;
                if ws_tx
                    .send(frame(serde_json::json!({ "type": "no_session" })))
                    .await
                    .is_err()
                {
                    break;
                }
            },
            Step::Ping => {
                if ws_tx
                    .send(frame(serde_json::json!({ "type": "ping" })))
                    .await
                    .is_err()
                {
                    break;
                }
            },
            Step::Timeout => {
                debug!(container_id, "headless read timeout");
                break;
            },
            Step::Incoming(incoming) => {
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
                let parsed = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        if ws_tx
                            .send(error_frame(&format!("invalid message: {e}")))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        continue;
                    },
                };
                if !handle_message(
                    &mut ws_tx,
                    &state,
                    &container_id,
                    &client_id,
                    &mut attached,
                    parsed,
                )
                .await
                {
                    break;
                }
            },
        }
    }

    if let Some((session_id, _)) = attached {
        state.headless.unsubscribe(&session_id, &client_id);
    }
    info!(container_id, client_id, "headless client detached");
}

async fn next_step(
    attached: &mut Option<(String, mpsc::Receiver<SessionEvent>)>,
    ws_rx: &mut SplitStream<WebSocket>,
    ping: &mut tokio::time::Interval,
    read_deadline: tokio::time::Instant,
) -> Step {
    tokio::select! {
        event = async {
            match attached.as_mut() {
                Some((_, rx)) => rx.recv().await,
                None => std::future::pending().await,
            }
        } => Step::Event(event),
        incoming = ws_rx.next() => Step::Incoming(incoming),
        _ = ping.tick() => Step::Ping,
        _ = tokio::time::sleep_until(read_deadline) => Step::Timeout,
    }
}

/// Returns false when the socket is gone.
async fn handle_message(
    ws_tx: &mut WsSink,
    state: &Arc<AppState>,
    container_id: &str,
    client_id: &str,
    attached: &mut Option<(String, mpsc::Receiver<SessionEvent>)>,
    message: ClientMessage,
) -> bool {
    match message {
        ClientMessage::Start { conversation_id } => {
            // Starting headless work claims the container: all PTY
            // sessions are closed before the assistant takes over.
            let closed = state.arbiter.switch_to_headless(container_id).await;

            let container = match state.controller.get(container_id).await {
                Ok(container) => container,
                Err(e) => return ws_tx.send(error_frame(&e.to_string())).await.is_ok(),
            };

            // Reattach when the requested conversation is already live.
            let existing = state
                .headless
                .session_for_container(container_id)
                .filter(|session| match &conversation_id {
                    Some(requested) => &session.conversation_id == requested,
                    None => true,
                });

            let info = match existing {
                Some(session) => state.headless.session_info(&session),
                None => {
                    match state
                        .headless
                        .create_session(container_id, &container.runtime_id, conversation_id)
                        .await
                    {
                        Ok(info) => info,
                        Err(e) => {
                            return ws_tx.send(error_frame(&e.to_string())).await.is_ok();
                        },
                    }
                },
            };

            let (rx, replay) = match state.headless.subscribe(&info.session_id, client_id).await {
                Ok(subscribed) => subscribed,
                Err(e) => return ws_tx.send(error_frame(&e.to_string())).await.is_ok(),
            };

            if ws_tx
                .send(frame(serde_json::json!({
                    "type": "mode_switched",
                    "mode": "headless",
                    "closed_pty_sessions": closed,
                })))
                .await
                .is_err()
            {
                return false;
            }
            if ws_tx.send(session_info_frame(&info)).await.is_err() {
                return false;
            }

            // Completed history, then the in-flight turn's replay, then
            // live events from the subscription.
            let history = state
                .headless
                .store()
                .recent_turns(&info.conversation_id, HISTORY_PAGE)
                .await;
            match history {
                Ok((turns, has_more)) => {
                    if ws_tx
                        .send(frame(serde_json::json!({
                            "type": "history",
                            "turns": turns,
                            "has_more": has_more,
                        })))
                        .await
                        .is_err()
                    {
                        return false;
                    }
                },
                Err(e) => {
                    if ws_tx.send(error_frame(&e.to_string())).await.is_err() {
                        return false;
                    }
                },
            }
            for event in &replay {
                if ws_tx.send(event_frame(event)).await.is_err() {
                    return false;
                }
            }

            *attached = Some((info.session_id, rx));
            true
        },
        ClientMessage::Prompt { text, model } => {
            let Some((session_id, _)) = attached.as_ref() else {
                return ws_tx
                    .send(frame(serde_json::json!({ "type": "no_session" })))
                    .await
                    .is_ok();
            };
            match state
                .headless
                .send_prompt(session_id, &text, "websocket", model.as_deref())
                .await
            {
                Ok(turn) => ws_tx
                    .send(frame(serde_json::json!({
                        "type": "event",
                        "turn_id": turn.id,
                        "event": { "type": "turn_started", "turn": turn },
                    })))
                    .await
                    .is_ok(),
                Err(e) => ws_tx.send(error_frame(&e.to_string())).await.is_ok(),
            }
        },
        ClientMessage::Cancel => {
            let Some((session_id, _)) = attached.as_ref() else {
                return ws_tx
                    .send(frame(serde_json::json!({ "type": "no_session" })))
                    .await
                    .is_ok();
            };
            match state.headless.cancel(session_id).await {
                Ok(()) => true,
                Err(e) => ws_tx.send(error_frame(&e.to_string())).await.is_ok(),
            }
        },
        ClientMessage::LoadMore { before_idx } => {
            let Some((session_id, _)) = attached.as_ref() else {
                return ws_tx
                    .send(frame(serde_json::json!({ "type": "no_session" })))
                    .await
                    .is_ok();
            };
            let conversation_id = match state.headless.get_session(session_id) {
                Ok(session) => session.conversation_id.clone(),
                Err(e) => return ws_tx.send(error_frame(&e.to_string())).await.is_ok(),
            };
            match state
                .headless
                .store()
                .turns_before(&conversation_id, before_idx, HISTORY_PAGE)
                .await
            {
                Ok((turns, has_more)) => ws_tx
                    .send(frame(serde_json::json!({
                        "type": "history_more",
                        "turns": turns,
                        "has_more": has_more,
                    })))
                    .await
                    .is_ok(),
                Err(e) => ws_tx.send(error_frame(&e.to_string())).await.is_ok(),
            }
        },
        ClientMessage::ModeSwitch { mode } => match mode.as_str() {
            "interactive" => {
                if let Some((session_id, _)) = attached.take() {
                    state.headless.unsubscribe(&session_id, client_id);
                }
                state.arbiter.switch_to_interactive(container_id).await;
                ws_tx
                    .send(frame(serde_json::json!({
                        "type": "mode_switched",
                        "mode": "interactive",
                    })))
                    .await
                    .is_ok()
            },
            "headless" => {
                let closed = state.arbiter.switch_to_headless(container_id).await;
                ws_tx
                    .send(frame(serde_json::json!({
                        "type": "mode_switched",
                        "mode": "headless",
                        "closed_pty_sessions": closed,
                    })))
                    .await
                    .is_ok()
            },
            other => ws_tx
                .send(error_frame(&format!("unknown mode '{other}'")))
                .await
                .is_ok(),
        },
        ClientMessage::Ping => ws_tx
            .send(frame(serde_json::json!({ "type": "pong" })))
            .await
            .is_ok(),
    }
}
