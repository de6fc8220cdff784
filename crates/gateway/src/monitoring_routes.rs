use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{
            Path, Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        http::StatusCode,
        response::IntoResponse,
    },
    burrow_common::Error,
    burrow_monitor::MonitorConfig,
    serde::Deserialize,
    tracing::debug,
};

use crate::{error::ApiResult, state::AppState};

#[derive(Deserialize)]
pub struct EnableRequest {
    container_id: String,
    #[serde(flatten)]
    config: MonitorConfig,
}

/// Enable monitoring on a PTY session. The session must be live in the
/// multiplexer; its container identity comes from there.
pub async fn enable(
    State(state): State<Arc<AppState>>,
    Path(pty_id): Path<String>,
    Json(request): Json<EnableRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .mux
        .get(&pty_id)
        .await
        .ok_or_else(|| Error::not_found(format!("pty session {pty_id} not found")))?;
    if session.container_id != request.container_id {
        return Err(Error::validation("pty session belongs to another container").into());
    }
    state
        .engine
        .enable(
            &session.container_id,
            &pty_id,
            &session.runtime_id,
            request.config,
        )
        .await?;
    Ok(Json(state.engine.status(&pty_id)?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(pty_id): Path<String>,
    Json(config): Json<MonitorConfig>,
) -> ApiResult<impl IntoResponse> {
    state.engine.update_config(&pty_id, config).await?;
    Ok(Json(state.engine.status(&pty_id)?))
}

pub async fn disable(
    State(state): State<Arc<AppState>>,
    Path(pty_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.engine.disable(&pty_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(pty_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.status(&pty_id)?))
}

#[derive(Deserialize)]
pub struct ContextQuery {
    bytes: Option<usize>,
}

pub async fn context(
    State(state): State<Arc<AppState>>,
    Path(pty_id): Path<String>,
    Query(query): Query<ContextQuery>,
) -> ApiResult<impl IntoResponse> {
    let window = state
        .engine
        .context(&pty_id, query.bytes.unwrap_or(usize::MAX))?;
    Ok(Json(serde_json::json!({
        "context": String::from_utf8_lossy(&window),
    })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

pub async fn automation_logs(
    State(state): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let entries = state
        .automation_logs
        .list_for_container(&container_id, query.limit.unwrap_or(100).min(1000))
        .await?;
    Ok(Json(entries))
}

/// Stream status snapshots to a subscriber until it disconnects.
pub async fn subscribe_ws(
    State(state): State<Arc<AppState>>,
    Path(pty_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_status(socket, state, pty_id))
}

async fn stream_status(socket: WebSocket, state: Arc<AppState>, pty_id: String) {
    use futures::{SinkExt, StreamExt};

    let (mut ws_tx, mut ws_rx) = socket.split();
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let mut rx = match state.engine.subscribe(&pty_id, &subscriber_id) {
        Ok(rx) => rx,
        Err(e) => {
            let _ = ws_tx
                .send(Message::Text(
                    serde_json::json!({ "type": "error", "message": e.to_string() })
                        .to_string()
                        .into(),
                ))
                .await;
            return;
        },
    };

    loop {
        tokio::select! {
            status = rx.recv() => {
                let Some(status) = status else { break };
                let Ok(frame) = serde_json::to_string(&status) else { continue };
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            },
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {},
                }
            },
        }
    }

    state.engine.unsubscribe(&pty_id, &subscriber_id);
    debug!(pty_id, subscriber_id, "monitoring subscriber detached");
}
