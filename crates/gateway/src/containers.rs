use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, Query, State},
        http::StatusCode,
        response::IntoResponse,
    },
    burrow_runtime::{CreateContainerRequest, controller::StopOutcome},
    serde::Deserialize,
};

use crate::{error::ApiResult, state::AppState};

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateContainerRequest>,
) -> ApiResult<impl IntoResponse> {
    let container = state.controller.create(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "container": container,
            "message": "container created, initialization in progress",
        })),
    ))
}

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.list().await?))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.get(&id).await?))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let container = state.controller.get(&id).await?;
    Ok(Json(serde_json::json!({
        "status": container.status,
        "init_status": container.init_status,
        "init_message": container.init_message,
        "injection_status": container.injection,
    })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(100).min(10_000);
    let logs = state.controller.logs(&id, limit).await?;
    Ok(Json(serde_json::json!({ "logs": logs })))
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.start(&id).await?))
}

fn stop_response(outcome: StopOutcome, action: &str) -> impl IntoResponse {
    let status = match outcome {
        StopOutcome::Completed => StatusCode::OK,
        StopOutcome::Deferred => StatusCode::ACCEPTED,
    };
    let message = match outcome {
        StopOutcome::Completed => format!("{action} completed"),
        StopOutcome::Deferred => format!("{action} continuing in background"),
    };
    (status, Json(serde_json::json!({ "message": message })))
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.controller.stop(&id).await?;
    Ok(stop_response(outcome, "stop"))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.controller.delete(&id).await?;
    state.arbiter.forget(&id);
    Ok(stop_response(outcome, "delete"))
}

pub async fn list_orphans(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.list_orphans().await?))
}

pub async fn stop_orphan(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.controller.stop_orphan(&runtime_id).await?;
    Ok(Json(serde_json::json!({ "message": "orphan stopped" })))
}

pub async fn remove_orphan(
    State(state): State<Arc<AppState>>,
    Path(runtime_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.controller.remove_orphan(&runtime_id).await?;
    Ok(Json(serde_json::json!({ "message": "orphan removed" })))
}
