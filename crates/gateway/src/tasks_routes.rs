use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
    },
    burrow_monitor::TaskState,
    serde::Deserialize,
};

use crate::{error::ApiResult, state::AppState};

#[derive(Deserialize)]
pub struct NewTask {
    text: String,
}

#[derive(Deserialize)]
pub struct TaskPatch {
    text: Option<String>,
    state: Option<TaskState>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(container_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.tasks.list(&container_id).await?))
}

pub async fn add(
    State(state): State<Arc<AppState>>,
    Path(container_id): Path<String>,
    Json(input): Json<NewTask>,
) -> ApiResult<impl IntoResponse> {
    let task = state.tasks.add(&container_id, &input.text).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path((_container_id, task_id)): Path<(String, String)>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<impl IntoResponse> {
    let mut task = state.tasks.get(&task_id).await?;
    if let Some(text) = patch.text.as_deref() {
        task = state.tasks.update_text(&task_id, text).await?;
    }
    if let Some(next_state) = patch.state {
        task = state.tasks.set_state(&task_id, next_state).await?;
    }
    Ok(Json(task))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path((_container_id, task_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.tasks.delete(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
