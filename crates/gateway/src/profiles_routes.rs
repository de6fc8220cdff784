use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, Query, State},
        http::StatusCode,
        response::IntoResponse,
    },
    burrow_common::Error,
    burrow_runtime::profiles::ProfileKind,
    serde::Deserialize,
};

use crate::{error::ApiResult, state::AppState};

#[derive(Deserialize)]
pub struct ProfileQuery {
    kind: Option<String>,
}

#[derive(Deserialize)]
pub struct NewProfile {
    name: String,
    kind: String,
    payload: String,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProfileQuery>,
) -> ApiResult<impl IntoResponse> {
    let kind = match query.kind.as_deref() {
        None => None,
        Some(raw) => Some(
            ProfileKind::parse(raw)
                .ok_or_else(|| Error::validation(format!("unknown profile kind '{raw}'")))?,
        ),
    };
    let mut profiles = state.profiles.list(kind).await?;
    // Credential payloads never leave the server.
    for profile in &mut profiles {
        if profile.kind == ProfileKind::Credential {
            profile.payload = "***".into();
        }
    }
    Ok(Json(profiles))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewProfile>,
) -> ApiResult<impl IntoResponse> {
    let kind = ProfileKind::parse(&input.kind)
        .ok_or_else(|| Error::validation(format!("unknown profile kind '{}'", input.kind)))?;
    let created = state
        .profiles
        .create(&input.name, kind, &input.payload)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": created.id, "name": created.name, "kind": created.kind })),
    ))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.profiles.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
