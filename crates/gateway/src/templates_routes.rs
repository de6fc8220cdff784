use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, Query, State},
        http::StatusCode,
        response::IntoResponse,
    },
    burrow_common::Error,
    burrow_templates::{NewTemplate, TemplateKind, TemplatePatch},
    serde::Deserialize,
};

use crate::{error::ApiResult, state::AppState};

#[derive(Deserialize)]
pub struct KindQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn parse_kind(raw: Option<&str>) -> ApiResult<Option<TemplateKind>> {
    match raw {
        None => Ok(None),
        Some(raw) => TemplateKind::parse(raw)
            .map(Some)
            .ok_or_else(|| Error::validation(format!("unknown template type '{raw}'")).into()),
    }
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KindQuery>,
) -> ApiResult<impl IntoResponse> {
    let kind = parse_kind(query.kind.as_deref())?;
    Ok(Json(state.templates.list(kind).await?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewTemplate>,
) -> ApiResult<impl IntoResponse> {
    let created = state.templates.create(input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.templates.get(&id).await?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<TemplatePatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.templates.update(&id, patch).await?))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.templates.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
