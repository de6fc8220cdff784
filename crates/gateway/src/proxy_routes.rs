use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        body::Body,
        extract::{ConnectInfo, FromRequestParts, Path, State, WebSocketUpgrade},
        http::{Request, Uri},
        response::{IntoResponse, Response},
    },
    burrow_proxy::ProxyTarget,
};

use crate::{error::ApiResult, state::AppState};

async fn resolve(state: &AppState, id: &str, port: u16) -> burrow_common::Result<ProxyTarget> {
    // Fresh resolution on every request; addresses move when containers
    // restart.
    let ip = state.controller.container_ip(id).await?;
    Ok(ProxyTarget {
        ip,
        port,
        base_path: format!("/api/proxy/{id}/{port}"),
    })
}

pub async fn forward_root(
    State(state): State<Arc<AppState>>,
    Path((id, port)): Path<(String, u16)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> ApiResult<Response> {
    forward_inner(state, id, port, String::new(), addr, request).await
}

pub async fn forward(
    State(state): State<Arc<AppState>>,
    Path((id, port, path)): Path<(String, u16, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> ApiResult<Response> {
    forward_inner(state, id, port, path, addr, request).await
}

async fn forward_inner(
    state: Arc<AppState>,
    id: String,
    port: u16,
    path: String,
    addr: SocketAddr,
    request: Request<Body>,
) -> ApiResult<Response> {
    let target = resolve(&state, &id, port).await?;
    let suffix = format!("/{path}");
    let query = request.uri().query().map(String::from);

    let (mut parts, body) = request.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state).await.ok();
    let request = Request::from_parts(parts, body);

    // WebSocket upgrades ride the same resolution path; the bridge keeps
    // the upgrade headers intact end to end.
    if let Some(ws) = ws {
        let response = ws.on_upgrade(move |socket| async move {
            burrow_proxy::bridge_websocket(socket, target, &suffix, query.as_deref()).await;
        });
        return Ok(response.into_response());
    }

    let method = request.method().clone();
    let headers = request.headers().clone();
    let original_host = host_of(request.uri(), &headers);
    let body = axum::body::to_bytes(request.into_body(), 16 * 1024 * 1024)
        .await
        .map_err(|e| burrow_common::Error::validation(format!("unreadable body: {e}")))?;

    Ok(state
        .proxy
        .forward(
            &target,
            method,
            &suffix,
            query.as_deref(),
            &headers,
            body,
            &addr.ip().to_string(),
            &original_host,
            "http",
        )
        .await)
}

fn host_of(uri: &Uri, headers: &axum::http::HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| uri.host().map(String::from))
        .unwrap_or_default()
}
