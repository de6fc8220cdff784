//! Reverse proxy into in-container service ports. Stateless per request:
//! the gateway resolves the container's live address and hands it in as a
//! [`ProxyTarget`]; this crate does the forwarding and rewriting for both
//! plain HTTP and WebSocket upgrades.

use {
    axum::{
        body::Body,
        extract::ws::{Message as AxumMessage, WebSocket},
        http::{HeaderMap, HeaderValue, Method, StatusCode, header},
        response::Response,
    },
    futures::{SinkExt, StreamExt},
    tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage},
    tracing::{debug, warn},
};

/// Where one request goes.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    /// Container address, freshly resolved for this request.
    pub ip: String,
    /// Service port inside the container.
    pub port: u16,
    /// The proxy prefix for this container/port pair, e.g.
    /// `/api/proxy/<id>/<port>`. Used for Location rewriting.
    pub base_path: String,
}

impl ProxyTarget {
    fn authority(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    fn url(&self, path: &str, query: Option<&str>) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        match query {
            Some(query) if !query.is_empty() => {
                format!("http://{}{}?{}", self.authority(), path, query)
            },
            _ => format!("http://{}{}", self.authority(), path),
        }
    }
}

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// Stateless HTTP forwarder.
pub struct ProxyClient {
    http: reqwest::Client,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        Self {
            // Upstream redirects must come back to the client (and get
            // their Location rewritten), not be followed internally.
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
        }
    }

    /// Forward one HTTP request into the container and translate the
    /// response back, rewriting Location headers onto the proxy base
    /// path. Upstream failures surface as 502.
    #[allow(clippy::too_many_arguments)]
    pub async fn forward(
        &self,
        target: &ProxyTarget,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: bytes::Bytes,
        client_ip: &str,
        original_host: &str,
        original_proto: &str,
    ) -> Response {
        let url = target.url(path, query);
        debug!(%url, %method, "proxying request");

        let mut request = self.http.request(method, &url).body(body);
        for (name, value) in headers {
            if is_hop_by_hop(name.as_str()) || name == header::HOST {
                continue;
            }
            request = request.header(name, value);
        }
        let forwarded_for = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {client_ip}"),
            None => client_ip.to_string(),
        };
        request = request
            .header(header::HOST, target.authority())
            .header("x-forwarded-host", original_host)
            .header("x-forwarded-proto", original_proto)
            .header("x-real-ip", client_ip)
            .header("x-forwarded-for", forwarded_for);

        let upstream = match request.send().await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(%url, error = %e, "upstream request failed");
                return bad_gateway(&e.to_string());
            },
        };

        let status = upstream.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if name == header::LOCATION {
                if let Ok(location) = value.to_str() {
                    let rewritten = rewrite_location(location, target);
                    if let Ok(value) = HeaderValue::from_str(&rewritten) {
                        builder = builder.header(header::LOCATION, value);
                        continue;
                    }
                }
            }
            builder = builder.header(name, value);
        }

        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(%url, error = %e, "upstream body read failed");
                return bad_gateway(&e.to_string());
            },
        };
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| bad_gateway("invalid upstream response"))
    }
}

fn bad_gateway(message: &str) -> Response {
    let body = format!("{{\"error\": \"upstream unavailable: {message}\"}}");
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// Rewrite a redirect Location onto the proxy base path.
///
/// Only locations pointing back at the target (relative, or absolute with
/// the target's host) are touched; anything already carrying the prefix
/// is left alone to avoid double-prefixing.
pub fn rewrite_location(location: &str, target: &ProxyTarget) -> String {
    // Absolute URL: rewrite only when it points at the target itself.
    if let Some(rest) = location
        .strip_prefix("http://")
        .or_else(|| location.strip_prefix("https://"))
    {
        let (host, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };
        if host == target.authority() || host == target.ip {
            return prefix_path(path, &target.base_path);
        }
        return location.to_string();
    }

    // Relative: host is "empty", always ours to rewrite.
    if location.starts_with('/') {
        return prefix_path(location, &target.base_path);
    }
    location.to_string()
}

fn prefix_path(path: &str, base: &str) -> String {
    if path.starts_with(base) {
        path.to_string()
    } else {
        format!("{base}{path}")
    }
}

/// Bridge an accepted client WebSocket to the in-container service. The
/// underlying connection preserves the upgrade headers; frames are
/// relayed verbatim in both directions until either side closes.
pub async fn bridge_websocket(client: WebSocket, target: ProxyTarget, path: &str, query: Option<&str>) {
    let url = format!(
        "ws://{}{}{}",
        target.authority(),
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        },
        match query {
            Some(query) if !query.is_empty() => format!("?{query}"),
            _ => String::new(),
        }
    );

    let (upstream, _) = match connect_async(&url).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(%url, error = %e, "websocket upstream connect failed");
            let mut client = client;
            let _ = client
                .send(AxumMessage::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1014,
                    reason: "upstream unavailable".into(),
                })))
                .await;
            return;
        },
    };
    debug!(%url, "websocket bridged");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let forwarded = match message {
                AxumMessage::Text(text) => TungsteniteMessage::text(text.to_string()),
                AxumMessage::Binary(data) => TungsteniteMessage::binary(data),
                AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
                AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
                AxumMessage::Close(_) => break,
            };
            if upstream_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let forwarded = match message {
                TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
                TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
                TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
                TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
                TungsteniteMessage::Close(_) => break,
                TungsteniteMessage::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
    debug!(%url, "websocket bridge closed");
}
