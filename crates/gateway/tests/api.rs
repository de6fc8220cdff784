//! HTTP-level integration tests against the full router, backed by the
//! scripted container runtime and an in-memory database.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use {
    burrow_config::BurrowConfig,
    burrow_gateway::build_state,
    burrow_runtime::testing::FakeRuntime,
    tokio_util::sync::CancellationToken,
};

struct TestServer {
    base: String,
    client: reqwest::Client,
    runtime: Arc<FakeRuntime>,
    _shutdown: CancellationToken,
}

async fn spawn_server() -> TestServer {
    // Handlers and background workers hit the pool concurrently; a
    // single shared connection keeps one in-memory database for all.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let state = build_state(BurrowConfig::default(), pool, runtime.clone())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let app = burrow_gateway::router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;
    });

    TestServer {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        runtime,
        _shutdown: shutdown,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn wait_ready(&self, id: &str) -> serde_json::Value {
        for _ in 0..300 {
            let status: serde_json::Value = self
                .client
                .get(self.url(&format!("/api/containers/{id}/status")))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            match status["init_status"].as_str() {
                Some("ready") => return status,
                Some("failed") => panic!("init failed: {status}"),
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("container never became ready");
    }
}

#[tokio::test]
async fn create_inject_ready_flow() {
    let server = spawn_server().await;

    // Catalog two templates.
    let x: serde_json::Value = server
        .client
        .post(server.url("/api/claude-configs"))
        .json(&serde_json::json!({
            "name": "x", "kind": "instructions", "content": "# hi",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let y: serde_json::Value = server
        .client
        .post(server.url("/api/claude-configs"))
        .json(&serde_json::json!({
            "name": "y", "kind": "skill",
            "content": "---\nallowed_tools:\n  - Read\n---\n# s",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // Create a repo-less container selecting both.
    let response = server
        .client
        .post(server.url("/api/containers"))
        .json(&serde_json::json!({
            "name": "sandbox-e1",
            "skip_git_repo": true,
            "templates": {
                "instructions": x["id"],
                "skills": [y["id"]],
            },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let created: serde_json::Value = response.json().await.unwrap();
    let id = created["container"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["container"]["work_dir"], "/app");

    let status = server.wait_ready(&id).await;
    assert_eq!(
        status["injection_status"]["successful"],
        serde_json::json!(["x", "y"])
    );
    assert_eq!(status["injection_status"]["failed"], serde_json::json!([]));
}

#[tokio::test]
async fn injection_failure_is_tolerated() {
    let server = spawn_server().await;
    server.runtime.fail_runs_matching(".claude/commands/bad.md");

    let good: serde_json::Value = server
        .client
        .post(server.url("/api/claude-configs"))
        .json(&serde_json::json!({
            "name": "good", "kind": "instructions", "content": "# ok",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let bad: serde_json::Value = server
        .client
        .post(server.url("/api/claude-configs"))
        .json(&serde_json::json!({
            "name": "bad", "kind": "command", "content": "echo hi",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let created: serde_json::Value = server
        .client
        .post(server.url("/api/containers"))
        .json(&serde_json::json!({
            "name": "sandbox-e2",
            "skip_git_repo": true,
            "templates": {
                "instructions": good["id"],
                "commands": [bad["id"]],
            },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["container"]["id"].as_str().unwrap().to_string();

    let status = server.wait_ready(&id).await;
    assert_eq!(
        status["injection_status"]["successful"],
        serde_json::json!(["good"])
    );
    assert_eq!(
        status["injection_status"]["failed"][0]["template_name"],
        "bad"
    );
}

#[tokio::test]
async fn template_crud_and_conflicts() {
    let server = spawn_server().await;

    let create = |name: &str, kind: &str, content: &str| {
        let client = server.client.clone();
        let url = server.url("/api/claude-configs");
        let body = serde_json::json!({ "name": name, "kind": kind, "content": content });
        async move { client.post(url).json(&body).send().await.unwrap() }
    };

    assert_eq!(create("x", "instructions", "# hi").await.status(), 201);
    // Duplicate (name, kind) is a conflict; same name in another kind is not.
    assert_eq!(create("x", "instructions", "# again").await.status(), 409);
    assert_eq!(create("x", "command", "echo").await.status(), 201);
    // MCP validation gates creation.
    assert_eq!(
        create("srv", "mcp_server", r#"{"command": "npx"}"#)
            .await
            .status(),
        400
    );
    assert_eq!(
        create("srv", "mcp_server", r#"{"command": "npx", "args": []}"#)
            .await
            .status(),
        201
    );

    let listed: Vec<serde_json::Value> = server
        .client
        .get(server.url("/api/claude-configs?type=instructions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    // Unknown type is a 400, unknown id a 404.
    assert_eq!(
        server
            .client
            .get(server.url("/api/claude-configs?type=bogus"))
            .send()
            .await
            .unwrap()
            .status(),
        400
    );
    assert_eq!(
        server
            .client
            .get(server.url("/api/claude-configs/missing"))
            .send()
            .await
            .unwrap()
            .status(),
        404
    );
}

#[tokio::test]
async fn start_requires_ready_and_missing_is_404() {
    let server = spawn_server().await;

    assert_eq!(
        server
            .client
            .post(server.url("/api/containers/nope/start"))
            .send()
            .await
            .unwrap()
            .status(),
        404
    );

    // Repo without credential is a validation error.
    let response = server
        .client
        .post(server.url("/api/containers"))
        .json(&serde_json::json!({
            "name": "needs-cred",
            "git_url": "https://github.com/a/b.git",
            "repo_name": "b",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("credential"));
}

#[tokio::test]
async fn stop_then_start_round_trip() {
    let server = spawn_server().await;
    let created: serde_json::Value = server
        .client
        .post(server.url("/api/containers"))
        .json(&serde_json::json!({ "name": "cycler", "skip_git_repo": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["container"]["id"].as_str().unwrap().to_string();
    server.wait_ready(&id).await;

    let stop = server
        .client
        .post(server.url(&format!("/api/containers/{id}/stop")))
        .send()
        .await
        .unwrap();
    assert_eq!(stop.status(), 200);

    let start = server
        .client
        .post(server.url(&format!("/api/containers/{id}/start")))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status(), 200);

    let remove = server
        .client
        .delete(server.url(&format!("/api/containers/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(remove.status(), 200);
}

#[tokio::test]
async fn task_queue_crud() {
    let server = spawn_server().await;

    let t1: serde_json::Value = server
        .client
        .post(server.url("/api/tasks/c1"))
        .json(&serde_json::json!({ "text": "first" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    server
        .client
        .post(server.url("/api/tasks/c1"))
        .json(&serde_json::json!({ "text": "second" }))
        .send()
        .await
        .unwrap();

    let listed: Vec<serde_json::Value> = server
        .client
        .get(server.url("/api/tasks/c1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["text"], "first");

    // Invalid transition: pending -> completed.
    let task_id = t1["id"].as_str().unwrap();
    let bad = server
        .client
        .put(server.url(&format!("/api/tasks/c1/{task_id}")))
        .json(&serde_json::json!({ "state": "completed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    // The legacy alias is accepted on the wire.
    let ok = server
        .client
        .put(server.url(&format!("/api/tasks/c1/{task_id}")))
        .json(&serde_json::json!({ "state": "running" }))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    let updated: serde_json::Value = ok.json().await.unwrap();
    assert_eq!(updated["state"], "in_progress");
}

#[tokio::test]
async fn orphan_listing_and_cleanup() {
    let server = spawn_server().await;
    server.runtime.add_running("rt-stray", "stray");

    let orphans: Vec<serde_json::Value> = server
        .client
        .get(server.url("/api/containers/docker"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0]["runtime_id"], "rt-stray");

    assert_eq!(
        server
            .client
            .delete(server.url("/api/containers/docker/rt-stray"))
            .send()
            .await
            .unwrap()
            .status(),
        200
    );

    let orphans: Vec<serde_json::Value> = server
        .client
        .get(server.url("/api/containers/docker"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(orphans.is_empty());
}
