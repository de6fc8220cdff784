use std::sync::Arc;

use {
    axum::{
        Router,
        routing::{any, delete, get, post, put},
    },
    burrow_config::BurrowConfig,
    burrow_headless::{ConversationStore, HeadlessManager, ModeArbiter},
    burrow_monitor::{AutomationLogStore, MonitorConfigStore, MonitorEngine, TaskStore},
    burrow_proxy::ProxyClient,
    burrow_runtime::{
        ContainerController, ContainerRuntime,
        ports::PortAllocator,
        profiles::ProfileStore,
        store::ContainerStore,
    },
    burrow_templates::TemplateStore,
    burrow_term::{HistoryStore, PtyMultiplexer},
    sqlx::SqlitePool,
    tokio_util::sync::CancellationToken,
    tower_http::trace::TraceLayer,
    tracing::info,
};

use crate::{
    containers, headless_ws, monitoring_routes, profiles_routes, proxy_routes, state::AppState,
    tasks_routes, templates_routes, terminal_ws,
};

/// Create every table the stores need. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> burrow_common::Result<()> {
    ContainerStore::init(pool).await?;
    PortAllocator::init(pool).await?;
    ProfileStore::init(pool).await?;
    TemplateStore::init(pool).await?;
    HistoryStore::init(pool).await?;
    PtyMultiplexer::init(pool).await?;
    TaskStore::init(pool).await?;
    AutomationLogStore::init(pool).await?;
    MonitorConfigStore::init(pool).await?;
    ConversationStore::init(pool).await?;
    Ok(())
}

/// Construct the component graph leaves-first and install the callback
/// seams that keep the PTY multiplexer and the monitoring engine (and the
/// controller and the arbiter) free of cyclic imports.
pub async fn build_state(
    config: BurrowConfig,
    pool: SqlitePool,
    runtime: Arc<dyn ContainerRuntime>,
) -> burrow_common::Result<Arc<AppState>> {
    init_schema(&pool).await?;

    let templates = Arc::new(TemplateStore::new(pool.clone()));
    let profiles = Arc::new(ProfileStore::new(pool.clone()));
    let tasks = Arc::new(TaskStore::new(pool.clone()));
    let automation_logs = Arc::new(AutomationLogStore::new(pool.clone()));
    let history = Arc::new(HistoryStore::new(pool.clone(), config.history.clone()));

    let mux = Arc::new(PtyMultiplexer::new(
        runtime.clone(),
        history.clone(),
        pool.clone(),
        config.terminal.clone(),
    ));
    let engine = Arc::new(MonitorEngine::new(
        runtime.clone(),
        tasks.clone(),
        automation_logs.clone(),
        Arc::new(MonitorConfigStore::new(pool.clone())),
        config.monitor.clone(),
        config.assistant.binary.clone(),
    ));
    let headless = Arc::new(HeadlessManager::new(
        runtime.clone(),
        Arc::new(ConversationStore::new(pool.clone())),
        config.assistant.clone(),
    ));
    let arbiter = Arc::new(ModeArbiter::new());
    let controller = Arc::new(ContainerController::new(
        runtime,
        Arc::new(ContainerStore::new(pool.clone())),
        Arc::new(PortAllocator::new(pool.clone())),
        profiles.clone(),
        templates.clone(),
        config.clone(),
    ));

    // PTY output feeds the monitoring engine.
    {
        let engine = engine.clone();
        mux.set_output_callback(Arc::new(move |session_id, data| {
            engine.on_pty_output(session_id, data);
        }));
    }
    // Strategies write back into the PTY.
    {
        let mux = mux.clone();
        engine.set_pty_writer(Arc::new(move |session_id, bytes| {
            let mux = mux.clone();
            Box::pin(async move { mux.write(&session_id, &bytes).await })
        }));
    }
    // Enabling monitoring shields the session from idle reclamation.
    {
        let mux = mux.clone();
        engine.set_pty_protector(Arc::new(move |session_id, protected| {
            let mux = mux.clone();
            Box::pin(async move {
                if let Some(session) = mux.get(&session_id).await {
                    session.set_protected(protected);
                }
            })
        }));
    }
    // Stop/delete closes every PTY session first, protected or not.
    {
        let mux = mux.clone();
        controller.set_session_closer(Arc::new(move |runtime_id| {
            let mux = mux.clone();
            Box::pin(async move { mux.close_for_runtime(&runtime_id).await })
        }));
    }
    // Mode switches tear down the other side's sessions.
    {
        let mux = mux.clone();
        arbiter.set_interactive_closer(Arc::new(move |container_id| {
            let mux = mux.clone();
            Box::pin(async move { mux.close_for_container(&container_id).await })
        }));
    }
    {
        let headless = headless.clone();
        arbiter.set_headless_closer(Arc::new(move |container_id| {
            let headless = headless.clone();
            Box::pin(async move { headless.close_for_container(&container_id).await })
        }));
    }

    Ok(Arc::new(AppState {
        config,
        controller,
        mux,
        history,
        engine,
        headless,
        arbiter,
        templates,
        profiles,
        tasks,
        automation_logs,
        proxy: Arc::new(ProxyClient::new()),
    }))
}

/// Spawn the background loops, rooted at `shutdown`.
pub fn spawn_background(state: &Arc<AppState>, shutdown: &CancellationToken) {
    tokio::spawn(state.history.clone().run_flush_loop(shutdown.child_token()));
    tokio::spawn(state.mux.clone().run_idle_sweeper(shutdown.child_token()));
    tokio::spawn(state.engine.clone().run_sweeper(shutdown.child_token()));
}

/// The full `/api` router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Containers
        .route(
            "/api/containers",
            get(containers::list).post(containers::create),
        )
        .route("/api/containers/docker", get(containers::list_orphans))
        .route(
            "/api/containers/docker/{runtime_id}/stop",
            post(containers::stop_orphan),
        )
        .route(
            "/api/containers/docker/{runtime_id}",
            delete(containers::remove_orphan),
        )
        .route(
            "/api/containers/{id}",
            get(containers::get).delete(containers::remove),
        )
        .route("/api/containers/{id}/status", get(containers::status))
        .route("/api/containers/{id}/logs", get(containers::logs))
        .route("/api/containers/{id}/start", post(containers::start))
        .route("/api/containers/{id}/stop", post(containers::stop))
        .route("/api/containers/{id}/terminal", get(terminal_ws::upgrade))
        .route("/api/containers/{id}/headless", get(headless_ws::upgrade))
        // Config template catalog
        .route(
            "/api/claude-configs",
            get(templates_routes::list).post(templates_routes::create),
        )
        .route(
            "/api/claude-configs/{id}",
            get(templates_routes::get)
                .put(templates_routes::update)
                .delete(templates_routes::remove),
        )
        // Profiles
        .route(
            "/api/profiles",
            get(profiles_routes::list).post(profiles_routes::create),
        )
        .route("/api/profiles/{id}", delete(profiles_routes::remove))
        // Monitoring
        .route(
            "/api/monitoring/{pty_id}",
            post(monitoring_routes::enable)
                .put(monitoring_routes::update)
                .delete(monitoring_routes::disable),
        )
        .route(
            "/api/monitoring/{pty_id}/status",
            get(monitoring_routes::status),
        )
        .route(
            "/api/monitoring/{pty_id}/context",
            get(monitoring_routes::context),
        )
        .route(
            "/api/monitoring/{pty_id}/ws",
            get(monitoring_routes::subscribe_ws),
        )
        .route(
            "/api/monitoring/container/{container_id}/logs",
            get(monitoring_routes::automation_logs),
        )
        // Task queue
        .route(
            "/api/tasks/{container_id}",
            get(tasks_routes::list).post(tasks_routes::add),
        )
        .route(
            "/api/tasks/{container_id}/{task_id}",
            put(tasks_routes::update).delete(tasks_routes::remove),
        )
        // Reverse proxy (HTTP + WebSocket)
        .route("/api/proxy/{id}/{port}", any(proxy_routes::forward_root))
        .route(
            "/api/proxy/{id}/{port}/{*path}",
            any(proxy_routes::forward),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the token fires.
pub async fn run(
    state: Arc<AppState>,
    bind: &str,
    port: u16,
    shutdown: CancellationToken,
) -> burrow_common::Result<()> {
    spawn_background(&state, &shutdown);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind((bind, port)).await?;
    info!(bind, port, "burrow gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}
