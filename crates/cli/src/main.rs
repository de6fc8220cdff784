use std::{path::PathBuf, sync::Arc};

use {
    clap::Parser,
    sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    tokio_util::sync::CancellationToken,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use burrow_runtime::DockerRuntime;

#[derive(Parser)]
#[command(name = "burrow", about = "Burrow — ephemeral developer sandbox orchestrator")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long)]
    port: Option<u16>,

    /// Custom data directory for the database (overrides default).
    #[arg(long, env = "BURROW_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = burrow_config::discover_and_load();
    if let Some(bind) = &cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(burrow_config::data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let database_path = config
        .server
        .database_path
        .clone()
        .unwrap_or_else(|| data_dir.join("burrow.db"));
    info!(path = %database_path.display(), "opening database");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&database_path)
                .create_if_missing(true),
        )
        .await?;

    let runtime = Arc::new(DockerRuntime::connect()?);
    let state = burrow_gateway::build_state(config.clone(), pool, runtime).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    burrow_gateway::run(state, &config.server.bind, config.server.port, shutdown).await?;
    info!("burrow gateway stopped");
    Ok(())
}
