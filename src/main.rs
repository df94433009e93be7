//! claudefront HTTP server
//!
//! Starts an Axum web server that forwards Claude-compatible API traffic to a
//! pool of upstream endpoints, retrying and failing over across endpoints and
//! groups per configuration.

use axum::{
    Router, middleware,
    routing::{get, patch, post},
};
use clap::Parser;
use claudefront::{
    cli::{Cli, Command, generate_config_template},
    config::Config,
    handlers::{self, AppState},
    middleware::request_id_middleware,
    telemetry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// How often the background health checker probes endpoints, independent of
/// request traffic. Not operator-configurable; the retry/suspend knobs in
/// `config.toml` cover the behavior operators actually need to tune.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Command::Config { output } => {
                if let Err(e) = handle_config_command(output) {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
                return;
            }
        }
    }

    if let Err(e) = run_server(&cli.config).await {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

/// Generate a template configuration file, either to stdout or to a path.
fn handle_config_command(output: Option<String>) -> Result<(), String> {
    let template = generate_config_template();

    match output {
        Some(path) => {
            if std::path::Path::new(&path).exists() {
                return Err(format!("refusing to overwrite existing file: {path}"));
            }
            std::fs::write(&path, template).map_err(|e| format!("failed to write {path}: {e}"))?;
            eprintln!("Configuration template written to: {path}");
            eprintln!("Edit the file, then run: claudefront --config {path}");
        }
        None => print!("{template}"),
    }

    Ok(())
}

async fn run_server(config_path: &str) -> Result<(), claudefront::error::StartupError> {
    let config = Config::from_file(config_path)?;
    telemetry::init(&config.observability.log_level);

    tracing::info!(host = %config.server.host, port = config.server.port, "starting claudefront");

    let config = Arc::new(config);
    let state = AppState::new(config.clone())?;

    let http = reqwest::Client::builder()
        .build()
        .map_err(|e| claudefront::error::StartupError::Config(format!("failed to build http client: {e}")))?;
    state.spawn_background_tasks(HEALTH_CHECK_INTERVAL, http);

    let shutdown_state = state.clone();

    let app = Router::new()
        .route("/v1/messages", post(handlers::forward::handler))
        .route("/health", get(handlers::health::handler))
        .route("/metrics", get(handlers::metrics::handler))
        .route("/v1/admin/endpoints", get(handlers::management::list_endpoints))
        .route(
            "/v1/admin/endpoints/{name}/priority",
            patch(handlers::management::update_priority),
        )
        .route(
            "/v1/admin/endpoints/{name}/check",
            post(handlers::management::trigger_health_check),
        )
        .route("/v1/admin/groups", get(handlers::management::list_groups))
        .route("/v1/admin/groups/{name}/pause", post(handlers::management::pause_group))
        .route("/v1/admin/groups/{name}/resume", post(handlers::management::resume_group))
        .route(
            "/v1/admin/groups/{name}/force-activate",
            post(handlers::management::force_activate_group),
        )
        .route("/v1/admin/config", get(handlers::management::read_config))
        .route("/v1/admin/usage", get(handlers::management::query_usage))
        .route("/v1/admin/usage/export.csv", get(handlers::management::export_usage_csv))
        .route("/v1/admin/usage/export.json", get(handlers::management::export_usage_json))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http());

    let ip_addr = config.server.host.parse::<std::net::IpAddr>().map_err(|e| {
        claudefront::error::StartupError::Config(format!(
            "invalid host '{}' in config: {e}",
            config.server.host
        ))
    })?;
    let addr = SocketAddr::from((ip_addr, config.server.port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| claudefront::error::StartupError::Bind { addr: addr.to_string(), source })?;

    tracing::info!("listening on {addr}");
    tracing::info!("forwarding endpoint at http://{addr}/v1/messages");
    tracing::info!("management surface at http://{addr}/v1/admin/*");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_state))
        .await
        .map_err(|e| claudefront::error::StartupError::Bind { addr: addr.to_string(), source: e })?;

    tracing::info!("server shutdown complete");

    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown. Background tasks
/// (health checker, suspension-recovery listener) are plain `tokio::spawn`s
/// with no cancellation handle; they end when the process exits.
async fn shutdown_signal(_state: AppState) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
