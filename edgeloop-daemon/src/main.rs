// Edgeloop Daemon - Gateway control loop service
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # edgeloopd
//!
//! Runs the gateway control loop and serves its health, status and
//! Prometheus metrics over HTTP. Collectors without direct log access post
//! readings to `POST /ingest/{stream}`.
//!
//! ## Usage
//!
//! ```bash
//! # Pull config from the control plane
//! edgeloopd --gateway-id plant-7 --control-plane-url http://cp:8000
//!
//! # Offline, config from a local file
//! edgeloopd --gateway-id plant-7 --config /etc/edgeloop/gateway.json
//!
//! # Replay a recorded dataset through the validator and aggregator
//! edgeloopd replay --csv readings.csv --config gateway.json
//! ```
//!
//! Every flag can also be set through its environment variable.

mod ingest;
mod metrics;
mod replay;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::{Args as ClapArgs, Parser, Subcommand};
use edgeloop::{
    Alert, ConfigCache, DurableLog, GatewayError, HealthRollup, MemoryLog, ReadingCodec,
    SchemaCache,
};
use edgeloop_gateway::{
    ConfigNotifier, ControlPlane, DockerCliRuntime, DockerConfig, FileConfigSource, Gateway,
    GatewaySettings, GatewayView, GovernorStatus, HttpControlPlane, HttpDestination,
    HttpSchemaRegistry, InstanceTable, PipelineStats, PumpStatus,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Edge gateway control loop
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a CSV of readings through the validator and aggregator
    Replay {
        /// CSV with columns asset_id,parameter,value,unit,device_time
        #[arg(long)]
        csv: PathBuf,

        /// Gateway config providing rules and resolutions
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print every emitted window
        #[arg(long, default_value = "false")]
        windows: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Identity reported to the control plane
    #[arg(long, env = "GATEWAY_ID", default_value = "edgeloop")]
    gateway_id: String,

    /// Control plane base URL
    #[arg(long, env = "CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,

    /// Local config file, used when no control plane is configured
    #[arg(long = "config", env = "GATEWAY_CONFIG")]
    config_path: Option<PathBuf>,

    /// Schema registry base URL; builtin schemas only when unset
    #[arg(long, env = "SCHEMA_REGISTRY_URL")]
    schema_registry_url: Option<String>,

    /// Directory for the config and schema caches
    #[arg(long, env = "CACHE_DIR", default_value = "/var/lib/edgeloop")]
    cache_dir: PathBuf,

    /// Address to serve health and metrics on
    #[arg(long, env = "HEALTH_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "HEALTH_PORT", default_value = "8080")]
    port: u16,

    /// Local log capacity in bytes
    #[arg(long, env = "LOG_CAPACITY_BYTES", default_value = "8589934592")]
    log_capacity: u64,

    /// Destination URL for exported readings
    #[arg(long, env = "EXPORT_URL")]
    export_url: Option<String>,

    /// Topic delivered to the export destination
    #[arg(long, env = "EXPORT_TOPIC", default_value = edgeloop::topics::CLEAN)]
    export_topic: String,

    /// Docker network shared with the components
    #[arg(long, env = "DOCKER_NETWORK")]
    docker_network: Option<String>,

    /// Timeout of outbound HTTP calls, in seconds
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "10")]
    http_timeout_secs: u64,
}

/// Application state shared across handlers.
struct AppState {
    view: GatewayView,
    notifier: ConfigNotifier,
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    start_time: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_secs: u64,
    config_version: u64,
    health: HealthRollup,
    instances: Arc<InstanceTable>,
    governor: GovernorStatus,
    stats: PipelineStats,
    exports: Vec<PumpStatus>,
    recent_alerts: Vec<Alert>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let result = match args.command {
        Some(Command::Replay {
            csv,
            config,
            windows,
        }) => run_replay(replay::ReplayConfig {
            csv_path: csv,
            config_path: config,
            include_windows: windows,
        }),
        None => serve(args.run).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = e.kind(), "edgeloopd exiting");
            if e.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_replay(config: replay::ReplayConfig) -> edgeloop::Result<()> {
    let summary = replay::run(&config).map_err(|e| match e {
        replay::ReplayError::Gateway(inner) => inner,
        other => GatewayError::Config(other.to_string()),
    })?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn serve(args: RunArgs) -> edgeloop::Result<()> {
    info!("edgeloopd v{}", env!("CARGO_PKG_VERSION"));
    let timeout = Duration::from_secs(args.http_timeout_secs);

    let schemas = match &args.schema_registry_url {
        Some(url) => SchemaCache::with_registry(Arc::new(HttpSchemaRegistry::new(url.clone(), timeout)?)),
        None => SchemaCache::offline(),
    }
    .with_builtins()?
    .persisted_at(args.cache_dir.join("schemas.json"))?;
    let codec = ReadingCodec::new(Arc::new(schemas));

    let control_plane: Arc<dyn ControlPlane> = match (&args.control_plane_url, &args.config_path) {
        (Some(url), _) => Arc::new(HttpControlPlane::new(url.clone(), timeout)?),
        (None, Some(path)) => Arc::new(FileConfigSource::new(path.clone())),
        (None, None) => {
            return Err(GatewayError::Config(
                "either --control-plane-url or --config is required".into(),
            ))
        }
    };

    let runtime = DockerCliRuntime::new(DockerConfig {
        network: args.docker_network.clone(),
        ..Default::default()
    })?;
    let log: Arc<dyn DurableLog> = Arc::new(MemoryLog::new(args.log_capacity));

    let mut gateway = Gateway::new(
        GatewaySettings::new(args.gateway_id.clone()),
        Arc::clone(&log),
        codec.clone(),
        Arc::new(runtime),
        control_plane,
        ConfigCache::new(&args.cache_dir),
    );
    if let Some(url) = &args.export_url {
        info!(url = %url, topic = %args.export_topic, "export enabled");
        gateway = gateway.with_export(
            args.export_topic.clone(),
            Arc::new(HttpDestination::new("export", url.clone(), timeout)?),
        );
    }

    let handle = gateway.start().await?;
    let state = Arc::new(AppState {
        view: handle.view(),
        notifier: handle.notifier(),
        log,
        codec,
        start_time: Instant::now(),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/health/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/config/notify", post(notify_handler))
        .route("/ingest/:stream", post(ingest_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid listen address: {}", e)))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Health endpoint: http://{}/health", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    handle.shutdown().await;
    served.map_err(GatewayError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Gateway roll-up; 503 when unhealthy or offline
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.view.health();
    let code = if health.status.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn live_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Ready once a config is active and the gateway is operational
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.view.health();
    if state.view.config().version > 0 && health.status.is_ok() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let view = &state.view;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        config_version: view.config().version,
        health: view.health(),
        instances: view.instances(),
        governor: view.governor(),
        stats: view.stats(),
        exports: view.exports(),
        recent_alerts: view.recent_alerts(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    metrics::update_from_view(&state.view);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics::encode_metrics(),
    )
}

/// Push notification from the control plane
async fn notify_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.notifier.notify();
    (StatusCode::ACCEPTED, "Pull scheduled")
}

/// Append collector readings to a raw stream
async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Path(stream): Path<String>,
    Json(body): Json<ingest::IngestBody>,
) -> impl IntoResponse {
    let config = state.view.config();
    match ingest::ingest(
        state.log.as_ref(),
        &state.codec,
        &config,
        &stream,
        body,
        edgeloop::now_ms(),
    )
    .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => {
            let code = match &e {
                ingest::IngestError::UnknownStream(_) => StatusCode::NOT_FOUND,
                ingest::IngestError::EmptyBatch => StatusCode::BAD_REQUEST,
                ingest::IngestError::Gateway(GatewayError::StorageExhaustion(_)) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                ingest::IngestError::Gateway(GatewayError::Schema(_) | GatewayError::Json(_)) => {
                    StatusCode::BAD_REQUEST
                }
                ingest::IngestError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(stream = %stream, error = %e, "ingest rejected");
            (code, e.to_string()).into_response()
        }
    }
}
