//! Storage Topology Manager
//!
//! Serves the device lifecycle REST API together with health and metrics
//! endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │  REST API :8080  │   │  Health  :8081   │   │  Metrics :9090   │
//! └────────┬─────────┘   └──────────────────┘   └────────┬─────────┘
//!          │                                             │
//!          └──────────────┐              ┌───────────────┘
//!                  ┌──────┴──────────────┴──────┐
//!                  │        Orchestrator        │
//!                  └──────┬──────────────┬──────┘
//!                         │              │
//!                 ┌───────┴──────┐ ┌─────┴────────┐
//!                 │   Executor   │ │  Placement   │
//!                 │              │ │     Pool     │
//!                 └──────────────┘ └──────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_topology_manager::{
    ApiServer, ApiServerConfig, ExecutorFactory, OperationMetrics, Orchestrator, PlacementPool,
    ServiceConfig, TopologyStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Topology Manager - device lifecycle control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Load the file configuration and apply overrides
    fn into_config(self) -> anyhow::Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ServiceConfig::default(),
        };

        if let Some(addr) = self.api_addr {
            config.api_addr = addr;
        }
        if let Some(addr) = self.health_addr {
            config.health_addr = addr;
        }
        if let Some(addr) = self.metrics_addr {
            config.metrics_addr = addr;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.log_json |= self.log_json;

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize logging
    init_logging(&config.log_level, config.log_json)?;

    info!("Starting Storage Topology Manager");
    info!("  Version: {}", storage_topology_manager::VERSION);
    info!("  REST API: {}", config.api_addr);
    info!("  Executor: {}", config.executor.kind);

    let store = TopologyStore::new();
    let executor = ExecutorFactory::create(&config.executor)?;
    let allocator = PlacementPool::new();
    let metrics = OperationMetrics::new()?;

    let orchestrator = Orchestrator::new(
        config.orchestrator_config(),
        store,
        executor,
        allocator,
        metrics,
    );

    // Start health server
    let health_addr = config.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = config.metrics_addr.clone();
    let metrics_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_orchestrator).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Prune finished jobs
    let prune_orchestrator = orchestrator.clone();
    let prune_interval = config.job_prune_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(prune_interval);
        loop {
            ticker.tick().await;
            prune_orchestrator.prune_jobs();
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: config.api_socket_addr()?,
        ..Default::default()
    };
    let api_server = ApiServer::new(api_config, orchestrator);

    let shutdown = api_server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown.send(());
        }
    });

    api_server.run().await.context("API server failed")?;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, json: bool) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("axum=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().context("invalid health server address")?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .await
        .context("health server error")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match orchestrator.metrics().encode() {
                            Ok(text) => {
                                let mut response = text_response(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    hyper::header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().context("invalid metrics server address")?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)?
        .serve(make_svc)
        .await
        .context("metrics server error")?;

    Ok(())
}
