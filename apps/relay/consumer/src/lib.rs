//! Relay Consumer Service
//!
//! Starts and stops RabbitMQ consumers on demand and keeps what they receive.
//!
//! ## Architecture
//!
//! ```text
//! HTTP (/start_consumer, /stop_consumer, /messages, ...)
//!   ↓
//! ConsumerRegistry (one worker task per active queue)
//!   ↓ (lapin subscription, prefetch 1)
//! RabbitMQ
//!
//! ConsumerState → STATE_DIR/active_queues.json, received_messages.json
//! ```
//!
//! ## Features
//!
//! - Consumers persisted across restarts and respawned on startup
//! - Reconnect with exponential backoff per queue
//! - Graceful shutdown: workers drain, snapshots are flushed
//! - Health, readiness and Prometheus endpoints

use amqp_consumer::{
    ConsumerApiState, ConsumerRegistry, ConsumerState, LapinBroker, PersistMode,
    PersistenceGateway, WorkerConfig, consumer_router, metrics,
};
use axum::Router;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{AmqpConfig, Environment, FromEnv, ServerConfig, StateConfig, app_info};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

/// Port the consumer service listens on when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 5001;

/// Run the consumer service
///
/// 1. Sets up error reporting, logging and metrics
/// 2. Loads broker, state and server configuration
/// 3. Restores persisted consumers before accepting requests
/// 4. Serves HTTP until SIGINT/SIGTERM, then stops every worker
///
/// # Errors
///
/// Returns an error if configuration is invalid, the listener cannot bind, or
/// the server fails.
pub async fn run() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);
    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting relay consumer service");
    info!("Environment: {:?}", environment);

    let server_config = ServerConfig::from_env_with_port(DEFAULT_PORT)
        .wrap_err("Failed to load server configuration")?;
    let amqp_config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    let state_config = StateConfig::from_env().wrap_err("Failed to load state configuration")?;

    let persist_mode = PersistMode::from_interval(state_config.persist_interval);
    let worker_config = WorkerConfig::new();
    info!(
        broker = %amqp_config.endpoint(),
        state_dir = %state_config.dir.display(),
        persist_mode = ?persist_mode,
        prefetch = worker_config.prefetch,
        "Consumer configuration loaded"
    );

    let broker = Arc::new(LapinBroker::new(amqp_config));
    let state = Arc::new(ConsumerState::new(
        PersistenceGateway::file(state_config.dir.clone()),
        persist_mode,
    ));
    let registry = Arc::new(ConsumerRegistry::new(
        broker.clone(),
        state,
        worker_config,
    ));

    let restored = registry
        .restore()
        .wrap_err("Failed to restore persisted consumers")?;
    info!(count = restored.len(), queues = ?restored, "Persisted consumers restored");

    let router: Router = consumer_router(
        ConsumerApiState {
            registry: registry.clone(),
            binder: broker,
        },
        app_info,
    )
    .layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let listener = TcpListener::bind(server_config.address())
        .await
        .wrap_err_with(|| format!("Failed to bind to {}", server_config.address()))?;
    info!(address = %server_config.address(), "Consumer service listening");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("Consumer server failed");

    registry.shutdown().await;
    info!("Relay consumer service stopped");
    served
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
