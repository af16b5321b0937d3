//! Relay Producer Service
//!
//! Publishes JSON messages and declares exchanges over HTTP.
//!
//! Every request opens a short-lived broker connection, so the service holds
//! no broker state between requests.

use amqp_consumer::{LapinBroker, ProducerApiState, metrics, producer_router};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{AmqpConfig, Environment, FromEnv, ServerConfig, app_info};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info};

/// Port the producer service listens on when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 5000;

/// Run the producer service until SIGINT/SIGTERM.
pub async fn run() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);
    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting relay producer service");

    let server_config = ServerConfig::from_env_with_port(DEFAULT_PORT)
        .wrap_err("Failed to load server configuration")?;
    let amqp_config = AmqpConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    info!(broker = %amqp_config.endpoint(), "Producer configuration loaded");

    let router = producer_router(
        ProducerApiState {
            binder: Arc::new(LapinBroker::new(amqp_config)),
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
    info!(address = %server_config.address(), "Producer service listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("Producer server failed")?;

    info!("Relay producer service stopped");
    Ok(())
}

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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
