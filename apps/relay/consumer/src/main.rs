//! Relay Consumer Service - Entry Point
//!
//! HTTP control plane for per-queue RabbitMQ consumers.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relay_consumer::run().await
}
