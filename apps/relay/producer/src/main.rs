//! Relay Producer Service - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relay_producer::run().await
}
