//! RabbitMQ test infrastructure
//!
//! Provides a `TestRabbitMq` helper that runs a RabbitMQ container for tests.

use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::rabbitmq::RabbitMq;

/// AMQP port inside the container.
const AMQP_PORT: u16 = 5672;

/// Test RabbitMQ wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestRabbitMq;
///
/// # async fn example() {
/// let rabbit = TestRabbitMq::new().await;
/// let url = rabbit.amqp_url();
/// // Hand the URL to the broker client under test
/// # }
/// ```
pub struct TestRabbitMq {
    #[allow(dead_code)]
    container: ContainerAsync<RabbitMq>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl TestRabbitMq {
    /// Start a RabbitMQ container with the module's default image and credentials.
    pub async fn new() -> Self {
        let container = RabbitMq::default()
            .start()
            .await
            .expect("Failed to start RabbitMQ container");

        let port = container
            .get_host_port_ipv4(AMQP_PORT)
            .await
            .expect("Failed to get RabbitMQ port");

        tracing::info!(port, "Test RabbitMQ ready");

        Self {
            container,
            host: "127.0.0.1".to_string(),
            port,
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }

    /// AMQP URI for the default vhost.
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2F",
            self.username, self.password, self.host, self.port
        )
    }
}

impl Drop for TestRabbitMq {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test RabbitMQ container");
    }
}
