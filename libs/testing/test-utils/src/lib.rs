//! Shared test utilities for broker-facing crates
//!
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic queue, exchange and payload names (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Usage
//!
//! Add `features = ["rabbitmq"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["rabbitmq"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRabbitMq};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_broker_test() {
//!     let rabbit = TestRabbitMq::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_broker_test");
//!
//!     let queue = builder.queue("orders");
//!     // connect to rabbit.amqp_url() and use `queue`
//! }
//! ```

use serde_json::{Value, json};

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic names
///
/// Tests that share a broker stay isolated by deriving every queue and
/// exchange name from the test's own name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_start_consumer");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a unique name for testing
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.name("queue", "orders"), "test-queue-7-orders");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Queue name unique to this builder
    pub fn queue(&self, suffix: &str) -> String {
        self.name("queue", suffix)
    }

    /// Exchange name unique to this builder
    pub fn exchange(&self, suffix: &str) -> String {
        self.name("exchange", suffix)
    }

    /// JSON payload `{"id": n, "source": <seed>}`
    pub fn payload(&self, n: u64) -> Value {
        json!({ "id": n, "source": self.seed })
    }
}

/// Test assertion helpers
pub mod assertions {
    use serde_json::Value;

    /// Assert that the `content` of each stored envelope matches `expected`, in order
    pub fn assert_contents(envelopes: &[Value], expected: &[Value], context: &str) {
        let actual: Vec<&Value> = envelopes.iter().map(|e| &e["message"]).collect();
        let expected: Vec<&Value> = expected.iter().collect();
        assert_eq!(actual, expected, "{}: stored messages differ", context);
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
