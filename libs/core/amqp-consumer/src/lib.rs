//! AMQP Consumer Manager
//!
//! Start and stop per-queue consumers at runtime, keep what they receive in a
//! queryable in-memory store, and bring everything back after a restart.
//!
//! ## Features
//!
//! - **Per-queue workers**: one task per queue with reconnect and backoff
//! - **Unconditional ack**: every delivery is stored (JSON or text) then acked
//! - **Durable state**: active queues and message history snapshotted to disk
//! - **Graceful stop**: in-flight deliveries finish before a consumer is cancelled
//! - **Prometheus metrics** and K8s-style health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use amqp_consumer::{
//!     ConsumerRegistry, ConsumerState, LapinBroker, PersistenceGateway, PersistMode, WorkerConfig,
//! };
//!
//! let state = Arc::new(ConsumerState::new(
//!     PersistenceGateway::file("/app"),
//!     PersistMode::EveryMutation,
//! ));
//! let broker = Arc::new(LapinBroker::new(AmqpConfig::from_env()?));
//! let registry = ConsumerRegistry::new(broker, state, WorkerConfig::default());
//!
//! registry.restore()?;
//! registry.start("orders")?;
//! ```

mod amqp;
mod api;
mod broker;
mod config;
mod envelope;
mod error;
mod health;
mod memory;
pub mod metrics;
mod persistence;
mod registry;
mod resilience;
mod state;
mod store;
mod worker;

// Re-export main types
pub use amqp::{LapinBroker, LapinSubscription};
pub use api::{
    ApiError, ConsumerApiState, DEFAULT_QUEUE, ProducerApiState, consumer_router, producer_router,
};
pub use broker::{Broker, Delivery, ExchangeKind, QueueBinder, SubscribeOptions, Subscription};
pub use config::{PersistMode, WorkerConfig};
pub use envelope::{BodyEncoding, MessageEnvelope, RECEIVED_AT_FORMAT, decode_body};
pub use error::{ConsumerError, PersistenceError};
pub use health::{HealthResponse, health_router, ready_router};
pub use memory::{Binding, InMemoryBroker, MemorySubscription};
pub use metrics::{ConsumerMetrics, init_metrics};
pub use persistence::{
    Artifact, FileSnapshotStore, MemorySnapshotStore, PersistenceGateway, SnapshotStore,
};
pub use registry::{ConsumerRegistry, MAX_QUEUE_NAME_LEN, StartOutcome, StopOutcome};
pub use resilience::Backoff;
pub use state::ConsumerState;
pub use store::{ActiveQueueSet, MessageStore, QueueMessages};
pub use worker::{ConsumerWorker, WorkerState};
