//! Prometheus metrics for consumer workers and the publishing side
//!
//! Provides observability into deliveries, acknowledgements, reconnects and
//! snapshot writes.

use crate::envelope::BodyEncoding;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls return the same handle. If a
/// different recorder is already installed the failure is logged and `None`
/// is returned; metrics calls then go to that recorder.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
        .ok()
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Record a failed snapshot read or write
pub fn persistence_failed(artifact: &str, operation: &'static str) {
    counter!(
        "amqp_consumer_persistence_failures_total",
        "artifact" => artifact.to_string(),
        "operation" => operation
    )
    .increment(1);
}

/// Record a publish attempt from the producer side
pub fn message_published(exchange: &str, success: bool) {
    let exchange = if exchange.is_empty() {
        "(default)".to_string()
    } else {
        exchange.to_string()
    };
    counter!(
        "amqp_producer_messages_published_total",
        "exchange" => exchange,
        "status" => if success { "success" } else { "failed" }
    )
    .increment(1);
}

/// Per-queue worker metrics helper
#[derive(Debug, Clone)]
pub struct ConsumerMetrics {
    queue: String,
}

impl ConsumerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a delivery and how its body was decoded
    pub fn message_received(&self, encoding: BodyEncoding) {
        counter!(
            "amqp_consumer_messages_received_total",
            "queue" => self.queue.clone()
        )
        .increment(1);

        if encoding == BodyEncoding::Text {
            counter!(
                "amqp_consumer_decode_fallbacks_total",
                "queue" => self.queue.clone()
            )
            .increment(1);
        }
    }

    /// Record a delivery stored and acknowledged
    pub fn message_handled(&self, duration: Duration) {
        histogram!(
            "amqp_consumer_handle_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a delivery that could not be stored (it is still acked)
    pub fn processing_failed(&self) {
        counter!(
            "amqp_consumer_processing_errors_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record an acknowledgement outcome
    pub fn ack(&self, success: bool) {
        counter!(
            "amqp_consumer_acks_total",
            "queue" => self.queue.clone(),
            "status" => if success { "success" } else { "failed" }
        )
        .increment(1);
    }

    /// Record a connection-level failure and the reconnect it triggers
    pub fn connection_failed(&self) {
        counter!(
            "amqp_consumer_reconnects_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Track live workers
    pub fn worker_started(&self) {
        gauge!("amqp_consumer_workers", "queue" => self.queue.clone()).increment(1.0);
    }

    pub fn worker_stopped(&self) {
        gauge!("amqp_consumer_workers", "queue" => self.queue.clone()).decrement(1.0);
    }
}
