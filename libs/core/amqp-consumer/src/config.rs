//! Worker configuration
//!
//! This module provides `WorkerConfig` for tuning per-queue consumer workers.

use crate::resilience::Backoff;
use std::time::Duration;
use uuid::Uuid;

/// When consumer state is written to the snapshot store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Write the affected artifacts after every mutation
    #[default]
    EveryMutation,

    /// Mark state dirty on mutation and flush on a fixed interval
    Interval(Duration),
}

impl PersistMode {
    /// `None` or a zero interval means every mutation.
    pub fn from_interval(interval: Option<Duration>) -> Self {
        match interval {
            Some(d) if !d.is_zero() => PersistMode::Interval(d),
            _ => PersistMode::EveryMutation,
        }
    }
}

/// Configuration shared by every consumer worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unacknowledged deliveries the broker may push per consumer
    pub prefetch: u16,

    /// Delay policy between reconnect attempts
    pub backoff: Backoff,

    /// Prefix for broker consumer tags (`{prefix}-{queue}-{n}`)
    pub consumer_tag_prefix: String,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            prefetch: 1,
            backoff: Backoff::default(),
            consumer_tag_prefix: format!("relay-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    /// Set the prefetch count (minimum 1)
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set the reconnect backoff policy
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the consumer tag prefix
    pub fn with_consumer_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_tag_prefix = prefix.into();
        self
    }

    /// Consumer tag for the `attempt`-th subscription on `queue`.
    pub fn consumer_tag(&self, queue: &str, attempt: u64) -> String {
        format!("{}-{}-{}", self.consumer_tag_prefix, queue, attempt)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}
