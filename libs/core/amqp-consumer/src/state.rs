//! Shared consumer state: message history, active queues, and their snapshots.
//!
//! Everything mutable sits behind one lock. Each operation takes it, applies
//! the in-memory change, runs the synchronous snapshot write the
//! [`PersistMode`] calls for, and releases it. Nothing awaits while holding it.

use crate::config::PersistMode;
use crate::envelope::MessageEnvelope;
use crate::error::ConsumerError;
use crate::persistence::PersistenceGateway;
use crate::store::{ActiveQueueSet, MessageStore, QueueMessages};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct Inner {
    messages: MessageStore,
    active: ActiveQueueSet,
    dirty_active: bool,
    dirty_messages: bool,
}

/// Which artifacts a mutation touched.
#[derive(Debug, Clone, Copy)]
struct Touched {
    active: bool,
    messages: bool,
}

impl Touched {
    const ACTIVE: Touched = Touched {
        active: true,
        messages: false,
    };
    const MESSAGES: Touched = Touched {
        active: false,
        messages: true,
    };
    const BOTH: Touched = Touched {
        active: true,
        messages: true,
    };
}

/// Message store and active-queue set, guarded together.
pub struct ConsumerState {
    inner: Mutex<Inner>,
    gateway: PersistenceGateway,
    mode: PersistMode,
}

impl ConsumerState {
    pub fn new(gateway: PersistenceGateway, mode: PersistMode) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            gateway,
            mode,
        }
    }

    pub fn persist_mode(&self) -> PersistMode {
        self.mode
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ConsumerError> {
        self.inner.lock().map_err(|_| ConsumerError::StatePoisoned)
    }

    /// Record a mutation and write snapshots according to the persist mode.
    fn touched(&self, inner: &mut Inner, touched: Touched) {
        inner.dirty_active |= touched.active;
        inner.dirty_messages |= touched.messages;

        if self.mode == PersistMode::EveryMutation {
            self.write_dirty(inner);
        }
    }

    /// Write every dirty artifact. Failed writes stay dirty.
    fn write_dirty(&self, inner: &mut Inner) {
        if inner.dirty_active && self.gateway.save_active_queues(&inner.active) {
            inner.dirty_active = false;
        }
        if inner.dirty_messages && self.gateway.save_messages(&inner.messages) {
            inner.dirty_messages = false;
        }
    }

    /// Replace in-memory state with the persisted snapshots.
    ///
    /// Every restored active queue gets a message entry. Returns the restored
    /// active set.
    pub fn restore(&self) -> Result<ActiveQueueSet, ConsumerError> {
        let messages = self.gateway.load_messages();
        let active = self.gateway.load_active_queues();

        let mut inner = self.lock()?;
        inner.messages = messages;
        inner.active = active;
        let names: Vec<String> = inner.active.to_vec();
        for name in &names {
            inner.messages.ensure_queue(name);
        }
        inner.dirty_active = false;
        inner.dirty_messages = false;

        info!(
            active_queues = inner.active.len(),
            stored_messages = inner.messages.total_messages(),
            location = %self.gateway.location(),
            "Consumer state restored"
        );
        Ok(inner.active.clone())
    }

    /// Mark `queue` active and make sure it has a message entry.
    ///
    /// Returns `false` when it was already active; nothing changes then.
    pub fn activate(&self, queue: &str) -> Result<bool, ConsumerError> {
        let mut inner = self.lock()?;
        if !inner.active.insert(queue) {
            return Ok(false);
        }
        inner.messages.ensure_queue(queue);
        self.touched(&mut inner, Touched::BOTH);
        Ok(true)
    }

    /// Drop `queue` from the active set. Its message history stays.
    ///
    /// Returns `false` when it was not active.
    pub fn deactivate(&self, queue: &str) -> Result<bool, ConsumerError> {
        let mut inner = self.lock()?;
        if !inner.active.remove(queue) {
            return Ok(false);
        }
        self.touched(&mut inner, Touched::ACTIVE);
        Ok(true)
    }

    pub fn is_active(&self, queue: &str) -> Result<bool, ConsumerError> {
        Ok(self.lock()?.active.contains(queue))
    }

    /// Copy of the active set.
    pub fn active_queues(&self) -> Result<ActiveQueueSet, ConsumerError> {
        Ok(self.lock()?.active.clone())
    }

    /// Append an envelope to `queue`. Returns the queue's new length.
    pub fn append(&self, queue: &str, envelope: MessageEnvelope) -> Result<usize, ConsumerError> {
        let mut inner = self.lock()?;
        let len = inner.messages.append(queue, envelope);
        self.touched(&mut inner, Touched::MESSAGES);
        Ok(len)
    }

    pub fn messages(&self, queue: &str) -> Result<QueueMessages, ConsumerError> {
        Ok(self.lock()?.messages.get(queue))
    }

    /// Empty `queue`'s history. Unknown queues are left alone.
    ///
    /// Returns whether the queue was known.
    pub fn clear(&self, queue: &str) -> Result<bool, ConsumerError> {
        let mut inner = self.lock()?;
        if !inner.messages.clear(queue) {
            return Ok(false);
        }
        self.touched(&mut inner, Touched::MESSAGES);
        Ok(true)
    }

    /// Whether any artifact has changes not yet written.
    #[cfg(test)]
    fn is_dirty(&self) -> Result<bool, ConsumerError> {
        let inner = self.lock()?;
        Ok(inner.dirty_active || inner.dirty_messages)
    }

    /// Write any dirty artifacts now.
    pub fn flush(&self) -> Result<(), ConsumerError> {
        let mut inner = self.lock()?;
        if inner.dirty_active || inner.dirty_messages {
            debug!(
                active = inner.dirty_active,
                messages = inner.dirty_messages,
                "Flushing consumer state"
            );
            self.write_dirty(&mut inner);
        }
        Ok(())
    }

    /// Start the background flusher for [`PersistMode::Interval`].
    ///
    /// Returns `None` in every-mutation mode. The task flushes once more and
    /// exits when `shutdown` turns true or its sender is dropped.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let PersistMode::Interval(period) = self.mode else {
            return None;
        };

        let state = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Snapshot flusher started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = state.flush() {
                            error!(error = %e, "Snapshot flush failed");
                        }
                    }
                    _ = shutdown.wait_for(|stop| *stop) => break,
                }
            }

            if let Err(e) = state.flush() {
                error!(error = %e, "Final snapshot flush failed");
            }
            info!("Snapshot flusher stopped");
        }))
    }
}
