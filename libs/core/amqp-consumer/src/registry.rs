//! Control surface for per-queue consumers.
//!
//! The registry keeps one worker per active queue. Starting an active queue is
//! a no-op; stopping removes the queue from the active set and cancels its
//! worker. The active set is persisted, and [`ConsumerRegistry::restore`]
//! brings the same workers back after a restart.

use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::error::ConsumerError;
use crate::state::ConsumerState;
use crate::store::QueueMessages;
use crate::worker::{ConsumerWorker, WorkerState};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Longest queue name the broker accepts, in bytes.
pub const MAX_QUEUE_NAME_LEN: usize = 255;

/// Result of [`ConsumerRegistry::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyActive,
}

/// Result of [`ConsumerRegistry::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotFound,
}

struct WorkerHandle {
    cancel: watch::Sender<bool>,
    status: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    fn cancel(self) -> JoinHandle<()> {
        let _ = self.cancel.send(true);
        self.task
    }
}

struct Flusher {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub(crate) fn validate_queue_name(queue: &str) -> Result<(), ConsumerError> {
    if queue.trim().is_empty() {
        return Err(ConsumerError::InvalidRequest(
            "Queue name is required".to_string(),
        ));
    }
    if queue.len() > MAX_QUEUE_NAME_LEN {
        return Err(ConsumerError::InvalidRequest(format!(
            "Queue name exceeds {MAX_QUEUE_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Starts, stops, and restores consumer workers.
pub struct ConsumerRegistry {
    broker: Arc<dyn Broker>,
    state: Arc<ConsumerState>,
    config: WorkerConfig,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    flusher: Mutex<Option<Flusher>>,
    spawned: AtomicU64,
    restored: AtomicBool,
}

impl ConsumerRegistry {
    /// Create a registry. In interval persist mode this spawns the snapshot
    /// flusher, so it must run inside a Tokio runtime.
    pub fn new(broker: Arc<dyn Broker>, state: Arc<ConsumerState>, config: WorkerConfig) -> Self {
        let flusher = {
            let (shutdown, rx) = watch::channel(false);
            state
                .spawn_flusher(rx)
                .map(|task| Flusher { shutdown, task })
        };

        Self {
            broker,
            state,
            config,
            workers: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            flusher: Mutex::new(flusher),
            spawned: AtomicU64::new(0),
            restored: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn state(&self) -> &Arc<ConsumerState> {
        &self.state
    }

    fn lock_workers(&self) -> Result<MutexGuard<'_, HashMap<String, WorkerHandle>>, ConsumerError> {
        self.workers.lock().map_err(|_| ConsumerError::StatePoisoned)
    }

    fn spawn_worker(&self, queue: &str) -> WorkerHandle {
        let (worker, status) = ConsumerWorker::new(
            queue,
            Arc::clone(&self.broker),
            Arc::clone(&self.state),
            self.config.clone(),
        );
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(cancel_rx));
        self.spawned.fetch_add(1, Ordering::SeqCst);
        WorkerHandle {
            cancel,
            status,
            task,
        }
    }

    fn retire(&self, task: JoinHandle<()>) {
        match self.retired.lock() {
            Ok(mut retired) => {
                retired.retain(|t| !t.is_finished());
                retired.push(task);
            }
            Err(_) => warn!("Retired worker list poisoned, worker will not be awaited on shutdown"),
        }
    }

    /// Start consuming `queue` unless it is already active.
    pub fn start(&self, queue: &str) -> Result<StartOutcome, ConsumerError> {
        validate_queue_name(queue)?;
        let mut workers = self.lock_workers()?;

        if !self.state.activate(queue)? {
            info!(queue = %queue, "Consumer already exists for queue");
            return Ok(StartOutcome::AlreadyActive);
        }

        let handle = self.spawn_worker(queue);
        if let Some(stale) = workers.insert(queue.to_string(), handle) {
            self.retire(stale.cancel());
        }
        info!(queue = %queue, "Consumer started for queue");
        Ok(StartOutcome::Started)
    }

    /// Stop consuming `queue`.
    ///
    /// The worker finishes the delivery it is handling, then cancels its
    /// subscription. Message history is kept.
    pub fn stop(&self, queue: &str) -> Result<StopOutcome, ConsumerError> {
        let mut workers = self.lock_workers()?;

        if !self.state.deactivate(queue)? {
            return Ok(StopOutcome::NotFound);
        }

        if let Some(handle) = workers.remove(queue) {
            self.retire(handle.cancel());
        }
        info!(queue = %queue, "Consumer stopped for queue");
        Ok(StopOutcome::Stopped)
    }

    /// Load persisted state and spawn a worker for every persisted active queue.
    ///
    /// Call once at startup, before serving requests. Persisted names that
    /// fail validation are dropped from the active set. Returns the restored
    /// queue names.
    pub fn restore(&self) -> Result<Vec<String>, ConsumerError> {
        let mut workers = self.lock_workers()?;
        let active = self.state.restore()?;
        let mut restored = Vec::with_capacity(active.len());

        for queue in active.iter() {
            if let Err(e) = validate_queue_name(queue) {
                error!(queue = %queue, error = %e, "Dropping invalid persisted queue name");
                self.state.deactivate(queue)?;
                continue;
            }
            restored.push(queue.to_string());
            if workers.contains_key(queue) {
                continue;
            }
            let handle = self.spawn_worker(queue);
            workers.insert(queue.to_string(), handle);
            info!(queue = %queue, "Consumer restored for queue");
        }

        self.restored.store(true, Ordering::SeqCst);
        Ok(restored)
    }

    /// Whether [`ConsumerRegistry::restore`] has completed.
    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    /// Sorted copy of the active queue names.
    pub fn list_active(&self) -> Result<Vec<String>, ConsumerError> {
        Ok(self.state.active_queues()?.to_vec())
    }

    pub fn messages(&self, queue: &str) -> Result<QueueMessages, ConsumerError> {
        self.state.messages(queue)
    }

    /// Empty `queue`'s history. Unknown queues are a no-op.
    pub fn clear(&self, queue: &str) -> Result<(), ConsumerError> {
        if self.state.clear(queue)? {
            info!(queue = %queue, "Messages cleared for queue");
        }
        Ok(())
    }

    /// Current state of `queue`'s worker, if one is running.
    pub fn worker_state(&self, queue: &str) -> Result<Option<WorkerState>, ConsumerError> {
        let workers = self.lock_workers()?;
        Ok(workers.get(queue).map(|h| *h.status.borrow()))
    }

    /// State of every live worker, by queue name.
    pub fn worker_states(&self) -> Result<BTreeMap<String, WorkerState>, ConsumerError> {
        let workers = self.lock_workers()?;
        Ok(workers
            .iter()
            .map(|(queue, h)| (queue.clone(), *h.status.borrow()))
            .collect())
    }

    /// Workers spawned over the registry's lifetime.
    pub fn spawned_workers(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Cancel every worker, wait for them to stop, and flush pending snapshots.
    ///
    /// Active queues stay persisted so the next [`restore`](Self::restore)
    /// picks them up again.
    pub async fn shutdown(&self) {
        let mut tasks: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain().map(|(_, handle)| handle.cancel()).collect()
        };
        {
            let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
            tasks.append(&mut retired);
        }

        info!(workers = tasks.len(), "Stopping consumer workers");
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Consumer worker task failed");
            }
        }

        let flusher = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(flusher) = flusher {
            let _ = flusher.shutdown.send(true);
            if let Err(e) = flusher.task.await {
                error!(error = %e, "Snapshot flusher task failed");
            }
        }

        if let Err(e) = self.state.flush() {
            error!(error = %e, "Failed to flush consumer state on shutdown");
        }
        info!("Consumer registry shut down");
    }
}
