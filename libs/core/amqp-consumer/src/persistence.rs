//! Durable snapshots of the active-queue set and the message history.
//!
//! Each structure lives in its own artifact and is always written whole.
//! The gateway is best-effort: failures are logged and counted, never
//! returned, so a broken disk can not stall a consume/ack cycle.

use crate::error::PersistenceError;
use crate::metrics;
use crate::store::{ActiveQueueSet, MessageStore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use strum::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

/// The two snapshot artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Artifact {
    ActiveQueues,
    Messages,
}

impl Artifact {
    pub fn file_name(&self) -> &'static str {
        match self {
            Artifact::ActiveQueues => "active_queues.json",
            Artifact::Messages => "received_messages.json",
        }
    }
}

/// Raw storage for snapshot artifacts.
pub trait SnapshotStore: Send + Sync {
    /// Replace the artifact's contents.
    fn write(&self, artifact: Artifact, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Read the artifact. `Ok(None)` means it has never been written.
    fn read(&self, artifact: Artifact) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Where the artifacts live, for logs.
    fn location(&self) -> String;
}

/// Artifacts as JSON files in one directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|e| PersistenceError::io(&self.dir, e))?;

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| PersistenceError::io(&tmp, e))?;
        file.sync_all().map_err(|e| PersistenceError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn write(&self, artifact: Artifact, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.write_atomic(&self.path(artifact), bytes)
    }

    fn read(&self, artifact: Artifact) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path(artifact);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io(path, e)),
        }
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Artifacts held in process memory.
///
/// Used for tests and for running without a state directory. Writes can be
/// made to fail on demand to exercise the best-effort paths.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    artifacts: Mutex<HashMap<Artifact, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current bytes of an artifact, if it was ever written.
    pub fn raw(&self, artifact: Artifact) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .ok()
            .and_then(|artifacts| artifacts.get(&artifact).cloned())
    }

    /// Seed an artifact directly, bypassing the gateway.
    pub fn insert_raw(&self, artifact: Artifact, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.insert(artifact, bytes.into());
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn write(&self, artifact: Artifact, bytes: &[u8]) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(format!(
                "writes to {} are disabled",
                artifact
            )));
        }
        let mut artifacts = self
            .artifacts
            .lock()
            .map_err(|_| PersistenceError::Unavailable("snapshot lock poisoned".to_string()))?;
        artifacts.insert(artifact, bytes.to_vec());
        Ok(())
    }

    fn read(&self, artifact: Artifact) -> Result<Option<Vec<u8>>, PersistenceError> {
        let artifacts = self
            .artifacts
            .lock()
            .map_err(|_| PersistenceError::Unavailable("snapshot lock poisoned".to_string()))?;
        Ok(artifacts.get(&artifact).cloned())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// Serializes consumer state to and from a [`SnapshotStore`].
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn SnapshotStore>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }

    /// Gateway over JSON files in `dir`.
    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileSnapshotStore::new(dir)))
    }

    /// Gateway over a fresh in-memory store.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemorySnapshotStore::new()))
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Write the active-queue list. Returns whether the write succeeded.
    pub fn save_active_queues(&self, active: &ActiveQueueSet) -> bool {
        self.save(Artifact::ActiveQueues, active)
    }

    /// Write the full message history. Returns whether the write succeeded.
    pub fn save_messages(&self, messages: &MessageStore) -> bool {
        self.save(Artifact::Messages, messages)
    }

    /// Read the active-queue list; empty when missing or unreadable.
    pub fn load_active_queues(&self) -> ActiveQueueSet {
        self.load(Artifact::ActiveQueues)
    }

    /// Read the message history; empty when missing or unreadable.
    pub fn load_messages(&self) -> MessageStore {
        self.load(Artifact::Messages)
    }

    fn save<T: Serialize>(&self, artifact: Artifact, value: &T) -> bool {
        let result = serde_json::to_vec(value)
            .map_err(PersistenceError::from)
            .and_then(|bytes| self.store.write(artifact, &bytes));

        match result {
            Ok(()) => {
                debug!(artifact = %artifact, location = %self.store.location(), "Snapshot saved");
                true
            }
            Err(e) => {
                metrics::persistence_failed(artifact.as_ref(), "save");
                error!(artifact = %artifact, error = %e, "Error saving snapshot");
                false
            }
        }
    }

    fn load<T: DeserializeOwned + Default>(&self, artifact: Artifact) -> T {
        let bytes = match self.store.read(artifact) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(artifact = %artifact, "No snapshot found, starting empty");
                return T::default();
            }
            Err(e) => {
                metrics::persistence_failed(artifact.as_ref(), "load");
                warn!(artifact = %artifact, error = %e, "Error reading snapshot, starting empty");
                return T::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                info!(artifact = %artifact, location = %self.store.location(), "Snapshot loaded");
                value
            }
            Err(e) => {
                metrics::persistence_failed(artifact.as_ref(), "load");
                warn!(artifact = %artifact, error = %e, "Snapshot is corrupt, starting empty");
                T::default()
            }
        }
    }
}
