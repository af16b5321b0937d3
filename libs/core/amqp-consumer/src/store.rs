//! In-memory message history and active-queue bookkeeping.
//!
//! Both types are plain data: they carry no lock of their own. Concurrent
//! access goes through [`crate::ConsumerState`], which guards them together.

use crate::envelope::MessageEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Queue name → ordered envelopes, in delivery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageStore {
    queues: BTreeMap<String, Vec<MessageEnvelope>>,
}

/// Snapshot of one queue's history, shaped like the HTTP response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMessages {
    pub messages: Vec<MessageEnvelope>,
    pub count: usize,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the end of a queue's history, creating it if absent.
    ///
    /// Returns the new length of that queue's history.
    pub fn append(&mut self, queue: &str, envelope: MessageEnvelope) -> usize {
        let messages = self.queues.entry(queue.to_string()).or_default();
        messages.push(envelope);
        messages.len()
    }

    /// Make sure `queue` has an entry. Existing history is left untouched.
    pub fn ensure_queue(&mut self, queue: &str) {
        self.queues.entry(queue.to_string()).or_default();
    }

    /// Copy of a queue's history. Unknown queues yield an empty result.
    pub fn get(&self, queue: &str) -> QueueMessages {
        let messages = self.queues.get(queue).cloned().unwrap_or_default();
        let count = messages.len();
        QueueMessages { messages, count }
    }

    /// Empty a queue's history. Returns `false` when the queue is unknown.
    pub fn clear(&mut self, queue: &str) -> bool {
        match self.queues.get_mut(queue) {
            Some(messages) => {
                messages.clear();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Number of envelopes across every queue.
    pub fn total_messages(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }
}

/// Queue names that should have a running consumer.
///
/// Membership records intent; it says nothing about whether a worker is
/// currently connected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActiveQueueSet {
    names: BTreeSet<String>,
}

impl ActiveQueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the name was already present.
    pub fn insert(&mut self, queue: &str) -> bool {
        self.names.insert(queue.to_string())
    }

    /// Returns `false` if the name was not present.
    pub fn remove(&mut self, queue: &str) -> bool {
        self.names.remove(queue)
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.names.contains(queue)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.names.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for ActiveQueueSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}
