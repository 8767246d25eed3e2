//! In-process event log and document store.
//!
//! [`MemoryEventLog`] is an append-only log with a live tail, and
//! [`MemoryDocumentStore`] keeps documents in a `BTreeMap`. Both are used by
//! the integration tests and the demo, and are handy for running a
//! projector against a fixed set of events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{SourceError, StoreError};
use crate::event::{Payload, Position, RecordedEvent};
use crate::source::{EventSource, EventStream};
use crate::store::{DocumentKey, DocumentStore, Documents, WriteBatch};

#[derive(Debug, Default)]
struct LogState {
    events: Vec<RecordedEvent>,
    closed: bool,
}

/// An append-only, in-memory global event log.
///
/// Positions start at 0 and increase by one per append. Subscriptions
/// deliver the existing events and then wait for new ones until the log is
/// [`close`](MemoryEventLog::close)d, after which they end once drained.
///
/// `Clone` is cheap; clones share the same log.
#[derive(Clone)]
pub struct MemoryEventLog {
    state: Arc<watch::Sender<LogState>>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    /// Create an empty, open log.
    pub fn new() -> Self {
        let (state, _) = watch::channel(LogState::default());
        Self {
            state: Arc::new(state),
        }
    }

    /// Append an event with a JSON payload.
    ///
    /// # Returns
    ///
    /// The position assigned to the event.
    pub fn append(&self, stream_id: &str, event_type: &str, payload: Value) -> Position {
        self.append_payload(stream_id, event_type, Payload::Json(payload))
    }

    /// Append an event with a non-JSON payload.
    pub fn append_binary(&self, stream_id: &str, event_type: &str, payload: Vec<u8>) -> Position {
        self.append_payload(stream_id, event_type, Payload::Binary(payload))
    }

    fn append_payload(&self, stream_id: &str, event_type: &str, payload: Payload) -> Position {
        let mut position = Position::default();
        self.state.send_modify(|state| {
            position = Position::new(state.events.len() as u64);
            let stream_version = state
                .events
                .iter()
                .filter(|e| e.stream_id == stream_id)
                .count() as u64;
            state.events.push(RecordedEvent {
                event_id: Uuid::new_v4(),
                stream_id: stream_id.to_string(),
                stream_version,
                event_type: event_type.to_string(),
                payload,
                metadata: Value::Null,
                position,
                recorded_at: 0,
            });
        });
        position
    }

    /// Stop accepting waits: open subscriptions end once they have
    /// delivered every event.
    pub fn close(&self) {
        self.state.send_modify(|state| state.closed = true);
    }

    /// Number of events in the log.
    pub fn len(&self) -> usize {
        self.state.borrow().events.len()
    }

    /// Returns `true` if nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the last appended event.
    pub fn head(&self) -> Option<Position> {
        self.state.borrow().events.last().map(|e| e.position)
    }
}

#[async_trait]
impl EventSource for MemoryEventLog {
    async fn subscribe(&self, after: Option<Position>) -> Result<EventStream, SourceError> {
        let rx = self.state.subscribe();
        let start = rx
            .borrow()
            .events
            .partition_point(|e| Some(e.position) <= after);

        let stream = futures::stream::unfold((rx, start), |(mut rx, next)| async move {
            loop {
                {
                    let state = rx.borrow_and_update();
                    if let Some(event) = state.events.get(next) {
                        let event = event.clone();
                        drop(state);
                        return Some((Ok(event), (rx, next + 1)));
                    }
                    if state.closed {
                        return None;
                    }
                }
                // The sender lives as long as any clone of the log; if it
                // is gone nothing can be appended any more.
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// A [`DocumentStore`] backed by a `BTreeMap`.
///
/// A commit applies all of its mutations under a single write lock, so
/// readers never observe a partially applied batch.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<Documents>,
    commits: AtomicUsize,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every document in `collection`, keyed by document ID.
    pub fn collection(&self, collection: &str) -> BTreeMap<String, Value> {
        self.documents
            .read()
            .map(|documents| documents.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Snapshot of a single document.
    pub fn document(&self, key: &DocumentKey) -> Option<Value> {
        self.documents
            .read()
            .ok()?
            .get(&key.collection)?
            .get(&key.id)
            .cloned()
    }

    /// Number of successful commits.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::Acquire)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &DocumentKey) -> Result<Option<Value>, StoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StoreError::Unavailable("document map lock poisoned".to_string()))?;
        Ok(documents
            .get(&key.collection)
            .and_then(|c| c.get(&key.id))
            .cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| StoreError::Unavailable("document map lock poisoned".to_string()))?;
        batch.apply_to(&mut documents);
        self.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
