//! Document store abstraction and the atomic write batch.
//!
//! A [`WriteBatch`] collects every mutation produced while applying one
//! [`Batch`](crate::Batch), plus the projector's checkpoint. It is handed to
//! [`DocumentStore::commit`] exactly once and is either applied in full or
//! not at all.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::checkpoint::{CHECKPOINT_COLLECTION, COMMIT_POSITION_FIELD};
use crate::error::StoreError;
use crate::event::Position;

/// All documents of a store, keyed by collection and then by document ID.
pub(crate) type Documents = BTreeMap<String, BTreeMap<String, Value>>;

/// Address of a document: a collection name and an ID within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentKey {
    /// Collection name, e.g. `"position"`.
    pub collection: String,
    /// Document ID within the collection, e.g. `"Vehicle-O37"`.
    pub id: String,
}

impl DocumentKey {
    /// Create a document key.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A single staged change to a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Write `fields` to the document at `key`.
    ///
    /// With `merge == false` the document is replaced. With `merge == true`
    /// JSON objects are merged key by key, recursively; any other value
    /// replaces what was there.
    Set {
        key: DocumentKey,
        fields: Value,
        merge: bool,
    },
    /// Remove the document at `key`. Deleting a missing document is a no-op.
    Delete { key: DocumentKey },
}

impl Mutation {
    /// The document this mutation targets.
    pub fn key(&self) -> &DocumentKey {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// An ordered set of mutations committed as one atomic unit.
///
/// Mutations are applied in the order they were staged, so a later write to
/// the same document wins. A write batch is built for one
/// [`Batch`](crate::Batch) and consumed by [`DocumentStore::commit`]; it is
/// never reused.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    /// Create an empty write batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a full replacement of the document at `key`.
    pub fn set(&mut self, key: DocumentKey, fields: Value) -> &mut Self {
        self.mutations.push(Mutation::Set {
            key,
            fields,
            merge: false,
        });
        self
    }

    /// Stage a merge of `fields` into the document at `key`, creating it if
    /// it does not exist.
    pub fn merge(&mut self, key: DocumentKey, fields: Value) -> &mut Self {
        self.mutations.push(Mutation::Set {
            key,
            fields,
            merge: true,
        });
        self
    }

    /// Stage the removal of the document at `key`.
    pub fn delete(&mut self, key: DocumentKey) -> &mut Self {
        self.mutations.push(Mutation::Delete { key });
        self
    }

    /// Stage the checkpoint of projector `name` at `position`.
    ///
    /// The checkpoint lives at `projector/<name>` as
    /// `{"commitPosition": "<decimal>"}` and is written with replace
    /// semantics.
    pub fn set_checkpoint(&mut self, name: &str, position: Position) -> &mut Self {
        self.set(
            DocumentKey::new(CHECKPOINT_COLLECTION, name),
            serde_json::json!({ COMMIT_POSITION_FIELD: position.to_string() }),
        )
    }

    /// Append all mutations of `other`, keeping their order.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.mutations.extend(other.mutations);
        self
    }

    /// The staged mutations in application order.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns `true` if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Apply every mutation, in order, to an in-memory document map.
    ///
    /// Used by the provided stores, which call it on a working copy (or
    /// under a single lock) so that the batch lands as a whole.
    pub(crate) fn apply_to(self, documents: &mut Documents) {
        for mutation in self.mutations {
            match mutation {
                Mutation::Set { key, fields, merge } => {
                    let collection = documents.entry(key.collection).or_default();
                    match collection.get_mut(&key.id) {
                        Some(existing) if merge => merge_json(existing, fields),
                        _ => {
                            collection.insert(key.id, fields);
                        }
                    }
                }
                Mutation::Delete { key } => {
                    if let Some(collection) = documents.get_mut(&key.collection) {
                        collection.remove(&key.id);
                        if collection.is_empty() {
                            documents.remove(&key.collection);
                        }
                    }
                }
            }
        }
    }
}

/// Recursively merge `patch` into `target`.
///
/// Objects are merged key by key; any other combination replaces `target`
/// with `patch`. Applying the same patch twice yields the same document.
pub fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (field, value) in patch {
                match target.get_mut(&field) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(field, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// A materialized-view store the projector writes into.
///
/// # Contract
///
/// `commit` must apply every mutation of the batch or none of them. A
/// failed commit leaves the store exactly as it was, so the controller can
/// safely re-apply the same events from the previous checkpoint.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a single document.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if the document does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn get(&self, key: &DocumentKey) -> Result<Option<Value>, StoreError>;

    /// Atomically apply a write batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the batch was not applied. Nothing of the
    /// batch is visible afterwards.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}
