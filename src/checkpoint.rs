//! Reading the durable checkpoint of a projector.
//!
//! Checkpoints are only ever written through
//! [`WriteBatch::set_checkpoint`](crate::WriteBatch::set_checkpoint), in the
//! same commit as the side effects they cover.

use std::sync::Arc;

use serde_json::Value;

use crate::error::StoreError;
use crate::event::Position;
use crate::store::{DocumentKey, DocumentStore};

/// Collection holding one checkpoint document per projector name.
pub const CHECKPOINT_COLLECTION: &str = "projector";

/// Field of the checkpoint document holding the base-10 position string.
pub const COMMIT_POSITION_FIELD: &str = "commitPosition";

/// Read access to projector checkpoints in a [`DocumentStore`].
#[derive(Clone)]
pub struct Checkpoints {
    store: Arc<dyn DocumentStore>,
}

impl Checkpoints {
    /// Create a checkpoint reader over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Read the last committed position of projector `name`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if the projector has never committed; it then starts from
    /// the beginning of the log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MalformedCheckpoint`] if the document exists but
    /// does not hold a base-10 position string. A corrupt checkpoint is
    /// never treated as "start over", since that would silently replay the
    /// whole log. Store access errors are passed through.
    pub async fn read(&self, name: &str) -> Result<Option<Position>, StoreError> {
        let key = DocumentKey::new(CHECKPOINT_COLLECTION, name);
        let Some(document) = self.store.get(&key).await? else {
            return Ok(None);
        };
        parse_checkpoint(name, &document).map(Some)
    }
}

fn parse_checkpoint(name: &str, document: &Value) -> Result<Position, StoreError> {
    let malformed = |reason: String| StoreError::MalformedCheckpoint {
        name: name.to_string(),
        reason,
    };

    match document.get(COMMIT_POSITION_FIELD) {
        Some(Value::String(raw)) => raw
            .parse::<Position>()
            .map_err(|e| malformed(format!("`{raw}` is not a position: {e}"))),
        Some(other) => Err(malformed(format!(
            "`{COMMIT_POSITION_FIELD}` must be a string, found {other}"
        ))),
        None => Err(malformed(format!("missing `{COMMIT_POSITION_FIELD}`"))),
    }
}
