//! Crate-level error types for the projector pipeline and its collaborators.

use crate::event::Position;

/// Boxed error used for causes coming from application code (handlers) or
/// third-party clients (event sources).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error produced by an [`EventSource`](crate::EventSource) subscription.
///
/// Always treated as transient by the controller: the attempt is abandoned
/// and a new subscription is opened after a backoff delay.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SourceError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl SourceError {
    /// Create a source error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a source error wrapping an underlying cause.
    ///
    /// # Arguments
    ///
    /// * `message` - Human-readable context, e.g. `"subscribe stream error"`.
    /// * `source` - The client or transport error that caused the failure.
    pub fn with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Error returned by a [`DocumentStore`](crate::DocumentStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Disk I/O failure in a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A document or the store file could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store rejected the write batch, e.g. an optimistic-concurrency
    /// conflict on the backend.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The checkpoint document exists but does not hold a valid position.
    #[error("malformed checkpoint for projector `{name}`: {reason}")]
    MalformedCheckpoint {
        /// Projector name that owns the checkpoint document.
        name: String,
        /// What was wrong with the stored value.
        reason: String,
    },
}

/// Error returned by the projector.
///
/// The first four variants are raised inside a pipeline attempt and are
/// handled by the controller's restart loop (see
/// [`is_retryable`](ProjectorError::is_retryable)). The remaining variants
/// are programming or setup errors that are returned to the caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    /// The event log could not be subscribed to or the subscription broke.
    #[error("event source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),

    /// A per-event handler failed; the in-flight batch was discarded.
    #[error("handler failed for event at position {position}: {source}")]
    HandlerFailure {
        /// Position of the event whose handler failed.
        position: Position,
        /// The handler's error.
        #[source]
        source: BoxError,
    },

    /// The document store failed to commit a write batch.
    #[error("write batch commit failed: {0}")]
    CommitFailure(#[source] StoreError),

    /// The checkpoint could not be read at (re)start.
    #[error("checkpoint read failed: {0}")]
    CheckpointUnavailable(#[source] StoreError),

    /// `start()` was called on a projector that was already started.
    #[error("projector `{0}` was already started")]
    AlreadyStarted(String),

    /// The projector configuration is invalid.
    #[error("invalid projector configuration: {0}")]
    InvalidConfig(String),

    /// A required builder component was not provided.
    #[error("projector builder is missing a {0}")]
    MissingComponent(&'static str),

    /// The supervisor task panicked or was aborted.
    #[error("projector task failed: {0}")]
    TaskFailed(String),
}

impl ProjectorError {
    /// Returns `true` for errors that make the controller restart the
    /// pipeline from the last durable checkpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_)
                | Self::HandlerFailure { .. }
                | Self::CommitFailure(_)
                | Self::CheckpointUnavailable(_)
        )
    }
}
