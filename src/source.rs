//! The event source seam.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::SourceError;
use crate::event::{Position, RecordedEvent};

/// A live subscription to the global log.
///
/// Dropping the stream releases the subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RecordedEvent, SourceError>> + Send>>;

/// An ordered, durable, append-only global event log.
///
/// Implementations must deliver events in strictly increasing position
/// order, and must not retry on their own: a broken subscription surfaces
/// as an `Err` item (or a failed `subscribe`) and the projector controller
/// decides when to resubscribe.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a subscription.
    ///
    /// # Arguments
    ///
    /// * `after` - `None` to start at the beginning of the log, or
    ///   `Some(p)` to receive only events with a position strictly greater
    ///   than `p`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the log cannot be reached.
    async fn subscribe(&self, after: Option<Position>) -> Result<EventStream, SourceError>;
}
