//! Event filtering and terminal-event detection.
//!
//! Both stages are pure predicates evaluated by the source stage of the
//! pipeline, before events enter the bounded batching queue. Neither
//! reorders events.

use crate::event::RecordedEvent;

/// Decides which events reach the batcher.
///
/// Implementations must be pure: the same event always yields the same
/// answer, and no side effects are performed. Closures of type
/// `Fn(&RecordedEvent) -> bool` implement this trait.
pub trait EventFilter: Send + Sync {
    /// Returns `true` to retain the event, `false` to drop it silently.
    fn keep(&self, event: &RecordedEvent) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&RecordedEvent) -> bool + Send + Sync,
{
    fn keep(&self, event: &RecordedEvent) -> bool {
        self(event)
    }
}

/// The filter every projector applies before any user filter.
///
/// Drops events whose payload is not JSON. System events (event types
/// starting with `$`) carry JSON too and pass; drop them with a user filter
/// if the handler should not see them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFilter;

impl EventFilter for DefaultFilter {
    fn keep(&self, event: &RecordedEvent) -> bool {
        event.payload.is_json()
    }
}

/// Combined filter: [`DefaultFilter`] followed by an optional user filter.
pub(crate) struct FilterChain {
    user: Option<Box<dyn EventFilter>>,
}

impl FilterChain {
    pub(crate) fn new(user: Option<Box<dyn EventFilter>>) -> Self {
        Self { user }
    }
}

impl EventFilter for FilterChain {
    fn keep(&self, event: &RecordedEvent) -> bool {
        DefaultFilter.keep(event) && self.user.as_ref().is_none_or(|f| f.keep(event))
    }
}

/// Identifies the event that ends a bounded run.
///
/// A projector configured with a `StopOn` terminates successfully after the
/// first event on `stream_id` with type `event_type` has been committed.
/// Typically used by integration tests and batch backfills that append a
/// marker event at the end of their input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOn {
    /// Stream the terminal event is written to, e.g. `"IntegrationTest"`.
    pub stream_id: String,
    /// Type of the terminal event, e.g. `"IntegrationTestEnded"`.
    pub event_type: String,
}

impl StopOn {
    /// Create a terminal-event criterion.
    pub fn new(stream_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_type: event_type.into(),
        }
    }
}

/// Recognizes the terminal event, if one is configured.
///
/// Without a criterion the detector never fires and the projector runs until
/// the source ends or it is stopped.
#[derive(Debug, Clone, Default)]
pub struct TerminationDetector {
    stop_on: Option<StopOn>,
}

impl TerminationDetector {
    /// Create a detector for the given optional criterion.
    pub fn new(stop_on: Option<StopOn>) -> Self {
        Self { stop_on }
    }

    /// Returns `true` if `event` is the configured terminal event.
    pub fn is_terminal(&self, event: &RecordedEvent) -> bool {
        self.stop_on.as_ref().is_some_and(|stop| {
            event.stream_id == stop.stream_id && event.event_type == stop.event_type
        })
    }
}
