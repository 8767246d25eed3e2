//! Turning a batch of events into one atomic write batch.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};

use crate::batcher::Batch;
use crate::error::{BoxError, ProjectorError};
use crate::event::RecordedEvent;
use crate::store::{DocumentStore, WriteBatch};

/// Maps one event to document mutations.
///
/// Handlers stage writes into the provided [`WriteBatch`] and must not
/// write to the store directly; the staged writes are committed together
/// with the checkpoint. Because delivery is at-least-once, the same event
/// may be handled again after a restart, so the staged writes should be
/// idempotent (merge or set, rather than increments).
///
/// Synchronous closures of type
/// `Fn(&RecordedEvent, &mut WriteBatch) -> Result<(), BoxError>` implement
/// this trait.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stage the side effects of `event` into `writes`.
    ///
    /// # Errors
    ///
    /// Any error aborts the whole batch: nothing is committed and the
    /// projector restarts from its last checkpoint.
    async fn handle(&self, event: &RecordedEvent, writes: &mut WriteBatch)
    -> Result<(), BoxError>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(&RecordedEvent, &mut WriteBatch) -> Result<(), BoxError> + Send + Sync,
{
    async fn handle(
        &self,
        event: &RecordedEvent,
        writes: &mut WriteBatch,
    ) -> Result<(), BoxError> {
        self(event, writes)
    }
}

/// Run the handler over every event of `batch` and stage the checkpoint.
///
/// Up to `concurrency` handler invocations run at once. Each invocation
/// writes into its own fragment, and fragments are concatenated in event
/// order, so the resulting write batch is the same as if the events had
/// been handled one after another.
///
/// # Arguments
///
/// * `name` - Projector name; scopes the checkpoint document.
/// * `handler` - The per-event handler.
/// * `batch` - Events to apply, in log order.
/// * `concurrency` - Maximum handler invocations in flight.
///
/// # Returns
///
/// The write batch: all handler mutations followed by the checkpoint at
/// the batch's highest position.
///
/// # Errors
///
/// Returns [`ProjectorError::HandlerFailure`] for the first failing event
/// in log order. The partially built write batch is dropped.
pub(crate) async fn apply_batch(
    name: &str,
    handler: &dyn EventHandler,
    batch: &Batch,
    concurrency: usize,
) -> Result<WriteBatch, ProjectorError> {
    let invocations: Vec<_> = batch
        .events()
        .iter()
        .map(|event| handle_one(handler, event))
        .collect();
    let fragments: Vec<WriteBatch> = futures::stream::iter(invocations)
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;

    let mut writes = WriteBatch::new();
    for fragment in fragments {
        writes.extend(fragment);
    }
    writes.set_checkpoint(name, batch.highest_position());
    Ok(writes)
}

async fn handle_one(
    handler: &dyn EventHandler,
    event: &RecordedEvent,
) -> Result<WriteBatch, ProjectorError> {
    let mut fragment = WriteBatch::new();
    handler
        .handle(event, &mut fragment)
        .await
        .map_err(|source| ProjectorError::HandlerFailure {
            position: event.position,
            source,
        })?;
    Ok(fragment)
}

/// Commit a write batch, mapping store errors to
/// [`ProjectorError::CommitFailure`]. No retry happens here.
pub(crate) async fn commit_batch(
    store: &dyn DocumentStore,
    writes: WriteBatch,
) -> Result<(), ProjectorError> {
    store.commit(writes).await.map_err(ProjectorError::CommitFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::FlushReason;
    use crate::event::Position;
    use crate::store::{DocumentKey, Mutation};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn numbered(a: u64) -> RecordedEvent {
        RecordedEvent::json(Position::new(a), "numbers", "Numbered", json!({ "a": a }))
    }

    fn batch_of(range: std::ops::Range<u64>) -> Batch {
        Batch::new(range.map(numbered).collect(), FlushReason::Size).expect("non-empty")
    }

    fn record_position(event: &RecordedEvent, writes: &mut WriteBatch) -> Result<(), BoxError> {
        writes.merge(
            DocumentKey::new("numbers", "last"),
            json!({ "a": event.position.value() }),
        );
        Ok(())
    }

    /// Sleeps longer for earlier events so completion order is reversed.
    struct ReversedCompletion;

    #[async_trait]
    impl EventHandler for ReversedCompletion {
        async fn handle(
            &self,
            event: &RecordedEvent,
            writes: &mut WriteBatch,
        ) -> Result<(), BoxError> {
            let delay = 100 - event.position.value() * 10;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            record_position(event, writes)
        }
    }

    #[tokio::test]
    async fn handler_mutations_precede_checkpoint() {
        let writes = apply_batch("numbers", &record_position, &batch_of(0..3), 1)
            .await
            .expect("apply");

        assert_eq!(writes.len(), 4);
        assert_eq!(
            writes.mutations().last(),
            Some(&Mutation::Set {
                key: DocumentKey::new("projector", "numbers"),
                fields: json!({ "commitPosition": "2" }),
                merge: false,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_handlers_keep_event_order() {
        let writes = apply_batch("numbers", &ReversedCompletion, &batch_of(0..5), 5)
            .await
            .expect("apply");

        let staged: Vec<u64> = writes
            .mutations()
            .iter()
            .filter_map(|m| match m {
                Mutation::Set { fields, merge: true, .. } => fields["a"].as_u64(),
                _ => None,
            })
            .collect();
        assert_eq!(staged, vec![0, 1, 2, 3, 4]);
    }

    /// Tracks how many invocations are running at once.
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for InFlight {
        async fn handle(
            &self,
            event: &RecordedEvent,
            writes: &mut WriteBatch,
        ) -> Result<(), BoxError> {
            let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            record_position(event, writes)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_handlers_never_exceed_concurrency() {
        for concurrency in [1, 3, 8] {
            let handler = InFlight::default();
            let writes = apply_batch("numbers", &handler, &batch_of(0..20), concurrency)
                .await
                .expect("apply");

            assert_eq!(writes.len(), 21);
            assert_eq!(handler.peak.load(Ordering::SeqCst), concurrency);
        }
    }

    #[tokio::test]
    async fn handler_failure_reports_position_and_stages_nothing() {
        let failing = |event: &RecordedEvent, writes: &mut WriteBatch| -> Result<(), BoxError> {
            if event.position == Position::new(2) {
                return Err("cannot map event".into());
            }
            record_position(event, writes)
        };

        let err = apply_batch("numbers", &failing, &batch_of(0..5), 2)
            .await
            .expect_err("should fail");
        match err {
            ProjectorError::HandlerFailure { position, source } => {
                assert_eq!(position, Position::new(2));
                assert_eq!(source.to_string(), "cannot map event");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn commit_failure_is_mapped() {
        struct Rejecting;

        #[async_trait]
        impl DocumentStore for Rejecting {
            async fn get(
                &self,
                _key: &DocumentKey,
            ) -> Result<Option<serde_json::Value>, crate::error::StoreError> {
                Ok(None)
            }

            async fn commit(&self, _batch: WriteBatch) -> Result<(), crate::error::StoreError> {
                Err(crate::error::StoreError::Conflict("stale".into()))
            }
        }

        let err = commit_batch(&Rejecting, WriteBatch::new())
            .await
            .expect_err("should fail");
        assert!(matches!(err, ProjectorError::CommitFailure(_)));
    }
}
