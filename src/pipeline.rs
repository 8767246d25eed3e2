//! One attempt of the projection pipeline.
//!
//! An attempt runs two stages concurrently, connected by a bounded queue:
//!
//! - the **source stage** subscribes after the resume position, drops
//!   already-committed and filtered events, forwards the rest, and ends on
//!   end of stream, terminal event or stop;
//! - the **sink stage** batches the queue, applies each batch through the
//!   handler and commits it together with its checkpoint.
//!
//! A full queue blocks the source stage, so a slow store slows reading. Any
//! error ends the attempt; the controller decides whether to restart.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;

use crate::apply::{EventHandler, apply_batch, commit_batch};
use crate::batcher::Batcher;
use crate::config::ProjectorConfig;
use crate::error::ProjectorError;
use crate::event::{Position, RecordedEvent};
use crate::filter::{EventFilter, FilterChain, TerminationDetector};
use crate::source::EventSource;
use crate::store::DocumentStore;

/// Why a projector run ended successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source finished delivering events.
    EndOfStream,
    /// The configured terminal event was committed.
    TerminalEventReceived {
        /// Position of the terminal event.
        position: Position,
    },
    /// [`ProjectorHandle::stop`](crate::ProjectorHandle::stop) was called.
    StoppedExternally,
}

/// Everything an attempt needs; shared across restarts.
pub(crate) struct PipelineContext {
    pub(crate) name: String,
    pub(crate) source: Arc<dyn EventSource>,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) filter: FilterChain,
    pub(crate) detector: TerminationDetector,
    pub(crate) config: ProjectorConfig,
}

/// Run a single pipeline attempt.
///
/// # Arguments
///
/// * `ctx` - Projector components and configuration.
/// * `resume` - Last durable checkpoint; only later events are processed.
/// * `stop_rx` - Flips to `true` when the projector is asked to stop.
/// * `committed` - Advanced to each batch's checkpoint after its commit.
///
/// # Returns
///
/// How the attempt ended, once every queued event has been committed.
///
/// # Errors
///
/// Returns the first source, handler or commit error. Events not yet
/// committed are discarded and will be re-delivered by the next attempt.
pub(crate) async fn run_pipeline(
    ctx: &PipelineContext,
    resume: Option<Position>,
    stop_rx: watch::Receiver<bool>,
    committed: &watch::Sender<Option<Position>>,
) -> Result<Termination, ProjectorError> {
    let (tx, rx) = mpsc::channel(ctx.config.queue_capacity());
    let (termination, ()) = tokio::try_join!(
        source_stage(ctx, resume, stop_rx, tx),
        sink_stage(ctx, rx, committed),
    )?;
    Ok(termination)
}

async fn source_stage(
    ctx: &PipelineContext,
    resume: Option<Position>,
    mut stop_rx: watch::Receiver<bool>,
    tx: mpsc::Sender<RecordedEvent>,
) -> Result<Termination, ProjectorError> {
    tracing::info!(after = ?resume.map(Position::value), "subscribing");
    let subscribed = tokio::select! {
        biased;
        () = stopped(&mut stop_rx) => return Ok(Termination::StoppedExternally),
        subscribed = ctx.source.subscribe(resume) => subscribed,
    };
    let mut stream = subscribed.map_err(ProjectorError::SourceUnavailable)?;

    loop {
        let next = tokio::select! {
            biased;
            () = stopped(&mut stop_rx) => return Ok(Termination::StoppedExternally),
            next = stream.next() => next,
        };
        let Some(item) = next else {
            tracing::info!("event source ended");
            return Ok(Termination::EndOfStream);
        };
        let event = item.map_err(ProjectorError::SourceUnavailable)?;

        if resume.is_some_and(|checkpoint| event.position <= checkpoint) {
            tracing::trace!(position = %event.position, "skipping committed event");
            continue;
        }
        if !ctx.filter.keep(&event) {
            tracing::trace!(position = %event.position, event_type = %event.event_type, "event filtered out");
            continue;
        }

        let terminal = ctx.detector.is_terminal(&event);
        let position = event.position;
        tokio::select! {
            biased;
            () = stopped(&mut stop_rx) => return Ok(Termination::StoppedExternally),
            sent = tx.send(event) => {
                // The sink only goes away after failing, and its error wins
                // the join.
                if sent.is_err() {
                    return Ok(Termination::EndOfStream);
                }
            }
        }

        if terminal {
            tracing::info!(position = %position, "terminal event received");
            return Ok(Termination::TerminalEventReceived { position });
        }
    }
}

async fn sink_stage(
    ctx: &PipelineContext,
    rx: mpsc::Receiver<RecordedEvent>,
    committed: &watch::Sender<Option<Position>>,
) -> Result<(), ProjectorError> {
    let mut batcher = Batcher::new(rx, ctx.config.max_batch_size, ctx.config.max_queue_time);

    while let Some(batch) = batcher.next_batch().await {
        let checkpoint = batch.highest_position();
        let writes = apply_batch(
            &ctx.name,
            ctx.handler.as_ref(),
            &batch,
            ctx.config.handler_concurrency,
        )
        .await?;
        let mutations = writes.len();
        commit_batch(ctx.store.as_ref(), writes).await?;

        committed.send_if_modified(|current| {
            if current.is_none_or(|p| p < checkpoint) {
                *current = Some(checkpoint);
                true
            } else {
                false
            }
        });
        tracing::info!(
            checkpoint = %checkpoint,
            events = batch.len(),
            mutations,
            reason = ?batch.reason(),
            "batch committed"
        );
    }
    Ok(())
}

/// Resolves once a stop is requested. Never resolves if the sender is gone.
pub(crate) async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let result = stop_rx.wait_for(|stop| *stop).await.map(|_| ());
    if result.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoints;
    use crate::error::{BoxError, SourceError};
    use crate::filter::StopOn;
    use crate::memory::{MemoryDocumentStore, MemoryEventLog};
    use crate::source::EventStream;
    use crate::store::{DocumentKey, WriteBatch};
    use async_trait::async_trait;
    use serde_json::json;

    fn count_events(event: &RecordedEvent, writes: &mut WriteBatch) -> Result<(), BoxError> {
        writes.set(
            DocumentKey::new("seen", event.position.to_string()),
            json!({ "type": event.event_type }),
        );
        Ok(())
    }

    fn context(
        source: Arc<dyn EventSource>,
        store: Arc<MemoryDocumentStore>,
        config: ProjectorConfig,
    ) -> PipelineContext {
        PipelineContext {
            name: "test".to_string(),
            source,
            store,
            handler: Arc::new(count_events),
            filter: FilterChain::new(None),
            detector: TerminationDetector::new(config.stop_on.clone()),
            config,
        }
    }

    /// Replays a fixed list regardless of the requested position, like a
    /// source that re-delivers the checkpoint event.
    struct Replaying(Vec<RecordedEvent>);

    #[async_trait]
    impl EventSource for Replaying {
        async fn subscribe(&self, _after: Option<Position>) -> Result<EventStream, SourceError> {
            Ok(Box::pin(tokio_stream::iter(self.0.clone().into_iter().map(Ok))))
        }
    }

    #[tokio::test]
    async fn end_of_stream_commits_everything() {
        let log = MemoryEventLog::new();
        for a in 0..7 {
            log.append("numbers", "Numbered", json!({ "a": a }));
        }
        log.close();
        let store = Arc::new(MemoryDocumentStore::new());
        let config = ProjectorConfig {
            max_batch_size: 3,
            ..ProjectorConfig::default()
        };
        let ctx = context(Arc::new(log), store.clone(), config);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (committed, _) = watch::channel(None);

        let termination = run_pipeline(&ctx, None, stop_rx, &committed)
            .await
            .expect("pipeline");

        assert_eq!(termination, Termination::EndOfStream);
        assert_eq!(store.collection("seen").len(), 7);
        assert_eq!(store.commits(), 3);
        assert_eq!(*committed.borrow(), Some(Position::new(6)));
        let checkpoint = Checkpoints::new(store).read("test").await.expect("read");
        assert_eq!(checkpoint, Some(Position::new(6)));
    }

    #[tokio::test]
    async fn events_at_or_below_resume_are_skipped() {
        let events: Vec<RecordedEvent> = (0..5)
            .map(|a| RecordedEvent::json(Position::new(a), "numbers", "Numbered", json!({})))
            .collect();
        let store = Arc::new(MemoryDocumentStore::new());
        let ctx = context(
            Arc::new(Replaying(events)),
            store.clone(),
            ProjectorConfig::default(),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (committed, _) = watch::channel(None);

        run_pipeline(&ctx, Some(Position::new(2)), stop_rx, &committed)
            .await
            .expect("pipeline");

        let seen: Vec<String> = store.collection("seen").into_keys().collect();
        assert_eq!(seen, vec!["3".to_string(), "4".to_string()]);
    }

    #[tokio::test]
    async fn terminal_event_is_committed_and_ends_attempt() {
        let log = MemoryEventLog::new();
        log.append("numbers", "Numbered", json!({ "a": 0 }));
        log.append("IntegrationTest", "IntegrationTestEnded", json!({}));
        log.append("numbers", "Numbered", json!({ "a": 1 }));
        // The log stays open: only the terminal event can end the attempt.
        let store = Arc::new(MemoryDocumentStore::new());
        let config = ProjectorConfig {
            stop_on: Some(StopOn::new("IntegrationTest", "IntegrationTestEnded")),
            ..ProjectorConfig::default()
        };
        let ctx = context(Arc::new(log), store.clone(), config);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (committed, _) = watch::channel(None);

        let termination = run_pipeline(&ctx, None, stop_rx, &committed)
            .await
            .expect("pipeline");

        assert_eq!(
            termination,
            Termination::TerminalEventReceived {
                position: Position::new(1)
            }
        );
        assert_eq!(store.collection("seen").len(), 2);
        assert_eq!(*committed.borrow(), Some(Position::new(1)));
    }

    #[tokio::test]
    async fn failing_source_item_is_source_unavailable() {
        struct Broken;

        #[async_trait]
        impl EventSource for Broken {
            async fn subscribe(
                &self,
                _after: Option<Position>,
            ) -> Result<EventStream, SourceError> {
                let items = vec![
                    Ok(RecordedEvent::json(Position::new(0), "s", "T", json!({}))),
                    Err(SourceError::new("connection reset")),
                ];
                Ok(Box::pin(tokio_stream::iter(items)))
            }
        }

        let store = Arc::new(MemoryDocumentStore::new());
        let ctx = context(Arc::new(Broken), store, ProjectorConfig::default());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (committed, _) = watch::channel(None);

        let err = run_pipeline(&ctx, None, stop_rx, &committed)
            .await
            .expect_err("should fail");
        assert!(matches!(err, ProjectorError::SourceUnavailable(_)));
    }
}
