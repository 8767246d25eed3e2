//! The projector controller: lifecycle, restarts and the public handle.
//!
//! A [`Projector`] is assembled with [`ProjectorBuilder`] and started once.
//! Starting spawns a supervisor task that runs pipeline attempts until one
//! ends successfully. A failed attempt (source, handler, commit or
//! checkpoint read error) is followed by a jittered exponential backoff, a
//! fresh checkpoint read, and a new subscription after that checkpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;

use crate::apply::EventHandler;
use crate::checkpoint::Checkpoints;
use crate::config::ProjectorConfig;
use crate::error::ProjectorError;
use crate::event::Position;
use crate::filter::{EventFilter, FilterChain, TerminationDetector};
use crate::pipeline::{PipelineContext, Termination, run_pipeline, stopped};
use crate::source::EventSource;
use crate::store::DocumentStore;

/// Lifecycle state of a projector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorState {
    /// Built but not started.
    NotStarted,
    /// A pipeline attempt is running.
    Running,
    /// The last attempt failed; waiting before the next one.
    Restarting,
    /// The projector finished, successfully or not.
    Terminated,
}

/// Summary of a successful projector run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectorOutcome {
    /// Projector name.
    pub name: String,
    /// Why the run ended.
    pub termination: Termination,
    /// Last durable checkpoint, or `None` if nothing was ever committed.
    pub checkpoint: Option<Position>,
    /// Number of pipeline restarts during the run.
    pub restarts: u32,
}

/// Builder for [`Projector`].
///
/// The source, the store and the handler are required; the filter and the
/// configuration are optional.
pub struct ProjectorBuilder {
    name: String,
    source: Option<Arc<dyn EventSource>>,
    store: Option<Arc<dyn DocumentStore>>,
    handler: Option<Arc<dyn EventHandler>>,
    filter: Option<Box<dyn EventFilter>>,
    config: ProjectorConfig,
}

impl ProjectorBuilder {
    /// Set the event log to read from.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the document store that receives the writes and the checkpoint.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the per-event handler.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Add a filter applied after the [`DefaultFilter`](crate::DefaultFilter).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn filter(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Replace the default configuration.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn config(mut self, config: ProjectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and assemble the projector.
    ///
    /// # Errors
    ///
    /// * [`ProjectorError::MissingComponent`] if the source, store or
    ///   handler was not set.
    /// * [`ProjectorError::InvalidConfig`] if the name is empty or the
    ///   configuration is invalid.
    pub fn build(self) -> Result<Projector, ProjectorError> {
        if self.name.is_empty() {
            return Err(ProjectorError::InvalidConfig(
                "projector name must not be empty".to_string(),
            ));
        }
        self.config.validate()?;
        let source = self.source.ok_or(ProjectorError::MissingComponent("source"))?;
        let store = self.store.ok_or(ProjectorError::MissingComponent("store"))?;
        let handler = self
            .handler
            .ok_or(ProjectorError::MissingComponent("handler"))?;

        let (state, _) = watch::channel(ProjectorState::NotStarted);
        Ok(Projector {
            checkpoints: Checkpoints::new(Arc::clone(&store)),
            ctx: Arc::new(PipelineContext {
                name: self.name,
                source,
                store,
                handler,
                filter: FilterChain::new(self.filter),
                detector: TerminationDetector::new(self.config.stop_on.clone()),
                config: self.config,
            }),
            state,
            handle: tokio::sync::Mutex::new(None),
        })
    }
}

/// Projects an event log into a document store.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use eventfold_projector::{
///     BoxError, DocumentKey, MemoryDocumentStore, MemoryEventLog, Projector, RecordedEvent,
///     WriteBatch,
/// };
///
/// fn last_type(event: &RecordedEvent, writes: &mut WriteBatch) -> Result<(), BoxError> {
///     writes.merge(
///         DocumentKey::new("streams", event.stream_id.as_str()),
///         serde_json::json!({ "lastEventType": event.event_type }),
///     );
///     Ok(())
/// }
///
/// # async fn run() -> Result<(), eventfold_projector::ProjectorError> {
/// let log = MemoryEventLog::new();
/// let projector = Projector::builder("streams")
///     .source(Arc::new(log.clone()))
///     .store(Arc::new(MemoryDocumentStore::new()))
///     .handler(Arc::new(last_type))
///     .build()?;
///
/// let handle = projector.start().await?;
/// log.append("Vehicle-O37", "VehicleMoved", serde_json::json!({}));
/// let outcome = handle.stop().await?;
/// println!("stopped at {:?}", outcome.checkpoint);
/// # Ok(())
/// # }
/// ```
pub struct Projector {
    ctx: Arc<PipelineContext>,
    checkpoints: Checkpoints,
    state: watch::Sender<ProjectorState>,
    handle: tokio::sync::Mutex<Option<ProjectorHandle>>,
}

impl Projector {
    /// Start building a projector named `name`.
    ///
    /// The name scopes the checkpoint document (`projector/<name>`) and the
    /// tracing span of the run.
    pub fn builder(name: impl Into<String>) -> ProjectorBuilder {
        ProjectorBuilder {
            name: name.into(),
            source: None,
            store: None,
            handler: None,
            filter: None,
            config: ProjectorConfig::default(),
        }
    }

    /// The projector name.
    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProjectorState {
        *self.state.borrow()
    }

    /// Spawn the supervisor task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    ///
    /// A [`ProjectorHandle`] to observe, stop and await the run.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectorError::AlreadyStarted`] if the projector was
    /// started before, whether or not that run is still going.
    pub async fn start(&self) -> Result<ProjectorHandle, ProjectorError> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Err(ProjectorError::AlreadyStarted(self.ctx.name.clone()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (committed_tx, committed_rx) = watch::channel(None);
        self.state.send_replace(ProjectorState::Running);

        let span = tracing::info_span!("projector", projector = %self.ctx.name);
        let supervisor = Supervisor {
            ctx: Arc::clone(&self.ctx),
            checkpoints: self.checkpoints.clone(),
            state: self.state.clone(),
            committed: committed_tx,
            stop_rx,
        };
        let task = tokio::spawn(supervisor.run().instrument(span));

        let handle = ProjectorHandle {
            stop_tx,
            state_rx: self.state.subscribe(),
            committed_rx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        };
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Start the projector and wait for it to finish.
    ///
    /// # Errors
    ///
    /// See [`start`](Projector::start) and [`ProjectorHandle::wait`].
    pub async fn run(&self) -> Result<ProjectorOutcome, ProjectorError> {
        self.start().await?.wait().await
    }
}

/// Handle to a running projector.
///
/// Dropping the handle does **not** stop the projector; call
/// [`stop`](ProjectorHandle::stop) for a graceful shutdown.
///
/// `Clone` is cheap; all clones control the same run.
#[derive(Clone, Debug)]
pub struct ProjectorHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ProjectorState>,
    committed_rx: watch::Receiver<Option<Position>>,
    task: Arc<
        tokio::sync::Mutex<
            Option<tokio::task::JoinHandle<Result<ProjectorOutcome, ProjectorError>>>,
        >,
    >,
}

impl ProjectorHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> ProjectorState {
        *self.state_rx.borrow()
    }

    /// Highest checkpoint committed by this run so far.
    pub fn committed_position(&self) -> Option<Position> {
        *self.committed_rx.borrow()
    }

    /// Wait until this run has committed `position` (or beyond).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectorError::TaskFailed`] if the run ended before
    /// reaching `position`.
    pub async fn wait_for_position(&self, position: Position) -> Result<(), ProjectorError> {
        let mut committed_rx = self.committed_rx.clone();
        committed_rx
            .wait_for(|committed| committed.is_some_and(|p| p >= position))
            .await
            .map(|_| ())
            .map_err(|_| {
                ProjectorError::TaskFailed(format!("run ended before committing position {position}"))
            })
    }

    /// Ask the projector to stop and wait for it to finish.
    ///
    /// The subscription is dropped, events already queued are committed,
    /// and the run ends with [`Termination::StoppedExternally`] (unless it
    /// had already ended for another reason).
    ///
    /// # Errors
    ///
    /// See [`wait`](ProjectorHandle::wait).
    pub async fn stop(&self) -> Result<ProjectorOutcome, ProjectorError> {
        // The supervisor may already be gone; that is not an error.
        let _ = self.stop_tx.send(true);
        self.wait().await
    }

    /// Wait for the run to finish without stopping it.
    ///
    /// # Returns
    ///
    /// The outcome of the run. Only the first caller across all clones
    /// receives it.
    ///
    /// # Errors
    ///
    /// * Any non-retryable error that ended the run.
    /// * [`ProjectorError::TaskFailed`] if the supervisor task panicked, or
    ///   if the outcome was already taken by another call.
    pub async fn wait(&self) -> Result<ProjectorOutcome, ProjectorError> {
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| ProjectorError::TaskFailed(format!("supervisor task failed: {e}")))?,
            None => Err(ProjectorError::TaskFailed(
                "projector outcome was already taken".to_string(),
            )),
        }
    }
}

/// State owned by the spawned supervisor task.
struct Supervisor {
    ctx: Arc<PipelineContext>,
    checkpoints: Checkpoints,
    state: watch::Sender<ProjectorState>,
    committed: watch::Sender<Option<Position>>,
    stop_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Run attempts until one succeeds or a non-retryable error occurs.
    async fn run(mut self) -> Result<ProjectorOutcome, ProjectorError> {
        let config = self.ctx.config.clone();
        let mut backoff = config.restart_base_delay;
        let mut restarts = 0u32;
        let mut durable: Option<Position> = None;

        loop {
            if *self.stop_rx.borrow() {
                return Ok(self.finish(Termination::StoppedExternally, durable, restarts));
            }

            let before = self.committed_position();
            let read = tokio::select! {
                biased;
                () = stopped(&mut self.stop_rx) => {
                    return Ok(self.finish(Termination::StoppedExternally, durable, restarts));
                }
                read = self.checkpoints.read(&self.ctx.name) => read,
            };
            let result = match read {
                Ok(checkpoint) => {
                    durable = resume_position(&self.ctx.name, checkpoint, before);
                    run_pipeline(&self.ctx, durable, self.stop_rx.clone(), &self.committed).await
                }
                Err(e) => Err(ProjectorError::CheckpointUnavailable(e)),
            };

            match result {
                Ok(termination) => {
                    return Ok(self.finish(termination, durable, restarts));
                }
                Err(e) if e.is_retryable() => {
                    let last_committed = self.committed_position().max(durable);
                    if self.committed_position() > before {
                        backoff = config.restart_base_delay;
                    }
                    restarts += 1;
                    let delay = with_jitter(backoff);
                    self.state.send_replace(ProjectorState::Restarting);
                    tracing::warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        checkpoint = ?last_committed.map(Position::value),
                        restarts,
                        "pipeline failed, restarting"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        () = stopped(&mut self.stop_rx) => {
                            return Ok(self.finish(
                                Termination::StoppedExternally,
                                last_committed,
                                restarts,
                            ));
                        }
                    }
                    backoff = (backoff * 2).min(config.restart_max_delay);
                    self.state.send_replace(ProjectorState::Running);
                }
                Err(e) => {
                    tracing::error!(error = %e, "projector failed");
                    self.state.send_replace(ProjectorState::Terminated);
                    return Err(e);
                }
            }
        }
    }

    fn committed_position(&self) -> Option<Position> {
        *self.committed.borrow()
    }

    fn finish(
        &self,
        termination: Termination,
        durable: Option<Position>,
        restarts: u32,
    ) -> ProjectorOutcome {
        let checkpoint = self.committed_position().max(durable);
        self.state.send_replace(ProjectorState::Terminated);
        tracing::info!(
            ?termination,
            checkpoint = ?checkpoint.map(Position::value),
            restarts,
            "projector terminated"
        );
        ProjectorOutcome {
            name: self.ctx.name.clone(),
            termination,
            checkpoint,
            restarts,
        }
    }
}

/// Pick the position to resume after.
///
/// Normally this is the stored checkpoint. If the store reports a position
/// below one this process has already seen committed (a lagging replica,
/// say), the committed position wins so the checkpoint never regresses.
fn resume_position(
    name: &str,
    stored: Option<Position>,
    committed: Option<Position>,
) -> Option<Position> {
    if committed > stored {
        tracing::warn!(
            projector = name,
            stored = ?stored.map(Position::value),
            committed = ?committed.map(Position::value),
            "stored checkpoint is behind committed position, resuming from committed"
        );
        return committed;
    }
    stored
}

/// Spread `delay` over `[delay / 2, delay]` so restarting projectors do not
/// hit the source in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let half_ms = (delay.as_millis() / 2) as u64;
    if half_ms == 0 {
        return delay;
    }
    let jitter_ms = (uuid::Uuid::new_v4().as_u128() % u128::from(half_ms + 1)) as u64;
    Duration::from_millis(delay.as_millis() as u64 - half_ms + jitter_ms)
}
