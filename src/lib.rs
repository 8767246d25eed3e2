//! Checkpointed projection of an ordered global event log into a document
//! store.
//!
//! A [`Projector`] subscribes to an [`EventSource`], filters and batches the
//! events, runs an [`EventHandler`] for each one, and commits the resulting
//! writes together with its checkpoint in a single atomic [`WriteBatch`].
//! After a failure it resumes from the last committed checkpoint, so every
//! event is applied at least once and idempotent writes converge.

mod apply;
mod batcher;
mod checkpoint;
mod config;
mod error;
mod event;
mod file;
mod filter;
#[cfg(feature = "grpc")]
mod grpc;
mod memory;
mod pipeline;
mod projector;
mod source;
mod store;

#[cfg(feature = "grpc")]
pub(crate) mod proto {
    tonic::include_proto!("eventfold");
}

pub use apply::EventHandler;
pub use batcher::{Batch, Batcher, FlushReason};
pub use checkpoint::{CHECKPOINT_COLLECTION, COMMIT_POSITION_FIELD, Checkpoints};
pub use config::{MAX_BATCH_SIZE, MIN_QUEUE_TIME, ProjectorConfig};
pub use error::{BoxError, ProjectorError, SourceError, StoreError};
pub use event::{Payload, Position, RecordedEvent};
pub use file::JsonFileStore;
pub use filter::{DefaultFilter, EventFilter, StopOn, TerminationDetector};
#[cfg(feature = "grpc")]
pub use grpc::GrpcEventSource;
pub use memory::{MemoryDocumentStore, MemoryEventLog};
pub use pipeline::Termination;
pub use projector::{
    Projector, ProjectorBuilder, ProjectorHandle, ProjectorOutcome, ProjectorState,
};
pub use source::{EventSource, EventStream};
pub use store::{DocumentKey, DocumentStore, Mutation, WriteBatch, merge_json};
