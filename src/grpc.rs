//! [`EventSource`] over the eventfold-db `SubscribeAll` gRPC stream.

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tonic::transport::Channel;

use crate::error::SourceError;
use crate::event::{Position, RecordedEvent, from_proto};
use crate::proto;
use crate::proto::event_store_client::EventStoreClient;
use crate::proto::subscribe_response::Content;
use crate::source::{EventSource, EventStream};

/// Event source reading the global log of an `eventfold-db` server.
///
/// `CaughtUp` sentinels are not forwarded: the projector treats the log as
/// one continuous stream. Clone is cheap; clones share the channel.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), eventfold_projector::SourceError> {
/// use eventfold_projector::GrpcEventSource;
///
/// let source = GrpcEventSource::connect("http://127.0.0.1:2113").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct GrpcEventSource {
    client: EventStoreClient<Channel>,
}

impl GrpcEventSource {
    /// Connect to an `eventfold-db` server.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - The URI of the gRPC server (e.g., `"http://127.0.0.1:2113"`).
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the channel cannot be established.
    pub async fn connect(endpoint: &str) -> Result<Self, SourceError> {
        let client = EventStoreClient::connect(endpoint.to_string())
            .await
            .map_err(|e| SourceError::with_source(format!("cannot connect to {endpoint}"), e))?;
        Ok(Self { client })
    }

    /// Wrap an existing channel, e.g. one configured with TLS or timeouts.
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: EventStoreClient::new(channel),
        }
    }
}

#[async_trait]
impl EventSource for GrpcEventSource {
    async fn subscribe(&self, after: Option<Position>) -> Result<EventStream, SourceError> {
        // The server's position is inclusive.
        let from_position = after.map_or(0, |p| p.value().saturating_add(1));
        let request = proto::SubscribeAllRequest { from_position };
        let response = self
            .client
            .clone()
            .subscribe_all(request)
            .await
            .map_err(|status| SourceError::with_source("subscribe_all failed", status))?;

        let events = response.into_inner().filter_map(decode_response);
        Ok(Box::pin(events))
    }
}

/// Map one streamed response to an event, dropping sentinels.
fn decode_response(
    response: Result<proto::SubscribeResponse, tonic::Status>,
) -> Option<Result<RecordedEvent, SourceError>> {
    match response {
        Ok(proto::SubscribeResponse {
            content: Some(Content::Event(recorded)),
        }) => {
            let position = recorded.global_position;
            let event = from_proto(recorded);
            if event.is_none() {
                tracing::warn!(position, "skipping event with invalid event ID");
            }
            event.map(Ok)
        }
        Ok(proto::SubscribeResponse {
            content: Some(Content::CaughtUp(_)),
        }) => {
            tracing::debug!("source caught up");
            None
        }
        Ok(proto::SubscribeResponse { content: None }) => None,
        Err(status) => Some(Err(SourceError::with_source(
            "subscribe stream error",
            status,
        ))),
    }
}
