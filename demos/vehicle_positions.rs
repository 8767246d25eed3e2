//! Projects vehicle movements into a `position` collection stored on disk.
//!
//! Appends a few `VehicleMoved` events and an `IntegrationTestEnded` marker
//! to an in-memory log, runs a projector until the marker is committed, and
//! prints the resulting documents.
//!
//! Run with: `cargo run --example vehicle_positions`
//!
//! Set `RUST_LOG=eventfold_projector=debug` to see every flush and commit.

use std::sync::Arc;
use std::time::Duration;

use eventfold_projector::{
    BoxError, DocumentKey, JsonFileStore, MemoryEventLog, Projector, ProjectorConfig,
    RecordedEvent, StopOn, WriteBatch,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Coordinates {
    lat: f64,
    lon: f64,
}

/// Events written to `Vehicle-<id>` streams.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
enum VehicleEvent {
    VehicleMoved {
        position: Coordinates,
        #[serde(rename = "positionAtTime")]
        position_at_time: u64,
    },
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Keep the last known position of every vehicle.
fn project_position(event: &RecordedEvent, writes: &mut WriteBatch) -> Result<(), BoxError> {
    if !event.stream_id.starts_with("Vehicle") {
        return Ok(());
    }
    match event.decode::<VehicleEvent>() {
        Some(VehicleEvent::VehicleMoved {
            position,
            position_at_time,
        }) => {
            writes.set(
                DocumentKey::new("position", event.stream_id.as_str()),
                serde_json::json!({
                    "lastKnownPosition": position,
                    "positionAtTime": position_at_time,
                }),
            );
        }
        None => tracing::debug!(event_type = %event.event_type, "ignoring event"),
    }
    Ok(())
}

fn vehicle_moved(log: &MemoryEventLog, vehicle: &str, lat: f64, lon: f64, at: u64) {
    log.append(
        &format!("Vehicle-{vehicle}"),
        "VehicleMoved",
        serde_json::json!({ "position": { "lat": lat, "lon": lon }, "positionAtTime": at }),
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tmp = tempfile::tempdir()?;
    let store = Arc::new(JsonFileStore::open(tmp.path())?);

    let log = MemoryEventLog::new();
    vehicle_moved(&log, "O37", 6.051, 3.123456, 1602858380);
    vehicle_moved(&log, "O38", 5.0, 3.123456, 1602858381);
    vehicle_moved(&log, "O37", 6.052, 3.123456, 1602858382);
    vehicle_moved(&log, "O38", 5.1, 3.133456, 1602858383);
    vehicle_moved(&log, "O38", 5.011, 3.16, 1602858385);
    log.append("IntegrationTest", "IntegrationTestEnded", serde_json::json!({}));

    let projector = Projector::builder("position-projector")
        .source(Arc::new(log))
        .store(store.clone())
        .handler(Arc::new(project_position))
        .config(ProjectorConfig {
            max_batch_size: 2,
            max_queue_time: Duration::from_secs(2),
            stop_on: Some(StopOn::new("IntegrationTest", "IntegrationTestEnded")),
            ..ProjectorConfig::default()
        })
        .build()?;

    let outcome = projector.run().await?;
    println!(
        "{} finished with {:?} at checkpoint {:?}",
        outcome.name, outcome.termination, outcome.checkpoint
    );

    for (vehicle, document) in store.collection("position")? {
        println!("{vehicle}: {document}");
    }
    println!("documents stored in {}", store.path().display());

    Ok(())
}
