//! Crosswatch
//!
//! Crossing-triggered recording service for railway wagon inspection
//! gantries. The reference camera watches a crossing sign; when a train
//! obscures it the service records every camera until the sign comes back
//! or a hard ceiling is hit, then publishes a notification enriched with
//! train metadata consumed from a live feed.
//!
//! ## Architecture
//!
//! ```text
//! Cameras                      Session worker              Kafka
//! ┌──────────────┐            ┌──────────────┐        ┌──────────────┐
//! │ Crossing     │  edges     │ Recording    │        │ nr.wdd.meta  │
//! │ Pipeline     │───────────▶│ Manager      │───────▶│ (publisher)  │
//! │  tee probes  │            │ start/stop/  │        └──────────────┘
//! └──────────────┘            │ drain        │        ┌──────────────┐
//!        │                    └──────────────┘        │ nr.wdd.      │
//!        │ frames                     ▲               │ liveapi      │
//!        ▼                            │ gate          │ (feed)       │
//! ┌──────────────┐            ┌──────────────┐        └──────────────┘
//! │ Sign         │            │ Enrichment   │               │
//! │ Debouncer    │            │ Store        │◀──────────────┘
//! └──────────────┘            └──────────────┘
//! ```

pub mod config;
pub mod detector;
pub mod enrichment;
pub mod media;
pub mod notifier;
pub mod orchestrator;
pub mod pipeline;
pub mod recorder;
pub mod session;

pub use config::{ConfigValidationError, CrosswatchConfig};
pub use detector::{Detection, Edge, SignDebouncer};
pub use enrichment::{EnrichmentFeed, EnrichmentSnapshot, EnrichmentStore, FeedError};
pub use media::{DrainStatus, MediaError, MediaPipeline};
pub use notifier::{
    KafkaTransport, NotificationTransport, PublishError, SessionNotification, SessionPublisher,
};
pub use orchestrator::{Orchestrator, SessionCommand, SessionWorker};
pub use pipeline::CrossingPipeline;
pub use recorder::{RecordingManager, SessionPhase, StartOutcome, StopOutcome, StopReason};
pub use session::SessionId;
