//! Enrichment feed state.
//!
//! Train metadata arrives asynchronously on the live-API topic and is
//! folded into a snapshot that rides along with every session
//! notification. The same feed arms the gate that allows recording to
//! start.

use std::sync::Arc;

use parking_lot::Mutex;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message as KafkaMessage};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;

/// Keys whose presence marks a payload as a live command feed.
const LIVENESS_MARKERS: [&str; 3] = ["enable", "command", "start"];

/// Payloads longer than this count as live even without a marker key.
const LIVENESS_MIN_LEN: usize = 10;

/// Most recent value of each enrichment field. Fields update
/// independently; a field stays `None` until the feed supplies it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentSnapshot {
    pub vehicle_id: Option<String>,
    pub scheduled_time: Option<String>,
    pub rake_no: Option<String>,
    pub vehicle_name: Option<String>,
    pub train_number: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    snapshot: EnrichmentSnapshot,
    gate_enabled: bool,
}

/// Shared enrichment state, written by the feed consumer task and read
/// by the session worker.
///
/// The gate starts disabled: until the enrichment feed proves live, no
/// recording session may begin.
#[derive(Debug, Default)]
pub struct EnrichmentStore {
    inner: Mutex<Inner>,
}

impl EnrichmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current snapshot. Taken under the lock, never held
    /// across I/O.
    pub fn snapshot(&self) -> EnrichmentSnapshot {
        self.inner.lock().snapshot.clone()
    }

    /// Whether the feed has armed the recording gate.
    pub fn gate_enabled(&self) -> bool {
        self.inner.lock().gate_enabled
    }

    /// Disarm the gate. Called by the session worker once a session has
    /// been stopped and its notification handled, so the next session
    /// needs a fresh sign of life from the feed.
    pub fn clear_gate(&self) {
        self.inner.lock().gate_enabled = false;
    }

    /// Fold one feed payload into the store.
    ///
    /// Known fields are extracted independently; a field absent from the
    /// payload keeps its previous value. Payloads that fail JSON parsing
    /// update no fields and can still arm the gate through the length
    /// fallback.
    pub fn apply_payload(&self, payload: &str) {
        let parsed: Result<Value, _> = serde_json::from_str(payload);
        let object = match &parsed {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) => {
                warn!("Enrichment payload is not a JSON object");
                None
            }
            Err(error) => {
                warn!(error = %error, "Enrichment payload is not valid JSON");
                None
            }
        };

        let marker_present = object
            .map(|map| LIVENESS_MARKERS.iter().any(|key| map.contains_key(*key)))
            .unwrap_or(false);
        let alive = marker_present || payload.len() > LIVENESS_MIN_LEN;

        let mut updated = 0usize;
        let mut armed = false;
        {
            let mut inner = self.inner.lock();
            if let Some(map) = object {
                updated += usize::from(update_field(map, "vehicleId", &mut inner.snapshot.vehicle_id));
                updated += usize::from(update_field(
                    map,
                    "gps_record_time",
                    &mut inner.snapshot.scheduled_time,
                ));
                updated += usize::from(update_field(map, "rake_no", &mut inner.snapshot.rake_no));
                updated += usize::from(update_field(
                    map,
                    "vehicle_name",
                    &mut inner.snapshot.vehicle_name,
                ));
                updated += usize::from(update_field(
                    map,
                    "challan_no",
                    &mut inner.snapshot.train_number,
                ));
            }
            if alive && !inner.gate_enabled {
                inner.gate_enabled = true;
                armed = true;
            }
        }

        if updated > 0 {
            debug!(fields = updated, "Enrichment snapshot updated");
        }
        if armed {
            info!("Recording gate enabled by enrichment feed");
        } else if !alive {
            warn!(
                payload_len = payload.len(),
                "Enrichment payload failed liveness check, gate unchanged"
            );
        }
    }
}

/// Replace `slot` when `key` holds a scalar value. Strings are taken
/// as-is, numbers and booleans are stringified, anything else is skipped.
fn update_field(
    map: &serde_json::Map<String, Value>,
    key: &str,
    slot: &mut Option<String>,
) -> bool {
    let Some(value) = map.get(key) else {
        return false;
    };
    match value {
        Value::String(text) => {
            *slot = Some(text.clone());
            true
        }
        Value::Number(number) => {
            *slot = Some(number.to_string());
            true
        }
        Value::Bool(flag) => {
            *slot = Some(flag.to_string());
            true
        }
        _ => {
            debug!(key, "Skipping non-scalar enrichment value");
            false
        }
    }
}

/// Errors raised while setting up the enrichment feed consumer.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to {topic}: {message}")]
    SubscriptionError { topic: String, message: String },
}

/// Kafka consumer feeding train metadata into the [`EnrichmentStore`].
pub struct EnrichmentFeed {
    consumer: StreamConsumer,
    topic: String,
    store: Arc<EnrichmentStore>,
}

impl EnrichmentFeed {
    pub fn new(config: &KafkaConfig, store: Arc<EnrichmentStore>) -> Result<Self, FeedError> {
        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| FeedError::CreationError(e.to_string()))?;

        Ok(Self {
            consumer,
            topic: config.liveapi_topic.clone(),
            store,
        })
    }

    pub fn subscribe(&self) -> Result<(), FeedError> {
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| FeedError::SubscriptionError {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;
        info!(topic = %self.topic, "Subscribed to enrichment feed");
        Ok(())
    }

    /// Consume until shutdown. Malformed payloads are logged and skipped;
    /// one bad message never stops the feed.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        use tokio_stream::StreamExt;

        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!(topic = %self.topic, "Enrichment feed started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Enrichment feed shutting down");
                    break;
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(message)) => self.handle_message(&message),
                        Some(Err(e)) => {
                            warn!(error = %e, "Enrichment feed receive error");
                        }
                        None => {
                            warn!("Enrichment feed stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_message(&self, message: &BorrowedMessage<'_>) {
        let payload = match message.payload() {
            Some(payload) => payload,
            None => {
                debug!("Enrichment message without payload");
                return;
            }
        };
        debug!(
            offset = message.offset(),
            bytes = payload.len(),
            "Enrichment message received"
        );
        let text = String::from_utf8_lossy(payload);
        self.store.apply_payload(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_starts_disabled() {
        let store = EnrichmentStore::new();
        assert!(!store.gate_enabled());
        assert_eq!(store.snapshot(), EnrichmentSnapshot::default());
    }

    #[test]
    fn test_fields_extracted_and_gate_armed() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"{"vehicleId":"V1","challan_no":"T42"}"#);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.vehicle_id.as_deref(), Some("V1"));
        assert_eq!(snapshot.train_number.as_deref(), Some("T42"));
        assert_eq!(snapshot.scheduled_time, None);
        assert_eq!(snapshot.rake_no, None);
        assert_eq!(snapshot.vehicle_name, None);
        assert!(store.gate_enabled());
    }

    #[test]
    fn test_partial_update_preserves_other_fields() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"{"vehicleId":"V1","vehicle_name":"express"}"#);
        store.apply_payload(r#"{"rake_no":"R9","unrelated":"x"}"#);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.vehicle_id.as_deref(), Some("V1"));
        assert_eq!(snapshot.vehicle_name.as_deref(), Some("express"));
        assert_eq!(snapshot.rake_no.as_deref(), Some("R9"));
    }

    #[test]
    fn test_numeric_values_stringified() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"{"rake_no":42,"gps_record_time":"2024-01-05 10:00"}"#);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.rake_no.as_deref(), Some("42"));
        assert_eq!(snapshot.scheduled_time.as_deref(), Some("2024-01-05 10:00"));
    }

    #[test]
    fn test_null_value_keeps_previous() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"{"vehicleId":"V1"}"#);
        store.apply_payload(r#"{"vehicleId":null,"rake_no":"R1"}"#);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.vehicle_id.as_deref(), Some("V1"));
        assert_eq!(snapshot.rake_no.as_deref(), Some("R1"));
    }

    #[test]
    fn test_marker_key_arms_gate_without_fields() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"{"start":1}"#);
        assert!(store.gate_enabled());
        assert_eq!(store.snapshot(), EnrichmentSnapshot::default());
    }

    #[test]
    fn test_unparsable_long_payload_arms_gate_via_length() {
        let store = EnrichmentStore::new();
        store.apply_payload("not json but clearly a live feed");
        assert!(store.gate_enabled());
        assert_eq!(store.snapshot(), EnrichmentSnapshot::default());
    }

    #[test]
    fn test_short_payload_leaves_gate_disarmed() {
        let store = EnrichmentStore::new();
        store.apply_payload("{}");
        assert!(!store.gate_enabled());

        store.apply_payload("hi");
        assert!(!store.gate_enabled());
    }

    #[test]
    fn test_non_object_json_updates_nothing() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"["vehicleId","V1"]"#);
        assert_eq!(store.snapshot(), EnrichmentSnapshot::default());
        // Long enough for the length fallback
        assert!(store.gate_enabled());
    }

    #[test]
    fn test_clear_gate() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"{"enable":true}"#);
        assert!(store.gate_enabled());

        store.clear_gate();
        assert!(!store.gate_enabled());

        // Snapshot survives the gate reset
        store.apply_payload(r#"{"vehicleId":"V2"}"#);
        assert!(store.gate_enabled());
        assert_eq!(store.snapshot().vehicle_id.as_deref(), Some("V2"));
    }

    #[test]
    fn test_arming_is_idempotent() {
        let store = EnrichmentStore::new();
        store.apply_payload(r#"{"enable":true}"#);
        store.apply_payload(r#"{"enable":true}"#);
        assert!(store.gate_enabled());
    }
}
