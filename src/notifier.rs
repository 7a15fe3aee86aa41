//! Session-complete notification publishing.
//!
//! One notification is published per closed session. Delivery is
//! at-least-once with bounded retries; if every attempt fails the session
//! is still closed locally and the loss is surfaced in logs. This module
//! is the only place allowed to block on broker I/O, and it always runs
//! on the session worker, never on the frame path.

use crate::config::{CrosswatchConfig, KafkaConfig, NotifierConfig};
use crate::enrichment::{EnrichmentSnapshot, EnrichmentStore};
use crate::session::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

/// Status value stamped on every session notification.
const STATUS_RECORDING_STOPPED: &str = "recording_stopped";

/// Placeholder for enrichment fields and paths that never arrived.
const UNKNOWN: &str = "unknown";

/// How long a connect may spend probing the broker.
const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while delivering notifications.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Broker probe failed: {0}")]
    ProbeError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Transport timeout after {0:?}")]
    Timeout(Duration),

    #[error("Transport is not connected")]
    NotConnected,
}

/// Broker transport used by the publisher. The Kafka implementation is
/// below; tests substitute a scripted fake.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Whether the last known transport state is connected.
    fn is_connected(&self) -> bool;

    /// (Re)establish the broker connection.
    async fn connect(&self) -> Result<(), PublishError>;

    /// Send one message and wait for broker acknowledgment.
    async fn send(&self, topic: &str, key: &str, payload: &str) -> Result<(), PublishError>;
}

/// Kafka-backed notification transport.
///
/// `connect` creates a fresh producer and probes broker metadata to prove
/// reachability; a failed send marks the transport disconnected so the
/// next delivery attempt reconnects first.
pub struct KafkaTransport {
    config: KafkaConfig,
    producer: Mutex<Option<FutureProducer>>,
    connected: AtomicBool,
}

impl KafkaTransport {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            producer: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Flush any queued messages, used on shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let producer = self.producer.lock().clone();
        if let Some(producer) = producer {
            producer
                .flush(Timeout::After(timeout))
                .map_err(|_| PublishError::Timeout(timeout))?;
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationTransport for KafkaTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.producer.lock().is_some()
    }

    async fn connect(&self) -> Result<(), PublishError> {
        let kafka = self.config.clone();
        // Producer creation and the metadata probe both touch the network
        let producer = tokio::task::spawn_blocking(move || -> Result<FutureProducer, PublishError> {
            let producer: FutureProducer = kafka
                .build_producer_config()
                .create()
                .map_err(|e| PublishError::CreationError(e.to_string()))?;
            producer
                .client()
                .fetch_metadata(None, METADATA_PROBE_TIMEOUT)
                .map_err(|e| PublishError::ProbeError(e.to_string()))?;
            Ok(producer)
        })
        .await
        .map_err(|e| PublishError::CreationError(e.to_string()))??;

        *self.producer.lock() = Some(producer);
        self.connected.store(true, Ordering::SeqCst);
        info!(broker = %self.config.bootstrap_servers, "Notification transport connected");
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: &str) -> Result<(), PublishError> {
        let producer = self
            .producer
            .lock()
            .clone()
            .ok_or(PublishError::NotConnected)?;

        let record = FutureRecord::to(topic).key(key).payload(payload);
        match producer
            .send(record, Timeout::After(self.config.ack_timeout()))
            .await
        {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(PublishError::SendError {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Facts about one closed session, handed to the publisher.
#[derive(Debug, Clone)]
pub struct SessionNotification {
    pub session_id: SessionId,
    pub completed_at: DateTime<Utc>,
    /// Final path per stream index; `None` for streams that failed to
    /// finalize.
    pub stream_paths: Vec<Option<PathBuf>>,
}

/// Wire format of a session notification. Field order matters to nobody
/// but humans reading topic dumps, so it mirrors the reading order:
/// identity, time, then per-stream files.
#[derive(Debug, Serialize)]
struct NotificationMessage {
    device: String,
    status: String,
    train_uuid: String,
    timestamp: String,
    output_path: String,
    vehicle_id: String,
    scheduled_time: String,
    rake_no: String,
    vehicle_name: String,
    train_number: String,
    #[serde(flatten)]
    streams: serde_json::Map<String, serde_json::Value>,
}

/// Publishes session-complete notifications with bounded retries.
pub struct SessionPublisher {
    notifier: NotifierConfig,
    topic: String,
    ack_timeout: Duration,
    stream_names: Vec<String>,
    output_root: String,
    transport: Arc<dyn NotificationTransport>,
    enrichment: Arc<EnrichmentStore>,
}

impl SessionPublisher {
    pub fn new(
        config: &CrosswatchConfig,
        transport: Arc<dyn NotificationTransport>,
        enrichment: Arc<EnrichmentStore>,
    ) -> Self {
        Self {
            notifier: config.notifier.clone(),
            topic: config.kafka.meta_topic.clone(),
            ack_timeout: config.kafka.ack_timeout(),
            stream_names: config.media.stream_names.clone(),
            output_root: config.media.output_root.clone(),
            transport,
            enrichment,
        }
    }

    /// Deliver one notification. Returns whether the broker acknowledged
    /// it within the attempt budget.
    #[instrument(skip(self, notification), fields(session_id = %notification.session_id))]
    pub async fn publish(&self, notification: &SessionNotification) -> bool {
        let snapshot = self.enrichment.snapshot();
        let message = self.render_message(notification, &snapshot);
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(error) => {
                error!(error = %error, "Failed to serialize session notification");
                return false;
            }
        };

        info!(topic = %self.topic, bytes = payload.len(), "Publishing session notification");

        for attempt in 1..=self.notifier.publish_attempts {
            if !self.ensure_connected().await {
                warn!(attempt, "Transport unavailable, delivery attempt skipped");
            } else {
                let send = self
                    .transport
                    .send(&self.topic, notification.session_id.as_str(), &payload);
                match tokio::time::timeout(self.ack_timeout, send).await {
                    Ok(Ok(())) => {
                        info!(attempt, "Session notification delivered");
                        return true;
                    }
                    Ok(Err(error)) => {
                        warn!(attempt, error = %error, "Delivery attempt failed");
                    }
                    Err(_) => {
                        warn!(attempt, timeout = ?self.ack_timeout, "No acknowledgment within timeout");
                    }
                }
            }
            if attempt < self.notifier.publish_attempts {
                sleep(self.notifier.publish_retry_delay()).await;
            }
        }

        error!(
            attempts = self.notifier.publish_attempts,
            "Session notification not delivered, session closed unannounced"
        );
        false
    }

    async fn ensure_connected(&self) -> bool {
        if self.transport.is_connected() {
            return true;
        }
        for retry in 1..=self.notifier.connect_retries {
            info!(retry, "Reconnecting notification transport");
            match self.transport.connect().await {
                Ok(()) => return true,
                Err(error) => warn!(retry, error = %error, "Transport reconnect failed"),
            }
            if retry < self.notifier.connect_retries {
                sleep(self.notifier.connect_retry_interval()).await;
            }
        }
        false
    }

    fn render_message(
        &self,
        notification: &SessionNotification,
        snapshot: &EnrichmentSnapshot,
    ) -> NotificationMessage {
        let mut streams = serde_json::Map::new();
        for (index, path) in notification.stream_paths.iter().enumerate() {
            match self.stream_names.get(index) {
                Some(name) => {
                    let path_text = path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_else(|| UNKNOWN.to_string());
                    streams.insert(
                        name.clone(),
                        serde_json::json!({ "stream_id": index, "path": path_text }),
                    );
                }
                None => {
                    warn!(stream = index, "No configured name for stream, omitting from notification");
                }
            }
        }

        NotificationMessage {
            device: self.notifier.device_name.clone(),
            status: STATUS_RECORDING_STOPPED.to_string(),
            train_uuid: notification.session_id.to_string(),
            timestamp: notification
                .completed_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            output_path: self.output_root.clone(),
            vehicle_id: field_or_unknown(&snapshot.vehicle_id),
            scheduled_time: field_or_unknown(&snapshot.scheduled_time),
            rake_no: field_or_unknown(&snapshot.rake_no),
            vehicle_name: field_or_unknown(&snapshot.vehicle_name),
            train_number: field_or_unknown(&snapshot.train_number),
            streams,
        }
    }
}

fn field_or_unknown(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| UNKNOWN.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Scripted transport for publisher tests. Result queues are consumed
    /// per call; an empty queue means success.
    pub(crate) struct FakeTransport {
        connected: AtomicBool,
        connect_results: Mutex<VecDeque<Result<(), PublishError>>>,
        send_results: Mutex<VecDeque<Result<(), PublishError>>>,
        pub connects: AtomicUsize,
        pub sends: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeTransport {
        pub fn connected() -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(true),
                connect_results: Mutex::new(VecDeque::new()),
                send_results: Mutex::new(VecDeque::new()),
                connects: AtomicUsize::new(0),
                sends: Mutex::new(Vec::new()),
            })
        }

        pub fn disconnected() -> Arc<Self> {
            let transport = Self::connected();
            transport.connected.store(false, Ordering::SeqCst);
            transport
        }

        pub fn script_connect(&self, results: Vec<Result<(), PublishError>>) {
            *self.connect_results.lock() = results.into();
        }

        pub fn script_send(&self, results: Vec<Result<(), PublishError>>) {
            *self.send_results.lock() = results.into();
        }
    }

    #[async_trait]
    impl NotificationTransport for FakeTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn connect(&self) -> Result<(), PublishError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let result = self.connect_results.lock().pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.connected.store(true, Ordering::SeqCst);
            }
            result
        }

        async fn send(&self, topic: &str, key: &str, payload: &str) -> Result<(), PublishError> {
            self.sends
                .lock()
                .push((topic.to_string(), key.to_string(), payload.to_string()));
            let result = self.send_results.lock().pop_front().unwrap_or(Ok(()));
            if result.is_err() {
                self.connected.store(false, Ordering::SeqCst);
            }
            result
        }
    }
}
