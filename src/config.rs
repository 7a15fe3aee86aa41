//! Configuration management for the crosswatch service.
//!
//! Configuration is loaded from layered files and environment variables
//! and validated before the service starts. The source list (one URI per
//! stream) lives in a separate line-oriented file so deployments can swap
//! cameras without touching the main config.

use config::{Config, ConfigError, Environment, File};
use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Main configuration for the crosswatch service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CrosswatchConfig {
    /// Detection debouncing thresholds
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Stream and recording layout
    #[serde(default)]
    pub media: MediaConfig,

    /// Session lifecycle limits
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Kafka broker and topics
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Notification delivery protocol
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Thresholds for the crossing-sign debouncer.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// Minimum confidence for a detection to count as the crossing sign
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Consecutive sign-free frames before a crossing starts
    #[serde(default = "default_missing_frames_threshold")]
    pub missing_frames_threshold: u32,

    /// Consecutive sign frames before a crossing ends
    #[serde(default = "default_stable_sign_threshold")]
    pub stable_sign_threshold: u32,
}

/// Camera streams and on-disk layout.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Path to the line-oriented source list (one `name=uri` per stream)
    #[serde(default = "default_sources_file")]
    pub sources_file: String,

    /// Number of camera streams the service records
    #[serde(default = "default_stream_count")]
    pub stream_count: usize,

    /// Stream names in index order, used as keys in notifications
    #[serde(default = "default_stream_names")]
    pub stream_names: Vec<String>,

    /// Directory all recording paths are relative to
    #[serde(default = "default_output_root")]
    pub output_root: String,
}

/// Recording session limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Hard ceiling on a single session's recording time in seconds
    #[serde(default = "default_max_recording_secs")]
    pub max_recording_secs: u64,

    /// How long to wait for one stream's flush confirmation in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Interval between recording-timeout checks in seconds
    #[serde(default = "default_timeout_check_interval_secs")]
    pub timeout_check_interval_secs: u64,
}

/// Kafka broker connection and topic names.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Consumer group for the enrichment feed
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Topic session notifications are published to
    #[serde(default = "default_meta_topic")]
    pub meta_topic: String,

    /// Topic the enrichment feed is consumed from
    #[serde(default = "default_liveapi_topic")]
    pub liveapi_topic: String,

    /// How long a publish may wait for broker acknowledgment, milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Offset reset for the enrichment consumer; the feed is live state,
    /// so replaying history would re-arm the gate from stale commands
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Additional librdkafka properties (SSL, SASL, tuning)
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

/// Notification delivery protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Device identity stamped on every notification
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Delivery attempts per notification
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,

    /// Delay between failed delivery attempts in milliseconds
    #[serde(default = "default_publish_retry_delay_ms")]
    pub publish_retry_delay_ms: u64,

    /// Reconnect attempts before a delivery attempt is abandoned
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_confidence_threshold() -> f64 {
    0.2
}
fn default_missing_frames_threshold() -> u32 {
    60
}
fn default_stable_sign_threshold() -> u32 {
    180
}
fn default_sources_file() -> String {
    "sources.ini".to_string()
}
fn default_stream_count() -> usize {
    3
}
fn default_stream_names() -> Vec<String> {
    vec!["left".to_string(), "top".to_string(), "right".to_string()]
}
fn default_output_root() -> String {
    "/opt/wdd-infer-debris/output_res".to_string()
}
fn default_max_recording_secs() -> u64 {
    600
}
fn default_drain_timeout_ms() -> u64 {
    5000
}
fn default_timeout_check_interval_secs() -> u64 {
    1
}
fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}
fn default_client_id() -> String {
    "crosswatch".to_string()
}
fn default_group_id() -> String {
    "crosswatch-enrichment".to_string()
}
fn default_meta_topic() -> String {
    "nr.wdd.meta".to_string()
}
fn default_liveapi_topic() -> String {
    "nr.wdd.liveapi".to_string()
}
fn default_ack_timeout_ms() -> u64 {
    10000
}
fn default_auto_offset_reset() -> String {
    "latest".to_string()
}
fn default_device_name() -> String {
    "train_crossing_detector".to_string()
}
fn default_publish_attempts() -> u32 {
    3
}
fn default_publish_retry_delay_ms() -> u64 {
    2000
}
fn default_connect_retries() -> u32 {
    3
}
fn default_connect_retry_interval_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            missing_frames_threshold: default_missing_frames_threshold(),
            stable_sign_threshold: default_stable_sign_threshold(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            sources_file: default_sources_file(),
            stream_count: default_stream_count(),
            stream_names: default_stream_names(),
            output_root: default_output_root(),
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_recording_secs: default_max_recording_secs(),
            drain_timeout_ms: default_drain_timeout_ms(),
            timeout_check_interval_secs: default_timeout_check_interval_secs(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            group_id: default_group_id(),
            meta_topic: default_meta_topic(),
            liveapi_topic: default_liveapi_topic(),
            ack_timeout_ms: default_ack_timeout_ms(),
            auto_offset_reset: default_auto_offset_reset(),
            extra_properties: HashMap::new(),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            publish_attempts: default_publish_attempts(),
            publish_retry_delay_ms: default_publish_retry_delay_ms(),
            connect_retries: default_connect_retries(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl CrosswatchConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with CROSSWATCH_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            // Start with default config
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific config
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Override with environment variables (e.g., CROSSWATCH_KAFKA__META_TOPIC)
            .add_source(
                Environment::with_prefix("CROSSWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("CROSSWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.confidence_threshold".to_string(),
                message: "Must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.detection.missing_frames_threshold == 0 || self.detection.stable_sign_threshold == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "detection.missing_frames_threshold/stable_sign_threshold".to_string(),
                message: "Thresholds must be greater than 0".to_string(),
            });
        }

        if self.media.stream_count == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "media.stream_count".to_string(),
                message: "At least one stream is required".to_string(),
            });
        }
        if self.media.sources_file.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "media.sources_file".to_string(),
            ));
        }
        if self.media.output_root.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "media.output_root".to_string(),
            ));
        }

        if self.recorder.max_recording_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recorder.max_recording_secs".to_string(),
                message: "Recording ceiling must be greater than 0".to_string(),
            });
        }

        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.bootstrap_servers".to_string(),
            ));
        }
        if self.kafka.group_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.group_id".to_string(),
            ));
        }
        if self.kafka.meta_topic.is_empty() || self.kafka.liveapi_topic.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "kafka.meta_topic/liveapi_topic".to_string(),
            ));
        }

        if self.notifier.publish_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "notifier.publish_attempts".to_string(),
                message: "At least one delivery attempt is required".to_string(),
            });
        }

        Ok(())
    }
}

impl RecorderConfig {
    /// Get the recording ceiling as Duration.
    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.max_recording_secs)
    }

    /// Get the per-stream drain timeout as Duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Get the timeout check interval as Duration.
    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_check_interval_secs)
    }
}

impl KafkaConfig {
    /// Build a base rdkafka ClientConfig from this configuration.
    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);

        // Extra properties
        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Build a producer ClientConfig.
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("message.timeout.ms", self.ack_timeout_ms.to_string());
        config.set("acks", "all");

        config
    }

    /// Build a consumer ClientConfig for the enrichment feed.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.group_id);
        config.set("auto.offset.reset", &self.auto_offset_reset);
        config.set("enable.auto.commit", "true");

        config
    }

    /// Get the acknowledgment timeout as Duration.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl NotifierConfig {
    /// Get the delay between failed delivery attempts as Duration.
    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    /// Get the delay between reconnect attempts as Duration.
    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }
}

/// Read the stream source list.
///
/// The file is line-oriented `name=uri`; blank lines, `#` comments and
/// `[section]` headers are skipped, as are lines without `=`. Values are
/// taken in file order. Fewer entries than `expected` is a startup error;
/// extras are dropped with a warning.
pub fn read_sources(path: &Path, expected: usize) -> Result<Vec<String>, ConfigValidationError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigValidationError::SourceFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let mut sources = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        let Some((_, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        sources.push(value.to_string());
    }

    if sources.len() < expected {
        return Err(ConfigValidationError::SourceCount {
            found: sources.len(),
            expected,
        });
    }
    if sources.len() > expected {
        warn!(
            found = sources.len(),
            expected, "Source list has extra entries, using the first ones"
        );
        sources.truncate(expected);
    }

    Ok(sources)
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Failed to read source list {path}: {message}")]
    SourceFile { path: String, message: String },

    #[error("Source list provides {found} streams, expected {expected}")]
    SourceCount { found: usize, expected: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn create_test_config() -> CrosswatchConfig {
        CrosswatchConfig::default()
    }

    fn write_temp_sources(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("crosswatch-sources-{}.ini", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = create_test_config();
        assert!(config.validate().is_ok());

        assert_eq!(config.detection.confidence_threshold, 0.2);
        assert_eq!(config.detection.missing_frames_threshold, 60);
        assert_eq!(config.detection.stable_sign_threshold, 180);
        assert_eq!(config.media.stream_count, 3);
        assert_eq!(config.media.stream_names, vec!["left", "top", "right"]);
        assert_eq!(config.recorder.max_recording_secs, 600);
        assert_eq!(config.kafka.meta_topic, "nr.wdd.meta");
        assert_eq!(config.kafka.liveapi_topic, "nr.wdd.liveapi");
        assert_eq!(config.notifier.device_name, "train_crossing_detector");
    }

    #[test]
    fn test_invalid_confidence_threshold() {
        let mut config = create_test_config();
        config.detection.confidence_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_streams_rejected() {
        let mut config = create_test_config();
        config.media.stream_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_bootstrap_servers() {
        let mut config = create_test_config();
        config.kafka.bootstrap_servers = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_zero_publish_attempts_rejected() {
        let mut config = create_test_config();
        config.notifier.publish_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_producer_config_build() {
        let config = KafkaConfig::default();
        let producer_config = config.build_producer_config();

        assert!(producer_config.get("bootstrap.servers").is_some());
        assert!(producer_config.get("message.timeout.ms").is_some());
    }

    #[test]
    fn test_consumer_config_build() {
        let mut config = KafkaConfig::default();
        config
            .extra_properties
            .insert("security.protocol".to_string(), "ssl".to_string());
        let consumer_config = config.build_consumer_config();

        assert!(consumer_config.get("group.id").is_some());
        assert_eq!(consumer_config.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_read_sources_in_order() {
        let path = write_temp_sources(
            "# camera list\n[streams]\nleft=rtsp://cam-left/stream\n\ntop=rtsp://cam-top/stream\nright=rtsp://cam-right/stream\n",
        );
        let sources = read_sources(&path, 3).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(
            sources,
            vec![
                "rtsp://cam-left/stream",
                "rtsp://cam-top/stream",
                "rtsp://cam-right/stream"
            ]
        );
    }

    #[test]
    fn test_read_sources_skips_malformed_lines() {
        let path = write_temp_sources("no equals sign\nleft=rtsp://a\nempty=\ntop=rtsp://b\nright=rtsp://c\n");
        let sources = read_sources(&path, 3).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(sources, vec!["rtsp://a", "rtsp://b", "rtsp://c"]);
    }

    #[test]
    fn test_read_sources_too_few() {
        let path = write_temp_sources("left=rtsp://a\n");
        let result = read_sources(&path, 3);
        let _ = std::fs::remove_file(&path);

        assert!(matches!(
            result,
            Err(ConfigValidationError::SourceCount {
                found: 1,
                expected: 3
            })
        ));
    }

    #[test]
    fn test_read_sources_truncates_extras() {
        let path = write_temp_sources("a=rtsp://a\nb=rtsp://b\nc=rtsp://c\nd=rtsp://d\n");
        let sources = read_sources(&path, 3).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(sources.len(), 3);
        assert_eq!(sources[2], "rtsp://c");
    }

    #[test]
    fn test_read_sources_missing_file() {
        let result = read_sources(Path::new("/nonexistent/sources.ini"), 3);
        assert!(matches!(
            result,
            Err(ConfigValidationError::SourceFile { .. })
        ));
    }
}
