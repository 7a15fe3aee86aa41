//! Media-layer boundary consumed by the recording session manager.
//!
//! The session lifecycle only ever talks to this trait; the GStreamer
//! implementation lives in the pipeline module and tests substitute a
//! scripted fake.

use gstreamer as gst;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the media layer.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Unknown stream index {0}")]
    UnknownStream(usize),

    #[error("Stream {0} already has a recording bin attached")]
    AlreadyRecording(usize),

    #[error("Stream {0} has no recording bin attached")]
    NotRecording(usize),

    #[error("GStreamer error: {0}")]
    Glib(#[from] gst::glib::Error),

    #[error("GStreamer element operation failed: {0}")]
    Element(#[from] gst::glib::BoolError),

    #[error("Pipeline state change failed: {0}")]
    StateChange(#[from] gst::StateChangeError),

    #[error("Pad link failed: {0:?}")]
    PadLink(#[from] gst::PadLinkError),

    #[error("Pipeline element not found: {0}")]
    ElementNotFound(String),

    #[error("Pad not found: {0}")]
    PadNotFound(String),

    #[error("Stream {0} rejected the end-of-stream event")]
    EosRejected(usize),

    #[error("Failed to prepare recording directory: {0}")]
    Directory(String),

    #[error("Recording file missing or empty at {}", .0.display())]
    FileVerification(PathBuf),
}

/// Outcome of waiting for one stream's recording branch to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// End-of-stream reached the file sink, the container is finalized.
    Flushed,

    /// The branch reported an error while draining.
    Error,

    /// No flush confirmation arrived within the timeout.
    TimedOut,
}

/// Per-stream recording control exposed by the media pipeline.
///
/// Stream indices are stable `0..stream_count()`. All methods are safe to
/// call from a blocking worker context; `poll_drain_status` is the only
/// one that waits.
pub trait MediaPipeline: Send + Sync {
    /// Create a recording branch for `stream_index` writing to `path`
    /// (relative to the configured output root) and splice it into the
    /// live stream.
    fn attach_recording_sink(&self, stream_index: usize, path: &Path) -> Result<(), MediaError>;

    /// Inject end-of-stream into the stream's recording branch so the
    /// container can be finalized.
    fn request_end_of_stream(&self, stream_index: usize) -> Result<(), MediaError>;

    /// Block up to `timeout` waiting for the branch's flush confirmation.
    fn poll_drain_status(&self, stream_index: usize, timeout: Duration) -> DrainStatus;

    /// Unlink and dispose of the stream's recording branch, then verify
    /// the file landed on disk non-empty.
    fn detach_sink(&self, stream_index: usize) -> Result<(), MediaError>;

    /// Number of configured streams.
    fn stream_count(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted media layer for session-manager tests. Result queues are
    /// consumed call by call in stream-index order; an empty queue means
    /// success.
    pub(crate) struct FakeMedia {
        streams: usize,
        pub attach_results: Mutex<VecDeque<Result<(), MediaError>>>,
        pub drain_results: Mutex<VecDeque<DrainStatus>>,
        pub detach_results: Mutex<VecDeque<Result<(), MediaError>>>,
        pub attached: Mutex<Vec<(usize, PathBuf)>>,
        pub eos_requested: Mutex<Vec<usize>>,
        pub drain_polls: Mutex<Vec<(usize, Duration)>>,
        pub detached: Mutex<Vec<usize>>,
    }

    impl FakeMedia {
        pub fn new(streams: usize) -> Self {
            Self {
                streams,
                attach_results: Mutex::new(VecDeque::new()),
                drain_results: Mutex::new(VecDeque::new()),
                detach_results: Mutex::new(VecDeque::new()),
                attached: Mutex::new(Vec::new()),
                eos_requested: Mutex::new(Vec::new()),
                drain_polls: Mutex::new(Vec::new()),
                detached: Mutex::new(Vec::new()),
            }
        }

        pub fn script_attach(&self, results: Vec<Result<(), MediaError>>) {
            *self.attach_results.lock() = results.into();
        }

        pub fn script_drain(&self, results: Vec<DrainStatus>) {
            *self.drain_results.lock() = results.into();
        }

        pub fn script_detach(&self, results: Vec<Result<(), MediaError>>) {
            *self.detach_results.lock() = results.into();
        }
    }

    impl MediaPipeline for FakeMedia {
        fn attach_recording_sink(&self, stream_index: usize, path: &Path) -> Result<(), MediaError> {
            let result = self.attach_results.lock().pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.attached.lock().push((stream_index, path.to_path_buf()));
            }
            result
        }

        fn request_end_of_stream(&self, stream_index: usize) -> Result<(), MediaError> {
            self.eos_requested.lock().push(stream_index);
            Ok(())
        }

        fn poll_drain_status(&self, stream_index: usize, timeout: Duration) -> DrainStatus {
            self.drain_polls.lock().push((stream_index, timeout));
            self.drain_results
                .lock()
                .pop_front()
                .unwrap_or(DrainStatus::Flushed)
        }

        fn detach_sink(&self, stream_index: usize) -> Result<(), MediaError> {
            self.detached.lock().push(stream_index);
            self.detach_results.lock().pop_front().unwrap_or(Ok(()))
        }

        fn stream_count(&self) -> usize {
            self.streams
        }
    }
}
