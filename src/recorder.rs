//! Recording session lifecycle.
//!
//! The manager owns the one-session-at-a-time invariant: a start edge
//! opens recording on every stream, a stop edge (or the recording
//! ceiling) drains and finalizes them all. Per-stream failures never
//! block siblings; the manager always returns to idle.

use crate::config::{CrosswatchConfig, RecorderConfig};
use crate::enrichment::EnrichmentStore;
use crate::media::{DrainStatus, MediaPipeline};
use crate::session::{recording_path, SessionId};
use chrono::Local;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Where the manager is in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Recording,
    Finalizing,
}

/// Why a session is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The crossing sign has been stably visible again.
    SignStable,
    /// The recording ceiling was hit.
    Timeout,
    /// The process is shutting down.
    ShutdownRequested,
}

/// Result of a start request.
#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        session_id: SessionId,
        streams_attached: usize,
    },
    /// The enrichment feed has not armed the gate.
    GateDisabled,
    /// A session is already open.
    AlreadyActive,
    /// No stream could attach a recording sink.
    Failed,
}

/// Result of a stop request.
#[derive(Debug)]
pub enum StopOutcome {
    Stopped {
        session_id: SessionId,
        reason: StopReason,
        /// Final path per stream index; `None` where the stream failed
        /// to attach, drain or detach.
        stream_paths: Vec<Option<PathBuf>>,
    },
    NoActiveSession,
}

#[derive(Debug)]
struct StreamSlot {
    recording: bool,
    path: Option<PathBuf>,
    started_at: Option<Instant>,
}

#[derive(Debug)]
struct ManagerState {
    phase: SessionPhase,
    /// Minted ahead of time so paths can be named the moment recording
    /// starts; becomes the active session's id on start and is replaced
    /// after every stop.
    next_session_id: SessionId,
    streams: Vec<StreamSlot>,
}

/// Orchestrates the recording session lifecycle against the media layer.
pub struct RecordingManager {
    media: Arc<dyn MediaPipeline>,
    enrichment: Arc<EnrichmentStore>,
    recorder: RecorderConfig,
    state: Mutex<ManagerState>,
}

impl RecordingManager {
    pub fn new(
        config: &CrosswatchConfig,
        media: Arc<dyn MediaPipeline>,
        enrichment: Arc<EnrichmentStore>,
    ) -> Self {
        Self {
            media,
            enrichment,
            recorder: config.recorder.clone(),
            state: Mutex::new(ManagerState {
                phase: SessionPhase::Idle,
                next_session_id: SessionId::mint(),
                streams: Vec::new(),
            }),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    /// Id of the active session while recording, otherwise of the next one.
    pub fn session_id(&self) -> SessionId {
        self.state.lock().next_session_id.clone()
    }

    /// Open a recording session across all streams.
    ///
    /// Attach failures are best-effort: streams that fail sit the session
    /// out while their siblings record. The session opens if at least one
    /// stream attached.
    pub fn start(&self) -> StartOutcome {
        {
            let state = self.state.lock();
            if state.phase != SessionPhase::Idle {
                debug!("Start ignored, session already active");
                return StartOutcome::AlreadyActive;
            }
        }
        if !self.enrichment.gate_enabled() {
            info!("Recording start rejected, enrichment gate disabled");
            return StartOutcome::GateDisabled;
        }

        let session_id = self.state.lock().next_session_id.clone();
        info!(session_id = %session_id, "Starting recording session");

        let mut attached = 0usize;
        let mut slots = Vec::with_capacity(self.media.stream_count());
        for stream_index in 0..self.media.stream_count() {
            // Path is stamped with the sink-creation time, per stream
            let path = recording_path(&session_id, stream_index, Local::now());
            match self.media.attach_recording_sink(stream_index, &path) {
                Ok(()) => {
                    info!(stream = stream_index, path = %path.display(), "Recording sink attached");
                    attached += 1;
                    slots.push(StreamSlot {
                        recording: true,
                        path: Some(path),
                        started_at: Some(Instant::now()),
                    });
                }
                Err(error) => {
                    error!(stream = stream_index, error = %error, "Failed to attach recording sink");
                    slots.push(StreamSlot {
                        recording: false,
                        path: None,
                        started_at: None,
                    });
                }
            }
        }

        let mut state = self.state.lock();
        state.streams = slots;
        if attached > 0 {
            state.phase = SessionPhase::Recording;
            StartOutcome::Started {
                session_id,
                streams_attached: attached,
            }
        } else {
            error!(session_id = %session_id, "No stream could start recording, session not opened");
            StartOutcome::Failed
        }
    }

    /// Close the active session: drain and finalize every recording
    /// stream, then return the per-stream path map for publishing.
    ///
    /// Stopping while idle is a no-op. The manager is back in `Idle`
    /// with a freshly minted session id when this returns.
    pub async fn stop(&self, reason: StopReason) -> StopOutcome {
        let (session_id, slots) = {
            let mut state = self.state.lock();
            if state.phase != SessionPhase::Recording {
                debug!(?reason, "Stop ignored, no active session");
                return StopOutcome::NoActiveSession;
            }
            state.phase = SessionPhase::Finalizing;
            (
                state.next_session_id.clone(),
                std::mem::take(&mut state.streams),
            )
        };

        info!(session_id = %session_id, ?reason, "Stopping recording session");

        let mut stream_paths = Vec::with_capacity(slots.len());
        for (stream_index, slot) in slots.into_iter().enumerate() {
            if !slot.recording {
                stream_paths.push(None);
                continue;
            }
            stream_paths.push(self.finalize_stream(stream_index, slot).await);
        }

        {
            let mut state = self.state.lock();
            state.phase = SessionPhase::Idle;
            state.next_session_id = SessionId::mint();
            debug!(next_session_id = %state.next_session_id, "Ready for next session");
        }

        StopOutcome::Stopped {
            session_id,
            reason,
            stream_paths,
        }
    }

    /// Stop the whole session if any stream has recorded past the
    /// ceiling. Called from the timer task once per second.
    pub async fn check_timeout(&self) -> Option<StopOutcome> {
        let exceeded = {
            let state = self.state.lock();
            if state.phase != SessionPhase::Recording {
                return None;
            }
            let limit = self.recorder.max_recording();
            state
                .streams
                .iter()
                .any(|slot| slot.started_at.is_some_and(|t| t.elapsed() >= limit))
        };
        if !exceeded {
            return None;
        }

        warn!(
            limit_secs = self.recorder.max_recording_secs,
            "Recording ceiling exceeded, stopping session"
        );
        Some(self.stop(StopReason::Timeout).await)
    }

    /// Drain one stream's recording branch and detach it. Returns the
    /// confirmed path, or `None` if any step failed.
    async fn finalize_stream(&self, stream_index: usize, slot: StreamSlot) -> Option<PathBuf> {
        if let Err(error) = self.media.request_end_of_stream(stream_index) {
            error!(stream = stream_index, error = %error, "Failed to signal end-of-stream");
            if let Err(error) = self.media.detach_sink(stream_index) {
                error!(stream = stream_index, error = %error, "Failed to detach recording sink");
            }
            return None;
        }

        // The drain wait blocks, keep it off the async runtime
        let status = {
            let media = self.media.clone();
            let drain_timeout = self.recorder.drain_timeout();
            tokio::task::spawn_blocking(move || media.poll_drain_status(stream_index, drain_timeout))
                .await
                .unwrap_or(DrainStatus::Error)
        };

        match status {
            DrainStatus::Flushed => debug!(stream = stream_index, "Recording branch flushed"),
            DrainStatus::TimedOut => warn!(
                stream = stream_index,
                timeout = ?self.recorder.drain_timeout(),
                "Drain timed out, file may be incomplete"
            ),
            DrainStatus::Error => {
                error!(stream = stream_index, "Recording branch reported error while draining")
            }
        }

        let detach = self.media.detach_sink(stream_index);
        if let Err(error) = &detach {
            error!(stream = stream_index, error = %error, "Failed to detach recording sink");
        }

        if status == DrainStatus::Flushed && detach.is_ok() {
            if let Some(started_at) = slot.started_at {
                info!(
                    stream = stream_index,
                    duration_secs = started_at.elapsed().as_secs_f64(),
                    "Stream recording finalized"
                );
            }
            slot.path
        } else {
            None
        }
    }
}
