//! Wiring between the frame path and the session lifecycle.
//!
//! Pad probes run on GStreamer streaming threads and must never block, so
//! the frame side only advances the debouncer and forwards edges over an
//! unbounded channel. A single worker task owns the session lifecycle end
//! to end: start, stop, drain, publish, gate reset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::DetectionConfig;
use crate::detector::{Detection, Edge, SignDebouncer};
use crate::enrichment::EnrichmentStore;
use crate::notifier::{SessionNotification, SessionPublisher};
use crate::pipeline::CrossingPipeline;
use crate::recorder::{RecordingManager, StartOutcome, StopOutcome, StopReason};

/// Commands handled by the session worker, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Stop(StopReason),
    CheckTimeout,
    Shutdown,
}

/// Frame-side entry point. Cheap to clone; every clone shares the
/// debouncer, the active flag and the command channel.
#[derive(Clone)]
pub struct Orchestrator {
    debouncer: Arc<Mutex<SignDebouncer>>,
    session_active: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl Orchestrator {
    pub fn new(config: &DetectionConfig) -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let orchestrator = Self {
            debouncer: Arc::new(Mutex::new(SignDebouncer::new(config))),
            session_active: Arc::new(AtomicBool::new(false)),
            commands,
        };
        (orchestrator, receiver)
    }

    /// Advance the debouncer with one reference-stream frame. Runs on the
    /// streaming thread; anything slow happens on the worker task instead.
    pub fn on_reference_frame(&self, detections: &[Detection]) {
        let session_active = self.session_active.load(Ordering::SeqCst);
        let edge = self.debouncer.lock().observe(detections, session_active);
        let command = match edge {
            Some(Edge::Start) => SessionCommand::Start,
            Some(Edge::Stop) => SessionCommand::Stop(StopReason::SignStable),
            None => return,
        };
        if self.commands.send(command).is_err() {
            warn!(?command, "Session worker gone, dropping edge");
        }
    }

    /// Ask the worker to stop any active session and exit.
    pub fn request_shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

/// Owns the session lifecycle. Commands are processed strictly in order,
/// so a stop edge can never overtake the start that preceded it.
pub struct SessionWorker {
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    manager: Arc<RecordingManager>,
    publisher: SessionPublisher,
    enrichment: Arc<EnrichmentStore>,
    session_active: Arc<AtomicBool>,
    debouncer: Arc<Mutex<SignDebouncer>>,
}

impl SessionWorker {
    pub fn new(
        orchestrator: &Orchestrator,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        manager: Arc<RecordingManager>,
        publisher: SessionPublisher,
        enrichment: Arc<EnrichmentStore>,
    ) -> Self {
        Self {
            commands,
            manager,
            publisher,
            enrichment,
            session_active: orchestrator.session_active.clone(),
            debouncer: orchestrator.debouncer.clone(),
        }
    }

    pub async fn run(mut self) {
        info!("Session worker started");
        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::Start => self.handle_start(),
                SessionCommand::Stop(reason) => {
                    let outcome = self.manager.stop(reason).await;
                    self.finish_session(outcome).await;
                }
                SessionCommand::CheckTimeout => {
                    if let Some(outcome) = self.manager.check_timeout().await {
                        self.finish_session(outcome).await;
                    }
                }
                SessionCommand::Shutdown => {
                    info!("Session worker shutting down");
                    let outcome = self.manager.stop(StopReason::ShutdownRequested).await;
                    self.finish_session(outcome).await;
                    break;
                }
            }
        }
        info!("Session worker stopped");
    }

    fn handle_start(&self) {
        match self.manager.start() {
            StartOutcome::Started {
                session_id,
                streams_attached,
            } => {
                self.session_active.store(true, Ordering::SeqCst);
                debug!(session_id = %session_id, streams = streams_attached, "Session marked active");
            }
            StartOutcome::GateDisabled | StartOutcome::AlreadyActive | StartOutcome::Failed => {}
        }
    }

    /// Publish the finished session, then release the gate and re-arm the
    /// detector for the next train.
    async fn finish_session(&self, outcome: StopOutcome) {
        let StopOutcome::Stopped {
            session_id,
            reason,
            stream_paths,
        } = outcome
        else {
            return;
        };
        debug!(session_id = %session_id, ?reason, "Publishing session notification");
        let notification = SessionNotification {
            session_id,
            completed_at: Utc::now(),
            stream_paths,
        };
        self.publisher.publish(&notification).await;

        self.enrichment.clear_gate();
        self.session_active.store(false, Ordering::SeqCst);
        self.debouncer.lock().reset();
    }
}

/// Periodically nudge the worker to enforce the recording ceiling.
pub fn spawn_timeout_timer(
    orchestrator: &Orchestrator,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let commands = orchestrator.commands.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if commands.send(SessionCommand::CheckTimeout).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Log per-stream throughput and session state at a fixed cadence.
pub fn spawn_stats_reporter(
    pipeline: Arc<CrossingPipeline>,
    manager: Arc<RecordingManager>,
    stream_names: Vec<String>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_reference_frames = 0u64;
        let mut last_tick = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let counts = pipeline.frame_counts();
                    let now = Instant::now();
                    let elapsed = now.duration_since(last_tick).as_secs_f64();
                    let reference_frames = counts.first().copied().unwrap_or(0);
                    let current_fps = if elapsed > 0.0 {
                        reference_frames.saturating_sub(last_reference_frames) as f64 / elapsed
                    } else {
                        0.0
                    };
                    last_reference_frames = reference_frames;
                    last_tick = now;

                    let frames: Vec<String> = counts
                        .iter()
                        .enumerate()
                        .map(|(index, count)| {
                            let name = stream_names.get(index).map(String::as_str).unwrap_or("stream");
                            format!("{name}={count}")
                        })
                        .collect();
                    info!(
                        phase = ?manager.phase(),
                        session_id = %manager.session_id(),
                        reference_fps = current_fps,
                        frames = %frames.join(" "),
                        "Stream stats"
                    );
                }
            }
        }
    })
}
