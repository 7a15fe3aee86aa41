//! GStreamer pipeline hosting the camera streams and their recording branches.
//!
//! Every stream is decoded once and fanned out through a `tee`: one branch
//! keeps the stream live through a `fakesink`, and recording branches are
//! spliced in and out at runtime. The upstream inference element attaches one
//! `VideoRegionOfInterestMeta` per detected object whose `detection` param
//! structure carries `class-id` and `confidence`; the reference stream's tee
//! probe hands those to the frame callback on the streaming thread.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer_video as gst_video;

use gst::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MediaConfig;
use crate::detector::{Detection, REFERENCE_STREAM_INDEX};
use crate::media::{DrainStatus, MediaError, MediaPipeline};

const BUS_POLL_INTERVAL_MS: u64 = 100;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STARTUP_TIMEOUT_SECS: u64 = 10;
const RECORDING_BITRATE_KBPS: u32 = 4000;
const RECORDING_KEYFRAME_INTERVAL: u32 = 30;
const DETECTION_PARAM: &str = "detection";

/// Static handles for one camera stream inside the pipeline.
struct StreamRuntime {
    tee: gst::Element,
    frames: Arc<AtomicU64>,
}

/// A recording branch currently spliced into a stream's tee.
struct ActiveRecording {
    bin: gst::Bin,
    tee_pad: gst::Pad,
    block_probe: Option<gst::PadProbeId>,
    eos_rx: Option<mpsc::Receiver<()>>,
    relative_path: PathBuf,
    full_path: PathBuf,
}

/// Multi-stream GStreamer pipeline with runtime-attachable recording branches.
pub struct CrossingPipeline {
    pipeline: gst::Pipeline,
    streams: Vec<StreamRuntime>,
    recordings: Vec<Mutex<Option<ActiveRecording>>>,
    error_flags: Vec<Arc<AtomicBool>>,
    output_root: PathBuf,
    running: Arc<AtomicBool>,
}

impl CrossingPipeline {
    /// Build the pipeline for the configured sources. `on_frame` is invoked
    /// once per reference-stream buffer with the detections attached to it;
    /// it runs on the streaming thread and must not block.
    pub fn new<F>(media: &MediaConfig, sources: &[String], on_frame: F) -> Result<Self, MediaError>
    where
        F: Fn(&[Detection]) + Send + Sync + 'static,
    {
        gst::init()?;

        if sources.is_empty() {
            return Err(MediaError::UnknownStream(REFERENCE_STREAM_INDEX));
        }

        let description = Self::build_pipeline_description(sources);
        debug!(pipeline = %description, "Creating media pipeline");

        let pipeline = gst::parse::launch(&description)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| MediaError::ElementNotFound("pipeline".to_string()))?;

        let mut streams = Vec::with_capacity(sources.len());
        let mut recordings = Vec::with_capacity(sources.len());
        let mut error_flags = Vec::with_capacity(sources.len());
        for index in 0..sources.len() {
            let tee = pipeline
                .by_name(&format!("tee{index}"))
                .ok_or_else(|| MediaError::ElementNotFound(format!("tee{index}")))?;
            streams.push(StreamRuntime {
                tee,
                frames: Arc::new(AtomicU64::new(0)),
            });
            recordings.push(Mutex::new(None));
            error_flags.push(Arc::new(AtomicBool::new(false)));
        }

        install_frame_probes(&streams, on_frame)?;

        Ok(Self {
            pipeline,
            streams,
            recordings,
            error_flags,
            output_root: PathBuf::from(&media.output_root),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    fn build_pipeline_description(sources: &[String]) -> String {
        let mut parts = Vec::with_capacity(sources.len());
        for (index, uri) in sources.iter().enumerate() {
            parts.push(format!(
                "uridecodebin uri={uri} name=src{index} ! queue name=decq{index} ! \
                 videoconvert name=conv{index} ! tee name=tee{index} \
                 tee{index}. ! queue name=liveq{index} ! fakesink name=live{index} sync=false async=false"
            ));
        }
        parts.join(" ")
    }

    /// Set the pipeline playing and wait for the transition to settle.
    pub fn start(&self) -> Result<(), MediaError> {
        info!(streams = self.streams.len(), "Starting media pipeline");
        self.running.store(true, Ordering::SeqCst);
        self.pipeline.set_state(gst::State::Playing)?;

        let (result, current, _pending) = self
            .pipeline
            .state(gst::ClockTime::from_seconds(STARTUP_TIMEOUT_SECS));
        match result {
            Ok(_) => {
                info!(state = ?current, "Media pipeline running");
                Ok(())
            }
            Err(e) => {
                error!("Media pipeline failed to reach playing state");
                let _ = self.pipeline.set_state(gst::State::Null);
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Watch the pipeline bus, flagging recording-branch failures and
    /// bouncing failed sources back to playing.
    pub fn spawn_bus_watch(&self) -> Result<tokio::task::JoinHandle<()>, MediaError> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| MediaError::ElementNotFound("bus".to_string()))?;
        let pipeline = self.pipeline.clone();
        let running = self.running.clone();
        let error_flags = self.error_flags.clone();

        Ok(tokio::spawn(async move {
            debug!("Bus watch started");
            while running.load(Ordering::SeqCst) {
                if let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL_INTERVAL_MS)) {
                    handle_bus_message(&pipeline, &error_flags, &message);
                }
                tokio::task::yield_now().await;
            }
            debug!("Bus watch stopped");
        }))
    }

    /// Frames observed so far on each stream's tee, in index order.
    pub fn frame_counts(&self) -> Vec<u64> {
        self.streams
            .iter()
            .map(|stream| stream.frames.load(Ordering::Relaxed))
            .collect()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.pipeline.set_state(gst::State::Null);
        info!("Media pipeline stopped");
    }

    fn splice_into_stream(&self, stream_index: usize, bin: &gst::Bin) -> Result<gst::Pad, MediaError> {
        let tee = &self.streams[stream_index].tee;
        let tee_pad = tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| MediaError::PadNotFound(format!("tee{stream_index}.src_%u")))?;
        let bin_sink = bin
            .static_pad("sink")
            .ok_or_else(|| MediaError::PadNotFound(format!("recbin{stream_index}.sink")))?;

        if let Err(e) = tee_pad.link(&bin_sink) {
            tee.release_request_pad(&tee_pad);
            return Err(e.into());
        }
        if let Err(e) = bin.sync_state_with_parent() {
            let _ = tee_pad.unlink(&bin_sink);
            tee.release_request_pad(&tee_pad);
            return Err(e.into());
        }
        Ok(tee_pad)
    }
}

impl MediaPipeline for CrossingPipeline {
    fn attach_recording_sink(&self, stream_index: usize, path: &Path) -> Result<(), MediaError> {
        let slot = self
            .recordings
            .get(stream_index)
            .ok_or(MediaError::UnknownStream(stream_index))?;
        if slot.lock().is_some() {
            return Err(MediaError::AlreadyRecording(stream_index));
        }

        let full_path = self.output_root.join(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MediaError::Directory(e.to_string()))?;
        }

        let (bin, eos_rx) = build_recording_bin(stream_index, &full_path)?;
        self.pipeline.add(&bin)?;

        match self.splice_into_stream(stream_index, &bin) {
            Ok(tee_pad) => {
                self.error_flags[stream_index].store(false, Ordering::SeqCst);
                info!(stream = stream_index, path = %full_path.display(), "Recording sink attached");
                *slot.lock() = Some(ActiveRecording {
                    bin,
                    tee_pad,
                    block_probe: None,
                    eos_rx: Some(eos_rx),
                    relative_path: path.to_path_buf(),
                    full_path,
                });
                Ok(())
            }
            Err(e) => {
                let _ = bin.set_state(gst::State::Null);
                let _ = self.pipeline.remove(&bin);
                Err(e)
            }
        }
    }

    fn request_end_of_stream(&self, stream_index: usize) -> Result<(), MediaError> {
        let slot = self
            .recordings
            .get(stream_index)
            .ok_or(MediaError::UnknownStream(stream_index))?;
        let mut guard = slot.lock();
        let recording = guard
            .as_mut()
            .ok_or(MediaError::NotRecording(stream_index))?;

        // Stop feeding the branch, then let the queued data flush behind EOS.
        recording.block_probe = recording
            .tee_pad
            .add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_, _| {
                gst::PadProbeReturn::Ok
            });

        let bin_sink = recording
            .bin
            .static_pad("sink")
            .ok_or_else(|| MediaError::PadNotFound(format!("recbin{stream_index}.sink")))?;
        if !bin_sink.send_event(gst::event::Eos::new()) {
            return Err(MediaError::EosRejected(stream_index));
        }
        debug!(stream = stream_index, "End-of-stream injected into recording branch");
        Ok(())
    }

    fn poll_drain_status(&self, stream_index: usize, timeout: Duration) -> DrainStatus {
        let slot = match self.recordings.get(stream_index) {
            Some(slot) => slot,
            None => return DrainStatus::Error,
        };
        let eos_rx = {
            let mut guard = slot.lock();
            match guard.as_mut().and_then(|recording| recording.eos_rx.take()) {
                Some(eos_rx) => eos_rx,
                None => return DrainStatus::Error,
            }
        };

        let error_flag = &self.error_flags[stream_index];
        let deadline = Instant::now() + timeout;
        loop {
            if error_flag.load(Ordering::SeqCst) {
                return DrainStatus::Error;
            }
            let now = Instant::now();
            if now >= deadline {
                return DrainStatus::TimedOut;
            }
            let slice = DRAIN_POLL_INTERVAL.min(deadline - now);
            match eos_rx.recv_timeout(slice) {
                Ok(()) => return DrainStatus::Flushed,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return DrainStatus::Error,
            }
        }
    }

    fn detach_sink(&self, stream_index: usize) -> Result<(), MediaError> {
        let slot = self
            .recordings
            .get(stream_index)
            .ok_or(MediaError::UnknownStream(stream_index))?;
        let recording = slot
            .lock()
            .take()
            .ok_or(MediaError::NotRecording(stream_index))?;

        if let Some(probe) = recording.block_probe {
            recording.tee_pad.remove_probe(probe);
        }
        if let Some(bin_sink) = recording.bin.static_pad("sink") {
            let _ = recording.tee_pad.unlink(&bin_sink);
        }
        self.streams[stream_index]
            .tee
            .release_request_pad(&recording.tee_pad);
        recording.bin.set_state(gst::State::Null)?;
        self.pipeline.remove(&recording.bin)?;

        let metadata = std::fs::metadata(&recording.full_path)
            .map_err(|_| MediaError::FileVerification(recording.relative_path.clone()))?;
        if metadata.len() == 0 {
            return Err(MediaError::FileVerification(recording.relative_path.clone()));
        }
        info!(
            stream = stream_index,
            path = %recording.relative_path.display(),
            size_bytes = metadata.len(),
            "Recording finalized"
        );
        Ok(())
    }

    fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

impl Drop for CrossingPipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn install_frame_probes<F>(streams: &[StreamRuntime], on_frame: F) -> Result<(), MediaError>
where
    F: Fn(&[Detection]) + Send + Sync + 'static,
{
    for (stream_index, stream) in streams.iter().enumerate() {
        if stream_index == REFERENCE_STREAM_INDEX {
            continue;
        }
        let frames = stream.frames.clone();
        let pad = tee_sink_pad(&stream.tee, stream_index)?;
        pad.add_probe(gst::PadProbeType::BUFFER, move |_, info| {
            if matches!(info.data, Some(gst::PadProbeData::Buffer(_))) {
                frames.fetch_add(1, Ordering::Relaxed);
            }
            gst::PadProbeReturn::Ok
        });
    }

    let reference = &streams[REFERENCE_STREAM_INDEX];
    let frames = reference.frames.clone();
    let pad = tee_sink_pad(&reference.tee, REFERENCE_STREAM_INDEX)?;
    pad.add_probe(gst::PadProbeType::BUFFER, move |_, info| {
        if let Some(gst::PadProbeData::Buffer(ref buffer)) = info.data {
            frames.fetch_add(1, Ordering::Relaxed);
            let detections = extract_detections(buffer);
            on_frame(&detections);
        }
        gst::PadProbeReturn::Ok
    });
    Ok(())
}

fn tee_sink_pad(tee: &gst::Element, stream_index: usize) -> Result<gst::Pad, MediaError> {
    tee.static_pad("sink")
        .ok_or_else(|| MediaError::PadNotFound(format!("tee{stream_index}.sink")))
}

fn build_recording_bin(
    stream_index: usize,
    location: &Path,
) -> Result<(gst::Bin, mpsc::Receiver<()>), MediaError> {
    let bin = gst::Bin::builder()
        .name(format!("recbin{stream_index}"))
        .build();

    let queue = gst::ElementFactory::make("queue")
        .name(format!("recq{stream_index}"))
        .build()?;
    let convert = gst::ElementFactory::make("videoconvert").build()?;
    let encoder = gst::ElementFactory::make("x264enc")
        .property_from_str("tune", "zerolatency")
        .property("bitrate", RECORDING_BITRATE_KBPS)
        .property("key-int-max", RECORDING_KEYFRAME_INTERVAL)
        .build()?;
    let parser = gst::ElementFactory::make("h264parse").build()?;
    let muxer = gst::ElementFactory::make("mp4mux")
        .property("faststart", true)
        .build()?;
    let sink = gst::ElementFactory::make("filesink")
        .name(format!("recsink{stream_index}"))
        .property("location", location.to_string_lossy().as_ref())
        .property("sync", false)
        .build()?;

    bin.add_many([&queue, &convert, &encoder, &parser, &muxer, &sink])?;
    gst::Element::link_many([&queue, &convert, &encoder, &parser, &muxer, &sink])?;

    let queue_sink = queue
        .static_pad("sink")
        .ok_or_else(|| MediaError::PadNotFound(format!("recq{stream_index}.sink")))?;
    let ghost = gst::GhostPad::builder_with_target(&queue_sink)?
        .name("sink")
        .build();
    bin.add_pad(&ghost)?;

    // The aggregated bus never reports EOS while the live branches keep
    // running, so flush confirmation comes from the file sink pad itself.
    let (eos_tx, eos_rx) = mpsc::channel();
    let eos_tx = Mutex::new(eos_tx);
    let sink_pad = sink
        .static_pad("sink")
        .ok_or_else(|| MediaError::PadNotFound(format!("recsink{stream_index}.sink")))?;
    sink_pad.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_, info| {
        if let Some(gst::PadProbeData::Event(ref event)) = info.data {
            if event.type_() == gst::EventType::Eos {
                let _ = eos_tx.lock().send(());
            }
        }
        gst::PadProbeReturn::Ok
    });

    Ok((bin, eos_rx))
}

fn extract_detections(buffer: &gst::Buffer) -> Vec<Detection> {
    let mut detections = Vec::new();
    for meta in buffer.iter_meta::<gst_video::VideoRegionOfInterestMeta>() {
        let params = match meta.param(DETECTION_PARAM) {
            Some(params) => params,
            None => continue,
        };
        let class_id = match param_class_id(params) {
            Some(class_id) => class_id,
            None => continue,
        };
        let confidence = param_confidence(params).unwrap_or(0.0);
        detections.push(Detection::new(class_id, confidence));
    }
    detections
}

fn param_class_id(params: &gst::StructureRef) -> Option<i32> {
    params.get::<i32>("class-id").ok().or_else(|| {
        params
            .get::<u32>("class-id")
            .ok()
            .and_then(|id| i32::try_from(id).ok())
    })
}

fn param_confidence(params: &gst::StructureRef) -> Option<f64> {
    params
        .get::<f64>("confidence")
        .ok()
        .or_else(|| params.get::<f32>("confidence").ok().map(f64::from))
}

fn handle_bus_message(pipeline: &gst::Pipeline, error_flags: &[Arc<AtomicBool>], message: &gst::Message) {
    use gst::MessageView;

    match message.view() {
        MessageView::Error(err) => {
            let source = message
                .src()
                .map(|s| s.name().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            if let Some(stream_index) = indexed_component(message.src(), "recbin") {
                if let Some(flag) = error_flags.get(stream_index) {
                    flag.store(true, Ordering::SeqCst);
                }
                error!(
                    stream = stream_index,
                    source = %source,
                    error = %err.error(),
                    "Recording branch error"
                );
            } else if let Some(stream_index) = indexed_component(message.src(), "src") {
                error!(
                    stream = stream_index,
                    source = %source,
                    error = %err.error(),
                    debug = ?err.debug(),
                    "Source error"
                );
                restart_source(pipeline, stream_index);
            } else {
                error!(source = %source, error = %err.error(), debug = ?err.debug(), "Pipeline error");
            }
        }
        MessageView::Eos(..) => {
            warn!("Unexpected end of stream on the pipeline bus");
        }
        MessageView::StateChanged(state) => {
            if message
                .src()
                .map(|src| src == pipeline.upcast_ref::<gst::Object>())
                .unwrap_or(false)
            {
                debug!(old = ?state.old(), current = ?state.current(), "Pipeline state changed");
            }
        }
        MessageView::Warning(warning) => {
            warn!(warning = %warning.error(), "Pipeline warning");
        }
        _ => {}
    }
}

/// Walk a message source's ancestry looking for `{prefix}{index}`.
fn indexed_component(source: Option<&gst::Object>, prefix: &str) -> Option<usize> {
    let mut current = source?.clone();
    loop {
        let name = current.name();
        if let Some(rest) = name.strip_prefix(prefix) {
            if let Ok(index) = rest.parse::<usize>() {
                return Some(index);
            }
        }
        current = current.parent()?;
    }
}

fn restart_source(pipeline: &gst::Pipeline, stream_index: usize) {
    let source = match pipeline.by_name(&format!("src{stream_index}")) {
        Some(source) => source,
        None => return,
    };
    warn!(stream = stream_index, "Restarting failed source");
    if source.set_state(gst::State::Null).is_err() {
        error!(stream = stream_index, "Failed to reset source");
        return;
    }
    if source.sync_state_with_parent().is_err() {
        error!(stream = stream_index, "Failed to resume source after reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sources() -> Vec<String> {
        vec![
            "rtsp://10.0.0.10:554/left".to_string(),
            "rtsp://10.0.0.11:554/top".to_string(),
            "rtsp://10.0.0.12:554/right".to_string(),
        ]
    }

    #[test]
    fn test_pipeline_description_contains_every_source() {
        let description = CrossingPipeline::build_pipeline_description(&sample_sources());

        assert!(description.contains("uridecodebin uri=rtsp://10.0.0.10:554/left name=src0"));
        assert!(description.contains("uridecodebin uri=rtsp://10.0.0.11:554/top name=src1"));
        assert!(description.contains("uridecodebin uri=rtsp://10.0.0.12:554/right name=src2"));
        assert_eq!(description.matches("uridecodebin").count(), 3);
    }

    #[test]
    fn test_pipeline_description_tees_each_stream_into_a_live_branch() {
        let description = CrossingPipeline::build_pipeline_description(&sample_sources());

        for index in 0..3 {
            assert!(description.contains(&format!("tee name=tee{index}")));
            assert!(description.contains(&format!("tee{index}. ! queue name=liveq{index}")));
            assert!(description.contains(&format!(
                "fakesink name=live{index} sync=false async=false"
            )));
        }
    }

    #[test]
    fn test_pipeline_description_for_a_single_file_source() {
        let description =
            CrossingPipeline::build_pipeline_description(&["file:///var/clips/loop.mp4".to_string()]);

        assert!(description.contains("uridecodebin uri=file:///var/clips/loop.mp4 name=src0"));
        assert!(!description.contains("tee1"));
    }
}
