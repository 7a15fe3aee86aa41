//! Crossing-sign detection debouncing.
//!
//! This module converts the noisy per-frame detection results of the
//! reference stream into discrete start/stop edges for the recording
//! session lifecycle, using frame-count hysteresis thresholds.

use crate::config::DetectionConfig;
use serde::{Deserialize, Serialize};

/// Class id of the crossing sign in the upstream detector's label table.
pub const CLASS_ID_ROAD_SIGN: i32 = 0;
/// Class id for persons.
pub const CLASS_ID_PERSON: i32 = 1;
/// Class id for two-wheelers.
pub const CLASS_ID_TWO_WHEELER: i32 = 2;
/// Class id for vehicles.
pub const CLASS_ID_VEHICLE: i32 = 3;

/// Index of the stream whose detections drive the debouncer. The other
/// streams are recorded but never analyzed.
pub const REFERENCE_STREAM_INDEX: usize = 0;

/// One detected object on a processed frame of the reference stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class id assigned by the upstream detector
    pub class_id: i32,

    /// Detection confidence in `0.0..=1.0`
    pub confidence: f64,
}

impl Detection {
    /// Create a detection sample.
    pub fn new(class_id: i32, confidence: f64) -> Self {
        Self {
            class_id,
            confidence,
        }
    }
}

/// Edge emitted by the debouncer when a hysteresis threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// The sign has been missing long enough, a crossing is underway.
    Start,
    /// The sign has been stably visible long enough, the crossing is over.
    Stop,
}

/// Hysteresis state machine over per-frame sign presence.
///
/// Exactly one of the two counters is non-zero at any time: a qualifying
/// sign detection resets the missing counter and vice versa. At most one
/// edge is emitted per observed frame.
#[derive(Debug)]
pub struct SignDebouncer {
    missing_frames: u32,
    stable_frames: u32,
    confidence_threshold: f64,
    missing_threshold: u32,
    stable_threshold: u32,
}

impl SignDebouncer {
    /// Create a debouncer with the configured thresholds.
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            missing_frames: 0,
            stable_frames: 0,
            confidence_threshold: config.confidence_threshold,
            missing_threshold: config.missing_frames_threshold,
            stable_threshold: config.stable_sign_threshold,
        }
    }

    /// Consume one frame's detections and return an edge if a threshold
    /// was crossed.
    ///
    /// `session_active` is the caller's view of whether a recording
    /// session is currently open: `Start` is only emitted while inactive
    /// and `Stop` only while active. The stable counter resets at its
    /// threshold either way so a stop edge needs a full run of stable
    /// frames.
    pub fn observe(&mut self, detections: &[Detection], session_active: bool) -> Option<Edge> {
        let is_sign = detections.iter().any(|d| {
            d.class_id == CLASS_ID_ROAD_SIGN && d.confidence >= self.confidence_threshold
        });

        if is_sign {
            self.missing_frames = 0;
            self.stable_frames += 1;

            if self.stable_frames >= self.stable_threshold {
                self.stable_frames = 0;
                if session_active {
                    return Some(Edge::Stop);
                }
            }
        } else {
            self.stable_frames = 0;
            self.missing_frames += 1;

            if self.missing_frames >= self.missing_threshold && !session_active {
                return Some(Edge::Start);
            }
        }

        None
    }

    /// Frames since the last qualifying sign detection.
    pub fn missing_frames(&self) -> u32 {
        self.missing_frames
    }

    /// Consecutive frames with a qualifying sign detection.
    pub fn stable_frames(&self) -> u32 {
        self.stable_frames
    }

    /// Zero both counters. Called after a session closes so the next
    /// crossing needs a full run of missing frames.
    pub fn reset(&mut self) {
        self.missing_frames = 0;
        self.stable_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_debouncer() -> SignDebouncer {
        SignDebouncer::new(&DetectionConfig::default())
    }

    fn sign(confidence: f64) -> Vec<Detection> {
        vec![Detection::new(CLASS_ID_ROAD_SIGN, confidence)]
    }

    fn no_sign() -> Vec<Detection> {
        vec![Detection::new(CLASS_ID_VEHICLE, 0.9)]
    }

    #[test]
    fn test_start_edge_at_missing_threshold() {
        let mut debouncer = test_debouncer();
        for _ in 0..59 {
            assert_eq!(debouncer.observe(&no_sign(), false), None);
        }
        assert_eq!(debouncer.observe(&no_sign(), false), Some(Edge::Start));
        assert_eq!(debouncer.missing_frames(), 60);
    }

    #[test]
    fn test_present_frame_resets_missing_run() {
        let mut debouncer = test_debouncer();
        for _ in 0..59 {
            debouncer.observe(&no_sign(), false);
        }
        // One qualifying sign frame restarts the missing run
        assert_eq!(debouncer.observe(&sign(0.5), false), None);
        assert_eq!(debouncer.missing_frames(), 0);

        for _ in 0..59 {
            assert_eq!(debouncer.observe(&no_sign(), false), None);
        }
        assert_eq!(debouncer.observe(&no_sign(), false), Some(Edge::Start));
    }

    #[test]
    fn test_no_start_while_session_active() {
        let mut debouncer = test_debouncer();
        for _ in 0..200 {
            assert_eq!(debouncer.observe(&no_sign(), true), None);
        }
    }

    #[test]
    fn test_stop_edge_at_stable_threshold() {
        let mut debouncer = test_debouncer();
        for _ in 0..179 {
            assert_eq!(debouncer.observe(&sign(0.5), true), None);
        }
        assert_eq!(debouncer.observe(&sign(0.5), true), Some(Edge::Stop));
        assert_eq!(debouncer.stable_frames(), 0);
    }

    #[test]
    fn test_stable_frames_while_idle_do_nothing() {
        let mut debouncer = test_debouncer();
        for _ in 0..180 {
            assert_eq!(debouncer.observe(&sign(0.5), false), None);
        }
        // Counter reset at the threshold, so another full run is needed
        assert_eq!(debouncer.stable_frames(), 0);
    }

    #[test]
    fn test_confidence_boundary() {
        let mut debouncer = test_debouncer();
        // Below threshold counts as missing
        debouncer.observe(&sign(0.19), false);
        assert_eq!(debouncer.missing_frames(), 1);
        assert_eq!(debouncer.stable_frames(), 0);

        // At threshold counts as present
        debouncer.observe(&sign(0.2), false);
        assert_eq!(debouncer.missing_frames(), 0);
        assert_eq!(debouncer.stable_frames(), 1);
    }

    #[test]
    fn test_other_classes_do_not_count_as_sign() {
        let mut debouncer = test_debouncer();
        let detections = vec![
            Detection::new(CLASS_ID_PERSON, 0.95),
            Detection::new(CLASS_ID_TWO_WHEELER, 0.95),
            Detection::new(CLASS_ID_VEHICLE, 0.95),
        ];
        debouncer.observe(&detections, false);
        assert_eq!(debouncer.missing_frames(), 1);
    }

    #[test]
    fn test_empty_frame_counts_as_missing() {
        let mut debouncer = test_debouncer();
        debouncer.observe(&[], false);
        assert_eq!(debouncer.missing_frames(), 1);
    }

    #[test]
    fn test_counters_never_both_nonzero() {
        let mut debouncer = test_debouncer();
        // Deterministic mixed sequence with runs of both kinds
        for i in 0u32..2000 {
            let frame = if (i / 7) % 3 == 0 { sign(0.5) } else { no_sign() };
            debouncer.observe(&frame, i % 5 == 0);
            assert!(
                debouncer.missing_frames() == 0 || debouncer.stable_frames() == 0,
                "both counters non-zero at frame {i}"
            );
        }
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut debouncer = test_debouncer();
        for _ in 0..30 {
            debouncer.observe(&no_sign(), false);
        }
        debouncer.reset();
        assert_eq!(debouncer.missing_frames(), 0);
        assert_eq!(debouncer.stable_frames(), 0);
    }
}
