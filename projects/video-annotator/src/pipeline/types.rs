use crate::error::{ErrorKind, PipelineError};
use crate::run_context::OutputDescriptor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Axis-aligned box in pixel coordinates of the frame it was computed on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

/// One predicted object instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: i32,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Source-level facts reported once when a reader is opened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub audio_channels: u32,
    pub frame_count: usize,
    pub fps: f64,
}

/// A decoded frame together with its position in the source.
pub struct TimedFrame<F> {
    pub index: usize,
    /// Microseconds, monotonic within one video.
    pub timestamp_us: i64,
    pub image: F,
}

/// The most recent detection set and the frame it was computed on.
///
/// Passed by value through the frame loop: every `interval`-th frame replaces
/// the set, every other frame reuses it unscaled.
#[derive(Debug, Clone)]
pub struct DetectionCache {
    interval: usize,
    detections: Vec<Detection>,
    computed_at: Option<usize>,
    passes: usize,
}

impl DetectionCache {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            detections: Vec::new(),
            computed_at: None,
            passes: 0,
        }
    }

    pub fn is_due(&self, frame_index: usize) -> bool {
        frame_index % self.interval == 0
    }

    /// Refreshes the set if `frame_index` is due, otherwise returns `self` unchanged.
    pub fn advance<F, D>(
        self,
        frame_index: usize,
        frame: &F,
        detector: &mut D,
    ) -> anyhow::Result<Self>
    where
        D: crate::pipeline::detection::Detector<F> + ?Sized,
    {
        if !self.is_due(frame_index) {
            return Ok(self);
        }

        let detections = detector.detect(frame)?;
        tracing::debug!(
            "Frame {}: {} detections above threshold",
            frame_index,
            detections.len()
        );

        Ok(Self {
            interval: self.interval,
            detections,
            computed_at: Some(frame_index),
            passes: self.passes + 1,
        })
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn computed_at(&self) -> Option<usize> {
        self.computed_at
    }

    pub fn passes(&self) -> usize {
        self.passes
    }
}

/// Counters collected by one pass of the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoopStats {
    pub frames_processed: usize,
    pub detection_passes: usize,
    pub last_timestamp_us: Option<i64>,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output: OutputDescriptor,
    pub source: SourceInfo,
    pub frames_processed: usize,
    pub detection_passes: usize,
    pub elapsed_ms: u64,
}

/// The single value delivered to the caller when a run ends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(RunSummary),
    Failed { kind: ErrorKind, message: String },
}

impl From<Result<RunSummary, PipelineError>> for RunOutcome {
    fn from(result: Result<RunSummary, PipelineError>) -> Self {
        match result {
            Ok(summary) => RunOutcome::Completed(summary),
            Err(e) => RunOutcome::Failed {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

/// Processing state shared between the worker thread and its observers
#[derive(Debug)]
pub struct ProcessingState {
    pub run_id: String,
    pub video_path: String,
    /// Loop bound, known once the source is open
    pub total_frames: AtomicUsize,
    pub frames_done: AtomicUsize,
    pub is_active: AtomicBool,
    outcome: RwLock<Option<RunOutcome>>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(run_id: String, video_path: String) -> Self {
        Self {
            run_id,
            video_path,
            total_frames: AtomicUsize::new(0),
            frames_done: AtomicUsize::new(0),
            is_active: AtomicBool::new(true),
            outcome: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    pub fn set_total(&self, total: usize) {
        self.total_frames.store(total, Ordering::Relaxed);
    }

    pub fn frame_done(&self) {
        self.frames_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome. Only the first call has an effect.
    pub fn finish(&self, outcome: RunOutcome) -> bool {
        let Ok(mut slot) = self.outcome.write() else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.is_active.store(false, Ordering::Relaxed);
        true
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.read().ok().and_then(|o| o.clone())
    }

    pub fn to_status_json(&self) -> serde_json::Value {
        let outcome = self.outcome();
        let status = match &outcome {
            None => "processing",
            Some(RunOutcome::Completed(_)) => "completed",
            Some(RunOutcome::Failed { .. }) => "failed",
        };

        serde_json::json!({
            "run_id": self.run_id,
            "video_path": self.video_path,
            "status": status,
            "frames_done": self.frames_done.load(Ordering::Relaxed),
            "total_frames": self.total_frames.load(Ordering::Relaxed),
            "elapsed_secs": self.start_time.elapsed().as_secs_f64(),
            "outcome": outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detection::Detector;

    struct CountingDetector {
        seen: Vec<usize>,
    }

    impl Detector<usize> for CountingDetector {
        fn detect(&mut self, frame: &usize) -> anyhow::Result<Vec<Detection>> {
            self.seen.push(*frame);
            Ok(vec![Detection {
                class_id: 15,
                confidence: 0.9,
                bbox: BBox {
                    left: *frame as f32,
                    top: 0.0,
                    right: *frame as f32 + 10.0,
                    bottom: 10.0,
                },
            }])
        }
    }

    #[test]
    fn test_cache_refreshes_every_third_frame() {
        let mut detector = CountingDetector { seen: Vec::new() };
        let mut cache = DetectionCache::new(3);
        let mut sources = Vec::new();

        for i in 0..9 {
            cache = cache.advance(i, &i, &mut detector).unwrap();
            sources.push(cache.computed_at());
        }

        assert_eq!(detector.seen, vec![0, 3, 6]);
        assert_eq!(
            sources,
            vec![
                Some(0),
                Some(0),
                Some(0),
                Some(3),
                Some(3),
                Some(3),
                Some(6),
                Some(6),
                Some(6)
            ]
        );
        assert_eq!(cache.passes(), 3);
        assert_eq!(cache.detections()[0].bbox.left, 6.0);
    }

    #[test]
    fn test_zero_interval_detects_every_frame() {
        let cache = DetectionCache::new(0);
        assert!(cache.is_due(0));
        assert!(cache.is_due(1));
        assert!(cache.is_due(7));
    }

    #[test]
    fn test_outcome_is_recorded_once() {
        let state = ProcessingState::new("run".to_string(), "in.mp4".to_string());
        assert!(state.is_active.load(Ordering::Relaxed));

        let first = RunOutcome::Failed {
            kind: ErrorKind::SourceUnreadable,
            message: "first".to_string(),
        };
        let second = RunOutcome::Failed {
            kind: ErrorKind::ModelLoad,
            message: "second".to_string(),
        };

        assert!(state.finish(first));
        assert!(!state.finish(second));
        assert!(!state.is_active.load(Ordering::Relaxed));

        match state.outcome() {
            Some(RunOutcome::Failed { message, .. }) => assert_eq!(message, "first"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(state.to_status_json()["status"], "failed");
    }

    #[test]
    fn test_failed_outcome_serializes_kind() {
        let outcome: RunOutcome = Err(PipelineError::sink_unwritable("disk full")).into();
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "sink_unwritable");
        assert_eq!(json["message"], "Sink unwritable: disk full");
    }
}
