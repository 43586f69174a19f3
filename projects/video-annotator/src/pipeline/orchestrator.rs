// Pipeline orchestrator: drives one video through read → detect → overlay → write
//
// Runs on a single worker thread per video, records the outcome in a shared
// ProcessingState and delivers it exactly once to whoever started the run.

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::pipeline::detection::{Detector, DetectorConfig, ModelAssets, SsdDetector};
use crate::pipeline::overlay::{BoxOverlay, OverlayRenderer};
pub use crate::pipeline::types::ProcessingState;
use crate::pipeline::types::{DetectionCache, LoopStats, RunOutcome, RunSummary, SourceInfo};
use crate::run_context::resolve_output;
use crate::video::ffmpeg_writer::{FfmpegWriter, SinkSettings};
use crate::video::{open_reader, Backend, VideoReader, VideoWriter};
use crossbeam::channel::{self, Receiver};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

// Global registry of processing runs, finished ones included
lazy_static::lazy_static! {
    static ref PROCESSING_REGISTRY: RwLock<HashMap<String, Arc<ProcessingState>>> =
        RwLock::new(HashMap::new());
}

/// Everything a run needs besides the input path.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub model_dir: PathBuf,
    pub output_root: PathBuf,
    pub backend: Backend,
    /// Detection runs on frames whose index is a multiple of this
    pub detection_interval: usize,
    pub frame_rate: f64,
    pub container: String,
    pub detector: DetectorConfig,
}

impl PipelineConfig {
    pub fn new(model_dir: PathBuf, output_root: PathBuf) -> Self {
        Self {
            model_dir,
            output_root,
            backend: Backend::Ffmpeg,
            detection_interval: 3,
            frame_rate: 30.0,
            container: "matroska".to_string(),
            detector: DetectorConfig::default(),
        }
    }
}

/// Runs the frame loop until the loop bound or the end of the source.
///
/// The bound is one less than the reported frame count, so the last frame of
/// the source is never read.
pub fn run_frames<R, D, O, W>(
    reader: &mut R,
    detector: &mut D,
    overlay: &O,
    writer: &mut W,
    detection_interval: usize,
    mut on_frame: impl FnMut(usize),
) -> PipelineResult<LoopStats>
where
    R: VideoReader + ?Sized,
    D: Detector<R::Frame> + ?Sized,
    O: OverlayRenderer<R::Frame> + ?Sized,
    W: VideoWriter<R::Frame> + ?Sized,
{
    let limit = loop_bound(&reader.info());
    let mut cache = DetectionCache::new(detection_interval);
    let mut stats = LoopStats {
        frames_processed: 0,
        detection_passes: 0,
        last_timestamp_us: None,
    };

    for i in 0..limit {
        let Some(mut frame) = reader
            .next_frame()
            .map_err(|e| PipelineError::stage(Stage::Read, i, e))?
        else {
            tracing::warn!(
                "Source ended after {} frames, {} were expected",
                i,
                limit
            );
            break;
        };

        cache = cache
            .advance(i, &frame.image, detector)
            .map_err(|e| PipelineError::stage(Stage::Detect, i, e))?;
        tracing::trace!(
            "Frame {} (source #{}) drawn with detections from frame {:?}",
            i,
            frame.index,
            cache.computed_at()
        );

        overlay
            .render(&mut frame.image, cache.detections())
            .map_err(|e| PipelineError::stage(Stage::Render, i, e))?;

        writer
            .write_frame(&frame.image, frame.timestamp_us)
            .map_err(|e| PipelineError::stage(Stage::Write, i, e))?;

        stats.frames_processed += 1;
        stats.last_timestamp_us = Some(frame.timestamp_us);
        on_frame(i);
    }

    stats.detection_passes = cache.passes();
    Ok(stats)
}

pub fn loop_bound(info: &SourceInfo) -> usize {
    info.frame_count.saturating_sub(1)
}

/// Opens the sink for an already open source, runs the loop, then closes the
/// sink and the source in that order. Handles still open on a failure path are
/// released when they drop.
pub fn annotate<R, D, O, W, S>(
    mut reader: R,
    detector: &mut D,
    overlay: &O,
    open_sink: S,
    detection_interval: usize,
    on_frame: impl FnMut(usize),
) -> PipelineResult<LoopStats>
where
    R: VideoReader,
    D: Detector<R::Frame> + ?Sized,
    O: OverlayRenderer<R::Frame> + ?Sized,
    W: VideoWriter<R::Frame>,
    S: FnOnce(&SourceInfo) -> PipelineResult<W>,
{
    let info = reader.info();
    let mut writer = open_sink(&info)?;

    let stats = run_frames(
        &mut reader,
        detector,
        overlay,
        &mut writer,
        detection_interval,
        on_frame,
    )?;

    writer
        .close()
        .map_err(|e| PipelineError::stage(Stage::Close, stats.frames_processed, e))?;
    drop(writer);
    drop(reader);

    Ok(stats)
}

/// Annotates one video end to end with the MobileNet-SSD model and an FFmpeg sink.
pub fn process_video(
    video_path: &Path,
    config: &PipelineConfig,
    state: &ProcessingState,
) -> PipelineResult<RunSummary> {
    let started = Instant::now();

    let assets = ModelAssets::locate(&config.model_dir)?;
    let mut detector = SsdDetector::load(&assets, config.detector.clone())?;

    let output = resolve_output(&config.output_root)?;

    let reader = open_reader(video_path, config.backend)?;
    let source = reader.info();
    state.set_total(loop_bound(&source));

    let overlay = BoxOverlay::default();
    let stats = annotate(
        reader,
        &mut detector,
        &overlay,
        |info| {
            let settings = SinkSettings {
                width: info.width,
                height: info.height,
                audio_channels: info.audio_channels,
                frame_rate: config.frame_rate,
                container: config.container.clone(),
            };
            FfmpegWriter::create(&output.path, &settings).map_err(PipelineError::sink_unwritable)
        },
        config.detection_interval,
        |_| state.frame_done(),
    )?;

    if let Err(e) = output.write_sidecar() {
        tracing::warn!(
            "Failed to write descriptor for {}: {:#}",
            output.path.display(),
            e
        );
    }

    tracing::info!(
        "Annotated {} -> {} ({} frames, {} detection passes)",
        video_path.display(),
        output.path.display(),
        stats.frames_processed,
        stats.detection_passes
    );

    Ok(RunSummary {
        output,
        source,
        frames_processed: stats.frames_processed,
        detection_passes: stats.detection_passes,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

/// Handle on a run executing on its worker thread.
pub struct RunHandle {
    pub state: Arc<ProcessingState>,
    outcome_rx: Receiver<RunOutcome>,
}

impl RunHandle {
    /// Blocks until the run ends.
    pub fn wait(self) -> RunOutcome {
        self.outcome_rx.recv().unwrap_or_else(|_| lost_worker())
    }

    /// Waits up to `timeout`; `None` while the run is still going.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RunOutcome> {
        match self.outcome_rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(channel::RecvTimeoutError::Timeout) => None,
            Err(channel::RecvTimeoutError::Disconnected) => Some(lost_worker()),
        }
    }
}

fn lost_worker() -> RunOutcome {
    RunOutcome::from(Err(PipelineError::Internal(
        "worker exited without an outcome".to_string(),
    )))
}

/// Starts `process_video` on a dedicated worker thread.
pub fn spawn_run(run_id: String, video_path: PathBuf, config: PipelineConfig) -> RunHandle {
    let state = Arc::new(ProcessingState::new(
        run_id,
        video_path.to_string_lossy().to_string(),
    ));
    spawn_with_state(state, video_path, config)
}

fn spawn_with_state(
    state: Arc<ProcessingState>,
    video_path: PathBuf,
    config: PipelineConfig,
) -> RunHandle {
    let (tx, rx) = channel::bounded(1);
    let worker_state = state.clone();

    thread::spawn(move || {
        tracing::info!("Worker started for run {}", worker_state.run_id);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            process_video(&video_path, &config, &worker_state)
        }))
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            Err(PipelineError::Internal(message))
        });

        if let Err(e) = &result {
            tracing::error!("Run {} failed: {}", worker_state.run_id, e);
        }

        let outcome = RunOutcome::from(result);
        worker_state.finish(outcome.clone());
        let _ = tx.send(outcome);
    });

    RunHandle {
        state,
        outcome_rx: rx,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Run {0} is already being processed")]
    Busy(String),
    #[error("Registry lock poisoned")]
    Poisoned,
}

pub fn get_processing_state(run_id: &str) -> Option<Arc<ProcessingState>> {
    PROCESSING_REGISTRY.read().ok()?.get(run_id).cloned()
}

/// Registers and starts a run. Only one run may be active at a time.
pub fn start_processing(
    video_path: PathBuf,
    config: PipelineConfig,
) -> Result<Arc<ProcessingState>, StartError> {
    let stem = video_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let run_id = format!("{}-{}", stem, chrono::Utc::now().timestamp_millis());
    let state = Arc::new(ProcessingState::new(
        run_id.clone(),
        video_path.to_string_lossy().to_string(),
    ));

    {
        let mut registry = PROCESSING_REGISTRY
            .write()
            .map_err(|_| StartError::Poisoned)?;
        if let Some(active) = registry
            .values()
            .find(|s| s.is_active.load(Ordering::Relaxed))
        {
            return Err(StartError::Busy(active.run_id.clone()));
        }
        tracing::info!("Registering run {}", run_id);
        registry.insert(run_id, state.clone());
    }

    // The registry keeps the state; the outcome is observed through it.
    let _handle = spawn_with_state(state.clone(), video_path, config);
    Ok(state)
}

#[cfg(test)]
fn unregister_run(run_id: &str) {
    if let Ok(mut registry) = PROCESSING_REGISTRY.write() {
        registry.remove(run_id);
    }
}
