use crate::error::PipelineError;
use opencv::core::Mat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// Number of keypoints in one pose.
pub const KEYPOINT_COUNT: usize = 17;

/// Semantic keypoint ordering shared by every detector backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeypointKind {
    Nose = 0,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl KeypointKind {
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Anatomical edges drawn as limb lines.
pub const SKELETON_EDGES: [(KeypointKind, KeypointKind); 12] = [
    (KeypointKind::LeftShoulder, KeypointKind::RightShoulder),
    (KeypointKind::LeftShoulder, KeypointKind::LeftElbow),
    (KeypointKind::RightShoulder, KeypointKind::RightElbow),
    (KeypointKind::LeftElbow, KeypointKind::LeftWrist),
    (KeypointKind::RightElbow, KeypointKind::RightWrist),
    (KeypointKind::LeftShoulder, KeypointKind::LeftHip),
    (KeypointKind::RightShoulder, KeypointKind::RightHip),
    (KeypointKind::LeftHip, KeypointKind::RightHip),
    (KeypointKind::LeftHip, KeypointKind::LeftKnee),
    (KeypointKind::RightHip, KeypointKind::RightKnee),
    (KeypointKind::LeftKnee, KeypointKind::LeftAnkle),
    (KeypointKind::RightKnee, KeypointKind::RightAnkle),
];

/// Head keypoints and limb joints that get a filled disk.
/// Shoulders and hips are covered by the torso and edges.
pub const CIRCLED_JOINTS: [KeypointKind; 13] = [
    KeypointKind::Nose,
    KeypointKind::LeftEye,
    KeypointKind::RightEye,
    KeypointKind::LeftEar,
    KeypointKind::RightEar,
    KeypointKind::LeftElbow,
    KeypointKind::RightElbow,
    KeypointKind::LeftWrist,
    KeypointKind::RightWrist,
    KeypointKind::LeftKnee,
    KeypointKind::RightKnee,
    KeypointKind::LeftAnkle,
    KeypointKind::RightAnkle,
];

/// A keypoint position with its confidence.
///
/// Detectors emit `y`/`x` normalized to their square input; after coordinate
/// mapping they are pixel positions in the processed frame.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Keypoint {
    pub y: f32,
    pub x: f32,
    pub score: f32,
}

impl Keypoint {
    pub fn new(y: f32, x: f32, score: f32) -> Self {
        Self { y, x, score }
    }

    /// Strictly above the threshold; equal values are rejected.
    pub fn is_confident(&self, threshold: f32) -> bool {
        self.score > threshold
    }
}

/// One detected person in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonPose {
    pub keypoints: [Keypoint; KEYPOINT_COUNT],
    /// Whole-person score, when the model reports one.
    pub score: Option<f32>,
}

impl PersonPose {
    pub fn new(keypoints: [Keypoint; KEYPOINT_COUNT], score: Option<f32>) -> Self {
        Self { keypoints, score }
    }

    pub fn get(&self, kind: KeypointKind) -> &Keypoint {
        &self.keypoints[kind.index()]
    }

    pub fn max_keypoint_score(&self) -> f32 {
        self.keypoints
            .iter()
            .map(|k| k.score)
            .fold(f32::MIN, f32::max)
    }

    /// Person-level gate: the model's person score if present, otherwise the
    /// best keypoint score.
    pub fn is_confident(&self, threshold: f32) -> bool {
        self.score.unwrap_or_else(|| self.max_keypoint_score()) > threshold
    }
}

/// How masked-out pixels are rendered in the color channels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Background {
    /// Color scaled by alpha; masked-out pixels become black.
    Black,
    /// Color blended toward white with the complementary weight.
    White,
}

/// User-facing processing options, before validation against a source.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub confidence_threshold: f32,
    pub radius: i32,
    pub dilation_iterations: i32,
    pub blur_kernel_size: i32,
    pub processing_width: Option<i32>,
    pub workers: Option<usize>,
    pub background: Background,
    pub show_progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            radius: 30,
            dilation_iterations: 10,
            blur_kernel_size: 21,
            processing_width: None,
            workers: None,
            background: Background::White,
            show_progress: true,
        }
    }
}

impl PipelineOptions {
    /// Worker count: explicit override, else available parallelism minus one.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1),
        }
    }

    /// Validate the options and freeze them into the parameters shared by all
    /// workers for one run over a `width`×`height` source.
    pub fn resolve(&self, width: i32, height: i32) -> Result<ProcessingParams, PipelineError> {
        let threshold = self.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::Config(format!(
                "confidence threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.radius < 1 {
            return Err(PipelineError::Config(format!(
                "radius must be at least 1 pixel, got {}",
                self.radius
            )));
        }
        if self.dilation_iterations < 0 {
            return Err(PipelineError::Config(format!(
                "dilation iterations cannot be negative, got {}",
                self.dilation_iterations
            )));
        }
        if self.blur_kernel_size < 0 {
            return Err(PipelineError::Config(format!(
                "blur kernel size cannot be negative, got {}",
                self.blur_kernel_size
            )));
        }
        if let Some(pw) = self.processing_width {
            if pw < 1 {
                return Err(PipelineError::Config(format!(
                    "processing width must be positive, got {pw}"
                )));
            }
        }
        if self.workers == Some(0) {
            return Err(PipelineError::Config(
                "worker count must be at least 1".to_string(),
            ));
        }
        if width < 1 || height < 1 {
            return Err(PipelineError::Config(format!(
                "source dimensions {width}x{height} are not usable"
            )));
        }

        let (target_width, target_height) =
            target_dimensions(width, height, self.processing_width);
        let joint_radius = scaled_joint_radius(self.radius);

        Ok(ProcessingParams {
            confidence_threshold: threshold,
            joint_radius,
            line_thickness: joint_radius,
            dilation_iterations: self.dilation_iterations,
            blur_kernel_size: odd_kernel_size(self.blur_kernel_size),
            target_width,
            target_height,
            original_width: width,
            original_height: height,
            background: self.background,
        })
    }
}

/// Immutable per-run parameters, read concurrently by every worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingParams {
    pub confidence_threshold: f32,
    pub joint_radius: i32,
    pub line_thickness: i32,
    pub dilation_iterations: i32,
    /// Always odd; values of 1 or less disable the blur.
    pub blur_kernel_size: i32,
    pub target_width: i32,
    pub target_height: i32,
    pub original_width: i32,
    pub original_height: i32,
    pub background: Background,
}

/// Output geometry: downscale to `processing_width` when it is narrower than
/// the source, keeping the aspect ratio with an even height.
pub fn target_dimensions(width: i32, height: i32, processing_width: Option<i32>) -> (i32, i32) {
    match processing_width {
        Some(pw) if pw > 0 && pw < width => {
            let mut h = (height as f64 * pw as f64 / width as f64).round() as i32;
            if h % 2 != 0 {
                h += 1;
            }
            (pw, h.max(2))
        }
        _ => (width, height),
    }
}

pub fn scaled_joint_radius(radius: i32) -> i32 {
    ((radius as f32 * 0.8).round() as i32).max(1)
}

pub fn odd_kernel_size(size: i32) -> i32 {
    if size > 1 && size % 2 == 0 {
        size + 1
    } else {
        size
    }
}

/// A frame read from the video source.
pub struct Task {
    pub id: usize,
    pub frame: Mat,
}

/// Result of processing one frame. Recovery is explicit rather than hidden
/// behind a blanket catch.
pub enum FrameOutcome {
    Processed(Mat),
    /// Processing failed; `frame` is a fully transparent placeholder.
    Recovered { frame: Mat, error: String },
}

impl FrameOutcome {
    pub fn frame(&self) -> &Mat {
        match self {
            FrameOutcome::Processed(frame) => frame,
            FrameOutcome::Recovered { frame, .. } => frame,
        }
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, FrameOutcome::Recovered { .. })
    }
}

/// Worker output for one frame index.
pub struct FrameResult {
    pub id: usize,
    pub outcome: FrameOutcome,
}

/// Lifecycle of one pipeline run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Idle,
    Running,
    Draining,
    Aborting,
    Done,
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub ms_per_frame: f64,
}

/// Mutable state of one run, shared between the reader, the workers and the
/// control loop. Constructed per run; nothing here is process-global.
#[derive(Debug)]
pub struct ProcessingState {
    pub total_frames: usize,
    pub frames_read: AtomicUsize,
    pub frames_processed: AtomicUsize,
    pub frames_recovered: AtomicUsize,
    pub frames_written: AtomicUsize,
    abort: AtomicBool,
    abort_cause: RwLock<Option<String>>,
    phase: RwLock<PipelinePhase>,
    /// Timing per stage ("reader", "detect", "write")
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(total_frames: usize) -> Self {
        let mut stages = BTreeMap::new();
        for stage in ["reader", "detect", "write"] {
            stages.insert(
                stage.to_string(),
                StageProgress {
                    current: 0,
                    ms_per_frame: 0.0,
                },
            );
        }

        Self {
            total_frames,
            frames_read: AtomicUsize::new(0),
            frames_processed: AtomicUsize::new(0),
            frames_recovered: AtomicUsize::new(0),
            frames_written: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            abort_cause: RwLock::new(None),
            phase: RwLock::new(PipelinePhase::Idle),
            stages: RwLock::new(stages),
            start_time: Instant::now(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Raise the shared abort flag. The first cause wins.
    pub fn request_abort(&self, cause: impl Into<String>) {
        if let Ok(mut slot) = self.abort_cause.write() {
            if slot.is_none() {
                *slot = Some(cause.into());
            }
        }
        self.abort.store(true, Ordering::Release);
    }

    pub fn abort_cause(&self) -> Option<String> {
        self.abort_cause.read().ok().and_then(|c| c.clone())
    }

    pub fn set_phase(&self, next: PipelinePhase) {
        if let Ok(mut phase) = self.phase.write() {
            if *phase != next {
                tracing::info!("Pipeline phase {:?} -> {:?}", *phase, next);
                *phase = next;
            }
        }
    }

    pub fn update_stage(&self, stage: &str, current: usize, ms_per_frame: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.current = current;
                // Simple exponential moving average for smoothing durations
                if progress.ms_per_frame == 0.0 {
                    progress.ms_per_frame = ms_per_frame;
                } else {
                    progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms_per_frame * 0.1;
                }
            }
        }
    }

    pub fn stage_snapshot(&self) -> BTreeMap<String, StageProgress> {
        self.stages
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}
