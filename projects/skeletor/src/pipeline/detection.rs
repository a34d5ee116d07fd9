use crate::pipeline::geometry::Letterbox;
use crate::pipeline::types::{Keypoint, PersonPose, KEYPOINT_COUNT};
use anyhow::{anyhow, bail, ensure, Context, Result};
use ndarray::{Array4, ArrayViewD, Ix3, Ix4};
use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A keypoint model. Implementations receive the letterboxed BGR canvas and
/// return poses with coordinates normalized to that canvas.
///
/// Shared by every worker, so implementations must be safe to call
/// concurrently (or serialize themselves internally).
pub trait PoseDetector: Send + Sync {
    /// Side of the square input the model expects.
    fn input_size(&self) -> i32;

    fn infer(&self, canvas: &Mat) -> Result<Vec<PersonPose>>;
}

/// Letterbox `frame`, run the detector, drop low-confidence people and map
/// the survivors back into `frame` pixel coordinates.
pub fn detect_poses(
    detector: &dyn PoseDetector,
    frame: &Mat,
    confidence_threshold: f32,
) -> Result<Vec<PersonPose>> {
    let size = frame.size()?;
    ensure!(
        size.width > 0 && size.height > 0 && frame.channels() == 3,
        "invalid frame for detection: {}x{} with {} channels",
        size.width,
        size.height,
        frame.channels()
    );

    let letterbox = Letterbox::new(size.height, size.width, detector.input_size());
    let canvas = letterbox.apply(frame)?;
    let poses = detector.infer(&canvas)?;

    Ok(poses
        .iter()
        .filter(|pose| pose.is_confident(confidence_threshold))
        .map(|pose| letterbox.map_pose(pose))
        .collect())
}

/// MoveNet variants and their input resolutions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum MoveNetVariant {
    Thunder,
    Lightning,
    MultiposeLightning,
}

impl MoveNetVariant {
    pub fn input_size(self) -> i32 {
        match self {
            MoveNetVariant::Thunder => 256,
            MoveNetVariant::Lightning => 192,
            MoveNetVariant::MultiposeLightning => 256,
        }
    }
}

/// MoveNet ONNX model served by ONNX Runtime.
///
/// Keeps one session per worker; each call takes the next session in turn
/// and holds its lock only for the inference itself.
pub struct MoveNet {
    sessions: Vec<Mutex<Session>>,
    next: AtomicUsize,
    input_name: String,
    output_name: String,
    input_size: i32,
}

impl MoveNet {
    pub fn new(model_path: &Path, variant: MoveNetVariant, pool_size: usize) -> Result<Self> {
        tracing::info!(
            "Loading MoveNet {:?} from {} ({} sessions, {}x{} input)",
            variant,
            model_path.display(),
            pool_size.max(1),
            variant.input_size(),
            variant.input_size()
        );

        let mut sessions = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            sessions.push(load_session(model_path)?);
        }

        let (input_name, output_name) = {
            let first = &sessions[0];
            let input = first
                .inputs
                .first()
                .ok_or_else(|| anyhow!("model has no inputs"))?;
            let output = first
                .outputs
                .first()
                .ok_or_else(|| anyhow!("model has no outputs"))?;
            (input.name.clone(), output.name.clone())
        };
        tracing::debug!("MoveNet input '{}', output '{}'", input_name, output_name);

        let detector = Self {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            input_name,
            output_name,
            input_size: variant.input_size(),
        };
        detector.warm_up()?;
        Ok(detector)
    }

    fn warm_up(&self) -> Result<()> {
        let s = self.input_size as usize;
        let input = Array4::<i32>::zeros((1, s, s, 3));
        for slot in &self.sessions {
            let mut session = slot
                .lock()
                .map_err(|_| anyhow!("MoveNet session lock poisoned"))?;
            session
                .run(ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&input)?])
                .context("MoveNet warm-up inference failed")?;
        }
        tracing::info!("MoveNet warmed up");
        Ok(())
    }
}

fn load_session(path: &Path) -> Result<Session> {
    let builder = Session::builder().map_err(|e| anyhow!("ONNX Runtime init failed: {e}"))?;
    let builder = builder
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| anyhow!("failed to set optimization level: {e}"))?;
    let builder = builder
        .with_intra_threads(1)
        .map_err(|e| anyhow!("failed to set intra-op threads: {e}"))?;
    builder
        .commit_from_file(path)
        .map_err(|e| anyhow!("failed to load model from {}: {e}", path.display()))
}

impl PoseDetector for MoveNet {
    fn input_size(&self) -> i32 {
        self.input_size
    }

    fn infer(&self, canvas: &Mat) -> Result<Vec<PersonPose>> {
        let s = self.input_size as usize;
        ensure!(
            canvas.rows() as usize == s && canvas.cols() as usize == s,
            "canvas is {}x{}, model expects {s}x{s}",
            canvas.cols(),
            canvas.rows()
        );

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(canvas, &mut rgb, imgproc::COLOR_BGR2RGB)?;
        if !rgb.is_continuous() {
            bail!("canvas Mat is not continuous");
        }
        let bytes = rgb.data_bytes()?;
        let input = Array4::from_shape_fn((1, s, s, 3), |(_, y, x, c)| {
            bytes[(y * s + x) * 3 + c] as i32
        });

        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut session = self.sessions[slot]
            .lock()
            .map_err(|_| anyhow!("MoveNet session lock poisoned"))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&input)?])
            .context("MoveNet inference failed")?;
        let output = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;

        parse_movenet_output(output)
    }
}

/// Decode MoveNet output, selected by rank:
/// - `[1, 1, 17, 3]`: single pose, `(y, x, score)` per keypoint, no person score.
/// - `[1, K, 56]`: K candidates, 51 keypoint values followed by
///   `ymin, xmin, ymax, xmax, score`.
pub fn parse_movenet_output(output: ArrayViewD<'_, f32>) -> Result<Vec<PersonPose>> {
    let shape = output.shape().to_vec();
    match shape.as_slice() {
        [1, 1, k, 3] if *k == KEYPOINT_COUNT => {
            let output = output.into_dimensionality::<Ix4>()?;
            let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
            for (i, kp) in keypoints.iter_mut().enumerate() {
                *kp = Keypoint::new(
                    output[[0, 0, i, 0]],
                    output[[0, 0, i, 1]],
                    output[[0, 0, i, 2]],
                );
            }
            Ok(vec![PersonPose::new(keypoints, None)])
        }
        [1, candidates, width] if *width >= KEYPOINT_COUNT * 3 + 5 => {
            let output = output.into_dimensionality::<Ix3>()?;
            let mut poses = Vec::with_capacity(*candidates);
            for p in 0..*candidates {
                let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
                for (i, kp) in keypoints.iter_mut().enumerate() {
                    *kp = Keypoint::new(
                        output[[0, p, i * 3]],
                        output[[0, p, i * 3 + 1]],
                        output[[0, p, i * 3 + 2]],
                    );
                }
                let score = output[[0, p, KEYPOINT_COUNT * 3 + 4]];
                poses.push(PersonPose::new(keypoints, Some(score)));
            }
            Ok(poses)
        }
        other => bail!("unexpected MoveNet output shape {:?}", other),
    }
}
