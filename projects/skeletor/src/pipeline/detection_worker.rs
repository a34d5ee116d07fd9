use crate::pipeline::detection::{detect_poses, PoseDetector};
use crate::pipeline::masking::{blank_frame, composite, synthesize_mask, MaskStyle};
use crate::pipeline::types::{FrameOutcome, FrameResult, ProcessingParams, ProcessingState, Task};
use anyhow::{ensure, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Worker loop: take tasks until the queue closes or the run aborts, and emit
/// exactly one result per task taken.
///
/// A task already picked up is always finished, even after an abort.
pub fn detection_worker(
    worker_id: usize,
    rx: Receiver<Task>,
    tx: Sender<FrameResult>,
    detector: Arc<dyn PoseDetector>,
    params: Arc<ProcessingParams>,
    state: Arc<ProcessingState>,
    poll: Duration,
) {
    let style = MaskStyle::from(params.as_ref());

    loop {
        if state.is_aborted() {
            break;
        }

        let task = match rx.recv_timeout(poll) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let id = task.id;
        let start_inst = Instant::now();
        let outcome = run_task(detector.as_ref(), &params, &style, task);
        let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;

        if let FrameOutcome::Recovered { error, .. } = &outcome {
            tracing::warn!("Worker {}: frame {} recovered as blank: {}", worker_id, id, error);
            state.frames_recovered.fetch_add(1, Ordering::AcqRel);
        } else {
            tracing::debug!("Worker {}: frame {} in {:.1}ms", worker_id, id, duration_ms);
        }
        let processed = state.frames_processed.fetch_add(1, Ordering::AcqRel) + 1;
        state.update_stage("detect", processed, duration_ms);

        if tx.send(FrameResult { id, outcome }).is_err() {
            // Control loop is gone (aborted run)
            break;
        }
    }

    tracing::debug!("Worker {} exiting", worker_id);
}

/// Process one task, turning any error or panic into a blank frame of the
/// target geometry.
pub fn run_task(
    detector: &dyn PoseDetector,
    params: &ProcessingParams,
    style: &MaskStyle,
    task: Task,
) -> FrameOutcome {
    let attempt = catch_unwind(AssertUnwindSafe(|| {
        process_frame(detector, params, style, &task.frame)
    }));

    let error = match attempt {
        Ok(Ok(frame)) => return FrameOutcome::Processed(frame),
        Ok(Err(e)) => format!("{:#}", e),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            format!("panic: {}", message)
        }
    };

    match blank_frame(params.target_width, params.target_height) {
        Ok(frame) => FrameOutcome::Recovered { frame, error },
        // Allocation of the placeholder failed; hand back an empty Mat so the
        // writer reports a geometry error instead of the worker vanishing.
        Err(blank_err) => FrameOutcome::Recovered {
            frame: Mat::default(),
            error: format!("{}; blank frame unavailable: {:#}", error, blank_err),
        },
    }
}

/// Resize to the target geometry, detect, build the mask and composite.
pub fn process_frame(
    detector: &dyn PoseDetector,
    params: &ProcessingParams,
    style: &MaskStyle,
    frame: &Mat,
) -> Result<Mat> {
    ensure!(!frame.empty(), "empty frame");
    ensure!(
        frame.channels() == 3,
        "expected a 3-channel frame, got {} channels",
        frame.channels()
    );

    let target = Size::new(params.target_width, params.target_height);
    let working = if frame.size()? != target {
        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            target,
            0.0,
            0.0,
            imgproc::INTER_AREA,
        )?;
        resized
    } else {
        frame.clone()
    };

    let poses = detect_poses(detector, &working, params.confidence_threshold)?;
    let mask = synthesize_mask(target, &poses, style)?;
    composite(&working, &mask, params.background)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Keypoint, PersonPose, PipelineOptions, KEYPOINT_COUNT};
    use anyhow::bail;
    use opencv::core::{self, Scalar, Vec4b};

    struct NoPeople;

    impl PoseDetector for NoPeople {
        fn input_size(&self) -> i32 {
            64
        }

        fn infer(&self, _canvas: &Mat) -> Result<Vec<PersonPose>> {
            Ok(Vec::new())
        }
    }

    struct Broken {
        panic: bool,
    }

    impl PoseDetector for Broken {
        fn input_size(&self) -> i32 {
            64
        }

        fn infer(&self, _canvas: &Mat) -> Result<Vec<PersonPose>> {
            if self.panic {
                panic!("model exploded");
            }
            bail!("inference failed")
        }
    }

    /// Torso covering the central region of the canvas.
    struct CenteredPerson;

    impl PoseDetector for CenteredPerson {
        fn input_size(&self) -> i32 {
            64
        }

        fn infer(&self, _canvas: &Mat) -> Result<Vec<PersonPose>> {
            let mut kps = [Keypoint::new(0.5, 0.5, 0.0); KEYPOINT_COUNT];
            kps[5] = Keypoint::new(0.3, 0.3, 1.0);
            kps[6] = Keypoint::new(0.3, 0.7, 1.0);
            kps[11] = Keypoint::new(0.7, 0.3, 1.0);
            kps[12] = Keypoint::new(0.7, 0.7, 1.0);
            Ok(vec![PersonPose::new(kps, Some(0.9))])
        }
    }

    fn params(width: i32, height: i32, processing_width: Option<i32>) -> ProcessingParams {
        PipelineOptions {
            processing_width,
            dilation_iterations: 0,
            blur_kernel_size: 0,
            background: crate::pipeline::types::Background::Black,
            ..PipelineOptions::default()
        }
        .resolve(width, height)
        .unwrap()
    }

    fn frame(width: i32, height: i32, value: f64) -> Mat {
        Mat::new_rows_cols_with_default(height, width, core::CV_8UC3, Scalar::all(value)).unwrap()
    }

    fn task(id: usize, frame: Mat) -> Task {
        Task { id, frame }
    }

    #[test]
    fn test_no_detections_is_transparent() {
        let p = params(80, 60, None);
        let style = MaskStyle::from(&p);
        let outcome = run_task(&NoPeople, &p, &style, task(0, frame(80, 60, 200.0)));
        assert!(!outcome.is_recovered());
        let out = outcome.frame();
        assert_eq!(out.typ(), core::CV_8UC4);
        assert_eq!((out.cols(), out.rows()), (80, 60));
        assert!(out.data_bytes().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_error_and_panic_recover_to_blank() {
        let p = params(80, 60, Some(40));
        let style = MaskStyle::from(&p);
        for detector in [Broken { panic: false }, Broken { panic: true }] {
            let outcome = run_task(&detector, &p, &style, task(3, frame(80, 60, 50.0)));
            assert!(outcome.is_recovered());
            let out = outcome.frame();
            assert_eq!((out.cols(), out.rows()), (40, 30));
            assert_eq!(out.typ(), core::CV_8UC4);
            assert!(out.data_bytes().unwrap().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_malformed_frame_recovers() {
        let p = params(80, 60, None);
        let style = MaskStyle::from(&p);
        let outcome = run_task(&NoPeople, &p, &style, task(0, Mat::default()));
        match outcome {
            FrameOutcome::Recovered { frame, error } => {
                assert_eq!((frame.cols(), frame.rows()), (80, 60));
                assert!(error.contains("empty frame"));
            }
            FrameOutcome::Processed(_) => panic!("empty frame should not process"),
        }
    }

    #[test]
    fn test_detected_person_is_opaque_at_torso() {
        let p = params(64, 64, None);
        let style = MaskStyle::from(&p);
        let outcome = run_task(&CenteredPerson, &p, &style, task(0, frame(64, 64, 120.0)));
        assert!(!outcome.is_recovered());
        let out = outcome.frame();
        let center = out.at_2d::<Vec4b>(32, 32).unwrap();
        assert_eq!(center[3], 255);
        assert_eq!(center[0], 120);
        let corner = out.at_2d::<Vec4b>(0, 0).unwrap();
        assert_eq!(corner[3], 0);
    }

    #[test]
    fn test_worker_loop_emits_one_result_per_task() {
        let (task_tx, task_rx) = crossbeam::channel::bounded(8);
        let (result_tx, result_rx) = crossbeam::channel::unbounded();
        let p = Arc::new(params(16, 16, None));
        let state = Arc::new(ProcessingState::new(5));

        for id in 0..5 {
            task_tx.send(task(id, frame(16, 16, 10.0))).unwrap();
        }
        drop(task_tx);

        detection_worker(
            0,
            task_rx,
            result_tx,
            Arc::new(NoPeople),
            p,
            state.clone(),
            Duration::from_millis(5),
        );

        let mut ids: Vec<usize> = result_rx.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(state.frames_processed.load(Ordering::Acquire), 5);
        assert_eq!(state.frames_recovered.load(Ordering::Acquire), 0);
    }
}
