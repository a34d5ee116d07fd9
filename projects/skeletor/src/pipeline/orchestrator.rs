// Pipeline orchestrator: one run from open source to closed sink
//
// Owns the work queue, the results channel, the ordered writer and the abort
// flag for a single invocation. Nothing is shared between runs.

use crate::error::{PipelineError, SinkError};
use crate::pipeline::detection::PoseDetector;
use crate::pipeline::detection_worker::detection_worker;
use crate::pipeline::finalize::OrderedWriter;
use crate::pipeline::reader::read_worker;
use crate::pipeline::types::{
    PipelineOptions, PipelinePhase, ProcessingParams, ProcessingState, StageProgress,
};
use crate::video::encoder::{FrameSink, SinkStatus, StreamSpec};
use crate::video::VideoReader;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Work queue capacity per worker.
pub const QUEUE_DEPTH_PER_WORKER: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted { cause: String },
}

/// Final report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub total_frames: usize,
    pub frames_read: usize,
    pub frames_processed: usize,
    pub frames_recovered: usize,
    pub frames_written: usize,
    pub workers: usize,
    pub output_width: i32,
    pub output_height: i32,
    pub fps: f64,
    pub outcome: RunOutcome,
    pub encoder: Option<SinkStatus>,
    pub stages: BTreeMap<String, StageProgress>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Run the whole pipeline over `source`.
///
/// Configuration and source problems are returned as `Err` before any thread
/// starts, as is a sink that fails to start. Everything after that, including
/// a sink that dies mid-stream, ends in a `RunSummary`.
pub fn run_pipeline<F>(
    source: Box<dyn VideoReader>,
    detector: Arc<dyn PoseDetector>,
    options: &PipelineOptions,
    start_sink: F,
) -> Result<RunSummary, PipelineError>
where
    F: FnOnce(&StreamSpec) -> Result<Box<dyn FrameSink>, SinkError>,
{
    let started_at = Utc::now();
    let metadata = source.metadata();
    metadata.validate()?;
    let params = Arc::new(options.resolve(metadata.width, metadata.height)?);
    let workers = options.worker_count();

    tracing::info!(
        "Pipeline: {} frames at {:.2} fps, {}x{} -> {}x{}, {} workers",
        metadata.frame_count,
        metadata.fps,
        params.original_width,
        params.original_height,
        params.target_width,
        params.target_height,
        workers
    );

    let spec = StreamSpec::bgra(params.target_width, params.target_height, metadata.fps);
    let mut sink = start_sink(&spec).map_err(PipelineError::SinkStart)?;

    let state = Arc::new(ProcessingState::new(metadata.frame_count));
    state.set_phase(PipelinePhase::Running);

    let (task_tx, task_rx) = channel::bounded(QUEUE_DEPTH_PER_WORKER * workers);
    let (result_tx, result_rx) = channel::unbounded();

    let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(workers + 1);
    {
        let state = state.clone();
        handles.push((
            "reader".to_string(),
            thread::spawn(move || {
                read_worker(source, task_tx, state, POLL_INTERVAL);
            }),
        ));
    }
    for worker_id in 0..workers {
        let rx = task_rx.clone();
        let tx = result_tx.clone();
        let detector = detector.clone();
        let params = params.clone();
        let state = state.clone();
        handles.push((
            format!("worker-{}", worker_id),
            thread::spawn(move || {
                detection_worker(worker_id, rx, tx, detector, params, state, POLL_INTERVAL);
            }),
        ));
    }
    // Only the threads hold channel ends now, so disconnection tracks their exit
    drop(task_rx);
    drop(result_tx);

    let pb = progress_bar(metadata.frame_count, options.show_progress);
    let mut writer = OrderedWriter::new();

    loop {
        match result_rx.recv_timeout(POLL_INTERVAL) {
            Ok(result) => {
                writer.accept(result);
                if let Err(e) = writer.flush_ready(sink.as_mut(), &state, &pb) {
                    state.request_abort(format!(
                        "sink failed at frame {}: {}",
                        writer.cursor().saturating_sub(1),
                        e
                    ));
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if state.is_aborted() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if state.is_aborted() {
        state.set_phase(PipelinePhase::Aborting);
        let dropped = writer.discard();
        tracing::warn!(
            "Aborting: {} ({} buffered results dropped)",
            state.abort_cause().unwrap_or_default(),
            dropped
        );
        // Unblocks any worker still trying to hand back a result
        drop(result_rx);
    } else {
        state.set_phase(PipelinePhase::Draining);
        if !writer.is_empty() {
            tracing::warn!(
                "{} results never became writable: frame {} is missing, next parked is {:?}",
                writer.pending(),
                writer.cursor(),
                writer.first_pending()
            );
            writer.discard();
        }
    }

    join_bounded(handles, JOIN_TIMEOUT);
    pb.finish();

    let encoder = match sink.finish() {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!("Failed to close encoder: {}", e);
            state.request_abort(format!("failed to close encoder: {}", e));
            None
        }
    };

    let outcome = match (state.abort_cause(), &encoder) {
        (Some(cause), _) => RunOutcome::Aborted { cause },
        (None, Some(status)) if !status.success => RunOutcome::Aborted {
            cause: encoder_failure(status),
        },
        _ => RunOutcome::Completed,
    };

    state.set_phase(PipelinePhase::Done);
    Ok(summarize(
        &state, &params, &metadata, workers, started_at, outcome, encoder,
    ))
}

fn progress_bar(total: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    match ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})",
    ) {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => tracing::debug!("Progress template rejected: {}", e),
    }
    pb
}

fn encoder_failure(status: &SinkStatus) -> String {
    let mut cause = if status.timed_out {
        "encoder did not exit in time".to_string()
    } else {
        match status.exit_code {
            Some(code) => format!("encoder exited with code {}", code),
            None => "encoder terminated by signal".to_string(),
        }
    };
    if let Some(line) = status.diagnostics.lines().last() {
        cause.push_str(": ");
        cause.push_str(line);
    }
    cause
}

/// Join every thread, waiting at most `timeout` in total. Threads still
/// running after that are logged and detached.
fn join_bounded(handles: Vec<(String, JoinHandle<()>)>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    for (name, handle) in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            if handle.join().is_err() {
                tracing::error!("Thread {} panicked", name);
            }
        } else {
            tracing::warn!("Thread {} still running after {:?}, detaching", name, timeout);
        }
    }
}

fn summarize(
    state: &ProcessingState,
    params: &ProcessingParams,
    metadata: &crate::video::VideoMetadata,
    workers: usize,
    started_at: DateTime<Utc>,
    outcome: RunOutcome,
    encoder: Option<SinkStatus>,
) -> RunSummary {
    RunSummary {
        started_at,
        finished_at: Utc::now(),
        elapsed_secs: state.start_time.elapsed().as_secs_f64(),
        total_frames: state.total_frames,
        frames_read: state.frames_read.load(Ordering::Acquire),
        frames_processed: state.frames_processed.load(Ordering::Acquire),
        frames_recovered: state.frames_recovered.load(Ordering::Acquire),
        frames_written: state.frames_written.load(Ordering::Acquire),
        workers,
        output_width: params.target_width,
        output_height: params.target_height,
        fps: metadata.fps,
        outcome,
        encoder,
        stages: state.stage_snapshot(),
    }
}
