use crate::cli::Args;
use crate::pipeline::detection::{MoveNet, MoveNetVariant, PoseDetector};
use crate::pipeline::orchestrator::{run_pipeline, RunSummary};
use crate::pipeline::types::PipelineOptions;
use crate::run_artifacts;
use crate::video::encoder::{EncoderCommand, FfmpegEncoder, FrameSink};
use crate::video::{open_reader, ReaderBackend};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything one invocation needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub input: PathBuf,
    pub output: PathBuf,
    pub model: PathBuf,
    pub model_type: MoveNetVariant,
    pub backend: ReaderBackend,
    pub ffmpeg_bin: String,
    pub report: Option<PathBuf>,
    pub options: PipelineOptions,
}

impl RunContext {
    pub fn from_args(args: Args) -> Self {
        let output = webm_output_path(&args.output);
        if output != args.output {
            tracing::warn!(
                "Output {} is not .webm, writing {} instead",
                args.output.display(),
                output.display()
            );
        }

        let options = PipelineOptions {
            confidence_threshold: args.confidence,
            radius: args.radius,
            dilation_iterations: args.dilate,
            blur_kernel_size: args.blur,
            processing_width: args.processing_width,
            workers: args.threads,
            background: args.background,
            show_progress: !args.no_progress,
        };

        Self {
            input: args.input,
            output,
            model: args.model,
            model_type: args.model_type,
            backend: args.backend,
            ffmpeg_bin: args.ffmpeg_bin,
            report: args.report,
            options,
        }
    }

    /// Open the source, load the model, run the pipeline into the encoder and
    /// persist the report.
    pub fn execute(&self) -> Result<RunSummary> {
        let source = open_reader(&self.input, self.backend)?;
        let workers = self.options.worker_count();

        if !self.model.exists() {
            anyhow::bail!("Model file NOT FOUND at: {}", self.model.display());
        }
        let detector: Arc<dyn PoseDetector> = Arc::new(
            MoveNet::new(&self.model, self.model_type, workers)
                .with_context(|| format!("Failed to load model {}", self.model.display()))?,
        );

        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let summary = run_pipeline(source, detector, &self.options, |spec| {
            let command = EncoderCommand::webm(&self.ffmpeg_bin, spec, &self.output, workers);
            Ok(Box::new(FfmpegEncoder::start(&command, spec)?) as Box<dyn FrameSink>)
        })?;

        run_artifacts::log_summary(&summary);
        if let Some(report) = &self.report {
            run_artifacts::write_report(report, &summary)?;
        }
        Ok(summary)
    }
}

/// The encoder always produces WebM; any other extension is replaced.
pub fn webm_output_path(path: &Path) -> PathBuf {
    let is_webm = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("webm"))
        .unwrap_or(false);
    if is_webm {
        path.to_path_buf()
    } else {
        path.with_extension("webm")
    }
}
