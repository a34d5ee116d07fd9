// Run report persisted as JSON next to the output video

use crate::pipeline::orchestrator::{RunOutcome, RunSummary};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(summary)?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    tracing::info!("Run report written to {}", path.display());
    Ok(())
}

pub fn log_summary(summary: &RunSummary) {
    match &summary.outcome {
        RunOutcome::Completed => tracing::info!(
            "Completed: wrote {}/{} frames ({} recovered) in {:.1}s",
            summary.frames_written,
            summary.total_frames,
            summary.frames_recovered,
            summary.elapsed_secs
        ),
        RunOutcome::Aborted { cause } => tracing::error!(
            "Aborted: wrote {}/{} frames (read {}, processed {}): {}",
            summary.frames_written,
            summary.total_frames,
            summary.frames_read,
            summary.frames_processed,
            cause
        ),
    }

    for (stage, progress) in &summary.stages {
        tracing::info!(
            "  {:<6} {:>6} frames, {:.2} ms/frame",
            stage,
            progress.current,
            progress.ms_per_frame
        );
    }

    if let Some(encoder) = &summary.encoder {
        if !encoder.diagnostics.is_empty() {
            tracing::info!("Encoder output:\n{}", encoder.diagnostics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::SinkStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn summary(outcome: RunOutcome) -> RunSummary {
        RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed_secs: 1.5,
            total_frames: 100,
            frames_read: 100,
            frames_processed: 100,
            frames_recovered: 1,
            frames_written: 50,
            workers: 4,
            output_width: 640,
            output_height: 360,
            fps: 30.0,
            outcome,
            encoder: Some(SinkStatus {
                exit_code: Some(1),
                success: false,
                timed_out: false,
                diagnostics: "pipe closed".to_string(),
            }),
            stages: BTreeMap::new(),
        }
    }

    #[test]
    fn test_report_json_shape() {
        let dir = std::env::temp_dir().join(format!("skeletor-report-{}", std::process::id()));
        let path = dir.join("nested").join("report.json");
        let aborted = summary(RunOutcome::Aborted {
            cause: "sink failed at frame 50".to_string(),
        });

        write_report(&path, &aborted).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(value["outcome"]["status"], "aborted");
        assert_eq!(value["outcome"]["cause"], "sink failed at frame 50");
        assert_eq!(value["frames_written"], 50);
        assert_eq!(value["total_frames"], 100);
        assert_eq!(value["encoder"]["exit_code"], 1);
        assert_eq!(value["encoder"]["diagnostics"], "pipe closed");
        assert!(value["started_at"].is_string());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_completed_outcome_serializes_as_status() {
        let value = serde_json::to_value(summary(RunOutcome::Completed)).unwrap();
        assert_eq!(value["outcome"], serde_json::json!({ "status": "completed" }));
    }
}
