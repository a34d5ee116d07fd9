mod cli;
mod error;
mod pipeline;
mod run_artifacts;
mod run_context;
mod video;

use anyhow::Result;
use cli::Args;
use run_context::RunContext;

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    let context = RunContext::from_args(args);
    let summary = context.execute()?;

    if !summary.is_success() {
        anyhow::bail!(
            "run aborted after {}/{} frames",
            summary.frames_written,
            summary.total_frames
        );
    }

    Ok(())
}
