// Run-level error taxonomy
//
// Per-frame failures never appear here: workers recover them locally into a
// blank frame (see `pipeline::types::FrameOutcome`).

use thiserror::Error;

/// Failures that stop a run before or while it starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("video source error: {0:#}")]
    Source(anyhow::Error),

    #[error("failed to start encoder: {0}")]
    SinkStart(#[source] SinkError),
}

/// Failures reported by a frame sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The consumer closed its end of the stream (encoder exited early).
    #[error("encoder closed the stream: {0}")]
    BrokenPipe(#[source] std::io::Error),

    #[error("encoder I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("frame is {actual} bytes, encoder expects {expected}")]
    Geometry { expected: usize, actual: usize },
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::BrokenPipe {
            SinkError::BrokenPipe(err)
        } else {
            SinkError::Io(err)
        }
    }
}
