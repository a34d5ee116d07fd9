use crate::pipeline::detection::MoveNetVariant;
use crate::pipeline::types::Background;
use crate::video::ReaderBackend;
use clap::Parser;
use std::path::PathBuf;

/// Cut people out of a video into a transparent WebM using pose keypoints.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Input video
    pub input: PathBuf,

    /// Output video (forced to .webm)
    pub output: PathBuf,

    /// MoveNet ONNX model file
    #[arg(long, env = "SKELETOR_MODEL")]
    pub model: PathBuf,

    #[arg(long, value_enum, default_value_t = MoveNetVariant::MultiposeLightning)]
    pub model_type: MoveNetVariant,

    /// Downscale frames to this width before detection and masking
    #[arg(long)]
    pub processing_width: Option<i32>,

    /// Skeleton radius in pixels
    #[arg(long, default_value_t = 30)]
    pub radius: i32,

    /// Keypoint confidence threshold
    #[arg(long, default_value_t = 0.3)]
    pub confidence: f32,

    /// Mask dilation iterations
    #[arg(long, default_value_t = 10)]
    pub dilate: i32,

    /// Blur kernel size (even values are rounded up)
    #[arg(long, default_value_t = 21)]
    pub blur: i32,

    /// Worker threads (defaults to available cores minus one)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Video decoder
    #[arg(long, value_enum, default_value_t = ReaderBackend::Opencv)]
    pub backend: ReaderBackend,

    /// Color of masked-out pixels
    #[arg(long, value_enum, default_value_t = Background::White)]
    pub background: Background,

    /// ffmpeg executable used for encoding
    #[arg(long, env = "SKELETOR_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg_bin: String,

    /// Write the run report as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["skeletor", "in.mp4", "out.webm", "--model", "m.onnx"])
            .unwrap();
        assert_eq!(args.model_type, MoveNetVariant::MultiposeLightning);
        assert_eq!(args.radius, 30);
        assert_eq!(args.confidence, 0.3);
        assert_eq!(args.dilate, 10);
        assert_eq!(args.blur, 21);
        assert_eq!(args.backend, ReaderBackend::Opencv);
        assert_eq!(args.background, Background::White);
        assert!(args.threads.is_none());
        assert!(!args.no_progress);
    }

    #[test]
    fn test_value_enums() {
        let args = Args::try_parse_from([
            "skeletor",
            "in.mp4",
            "out.webm",
            "--model",
            "m.onnx",
            "--model-type",
            "thunder",
            "--backend",
            "ffmpeg",
            "--background",
            "black",
            "--threads",
            "3",
        ])
        .unwrap();
        assert_eq!(args.model_type, MoveNetVariant::Thunder);
        assert_eq!(args.backend, ReaderBackend::Ffmpeg);
        assert_eq!(args.background, Background::Black);
        assert_eq!(args.threads, Some(3));
    }
}
