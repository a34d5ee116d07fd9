pub mod encoder;
pub mod ffmpeg_reader;
pub mod opencv_reader;

use crate::error::PipelineError;
use anyhow::Result;
use opencv::core::Mat;
use serde::Serialize;
use std::path::Path;

/// Properties a source reports when opened.
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub frame_count: usize,
    pub fps: f64,
    pub width: i32,
    pub height: i32,
}

impl VideoMetadata {
    /// Reject sources the pipeline cannot run on.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.frame_count == 0 {
            return Err(PipelineError::Source(anyhow::anyhow!(
                "source reports zero frames"
            )));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(PipelineError::Source(anyhow::anyhow!(
                "source reports invalid fps {}",
                self.fps
            )));
        }
        if self.width < 1 || self.height < 1 {
            return Err(PipelineError::Source(anyhow::anyhow!(
                "source reports invalid dimensions {}x{}",
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

/// Sequential frame source producing BGR frames.
pub trait VideoReader: Send {
    fn metadata(&self) -> VideoMetadata;

    /// Next frame in stream order, `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Mat>>;
}

/// Decoder backend used to read the input video.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum ReaderBackend {
    Opencv,
    Ffmpeg,
}

/// Open `path` with the chosen backend and validate what it reports.
pub fn open_reader(
    path: &Path,
    backend: ReaderBackend,
) -> Result<Box<dyn VideoReader>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::Source(anyhow::anyhow!(
            "video file not found: {}",
            path.display()
        )));
    }

    let reader: Box<dyn VideoReader> = match backend {
        ReaderBackend::Opencv => Box::new(
            opencv_reader::OpencvReader::new(path).map_err(PipelineError::Source)?,
        ),
        ReaderBackend::Ffmpeg => Box::new(
            ffmpeg_reader::FfmpegReader::new(path).map_err(PipelineError::Source)?,
        ),
    };

    reader.metadata().validate()?;
    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(frame_count: usize, fps: f64) -> VideoMetadata {
        VideoMetadata {
            frame_count,
            fps,
            width: 640,
            height: 480,
        }
    }

    #[test]
    fn test_metadata_validation() {
        assert!(meta(10, 30.0).validate().is_ok());
        assert!(matches!(
            meta(0, 30.0).validate(),
            Err(PipelineError::Source(_))
        ));
        assert!(matches!(
            meta(10, 0.0).validate(),
            Err(PipelineError::Source(_))
        ));
        assert!(matches!(
            meta(10, f64::NAN).validate(),
            Err(PipelineError::Source(_))
        ));
    }

    #[test]
    fn test_missing_file_is_source_error() {
        let result = open_reader(Path::new("/definitely/not/here.mp4"), ReaderBackend::Opencv);
        assert!(matches!(result, Err(PipelineError::Source(_))));
    }
}
