use super::{VideoMetadata, VideoReader};
use anyhow::{anyhow, Result};
use opencv::{
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH, CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY,
    },
};
use std::path::Path;

/// Sequential reader over OpenCV's `VideoCapture`.
pub struct OpencvReader {
    capture: VideoCapture,
    metadata: VideoMetadata,
}

impl OpencvReader {
    pub fn new(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("video path is not valid UTF-8: {}", path.display()))?;
        let mut capture = VideoCapture::from_file(path_str, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path_str));
        }

        // Hardware decoding when the build supports it
        match capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            Ok(true) => tracing::debug!("OpencvReader: hardware acceleration enabled"),
            _ => tracing::debug!("OpencvReader: hardware acceleration not available"),
        }

        let fps = capture.get(CAP_PROP_FPS)?;
        let frame_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        let width = capture.get(CAP_PROP_FRAME_WIDTH)? as i32;
        let height = capture.get(CAP_PROP_FRAME_HEIGHT)? as i32;

        tracing::info!(
            "OpencvReader: opened {}, {} frames, fps={:.2}, {}x{}",
            path_str,
            frame_count,
            fps,
            width,
            height
        );

        Ok(Self {
            capture,
            metadata: VideoMetadata {
                frame_count,
                fps,
                width,
                height,
            },
        })
    }
}

impl VideoReader for OpencvReader {
    fn metadata(&self) -> VideoMetadata {
        self.metadata
    }

    fn next_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}
