use crate::pipeline::types::{Keypoint, PersonPose};
use anyhow::{ensure, Result};
use opencv::core::{self, Mat, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

/// Aspect-preserving fit of an `height`×`width` frame into a square model
/// input of side `input_size`, centered with black padding.
///
/// The same value drives both the forward placement and the inverse keypoint
/// mapping, so the two can never disagree on scale or padding.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Letterbox {
    pub input_size: i32,
    pub height: i32,
    pub width: i32,
    pub scale: f32,
    pub scaled_height: i32,
    pub scaled_width: i32,
    pub pad_y: i32,
    pub pad_x: i32,
}

impl Letterbox {
    pub fn new(height: i32, width: i32, input_size: i32) -> Self {
        let s = input_size as f32;
        let scale = (s / height as f32).min(s / width as f32);
        let scaled_height = ((height as f32 * scale).round() as i32).clamp(1, input_size);
        let scaled_width = ((width as f32 * scale).round() as i32).clamp(1, input_size);

        Self {
            input_size,
            height,
            width,
            scale,
            scaled_height,
            scaled_width,
            pad_y: (input_size - scaled_height) / 2,
            pad_x: (input_size - scaled_width) / 2,
        }
    }

    /// Resize `frame` and center it on a black square canvas.
    pub fn apply(&self, frame: &Mat) -> Result<Mat> {
        let size = frame.size()?;
        ensure!(
            size.width == self.width && size.height == self.height,
            "letterbox built for {}x{}, got {}x{}",
            self.width,
            self.height,
            size.width,
            size.height
        );

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(self.scaled_width, self.scaled_height),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let bottom = self.input_size - self.scaled_height - self.pad_y;
        let right = self.input_size - self.scaled_width - self.pad_x;
        let mut canvas = Mat::default();
        core::copy_make_border(
            &resized,
            &mut canvas,
            self.pad_y,
            bottom,
            self.pad_x,
            right,
            core::BORDER_CONSTANT,
            Scalar::all(0.0),
        )?;

        Ok(canvas)
    }

    /// Normalized model coordinates -> pixel position in the original frame,
    /// clamped to the frame bounds.
    pub fn to_pixel(&self, y_norm: f32, x_norm: f32) -> (f32, f32) {
        let s = self.input_size as f32;
        let y = (y_norm * s - self.pad_y as f32) / self.scale;
        let x = (x_norm * s - self.pad_x as f32) / self.scale;
        (
            y.clamp(0.0, (self.height - 1) as f32),
            x.clamp(0.0, (self.width - 1) as f32),
        )
    }

    /// Map every keypoint of a detector pose into frame pixels. Scores and
    /// the person score are carried through unchanged.
    pub fn map_pose(&self, pose: &PersonPose) -> PersonPose {
        let mut keypoints = pose.keypoints;
        for kp in keypoints.iter_mut() {
            let (y, x) = self.to_pixel(kp.y, kp.x);
            *kp = Keypoint::new(y, x, kp.score);
        }
        PersonPose::new(keypoints, pose.score)
    }
}
