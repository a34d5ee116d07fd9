// Mask synthesis and compositing
//
// Renders detected skeletons into a single-channel soft mask and merges it
// with the source frame into a BGRA frame.

use crate::pipeline::types::{
    Background, KeypointKind, PersonPose, ProcessingParams, CIRCLED_JOINTS, SKELETON_EDGES,
};
use anyhow::Result;
use opencv::core::{self, Mat, Point, Scalar, Size, Vector};
use opencv::imgproc;
use opencv::prelude::*;

/// Rendering settings for one mask.
#[derive(Debug, Copy, Clone)]
pub struct MaskStyle {
    pub confidence_threshold: f32,
    pub line_thickness: i32,
    pub joint_radius: i32,
    pub dilation_iterations: i32,
    /// Odd kernel side; 1 or less skips the blur.
    pub blur_kernel_size: i32,
}

impl From<&ProcessingParams> for MaskStyle {
    fn from(params: &ProcessingParams) -> Self {
        Self {
            confidence_threshold: params.confidence_threshold,
            line_thickness: params.line_thickness,
            joint_radius: params.joint_radius,
            dilation_iterations: params.dilation_iterations,
            blur_kernel_size: params.blur_kernel_size,
        }
    }
}

fn to_point(pose: &PersonPose, kind: KeypointKind) -> Point {
    let kp = pose.get(kind);
    Point::new(kp.x as i32, kp.y as i32)
}

fn white() -> Scalar {
    Scalar::all(255.0)
}

/// Draw one pose onto `mask`: torso, then limb lines, then joint disks.
fn draw_pose(mask: &mut Mat, pose: &PersonPose, style: &MaskStyle) -> Result<()> {
    let threshold = style.confidence_threshold;
    let confident = |kind: KeypointKind| pose.get(kind).is_confident(threshold);

    let torso = [
        KeypointKind::LeftShoulder,
        KeypointKind::RightShoulder,
        KeypointKind::RightHip,
        KeypointKind::LeftHip,
    ];
    if torso.iter().all(|&kind| confident(kind)) {
        let corners: Vector<Point> = torso.iter().map(|&kind| to_point(pose, kind)).collect();
        let mut contours = Vector::<Vector<Point>>::new();
        contours.push(corners);
        imgproc::fill_poly(
            mask,
            &contours,
            white(),
            imgproc::LINE_8,
            0,
            Point::default(),
        )?;
    }

    for &(a, b) in SKELETON_EDGES.iter() {
        if confident(a) && confident(b) {
            imgproc::line(
                mask,
                to_point(pose, a),
                to_point(pose, b),
                white(),
                style.line_thickness,
                imgproc::LINE_8,
                0,
            )?;
        }
    }

    for &kind in CIRCLED_JOINTS.iter() {
        if confident(kind) {
            imgproc::circle(
                mask,
                to_point(pose, kind),
                style.joint_radius,
                white(),
                imgproc::FILLED,
                imgproc::LINE_8,
                0,
            )?;
        }
    }

    Ok(())
}

/// Render `poses` (pixel coordinates) into a `size` mask with values in
/// `[0, 255]`. All poses are unioned first; dilation and blur run once over
/// the combined mask. No poses gives an all-zero mask.
pub fn synthesize_mask(size: Size, poses: &[PersonPose], style: &MaskStyle) -> Result<Mat> {
    let mut mask = Mat::new_size_with_default(size, core::CV_8UC1, Scalar::all(0.0))?;
    if poses.is_empty() {
        return Ok(mask);
    }

    for pose in poses {
        draw_pose(&mut mask, pose, style)?;
    }

    if style.dilation_iterations > 0 {
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(3, 3),
            Point::new(-1, -1),
        )?;
        let mut dilated = Mat::default();
        imgproc::dilate(
            &mask,
            &mut dilated,
            &kernel,
            Point::new(-1, -1),
            style.dilation_iterations,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        mask = dilated;
    }

    if style.blur_kernel_size > 1 {
        let k = if style.blur_kernel_size % 2 == 0 {
            style.blur_kernel_size + 1
        } else {
            style.blur_kernel_size
        };
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&mask, &mut blurred, Size::new(k, k), 0.0)?;
        mask = blurred;
    }

    Ok(mask)
}

/// Merge a BGR frame and its mask into a BGRA frame.
///
/// Color is the source scaled by `mask / 255`; with a white background the
/// complement `255 - mask` is added on top. Alpha is the mask unchanged.
/// Everything is whole-image arithmetic.
pub fn composite(frame: &Mat, mask: &Mat, background: Background) -> Result<Mat> {
    let mut mask_bgr = Mat::default();
    imgproc::cvt_color_def(mask, &mut mask_bgr, imgproc::COLOR_GRAY2BGR)?;

    let mut foreground = Mat::default();
    core::multiply(frame, &mask_bgr, &mut foreground, 1.0 / 255.0, -1)?;

    let color = match background {
        Background::Black => foreground,
        Background::White => {
            let mut inverse = Mat::default();
            core::bitwise_not_def(&mask_bgr, &mut inverse)?;
            let mut blended = Mat::default();
            core::add_def(&foreground, &inverse, &mut blended)?;
            blended
        }
    };

    let mut channels = Vector::<Mat>::new();
    core::split(&color, &mut channels)?;
    channels.push(mask.clone());

    let mut bgra = Mat::default();
    core::merge(&channels, &mut bgra)?;
    Ok(bgra)
}

/// Fully transparent frame used when processing a frame fails.
pub fn blank_frame(width: i32, height: i32) -> Result<Mat> {
    Ok(Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC4,
        Scalar::all(0.0),
    )?)
}
