use super::{VideoMetadata, VideoReader};
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use opencv::{core, prelude::*};
use std::path::Path;

/// Sequential reader decoding with FFmpeg via ffmpeg-next and converting
/// every frame to BGR24.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Created on the first frame, once the decoded pixel format is known.
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    metadata: VideoMetadata,
    packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
    finished: bool,
}

// SAFETY: the reader is moved into the pipeline's reader thread and only used
// there; the raw pointers inside ffmpeg-next types are never shared.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &Path) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let input_ctx = ffmpeg_next::format::input(&path)
            .with_context(|| format!("Failed to open video file {}", path.display()))?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;
        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let fps = if rational_fps.denominator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            0.0
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        let frame_count = if stream_frames == 0 && duration_secs > 0.0 {
            (duration_secs * fps).round() as usize
        } else {
            stream_frames
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let width = decoder.width() as i32;
        let height = decoder.height() as i32;

        tracing::info!(
            "FfmpegReader: opened {}, duration={:.2}s, fps={:.2}, stream_frames={}, estimated_total={}, {}x{}",
            path.display(),
            duration_secs,
            fps,
            stream_frames,
            frame_count,
            width,
            height
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            metadata: VideoMetadata {
                frame_count,
                fps,
                width,
                height,
            },
            packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
            finished: false,
        })
    }

    /// Pull the next decoded frame, feeding packets as the decoder asks for
    /// them. `Ok(false)` means the stream is exhausted.
    fn decode_next(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            let mut found_packet = false;
            while self.packet.read(&mut self.input_ctx).is_ok() {
                if self.packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                // Input exhausted, flush the decoder
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn to_bgr(
        &mut self,
        frame: &ffmpeg_next::util::frame::Video,
    ) -> Result<ffmpeg_next::util::frame::Video> {
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg_next::format::Pixel::BGR24,
                frame.width(),
                frame.height(),
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }

        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| anyhow!("scaler missing"))?;
        let mut bgr = ffmpeg_next::util::frame::Video::empty();
        scaler.run(frame, &mut bgr).context("Scaler failed")?;
        Ok(bgr)
    }
}

/// Deep-copy a BGR24 frame into an owned Mat so it can travel through the
/// pipeline after the FFmpeg frame is released.
fn bgr_frame_to_mat(frame: &ffmpeg_next::util::frame::Video) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;
    let dst = mat.data_bytes_mut()?;
    for y in 0..height as usize {
        let src_row = &data[y * stride..y * stride + row_bytes];
        dst[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(src_row);
    }

    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn metadata(&self) -> VideoMetadata {
        self.metadata
    }

    fn next_frame(&mut self) -> Result<Option<core::Mat>> {
        if self.finished {
            return Ok(None);
        }

        let mut decoded = ffmpeg_next::util::frame::Video::empty();
        if !self.decode_next(&mut decoded)? {
            self.finished = true;
            return Ok(None);
        }

        let bgr = self.to_bgr(&decoded)?;
        Ok(Some(bgr_frame_to_mat(&bgr)?))
    }
}
