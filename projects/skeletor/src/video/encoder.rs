use crate::error::SinkError;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);
const WAIT_POLL: Duration = Duration::from_millis(20);
/// Only the tail of the encoder's stderr is kept for the report.
const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024;

/// Geometry and rate of the raw stream handed to a sink.
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct StreamSpec {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub pixel_format: &'static str,
}

impl StreamSpec {
    pub fn bgra(width: i32, height: i32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            pixel_format: "bgra",
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width.max(0) as usize * self.height.max(0) as usize * 4
    }
}

/// What the encoder reported once its input was closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SinkStatus {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub diagnostics: String,
}

/// Consumer of ordered raw frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), SinkError>;

    /// Close the stream and collect the consumer's completion status.
    fn finish(self: Box<Self>) -> Result<SinkStatus, SinkError>;
}

/// Program and arguments of an encoder process reading frames on stdin.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// VP9 with alpha in a WebM container, fed raw BGRA on stdin.
    pub fn webm(ffmpeg_bin: &str, spec: &StreamSpec, output: &Path, threads: usize) -> Self {
        let size = format!("{}x{}", spec.width, spec.height);
        let rate = format!("{}", spec.fps);
        let threads = threads.max(1).to_string();
        let output = output.to_string_lossy();
        Self::new(
            ffmpeg_bin,
            &[
                "-y",
                "-loglevel",
                "error",
                "-f",
                "rawvideo",
                "-vcodec",
                "rawvideo",
                "-pix_fmt",
                spec.pixel_format,
                "-s",
                size.as_str(),
                "-r",
                rate.as_str(),
                "-i",
                "-",
                "-c:v",
                "libvpx-vp9",
                "-pix_fmt",
                "yuva420p",
                "-deadline",
                "realtime",
                "-cpu-used",
                "8",
                "-b:v",
                "1M",
                "-threads",
                threads.as_str(),
                "-row-mt",
                "1",
                "-an",
                output.as_ref(),
            ],
        )
    }
}

/// External encoder process fed over its stdin pipe.
pub struct FfmpegEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<JoinHandle<String>>,
    frame_bytes: usize,
    close_timeout: Duration,
}

impl FfmpegEncoder {
    pub fn start(command: &EncoderCommand, spec: &StreamSpec) -> Result<Self, SinkError> {
        Self::start_with_timeout(command, spec, DEFAULT_CLOSE_TIMEOUT)
    }

    pub fn start_with_timeout(
        command: &EncoderCommand,
        spec: &StreamSpec,
        close_timeout: Duration,
    ) -> Result<Self, SinkError> {
        tracing::info!(
            "Starting encoder: {} ({}x{} {} @ {:.2} fps)",
            command.program,
            spec.width,
            spec.height,
            spec.pixel_format,
            spec.fps
        );
        tracing::debug!("Encoder args: {:?}", command.args);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stderr_drain = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut tail: Vec<u8> = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            tail.extend_from_slice(&chunk[..n]);
                            if tail.len() > MAX_DIAGNOSTIC_BYTES {
                                let excess = tail.len() - MAX_DIAGNOSTIC_BYTES;
                                tail.drain(..excess);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&tail).into_owned()
            })
        });

        Ok(Self {
            child,
            stdin,
            stderr_drain,
            frame_bytes: spec.frame_bytes(),
            close_timeout,
        })
    }

    /// Wait for exit up to the close timeout, then kill.
    fn wait_bounded(&mut self) -> Result<(Option<ExitStatus>, bool), SinkError> {
        let deadline = Instant::now() + self.close_timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok((Some(status), false));
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(WAIT_POLL);
        }

        tracing::warn!(
            "Encoder did not exit within {:?}, killing it",
            self.close_timeout
        );
        if let Err(e) = self.child.kill() {
            tracing::warn!("Failed to kill encoder: {}", e);
        }
        let status = self.child.wait().ok();
        Ok((status, true))
    }
}

impl FrameSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), SinkError> {
        if frame.len() != self.frame_bytes {
            return Err(SinkError::Geometry {
                expected: self.frame_bytes,
                actual: frame.len(),
            });
        }
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            SinkError::BrokenPipe(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "encoder input already closed",
            ))
        })?;
        stdin.write_all(frame)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<SinkStatus, SinkError> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.flush() {
                tracing::debug!("Encoder stdin flush failed: {}", e);
            }
        }

        let (status, timed_out) = self.wait_bounded()?;

        let diagnostics = self
            .stderr_drain
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let exit_code = status.and_then(|s| s.code());
        let success = !timed_out && status.map(|s| s.success()).unwrap_or(false);

        if success {
            tracing::info!("Encoder finished cleanly");
        } else {
            tracing::warn!(
                "Encoder finished with exit code {:?} (timed out: {})",
                exit_code,
                timed_out
            );
        }

        Ok(SinkStatus {
            exit_code,
            success,
            timed_out,
            diagnostics: diagnostics.trim().to_string(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn tiny_spec() -> StreamSpec {
        StreamSpec::bgra(4, 2, 25.0)
    }

    #[test]
    fn test_webm_command_shape() {
        let spec = StreamSpec::bgra(640, 360, 29.97);
        let cmd = EncoderCommand::webm("ffmpeg", &spec, Path::new("/tmp/out.webm"), 3);
        assert_eq!(cmd.program, "ffmpeg");
        let joined = cmd.args.join(" ");
        assert!(joined.contains("-pix_fmt bgra -s 640x360 -r 29.97 -i -"));
        assert!(joined.contains("-c:v libvpx-vp9 -pix_fmt yuva420p"));
        assert!(joined.contains("-threads 3"));
        assert!(joined.ends_with("-an /tmp/out.webm"));
    }

    #[test]
    fn test_consumer_success() {
        let spec = tiny_spec();
        let cmd = EncoderCommand::new("cat", &[]);
        let mut sink: Box<dyn FrameSink> = Box::new(FfmpegEncoder::start(&cmd, &spec).unwrap());
        let frame = vec![7u8; spec.frame_bytes()];
        for _ in 0..10 {
            sink.write_frame(&frame).unwrap();
        }
        let status = sink.finish().unwrap();
        assert!(status.success);
        assert_eq!(status.exit_code, Some(0));
        assert!(!status.timed_out);
    }

    #[test]
    fn test_geometry_mismatch() {
        let spec = tiny_spec();
        let cmd = EncoderCommand::new("cat", &[]);
        let mut sink = FfmpegEncoder::start(&cmd, &spec).unwrap();
        let err = sink.write_frame(&[0u8; 5]).unwrap_err();
        assert!(matches!(
            err,
            SinkError::Geometry {
                expected: 32,
                actual: 5
            }
        ));
        Box::new(sink).finish().unwrap();
    }

    #[test]
    fn test_early_exit_is_broken_pipe() {
        let spec = StreamSpec::bgra(512, 512, 25.0);
        let cmd = EncoderCommand::new("true", &[]);
        let mut sink = FfmpegEncoder::start(&cmd, &spec).unwrap();
        let frame = vec![0u8; spec.frame_bytes()];

        let mut failure = None;
        for _ in 0..64 {
            if let Err(e) = sink.write_frame(&frame) {
                failure = Some(e);
                break;
            }
        }
        assert!(matches!(failure, Some(SinkError::BrokenPipe(_))));
        let status = Box::new(sink).finish().unwrap();
        assert_eq!(status.exit_code, Some(0));
    }

    #[test]
    fn test_diagnostics_and_exit_code() {
        let cmd = EncoderCommand::new("sh", &["-c", "cat >/dev/null; echo 'bad stream' >&2; exit 3"]);
        let sink = FfmpegEncoder::start(&cmd, &tiny_spec()).unwrap();
        let status = Box::new(sink).finish().unwrap();
        assert!(!status.success);
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(status.diagnostics, "bad stream");
    }

    #[test]
    fn test_hung_encoder_is_killed() {
        let cmd = EncoderCommand::new("sleep", &["5"]);
        let sink = FfmpegEncoder::start_with_timeout(
            &cmd,
            &tiny_spec(),
            Duration::from_millis(200),
        )
        .unwrap();
        let started = Instant::now();
        let status = Box::new(sink).finish().unwrap();
        assert!(status.timed_out);
        assert!(!status.success);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
