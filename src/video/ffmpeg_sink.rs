//! Output video encoding through an external ffmpeg process.
//!
//! Frames are streamed as raw RGB24 over stdin at fixed geometry and frame
//! rate. The codec is always explicit; it never follows the source container.
//! yuv420p needs even dimensions, so an odd width or height is cropped by one
//! pixel; the recorded geometry stays the source's.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use image::RgbImage;

use super::FrameSink;
use crate::error::{PipelineError, PipelineResult};

const STDERR_TAIL_CHARS: usize = 500;

pub struct FfmpegSink {
    path: PathBuf,
    width: u32,
    height: u32,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    frames_written: u64,
}

/// Encoder arguments up to, but not including, the output path.
pub(crate) fn encoder_args(width: u32, height: u32, fps: f64, codec: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner", "-loglevel", "error", "-y", "-f", "rawvideo", "-pix_fmt", "rgb24",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend([
        "-s".to_string(),
        format!("{width}x{height}"),
        "-r".to_string(),
        format!("{fps}"),
        "-i".to_string(),
        "-".to_string(),
        "-an".to_string(),
        "-c:v".to_string(),
        codec.to_string(),
    ]);
    if width % 2 == 1 || height % 2 == 1 {
        args.push("-vf".to_string());
        args.push("crop=trunc(iw/2)*2:trunc(ih/2)*2".to_string());
    }
    args.push("-pix_fmt".to_string());
    args.push("yuv420p".to_string());
    args
}

/// Read a pipe to the end, keeping only the trailing diagnostic text.
fn drain_tail<R: Read>(mut pipe: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                // Chars are at most 4 bytes.
                let keep = STDERR_TAIL_CHARS * 4;
                if tail.len() > keep * 2 {
                    tail.drain(..tail.len() - keep);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    let text = String::from_utf8_lossy(&tail);
    let trimmed = text.trim();
    let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    trimmed.chars().skip(skip).collect()
}

impl FfmpegSink {
    /// Spawn the encoder. Fails with `Open` when the binary cannot start.
    pub fn create(
        ffmpeg_bin: &str,
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
        codec: &str,
    ) -> PipelineResult<Self> {
        if width == 0 || height == 0 {
            return Err(PipelineError::open(
                path.display().to_string(),
                "output geometry must be non-zero",
            ));
        }
        let mut cmd = Command::new(ffmpeg_bin);
        cmd.args(encoder_args(width, height, fps, codec))
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::open(
                path.display().to_string(),
                format!("failed to start {ffmpeg_bin}: {e}"),
            )
        })?;
        let stdin = child.stdin.take();
        // Drained concurrently: a full stderr pipe would stall the encoder.
        let stderr = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || drain_tail(pipe)));
        log::debug!(
            "encoder started: {} {}x{} @ {} fps ({})",
            path.display(),
            width,
            height,
            fps,
            codec
        );

        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
            child: Some(child),
            stdin,
            stderr,
            frames_written: 0,
        })
    }

    fn stderr_tail(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default()
    }
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(PipelineError::Write(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Write("encoder already closed".into()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| PipelineError::Write(format!("encoder pipe: {e}")))?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        // Closing stdin signals end of stream.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait()?;
        let detail = self.stderr_tail();
        if !status.success() {
            return Err(PipelineError::Write(format!(
                "encoder for {} exited with {:?}: {}",
                self.path.display(),
                status.code(),
                detail
            )));
        }
        log::debug!(
            "encoder finished: {} ({} frames)",
            self.path.display(),
            self.frames_written
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            // Unfinished encoder: abandoned mid-stream.
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = self.stderr_tail();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = FfmpegSink::create(
            "/nonexistent/ffmpeg-binary",
            &dir.path().join("out.mp4"),
            64,
            48,
            30.0,
            "libx264",
        );
        assert!(matches!(result, Err(PipelineError::Open { .. })));
    }

    #[test]
    fn odd_geometry_is_cropped_to_even() {
        let args = encoder_args(101, 75, 25.0, "libx264");
        let filter = args.iter().position(|a| a == "-vf").map(|i| args[i + 1].as_str());
        assert_eq!(filter, Some("crop=trunc(iw/2)*2:trunc(ih/2)*2"));
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "101x75"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));

        let even = encoder_args(100, 76, 25.0, "mpeg4");
        assert!(!even.iter().any(|a| a == "-vf"));
    }

    #[cfg(unix)]
    fn fake_encoder(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.join("fake-ffmpeg");
        std::fs::write(&bin, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        bin
    }

    #[cfg(unix)]
    #[test]
    fn chatty_encoder_does_not_stall_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_encoder(dir.path(), "head -c 300000 /dev/zero >&2\ncat > /dev/null");
        let out = dir.path().join("out.mp4");
        let bin = bin.to_str().unwrap().to_string();

        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let result = (|| {
                let mut sink = FfmpegSink::create(&bin, &out, 100, 100, 30.0, "libx264")?;
                let frame = RgbImage::new(100, 100);
                for _ in 0..20 {
                    sink.write_frame(&frame)?;
                }
                sink.finish()?;
                Ok::<u64, PipelineError>(sink.frames_written())
            })();
            let _ = tx.send(result.map_err(|e| e.to_string()));
        });

        let written = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("encoder hung");
        assert_eq!(written, Ok(20));
    }

    #[cfg(unix)]
    #[test]
    fn failed_encoder_reports_the_end_of_its_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_encoder(
            dir.path(),
            "head -c 5000 /dev/zero | tr '\\0' x >&2\necho 'Unknown encoder nope' >&2\nexit 3",
        );
        let mut sink = FfmpegSink::create(
            bin.to_str().unwrap(),
            &dir.path().join("out.mp4"),
            8,
            8,
            30.0,
            "nope",
        )
        .unwrap();
        let message = sink.finish().unwrap_err().to_string();
        assert!(message.contains("Unknown encoder nope"));
        assert!(message.contains("Some(3)"));
        assert!(message.len() < 700);
    }

    #[test]
    fn zero_geometry_is_rejected() {
        let result = FfmpegSink::create("ffmpeg", Path::new("out.mp4"), 0, 48, 30.0, "libx264");
        assert!(matches!(result, Err(PipelineError::Open { .. })));
    }
}
