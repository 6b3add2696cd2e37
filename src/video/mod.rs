//! Video container I/O.
//!
//! Sources decode a container into an ordered sequence of RGB frames; sinks
//! append frames to an output stream at fixed geometry. Available sources:
//! - Synthetic `stub://` clips (tests, dry runs)
//! - Local video files (feature: video-ffmpeg)
//!
//! Output video is encoded by an external ffmpeg process (`FfmpegSink`).

mod ffmpeg_sink;
#[cfg(feature = "video-ffmpeg")]
mod ffmpeg_source;
mod synthetic;

use image::RgbImage;

use crate::error::{PipelineError, PipelineResult};

pub use ffmpeg_sink::FfmpegSink;
#[cfg(feature = "video-ffmpeg")]
pub use ffmpeg_source::FfmpegSource;
pub use synthetic::SyntheticSource;

/// Stream parameters reported by the container.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoInfo {
    /// As reported; may be 0 or non-finite for some containers.
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Frame count claimed by the container. Advisory only; may be 0 or wrong.
    pub frame_count_hint: u64,
    pub codec: String,
}

/// Sequential frame reader.
pub trait FrameSource {
    fn info(&self) -> &VideoInfo;

    /// Next decoded frame, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> PipelineResult<Option<RgbImage>>;
}

/// Fixed-geometry frame writer.
pub trait FrameSink {
    /// Append one frame. The frame must match the sink geometry.
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()>;

    /// Flush and close the output. Calling it twice is a no-op.
    fn finish(&mut self) -> PipelineResult<()>;

    fn frames_written(&self) -> u64;
}

/// Open a frame source for `path`.
///
/// `stub://` URLs open a synthetic clip; anything else must be a local file
/// path and needs the `video-ffmpeg` feature.
pub fn open_source(path: &str) -> PipelineResult<Box<dyn FrameSource>> {
    if path.trim().is_empty() {
        return Err(PipelineError::open(path, "empty path"));
    }
    if path.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_url(path)?));
    }
    if path.contains("://") {
        return Err(PipelineError::open(
            path,
            "only local files are supported (no URL schemes)",
        ));
    }
    #[cfg(feature = "video-ffmpeg")]
    {
        Ok(Box::new(FfmpegSource::open(path)?))
    }
    #[cfg(not(feature = "video-ffmpeg"))]
    {
        Err(PipelineError::open(
            path,
            "video decoding requires the video-ffmpeg feature",
        ))
    }
}
