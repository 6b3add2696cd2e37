//! Synthetic `stub://` clips.
//!
//! `stub://name?frames=30&fps=10&width=64&height=48&hint=30` yields `frames`
//! deterministic RGB frames. `hint` overrides the advertised frame count so
//! callers can exercise wrong or missing container metadata; `fps=0` models
//! a container without a usable frame rate.

use image::{Rgb, RgbImage};

use super::{FrameSource, VideoInfo};
use crate::error::{PipelineError, PipelineResult};

const DEFAULT_FRAMES: u64 = 30;
const DEFAULT_FPS: f64 = 10.0;
const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

pub struct SyntheticSource {
    info: VideoInfo,
    frames: u64,
    next_index: u64,
}

impl SyntheticSource {
    pub fn new(frames: u64, fps: f64, width: u32, height: u32) -> Self {
        Self {
            info: VideoInfo {
                fps,
                width,
                height,
                frame_count_hint: frames,
                codec: "rawvideo".to_string(),
            },
            frames,
            next_index: 0,
        }
    }

    /// Advertise a frame count different from what the clip really holds.
    pub fn with_hint(mut self, hint: u64) -> Self {
        self.info.frame_count_hint = hint;
        self
    }

    pub fn from_url(url: &str) -> PipelineResult<Self> {
        let rest = url
            .strip_prefix("stub://")
            .ok_or_else(|| PipelineError::open(url, "not a stub:// url"))?;
        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");

        let mut frames = DEFAULT_FRAMES;
        let mut fps = DEFAULT_FPS;
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut hint = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PipelineError::open(url, format!("malformed parameter '{pair}'")))?;
            let bad = || PipelineError::open(url, format!("invalid value for '{key}'"));
            match key {
                "frames" => frames = value.parse().map_err(|_| bad())?,
                "fps" => fps = value.parse().map_err(|_| bad())?,
                "width" => width = value.parse().map_err(|_| bad())?,
                "height" => height = value.parse().map_err(|_| bad())?,
                "hint" => hint = Some(value.parse().map_err(|_| bad())?),
                _ => return Err(PipelineError::open(url, format!("unknown parameter '{key}'"))),
            }
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::open(url, "frame size must be non-zero"));
        }

        let source = Self::new(frames, fps, width, height);
        Ok(match hint {
            Some(hint) => source.with_hint(hint),
            None => source,
        })
    }

    fn render(&self, index: u64) -> RgbImage {
        let shade = (index.wrapping_mul(37) % 256) as u8;
        RgbImage::from_fn(self.info.width, self.info.height, |x, y| {
            Rgb([shade, (x % 256) as u8, (y % 256) as u8])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> PipelineResult<Option<RgbImage>> {
        if self.next_index >= self.frames {
            return Ok(None);
        }
        let frame = self.render(self.next_index);
        self.next_index += 1;
        Ok(Some(frame))
    }
}
