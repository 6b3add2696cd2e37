//! Local video file decoding with FFmpeg.
//!
//! Frames are decoded in container order and converted to packed RGB24.
//! The demuxer, decoder and scaler are released when the source drops.

use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::{FrameSource, VideoInfo};
use crate::error::{PipelineError, PipelineResult};

pub struct FfmpegSource {
    path: String,
    info: VideoInfo,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
    frames_decoded: u64,
}

impl FfmpegSource {
    pub fn open(path: &str) -> PipelineResult<Self> {
        ffmpeg::init().map_err(|e| PipelineError::open(path, format!("initialize ffmpeg: {e}")))?;
        let input = ffmpeg::format::input(&path).map_err(|e| PipelineError::open(path, e))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| PipelineError::open(path, "file has no video track"))?;
        let stream_index = input_stream.index();

        let rate = input_stream.avg_frame_rate();
        let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
            f64::from(rate)
        } else {
            0.0
        };
        let frame_count_hint = input_stream.frames().max(0) as u64;

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| PipelineError::open(path, format!("load decoder parameters: {e}")))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| PipelineError::open(path, format!("open video decoder: {e}")))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| PipelineError::open(path, format!("create scaler: {e}")))?;

        let info = VideoInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            frame_count_hint,
            codec: decoder
                .codec()
                .map(|codec| codec.name().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        };

        Ok(Self {
            path: path.to_string(),
            info,
            input,
            stream_index,
            decoder,
            scaler,
            eof_sent: false,
            frames_decoded: 0,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> PipelineResult<RgbImage> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .map_err(|e| PipelineError::Decode(format!("scale frame to RGB: {e}")))?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| PipelineError::Decode("decoded frame has wrong buffer size".into()))
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> PipelineResult<Option<RgbImage>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.frames_decoded += 1;
                return self.convert(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    if let Err(err) = self.decoder.send_packet(&packet) {
                        log::warn!(
                            "{}: skipping undecodable packet after frame {}: {}",
                            self.path,
                            self.frames_decoded,
                            err
                        );
                    }
                }
                None => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| PipelineError::Decode(format!("flush decoder: {e}")))?;
                    self.eof_sent = true;
                }
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> PipelineResult<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .ok_or_else(|| PipelineError::Decode("ffmpeg frame is truncated".into()))?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).ok_or_else(|| {
            PipelineError::Decode("ffmpeg frame row is out of bounds".into())
        })?);
    }

    Ok((pixels, width, height))
}
