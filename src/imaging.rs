//! Image buffer helpers shared by the single-image, live and batch paths.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::error::{PipelineError, PipelineResult};

const JPEG_QUALITY: u8 = 90;

/// Decode an encoded image (JPEG, PNG) into RGB pixels.
pub fn decode_image(bytes: &[u8]) -> PipelineResult<RgbImage> {
    if bytes.is_empty() {
        return Err(PipelineError::Decode("empty image buffer".into()));
    }
    let image = image::load_from_memory(bytes)
        .map_err(|e| PipelineError::Decode(format!("invalid image file: {e}")))?;
    Ok(image.to_rgb8())
}

pub fn encode_jpeg(image: &RgbImage) -> PipelineResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|e| PipelineError::Write(format!("jpeg encode failed: {e}")))?;
    Ok(out.into_inner())
}

/// JPEG-encode and wrap as a `data:image/jpeg;base64,` URI.
pub fn jpeg_data_uri(image: &RgbImage) -> PipelineResult<String> {
    let jpeg = encode_jpeg(image)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}

/// Decode a base64 payload, accepting both bare base64 and data URIs.
pub fn decode_base64_payload(payload: &str) -> PipelineResult<Vec<u8>> {
    let encoded = match payload.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| PipelineError::Decode(format!("invalid base64 payload: {e}")))
}

#[cfg(test)]
pub(crate) fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("png encode");
    out.into_inner()
}
