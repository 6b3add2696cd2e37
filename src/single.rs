//! Single-image detection.
//!
//! One synchronous detector call per image. The live-frame path reuses this
//! for every inbound frame.

use std::time::Instant;

use image::RgbImage;
use serde::Serialize;

use crate::detect::{draw_detections, Detection, DetectorHandle};
use crate::error::PipelineResult;
use crate::imaging::{decode_image, jpeg_data_uri};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ImageShape {
    pub height: u32,
    pub width: u32,
}

/// Detection result for one image.
#[derive(Clone, Debug)]
pub struct ImageDetection {
    pub persons: Vec<Detection>,
    pub inference_time_ms: f64,
    pub image_shape: ImageShape,
    /// Present whenever annotation was requested, even with zero persons.
    pub annotated: Option<RgbImage>,
}

impl ImageDetection {
    pub fn person_count(&self) -> usize {
        self.persons.len()
    }

    /// Wire form; the annotated copy becomes a JPEG data URI.
    pub fn to_report(&self) -> PipelineResult<ImageDetectionReport> {
        let annotated_image = match &self.annotated {
            Some(image) => Some(jpeg_data_uri(image)?),
            None => None,
        };
        Ok(ImageDetectionReport {
            success: true,
            person_count: self.person_count(),
            persons: self.persons.clone(),
            inference_time_ms: self.inference_time_ms,
            image_shape: self.image_shape,
            annotated_image,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ImageDetectionReport {
    pub success: bool,
    pub person_count: usize,
    pub persons: Vec<Detection>,
    pub inference_time_ms: f64,
    pub image_shape: ImageShape,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<String>,
}

/// Run the detector once on a decoded image.
///
/// Fails with `NotLoaded` before touching the image when no model is ready.
pub fn detect_once(
    detector: &DetectorHandle,
    image: &RgbImage,
    annotate: bool,
) -> PipelineResult<ImageDetection> {
    let backend = detector.detector()?;
    let started = Instant::now();
    let output = backend.detect(image, annotate)?;
    let inference_time_ms = round2(started.elapsed().as_secs_f64() * 1000.0);

    let annotated = if annotate {
        Some(
            output
                .annotated
                .unwrap_or_else(|| draw_detections(image, &output.detections)),
        )
    } else {
        None
    };

    Ok(ImageDetection {
        persons: output.detections,
        inference_time_ms,
        image_shape: ImageShape {
            height: image.height(),
            width: image.width(),
        },
        annotated,
    })
}

/// Decode an encoded image buffer and run `detect_once` on it.
pub fn detect_bytes(
    detector: &DetectorHandle,
    bytes: &[u8],
    annotate: bool,
) -> PipelineResult<ImageDetection> {
    detector.detector()?;
    let image = decode_image(bytes)?;
    detect_once(detector, &image, annotate)
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, DetectorOutput, NullBackend, PersonDetector};
    use crate::error::PipelineError;
    use crate::imaging::png_bytes;
    use image::Rgb;

    struct OnePerson;

    impl PersonDetector for OnePerson {
        fn name(&self) -> &'static str {
            "one-person"
        }
        fn device(&self) -> &str {
            "cpu"
        }
        fn detect(&self, _image: &RgbImage, _annotate: bool) -> PipelineResult<DetectorOutput> {
            Ok(DetectorOutput {
                detections: vec![Detection::new(BoundingBox::from_corners(1, 1, 6, 6), 0.8)],
                annotated: None,
            })
        }
    }

    #[test]
    fn annotate_always_returns_a_copy() {
        let handle = DetectorHandle::with_backend(NullBackend::new());
        let image = RgbImage::from_pixel(10, 6, Rgb([5, 5, 5]));
        let result = detect_once(&handle, &image, true).unwrap();
        assert_eq!(result.person_count(), 0);
        assert_eq!(result.annotated.as_ref(), Some(&image));
        assert_eq!(
            result.image_shape,
            ImageShape {
                height: 6,
                width: 10
            }
        );

        let plain = detect_once(&handle, &image, false).unwrap();
        assert!(plain.annotated.is_none());
    }

    #[test]
    fn boxes_are_drawn_when_backend_does_not_annotate() {
        let handle = DetectorHandle::with_backend(OnePerson);
        let image = RgbImage::from_pixel(10, 10, Rgb([0, 0, 0]));
        let result = detect_once(&handle, &image, true).unwrap();
        assert_eq!(result.person_count(), 1);
        assert_ne!(result.annotated.as_ref(), Some(&image));

        let report = result.to_report().unwrap();
        assert!(report.success);
        assert!(report
            .annotated_image
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn unloaded_detector_and_bad_bytes() {
        let unloaded = DetectorHandle::unloaded();
        let png = png_bytes(&RgbImage::new(2, 2));
        assert!(matches!(
            detect_bytes(&unloaded, &png, false),
            Err(PipelineError::NotLoaded)
        ));

        let loaded = DetectorHandle::with_backend(NullBackend::new());
        assert!(matches!(
            detect_bytes(&loaded, b"garbage", false),
            Err(PipelineError::Decode(_))
        ));
        assert_eq!(detect_bytes(&loaded, &png, false).unwrap().person_count(), 0);
    }

    #[test]
    fn report_omits_missing_annotation() {
        let handle = DetectorHandle::with_backend(NullBackend::new());
        let result = detect_once(&handle, &RgbImage::new(2, 2), false).unwrap();
        let json = serde_json::to_value(result.to_report().unwrap()).unwrap();
        assert!(json.get("annotated_image").is_none());
        assert_eq!(json["person_count"], 0);
        assert_eq!(json["image_shape"]["width"], 2);
    }
}
