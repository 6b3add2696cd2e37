use image::RgbImage;

use crate::detect::annotate::draw_detections;
use crate::detect::backend::PersonDetector;
use crate::detect::result::DetectorOutput;
use crate::error::PipelineResult;

/// Backend without a model. Always ready, never finds anyone.
///
/// Lets the service and the video pipeline run end to end (decode, encode,
/// temp-file handling) on hosts where no model is installed.
pub struct NullBackend;

impl NullBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PersonDetector for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn device(&self) -> &str {
        "cpu"
    }

    fn detect(&self, image: &RgbImage, annotate: bool) -> PipelineResult<DetectorOutput> {
        Ok(DetectorOutput {
            detections: Vec::new(),
            annotated: annotate.then(|| draw_detections(image, &[])),
        })
    }
}
