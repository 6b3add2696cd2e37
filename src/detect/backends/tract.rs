#![cfg(feature = "backend-tract")]

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::annotate::draw_detections;
use crate::detect::backend::PersonDetector;
use crate::detect::result::{BoundingBox, Detection, DetectorOutput};
use crate::error::{PipelineError, PipelineResult};

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// COCO class index of "person".
const PERSON_CLASS: usize = 0;
/// Box coordinates (cx, cy, w, h) precede class scores in each anchor column.
const BOX_FEATURES: usize = 4;

/// Tract-based YOLOv8 person detector.
///
/// Loads a local ONNX export once at construction. Inference runs on the
/// CPU; the compiled plan is immutable, so one instance serves all workers.
pub struct TractBackend {
    model: Plan,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> PipelineResult<Self> {
        let model_path = model_path.as_ref();
        let load_err = |stage: &str, err: TractError| {
            PipelineError::Inference(format!(
                "{stage} for {}: {err}",
                model_path.display()
            ))
        };
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| load_err("failed to load ONNX model", e))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .map_err(|e| load_err("failed to set input fact", e))?
            .into_optimized()
            .map_err(|e| load_err("failed to optimize ONNX model", e))?
            .into_runnable()
            .map_err(|e| load_err("failed to build runnable ONNX model", e))?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            f32::from(resized.get_pixel(x as u32, y as u32)[c]) / 255.0
        });
        input.into_tensor()
    }

    fn extract_persons(
        &self,
        outputs: TVec<TValue>,
        source_width: u32,
        source_height: u32,
    ) -> PipelineResult<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| PipelineError::Inference("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| PipelineError::Inference(format!("output tensor was not f32: {e}")))?;
        let shape = view.shape();
        if shape.len() != 3 || shape[1] <= BOX_FEATURES + PERSON_CLASS {
            return Err(PipelineError::Inference(format!(
                "unexpected YOLO output shape {:?}",
                shape
            )));
        }

        let anchors = shape[2];
        let scale_x = source_width as f32 / self.input_size as f32;
        let scale_y = source_height as f32 / self.input_size as f32;
        let mut candidates = Vec::new();

        for anchor in 0..anchors {
            let score = view[[0, BOX_FEATURES + PERSON_CLASS, anchor]];
            if score < self.confidence_threshold {
                continue;
            }
            let cx = view[[0, 0, anchor]];
            let cy = view[[0, 1, anchor]];
            let w = view[[0, 2, anchor]];
            let h = view[[0, 3, anchor]];
            let x1 = ((cx - w / 2.0) * scale_x).clamp(0.0, source_width as f32);
            let y1 = ((cy - h / 2.0) * scale_y).clamp(0.0, source_height as f32);
            let x2 = ((cx + w / 2.0) * scale_x).clamp(0.0, source_width as f32);
            let y2 = ((cy + h / 2.0) * scale_y).clamp(0.0, source_height as f32);
            candidates.push(Detection::new(
                BoundingBox::from_f32_corners(x1, y1, x2, y2),
                score,
            ));
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Greedy NMS, highest confidence first.
pub(crate) fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep
            .iter()
            .all(|kept| kept.bbox.iou(&candidate.bbox) < iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

impl PersonDetector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn device(&self) -> &str {
        "cpu"
    }

    fn detect(&self, image: &RgbImage, annotate: bool) -> PipelineResult<DetectorOutput> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| PipelineError::Inference(format!("ONNX inference failed: {e}")))?;
        let detections = self.extract_persons(outputs, image.width(), image.height())?;
        let annotated = annotate.then(|| draw_detections(image, &detections));
        Ok(DetectorOutput {
            detections,
            annotated,
        })
    }
}
