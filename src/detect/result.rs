use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned box in source pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    /// Build a box from two corners. Corners are reordered so `x2 >= x1` and
    /// `y2 >= y1` always hold.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let (x1, x2) = if x2 < x1 { (x2, x1) } else { (x1, x2) };
        let (y1, y2) = if y2 < y1 { (y2, y1) } else { (y1, y2) };
        Self {
            x1,
            y1,
            x2,
            y2,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Truncating conversion from model-space float corners.
    pub fn from_f32_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::from_corners(x1 as i32, y1 as i32, x2 as i32, y2 as i32)
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width) * i64::from(self.height)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        let inter = i64::from(ix2 - ix1) * i64::from(iy2 - iy1);
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

/// One detected person.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Held as f64 so the rounded value serializes as written (0.9, not
    /// 0.8999999761581421).
    pub confidence: f64,
}

impl Detection {
    /// Confidence is clamped to [0, 1] and rounded to three decimals.
    pub fn new(bbox: BoundingBox, confidence: f32) -> Self {
        let confidence = (f64::from(confidence.clamp(0.0, 1.0)) * 1000.0).round() / 1000.0;
        Self { bbox, confidence }
    }
}

/// What a detector hands back for one image.
#[derive(Clone, Debug, Default)]
pub struct DetectorOutput {
    pub detections: Vec<Detection>,
    /// Copy of the input with boxes drawn, when the caller asked for one and
    /// the backend supports it.
    pub annotated: Option<RgbImage>,
}

impl DetectorOutput {
    pub fn person_count(&self) -> usize {
        self.detections.len()
    }
}
