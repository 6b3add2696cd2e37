use image::RgbImage;

use crate::detect::result::DetectorOutput;
use crate::error::PipelineResult;

/// Person detector trait.
///
/// Implementations are shared across batch workers, so `detect` takes `&self`.
/// Backends with mutable inference state guard it internally.
pub trait PersonDetector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Device the model runs on ("cpu", "cuda", ...).
    fn device(&self) -> &str;

    /// Returns false while the backend has no model ready.
    fn is_loaded(&self) -> bool {
        true
    }

    /// Run person detection on one RGB image.
    ///
    /// When `annotate` is true the backend should return a copy of the image
    /// with detections drawn. Backends that cannot annotate return `None`
    /// and callers fall back to the original frame.
    fn detect(&self, image: &RgbImage, annotate: bool) -> PipelineResult<DetectorOutput>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> PipelineResult<()> {
        Ok(())
    }
}
