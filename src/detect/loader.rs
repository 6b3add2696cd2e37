use std::sync::Arc;

use crate::config::ModelSettings;
use crate::detect::backend::PersonDetector;
use crate::detect::backends::NullBackend;
use crate::error::{PipelineError, PipelineResult};

/// Build the backend named in `settings.backend` and run its warm-up.
pub fn load_configured(settings: &ModelSettings) -> PipelineResult<Arc<dyn PersonDetector>> {
    let backend: Arc<dyn PersonDetector> = match settings.backend.as_str() {
        "null" => Arc::new(NullBackend::new()),
        "tract" => load_tract(settings)?,
        other => {
            return Err(PipelineError::InvalidArgument(format!(
                "unknown detector backend '{other}'"
            )))
        }
    };
    backend.warm_up()?;
    Ok(backend)
}

#[cfg(feature = "backend-tract")]
fn load_tract(settings: &ModelSettings) -> PipelineResult<Arc<dyn PersonDetector>> {
    use crate::detect::backends::TractBackend;

    let backend = TractBackend::new(&settings.path, settings.input_size)?
        .with_threshold(settings.confidence_threshold)
        .with_iou_threshold(settings.iou_threshold);
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn load_tract(_settings: &ModelSettings) -> PipelineResult<Arc<dyn PersonDetector>> {
    Err(PipelineError::InvalidArgument(
        "the tract backend requires the backend-tract feature".into(),
    ))
}
