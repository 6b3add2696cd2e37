//! Person detection port.
//!
//! `PersonDetector` is the seam between the pipelines and an inference
//! backend. Consumers never hold a backend directly; they go through a
//! `DetectorHandle`, which reports readiness and fails with `NotLoaded`
//! until a model is installed.

mod annotate;
mod backend;
mod backends;
mod handle;
mod loader;
mod result;

pub use annotate::draw_detections;
pub use backend::PersonDetector;
pub use backends::NullBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use handle::DetectorHandle;
pub use loader::load_configured;
pub use result::{BoundingBox, Detection, DetectorOutput};
