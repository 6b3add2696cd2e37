//! Person Sentry
//!
//! Person detection over still images, video files, live frame streams and
//! image batches, served over HTTP/WebSocket or run offline.
//!
//! # Module Structure
//!
//! - `detect`: detector port, detection data model, readiness handle, backends
//! - `single`: one detector call on one image (also used by `live`)
//! - `video` / `pipeline`: decode → detect → encode over a video file
//! - `batch`: bounded worker pool over many images
//! - `api`: HTTP service surface
//! - `config`, `error`, `imaging`, `ui`: ambient support

pub mod api;
pub mod batch;
pub mod config;
pub mod detect;
pub mod error;
pub mod imaging;
pub mod live;
pub mod pipeline;
pub mod single;
pub mod ui;
pub mod video;

pub use batch::{BatchCoordinator, BatchItem, BatchLimits, BatchOptions, BatchOutcome, SkippedItem};
pub use config::SentryConfig;
pub use detect::{BoundingBox, Detection, DetectorHandle, NullBackend, PersonDetector};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{FramePipeline, FrameResult, VideoSummary};
pub use single::{detect_bytes, detect_once, ImageDetection};
