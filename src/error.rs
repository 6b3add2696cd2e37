//! Error taxonomy for the detection pipeline.
//!
//! Per-frame and per-item failures are recovered where they happen and never
//! reach this type's callers as an `Err`. Everything that does surface here is
//! fatal to a single request only.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Input buffer is not a decodable image or video frame.
    #[error("decode error: {0}")]
    Decode(String),

    /// Detector has no model ready. Callers may retry later.
    #[error("model not loaded")]
    NotLoaded,

    #[error("inference error: {0}")]
    Inference(String),

    #[error("cannot open video '{path}': {reason}")]
    Open { path: String, reason: String },

    #[error("video write error: {0}")]
    Write(String),

    /// Encoder finished but produced a missing or implausibly small file.
    #[error("output video '{}' is {bytes} bytes (minimum {min_bytes})", path.display())]
    OutputTooSmall {
        path: PathBuf,
        bytes: u64,
        min_bytes: u64,
    },

    #[error("no decodable images in request")]
    EmptyInput,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// HTTP status the service answers with for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Decode(_)
            | PipelineError::EmptyInput
            | PipelineError::InvalidArgument(_) => 400,
            PipelineError::NotLoaded => 503,
            _ => 500,
        }
    }

    pub(crate) fn open(path: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::Open {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
