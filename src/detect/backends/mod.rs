pub mod null;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use null::NullBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
