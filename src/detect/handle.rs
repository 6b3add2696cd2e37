use std::sync::{Arc, RwLock};

use crate::detect::backend::PersonDetector;
use crate::error::{PipelineError, PipelineResult};

/// Shared, explicitly initialised handle to the active detector.
///
/// The handle starts unloaded; `load` installs a backend once the model is
/// ready. Every consumer goes through `detector()`, which fails fast with
/// `NotLoaded` until then. Clones share the same slot.
#[derive(Clone, Default)]
pub struct DetectorHandle {
    slot: Arc<RwLock<Option<Arc<dyn PersonDetector>>>>,
}

impl DetectorHandle {
    pub fn unloaded() -> Self {
        Self::default()
    }

    /// Handle that is ready immediately.
    pub fn with_backend<B: PersonDetector + 'static>(backend: B) -> Self {
        let handle = Self::unloaded();
        handle.install(Arc::new(backend));
        handle
    }

    pub fn with_shared(backend: Arc<dyn PersonDetector>) -> Self {
        let handle = Self::unloaded();
        handle.install(backend);
        handle
    }

    /// Install a backend. Replaces any previously loaded one.
    pub fn load<B: PersonDetector + 'static>(&self, backend: B) {
        self.install(Arc::new(backend));
    }

    pub fn install(&self, backend: Arc<dyn PersonDetector>) {
        log::info!(
            "detector '{}' loaded on {}",
            backend.name(),
            backend.device()
        );
        match self.slot.write() {
            Ok(mut guard) => *guard = Some(backend),
            Err(poisoned) => *poisoned.into_inner() = Some(backend),
        }
    }

    fn current(&self) -> Option<Arc<dyn PersonDetector>> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True when a backend is installed and reports its model ready.
    pub fn is_loaded(&self) -> bool {
        self.current().is_some_and(|backend| backend.is_loaded())
    }

    /// Device of the loaded backend, `None` while unloaded.
    pub fn device(&self) -> Option<String> {
        self.current()
            .filter(|backend| backend.is_loaded())
            .map(|backend| backend.device().to_string())
    }

    /// The ready detector, or `NotLoaded`.
    pub fn detector(&self) -> PipelineResult<Arc<dyn PersonDetector>> {
        match self.current() {
            Some(backend) if backend.is_loaded() => Ok(backend),
            _ => Err(PipelineError::NotLoaded),
        }
    }
}
