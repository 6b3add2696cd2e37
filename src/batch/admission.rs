//! Worker admission for batch dispatch.
//!
//! The coordinator asks the policy for a worker count before every chunk.
//! Memory readings only influence chunks that have not started yet.

use std::sync::Mutex;

use sysinfo::System;

/// Decides how many workers the next chunk may use.
pub trait AdmissionPolicy: Send + Sync {
    /// `current` is the count used for the previous chunk (the requested
    /// maximum for the first one). The result is clamped to
    /// `[1, requested]` by the caller.
    fn admit(&self, current: usize, requested: usize) -> usize;
}

/// Always admits the requested maximum.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unlimited;

impl AdmissionPolicy for Unlimited {
    fn admit(&self, _current: usize, requested: usize) -> usize {
        requested
    }
}

/// Source of system memory usage.
pub trait MemoryProbe: Send + Sync {
    /// Used memory as a percentage of total, `None` when unavailable.
    fn used_percent(&self) -> Option<f32>;
}

pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn used_percent(&self) -> Option<f32> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some(system.used_memory() as f32 / total as f32 * 100.0)
    }
}

/// Halves the worker count while memory usage is above the threshold.
///
/// Below the threshold the requested maximum is restored. Never admits
/// fewer than one worker.
pub struct MemoryPressurePolicy<P = SysinfoProbe> {
    probe: P,
    threshold_percent: f32,
}

impl<P: MemoryProbe> MemoryPressurePolicy<P> {
    pub fn new(probe: P, threshold_percent: f32) -> Self {
        Self {
            probe,
            threshold_percent,
        }
    }
}

impl MemoryPressurePolicy<SysinfoProbe> {
    pub fn system(threshold_percent: f32) -> Self {
        Self::new(SysinfoProbe::new(), threshold_percent)
    }
}

impl<P: MemoryProbe> AdmissionPolicy for MemoryPressurePolicy<P> {
    fn admit(&self, current: usize, requested: usize) -> usize {
        match self.probe.used_percent() {
            Some(used) if used > self.threshold_percent => {
                let reduced = (current / 2).max(1);
                log::warn!(
                    "memory usage {:.1}% above {:.1}%, reducing batch workers {} -> {}",
                    used,
                    self.threshold_percent,
                    current,
                    reduced
                );
                reduced
            }
            Some(_) => requested,
            None => current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed series of readings.
    struct ScriptedProbe {
        readings: Vec<Option<f32>>,
        next: AtomicUsize,
    }

    impl MemoryProbe for ScriptedProbe {
        fn used_percent(&self) -> Option<f32> {
            let i = self.next.fetch_add(1, Ordering::SeqCst);
            self.readings.get(i).copied().flatten()
        }
    }

    fn probe(readings: Vec<Option<f32>>) -> ScriptedProbe {
        ScriptedProbe {
            readings,
            next: AtomicUsize::new(0),
        }
    }

    #[test]
    fn halves_under_pressure_with_floor_of_one() {
        let policy = MemoryPressurePolicy::new(probe(vec![Some(95.0); 4]), 80.0);
        assert_eq!(policy.admit(8, 8), 4);
        assert_eq!(policy.admit(4, 8), 2);
        assert_eq!(policy.admit(2, 8), 1);
        assert_eq!(policy.admit(1, 8), 1);
    }

    #[test]
    fn recovers_to_requested_and_ignores_missing_readings() {
        let policy = MemoryPressurePolicy::new(probe(vec![Some(50.0), None]), 80.0);
        assert_eq!(policy.admit(2, 6), 6);
        assert_eq!(policy.admit(3, 6), 3);
    }

    #[test]
    fn unlimited_passes_through() {
        assert_eq!(Unlimited.admit(1, 7), 7);
    }
}
