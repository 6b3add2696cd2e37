//! Batch coordinator: many independent images through one detector.
//!
//! Items are decoded up front; undecodable ones never reach a worker and are
//! left out of `results`, counted only in `failed_count` and listed under
//! `skipped`. The rest are dispatched in chunks of `batch_size`. Before every
//! chunk the admission policy picks the worker count. Workers pull positions
//! from a shared queue and each one writes only the result slot of the
//! position it pulled, so results come back in ascending submission index.

mod admission;

use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::unbounded;
use image::RgbImage;
use serde::Serialize;

pub use admission::{AdmissionPolicy, MemoryPressurePolicy, MemoryProbe, SysinfoProbe, Unlimited};

use crate::config::BatchSettings;
use crate::detect::{Detection, DetectorHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::imaging::decode_image;
use crate::single::detect_once;

/// One submitted image.
#[derive(Clone, Debug)]
pub struct BatchItem {
    /// Caller label, usually the file name.
    pub source: String,
    pub bytes: Vec<u8>,
    /// Set when the payload was unusable before it got here (bad transfer
    /// encoding); the item is skipped with this reason.
    pub rejected: Option<String>,
}

impl BatchItem {
    pub fn new(source: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            bytes,
            rejected: None,
        }
    }

    pub fn rejected(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            bytes: Vec::new(),
            rejected: Some(reason.into()),
        }
    }

    fn decode(&self) -> Result<RgbImage, String> {
        match &self.rejected {
            Some(reason) => Err(reason.clone()),
            None => decode_image(&self.bytes).map_err(|err| err.to_string()),
        }
    }
}

/// Bounds and defaults for per-request parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_workers: usize,
    pub max_batch_size: usize,
    pub default_max_workers: usize,
    pub default_batch_size: usize,
}

impl From<&BatchSettings> for BatchLimits {
    fn from(settings: &BatchSettings) -> Self {
        Self {
            max_workers: settings.max_workers,
            max_batch_size: settings.max_batch_size,
            default_max_workers: settings.default_max_workers,
            default_batch_size: settings.default_batch_size,
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::from(&BatchSettings::default())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BatchOptions {
    pub max_workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub annotate: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    #[serde(rename = "filename")]
    pub source: String,
    pub success: bool,
    pub person_count: usize,
    pub persons: Vec<Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_time_ms: Option<f64>,
    #[serde(rename = "annotated_image", skip_serializing_if = "Option::is_none")]
    pub annotated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemResult {
    fn failed(index: usize, source: &str, error: &PipelineError) -> Self {
        Self {
            index,
            source: source.to_string(),
            success: false,
            person_count: 0,
            persons: Vec::new(),
            inference_time_ms: None,
            annotated: None,
            error: Some(error.to_string()),
        }
    }
}

/// An item that never reached a worker.
#[derive(Clone, Debug, Serialize)]
pub struct SkippedItem {
    pub index: usize,
    #[serde(rename = "filename")]
    pub source: String,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchOutcome {
    pub success: bool,
    /// Items that produced a detection result.
    pub total_processed: usize,
    /// Undecodable items plus items whose detection failed.
    pub failed_count: usize,
    /// One entry per decodable item, ascending by `index`.
    pub results: Vec<BatchItemResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedItem>,
}

pub struct BatchCoordinator {
    detector: DetectorHandle,
    limits: BatchLimits,
    policy: Arc<dyn AdmissionPolicy>,
}

impl BatchCoordinator {
    pub fn new(detector: DetectorHandle, limits: BatchLimits) -> Self {
        Self {
            detector,
            limits,
            policy: Arc::new(Unlimited),
        }
    }

    pub fn with_policy<A: AdmissionPolicy + 'static>(mut self, policy: A) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    /// Run detection over `items`.
    ///
    /// Out-of-range parameters are rejected before any work starts.
    /// Fails with `EmptyInput` when no item decodes and `NotLoaded` when the
    /// detector is not ready; per-item failures are reported in the results.
    pub fn run(&self, items: Vec<BatchItem>, options: BatchOptions) -> PipelineResult<BatchOutcome> {
        let max_workers = options.max_workers.unwrap_or(self.limits.default_max_workers);
        let batch_size = options.batch_size.unwrap_or(self.limits.default_batch_size);
        if max_workers == 0 || max_workers > self.limits.max_workers {
            return Err(PipelineError::InvalidArgument(format!(
                "max_workers must be within [1, {}], got {}",
                self.limits.max_workers, max_workers
            )));
        }
        if batch_size == 0 || batch_size > self.limits.max_batch_size {
            return Err(PipelineError::InvalidArgument(format!(
                "batch_size must be within [1, {}], got {}",
                self.limits.max_batch_size, batch_size
            )));
        }
        self.detector.detector()?;

        let mut pending: Vec<(usize, RgbImage)> = Vec::with_capacity(items.len());
        let mut skipped = Vec::new();
        for (index, item) in items.iter().enumerate() {
            match item.decode() {
                Ok(image) => pending.push((index, image)),
                Err(err) => {
                    log::warn!("batch item {} ({}) skipped: {}", index, item.source, err);
                    skipped.push(SkippedItem {
                        index,
                        source: item.source.clone(),
                        error: err,
                    });
                }
            }
        }
        if pending.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        log::info!(
            "batch: {} items ({} decodable), up to {} workers, chunks of {}",
            items.len(),
            pending.len(),
            max_workers,
            batch_size
        );

        let slots: Vec<OnceLock<BatchItemResult>> = pending.iter().map(|_| OnceLock::new()).collect();
        let mut workers = max_workers;
        let mut chunk_start = 0;
        while chunk_start < pending.len() {
            let chunk_end = (chunk_start + batch_size).min(pending.len());
            let chunk = &pending[chunk_start..chunk_end];
            workers = self.policy.admit(workers, max_workers).clamp(1, max_workers);
            self.dispatch(
                chunk,
                &slots[chunk_start..chunk_end],
                workers.min(chunk.len()),
                &items,
                options.annotate,
            );
            chunk_start = chunk_end;
        }

        let results: Vec<BatchItemResult> = slots
            .into_iter()
            .zip(&pending)
            .map(|(slot, (index, _))| {
                slot.into_inner().unwrap_or_else(|| {
                    BatchItemResult::failed(
                        *index,
                        &items[*index].source,
                        &PipelineError::Inference("worker exited before producing a result".into()),
                    )
                })
            })
            .collect();
        let total_processed = results.iter().filter(|r| r.success).count();
        let failed_count = skipped.len() + (results.len() - total_processed);
        log::info!("batch done: {} processed, {} failed", total_processed, failed_count);

        Ok(BatchOutcome {
            success: true,
            total_processed,
            failed_count,
            results,
            skipped,
        })
    }

    fn dispatch(
        &self,
        chunk: &[(usize, RgbImage)],
        slots: &[OnceLock<BatchItemResult>],
        workers: usize,
        items: &[BatchItem],
        annotate: bool,
    ) {
        let (tx, rx) = unbounded::<usize>();
        for position in 0..chunk.len() {
            let _ = tx.send(position);
        }
        drop(tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                scope.spawn(move || {
                    while let Ok(position) = rx.recv() {
                        let (index, image) = &chunk[position];
                        let result = self.detect_item(*index, &items[*index].source, image, annotate);
                        let _ = slots[position].set(result);
                    }
                });
            }
        });
    }

    fn detect_item(&self, index: usize, source: &str, image: &RgbImage, annotate: bool) -> BatchItemResult {
        let detected = detect_once(&self.detector, image, annotate).and_then(|detection| {
            let report = detection.to_report()?;
            Ok((detection, report.annotated_image))
        });
        match detected {
            Ok((detection, annotated)) => BatchItemResult {
                index,
                source: source.to_string(),
                success: true,
                person_count: detection.person_count(),
                persons: detection.persons,
                inference_time_ms: Some(detection.inference_time_ms),
                annotated,
                error: None,
            },
            Err(err) => {
                log::warn!("batch item {} ({}): detection failed: {}", index, source, err);
                BatchItemResult::failed(index, source, &err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, DetectorOutput, NullBackend, PersonDetector};
    use crate::imaging::png_bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Reports as many persons as the image is wide; fails on width 13.
    struct WidthCounter;

    impl PersonDetector for WidthCounter {
        fn name(&self) -> &'static str {
            "width-counter"
        }
        fn device(&self) -> &str {
            "cpu"
        }
        fn detect(&self, image: &RgbImage, _annotate: bool) -> PipelineResult<DetectorOutput> {
            if image.width() == 13 {
                return Err(PipelineError::NotLoaded);
            }
            // Finish out of submission order.
            thread::sleep(Duration::from_millis(u64::from(10 - image.width().min(10)) * 3));
            let detections = (0..image.width())
                .map(|i| Detection::new(BoundingBox::from_corners(i as i32, 0, i as i32 + 1, 1), 0.5))
                .collect();
            Ok(DetectorOutput {
                detections,
                annotated: None,
            })
        }
    }

    fn image_of_width(width: u32) -> Vec<u8> {
        png_bytes(&RgbImage::new(width, 2))
    }

    fn coordinator() -> BatchCoordinator {
        BatchCoordinator::new(DetectorHandle::with_backend(WidthCounter), BatchLimits::default())
    }

    #[test]
    fn results_follow_submission_order() {
        let items: Vec<BatchItem> = (1..=8)
            .map(|w| BatchItem::new(format!("{w}.png"), image_of_width(w)))
            .collect();
        let outcome = coordinator()
            .run(
                items,
                BatchOptions {
                    max_workers: Some(4),
                    batch_size: Some(3),
                    annotate: false,
                },
            )
            .unwrap();

        assert_eq!(outcome.total_processed, 8);
        for (i, result) in outcome.results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert_eq!(result.person_count, i + 1);
            assert_eq!(result.source, format!("{}.png", i + 1));
        }
    }

    #[test]
    fn undecodable_items_are_counted_but_not_listed() {
        let items = vec![
            BatchItem::new("bad-1", b"not an image".to_vec()),
            BatchItem::new("good", image_of_width(2)),
            BatchItem::new("bad-2", Vec::new()),
        ];
        let outcome = coordinator().run(items, BatchOptions::default()).unwrap();
        assert_eq!(outcome.total_processed, 1);
        assert_eq!(outcome.failed_count, 2);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].index, 1);
        assert_eq!(outcome.results[0].source, "good");
        let skipped: Vec<usize> = outcome.skipped.iter().map(|s| s.index).collect();
        assert_eq!(skipped, vec![0, 2]);
    }

    #[test]
    fn mixed_batch_keeps_failed_detection_and_drops_undecodable() {
        let items = vec![
            BatchItem::new("1", image_of_width(1)),
            BatchItem::new("garbage-a", b"GIF89a?".to_vec()),
            BatchItem::new("2", image_of_width(2)),
            BatchItem::new("13", image_of_width(13)),
            BatchItem::new("garbage-b", vec![0; 16]),
            BatchItem::new("4", image_of_width(4)),
            BatchItem::new("5", image_of_width(5)),
        ];
        let outcome = coordinator()
            .run(
                items,
                BatchOptions {
                    max_workers: Some(3),
                    batch_size: Some(2),
                    annotate: false,
                },
            )
            .unwrap();

        assert_eq!(outcome.results.len(), 5);
        let indices: Vec<usize> = outcome.results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 2, 3, 5, 6]);
        assert_eq!(outcome.total_processed, 4);
        assert_eq!(outcome.failed_count, 3);
        assert!(!outcome.results[2].success);
        assert_eq!(outcome.results[2].error.as_deref(), Some("model not loaded"));
        assert_eq!(outcome.results[4].person_count, 5);
    }

    #[test]
    fn rejected_items_keep_their_reason() {
        let items = vec![
            BatchItem::rejected("upload.png", "invalid base64 payload: bad padding"),
            BatchItem::new("ok", image_of_width(1)),
        ];
        let outcome = coordinator().run(items, BatchOptions::default()).unwrap();
        assert_eq!(outcome.failed_count, 1);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.skipped[0].source, "upload.png");
        assert!(outcome.skipped[0].error.contains("invalid base64 payload"));
    }

    #[test]
    fn one_failing_item_leaves_siblings_alone() {
        let items: Vec<BatchItem> = [1, 2, 13, 4, 5]
            .iter()
            .map(|&w| BatchItem::new(format!("{w}"), image_of_width(w)))
            .collect();
        let outcome = coordinator().run(items, BatchOptions::default()).unwrap();
        assert_eq!(outcome.total_processed, 4);
        assert_eq!(outcome.failed_count, 1);
        assert!(!outcome.results[2].success);
        assert_eq!(outcome.results[2].error.as_deref(), Some("model not loaded"));
    }

    #[test]
    fn rejects_out_of_range_parameters_and_empty_input() {
        let coordinator = coordinator();
        let items = vec![BatchItem::new("a", image_of_width(1))];
        for options in [
            BatchOptions { max_workers: Some(11), ..Default::default() },
            BatchOptions { max_workers: Some(0), ..Default::default() },
            BatchOptions { batch_size: Some(101), ..Default::default() },
        ] {
            assert!(matches!(
                coordinator.run(items.clone(), options),
                Err(PipelineError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            coordinator.run(vec![BatchItem::new("x", vec![1, 2, 3])], BatchOptions::default()),
            Err(PipelineError::EmptyInput)
        ));
    }

    #[test]
    fn unloaded_detector_fails_the_request() {
        let coordinator = BatchCoordinator::new(DetectorHandle::unloaded(), BatchLimits::default());
        let items = vec![BatchItem::new("a", image_of_width(1))];
        assert!(matches!(
            coordinator.run(items, BatchOptions::default()),
            Err(PipelineError::NotLoaded)
        ));
    }

    /// Records every admission decision.
    struct RecordingPolicy {
        inner: MemoryPressurePolicy<FixedProbe>,
        seen: Mutex<Vec<usize>>,
    }

    struct FixedProbe(f32);

    impl MemoryProbe for FixedProbe {
        fn used_percent(&self) -> Option<f32> {
            Some(self.0)
        }
    }

    impl AdmissionPolicy for Arc<RecordingPolicy> {
        fn admit(&self, current: usize, requested: usize) -> usize {
            let admitted = self.inner.admit(current, requested);
            self.seen.lock().unwrap().push(admitted);
            admitted
        }
    }

    #[test]
    fn memory_pressure_reduces_workers_for_later_chunks() {
        let policy = Arc::new(RecordingPolicy {
            inner: MemoryPressurePolicy::new(FixedProbe(93.0), 80.0),
            seen: Mutex::new(Vec::new()),
        });
        let coordinator = BatchCoordinator::new(
            DetectorHandle::with_backend(NullBackend::new()),
            BatchLimits::default(),
        )
        .with_policy(Arc::clone(&policy));

        let items: Vec<BatchItem> = (0..12)
            .map(|i| BatchItem::new(format!("{i}"), image_of_width(3)))
            .collect();
        let outcome = coordinator
            .run(
                items,
                BatchOptions {
                    max_workers: Some(8),
                    batch_size: Some(4),
                    annotate: true,
                },
            )
            .unwrap();

        assert_eq!(outcome.total_processed, 12);
        assert_eq!(*policy.seen.lock().unwrap(), vec![4, 2, 1]);
        assert!(outcome.results.iter().all(|r| r.annotated.is_some()));
    }
}
