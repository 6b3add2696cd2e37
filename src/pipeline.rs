//! Frame pipeline: decode → detect → encode, strictly in frame order.
//!
//! The per-frame loop is a fold over the decoded sequence. A detector failure
//! at frame `i` is recorded as a zero-detection frame plus an entry in the
//! failure list; it never stops the fold. Every decoded frame is written to
//! the output exactly once, whether or not it produced detections, so the
//! output video keeps the source frame count and timing.
//!
//! Only frames with at least one person are kept in the result list.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;

use crate::config::VideoSettings;
use crate::detect::{Detection, DetectorHandle, PersonDetector};
use crate::error::{PipelineError, PipelineResult};
use crate::single::round2;
use crate::video::{open_source, FfmpegSink, FrameSink, FrameSource, VideoInfo};

const PROGRESS_EVERY: u64 = 30;

/// Detection record for one frame with at least one person.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameResult {
    #[serde(rename = "frame")]
    pub frame_index: u64,
    #[serde(rename = "timestamp")]
    pub timestamp_seconds: f64,
    pub person_count: usize,
    #[serde(rename = "persons")]
    pub detections: Vec<Detection>,
}

/// A frame whose detector call failed. It still counts as processed and is
/// still written to the output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameFailure {
    pub frame: u64,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// State of the encoded output after the encoder closed.
#[derive(Clone, Debug, PartialEq)]
pub enum OutputReport {
    Ready { path: PathBuf, bytes: u64 },
    /// Missing (`bytes == 0`) or implausibly small.
    TooSmall {
        path: PathBuf,
        bytes: u64,
        min_bytes: u64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct VideoSummary {
    /// Frame count advertised by the container; may differ from reality.
    pub total_frames: u64,
    pub processed_frames: u64,
    pub fps: f64,
    pub duration: f64,
    pub resolution: Resolution,
    pub frames_with_detection: usize,
    pub frames: Vec<FrameResult>,
    pub detection_failures: Vec<FrameFailure>,
    #[serde(skip)]
    pub output: Option<OutputReport>,
}

impl VideoSummary {
    /// Path of a usable output video, or `OutputTooSmall`.
    pub fn require_output(&self) -> PipelineResult<&Path> {
        match &self.output {
            Some(OutputReport::Ready { path, .. }) => Ok(path),
            Some(OutputReport::TooSmall {
                path,
                bytes,
                min_bytes,
            }) => Err(PipelineError::OutputTooSmall {
                path: path.clone(),
                bytes: *bytes,
                min_bytes: *min_bytes,
            }),
            None => Err(PipelineError::InvalidArgument(
                "no output video was requested".into(),
            )),
        }
    }
}

/// Accumulated outputs and errors of the per-frame fold.
#[derive(Clone, Debug, Default)]
pub struct FrameFold {
    pub processed: u64,
    pub results: Vec<FrameResult>,
    pub failures: Vec<FrameFailure>,
}

pub struct FramePipeline {
    detector: DetectorHandle,
    settings: VideoSettings,
}

impl FramePipeline {
    pub fn new(detector: DetectorHandle, settings: VideoSettings) -> Self {
        Self { detector, settings }
    }

    /// Process `source_path`, optionally encoding an annotated copy to
    /// `output_path`.
    pub fn process(
        &self,
        source_path: &str,
        output_path: Option<&Path>,
    ) -> PipelineResult<VideoSummary> {
        self.process_with_progress(source_path, output_path, |_, _| {})
    }

    /// Like `process`, calling `progress(processed, frame_count_hint)` after
    /// every frame.
    pub fn process_with_progress<F>(
        &self,
        source_path: &str,
        output_path: Option<&Path>,
        progress: F,
    ) -> PipelineResult<VideoSummary>
    where
        F: FnMut(u64, u64),
    {
        let detector = self.detector.detector()?;
        let mut source = open_source(source_path)?;
        let info = source.info().clone();
        let fps = self.effective_fps(&info);
        log::info!(
            "processing video {}: {}x{} @ {} fps, {} frames advertised, codec {}",
            source_path,
            info.width,
            info.height,
            fps,
            info.frame_count_hint,
            info.codec
        );

        let mut sink = match output_path {
            Some(path) => Some(FfmpegSink::create(
                &self.settings.ffmpeg_bin,
                path,
                info.width,
                info.height,
                fps,
                &self.settings.codec,
            )?),
            None => None,
        };

        let fold = run_frames(
            detector.as_ref(),
            source.as_mut(),
            sink.as_mut().map(|s| s as &mut dyn FrameSink),
            fps,
            progress,
        )?;
        drop(source);

        let output = match (sink.as_mut(), output_path) {
            (Some(sink), Some(path)) => {
                sink.finish()?;
                Some(check_output(path, self.settings.min_output_bytes))
            }
            _ => None,
        };

        let summary = summarize(&info, fps, fold, output);
        log::info!(
            "video done: {} frames processed, {} with persons, {} detector failures",
            summary.processed_frames,
            summary.frames_with_detection,
            summary.detection_failures.len()
        );
        Ok(summary)
    }

    /// Container fps, or the configured default when it is zero or unreadable.
    pub fn effective_fps(&self, info: &VideoInfo) -> f64 {
        if info.fps.is_finite() && info.fps > 0.0 {
            info.fps
        } else {
            self.settings.default_fps
        }
    }
}

/// Fold over every frame of `source` until the decoder is exhausted.
///
/// The advertised frame count is never used for termination.
pub fn run_frames<F>(
    detector: &dyn PersonDetector,
    source: &mut dyn FrameSource,
    mut sink: Option<&mut dyn FrameSink>,
    fps: f64,
    mut progress: F,
) -> PipelineResult<FrameFold>
where
    F: FnMut(u64, u64),
{
    let (width, height) = (source.info().width, source.info().height);
    let hint = source.info().frame_count_hint;
    let annotate = sink.is_some();
    let mut fold = FrameFold::default();

    while let Some(frame) = source.next_frame()? {
        let index = fold.processed;
        let (detections, annotated) = match detector.detect(&frame, annotate) {
            Ok(output) => (output.detections, output.annotated),
            Err(err) => {
                log::warn!("frame {}: detection failed, recording no persons: {}", index, err);
                fold.failures.push(FrameFailure {
                    frame: index,
                    reason: err.to_string(),
                });
                (Vec::new(), None)
            }
        };

        if let Some(sink) = sink.as_deref_mut() {
            let out = annotated.as_ref().unwrap_or(&frame);
            sink.write_frame(&fit_frame(out, width, height))?;
        }

        if !detections.is_empty() {
            fold.results.push(FrameResult {
                frame_index: index,
                timestamp_seconds: round2(index as f64 / fps),
                person_count: detections.len(),
                detections,
            });
        }

        fold.processed += 1;
        if fold.processed % PROGRESS_EVERY == 0 {
            log::debug!("progress: {}/{} frames", fold.processed, hint);
        }
        progress(fold.processed, hint);
    }

    Ok(fold)
}

/// Resize to the output geometry when the frame does not already match.
fn fit_frame(frame: &RgbImage, width: u32, height: u32) -> Cow<'_, RgbImage> {
    if frame.dimensions() == (width, height) {
        Cow::Borrowed(frame)
    } else {
        Cow::Owned(imageops::resize(frame, width, height, FilterType::Triangle))
    }
}

/// Post-condition on the encoded file.
pub fn check_output(path: &Path, min_bytes: u64) -> OutputReport {
    let bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if bytes >= min_bytes && bytes > 0 {
        OutputReport::Ready {
            path: path.to_path_buf(),
            bytes,
        }
    } else {
        log::warn!(
            "output video {} is {} bytes, below the {} byte minimum",
            path.display(),
            bytes,
            min_bytes
        );
        OutputReport::TooSmall {
            path: path.to_path_buf(),
            bytes,
            min_bytes,
        }
    }
}

fn summarize(info: &VideoInfo, fps: f64, fold: FrameFold, output: Option<OutputReport>) -> VideoSummary {
    VideoSummary {
        total_frames: info.frame_count_hint,
        processed_frames: fold.processed,
        fps,
        duration: round2(fold.processed as f64 / fps),
        resolution: Resolution {
            width: info.width,
            height: info.height,
        },
        frames_with_detection: fold.results.len(),
        frames: fold.results,
        detection_failures: fold.failures,
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, DetectorOutput, NullBackend};
    use crate::video::SyntheticSource;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Finds one person on frame 1 only; fails on frames listed in `fail_on`.
    struct ScriptedDetector {
        calls: AtomicU64,
        fail_on: Vec<u64>,
        annotate_size: Option<(u32, u32)>,
    }

    impl ScriptedDetector {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_on: Vec::new(),
                annotate_size: None,
            }
        }
    }

    impl PersonDetector for ScriptedDetector {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn device(&self) -> &str {
            "cpu"
        }
        fn detect(&self, image: &RgbImage, annotate: bool) -> PipelineResult<DetectorOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&call) {
                return Err(PipelineError::Inference(format!("frame {call} exploded")));
            }
            let detections = if call == 1 {
                vec![Detection::new(BoundingBox::from_corners(10, 10, 50, 90), 0.9)]
            } else {
                Vec::new()
            };
            let annotated = match (annotate, self.annotate_size) {
                (true, Some((w, h))) => Some(RgbImage::new(w, h)),
                (true, None) => Some(image.clone()),
                (false, _) => None,
            };
            Ok(DetectorOutput {
                detections,
                annotated,
            })
        }
    }

    #[derive(Default)]
    struct MemorySink {
        frames: Vec<RgbImage>,
    }

    impl FrameSink for MemorySink {
        fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()> {
            self.frames.push(frame.clone());
            Ok(())
        }
        fn finish(&mut self) -> PipelineResult<()> {
            Ok(())
        }
        fn frames_written(&self) -> u64 {
            self.frames.len() as u64
        }
    }

    fn settings() -> VideoSettings {
        VideoSettings::default()
    }

    #[test]
    fn three_frame_scenario() {
        let pipeline = FramePipeline::new(
            DetectorHandle::with_backend(ScriptedDetector::new()),
            settings(),
        );
        let summary = pipeline
            .process("stub://scenario?frames=3&fps=10&width=100&height=100", None)
            .unwrap();

        assert_eq!(summary.processed_frames, 3);
        assert_eq!(summary.frames_with_detection, 1);
        assert_eq!(summary.duration, 0.3);
        assert_eq!(summary.fps, 10.0);
        assert!(summary.output.is_none());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            json["frames"],
            serde_json::json!([{
                "frame": 1,
                "timestamp": 0.1,
                "person_count": 1,
                "persons": [{
                    "bbox": {"x1": 10, "y1": 10, "x2": 50, "y2": 90, "width": 40, "height": 80},
                    "confidence": 0.9
                }]
            }])
        );
        assert_eq!(json["resolution"], serde_json::json!({"width": 100, "height": 100}));
    }

    #[test]
    fn every_frame_is_written_even_without_detections() {
        let detector = ScriptedDetector::new();
        let mut source = SyntheticSource::new(7, 10.0, 16, 12);
        let mut sink = MemorySink::default();
        let fold = run_frames(&detector, &mut source, Some(&mut sink), 10.0, |_, _| {}).unwrap();

        assert_eq!(fold.processed, 7);
        assert_eq!(sink.frames_written(), 7);
        assert_eq!(fold.results.len(), 1);
    }

    #[test]
    fn detector_failure_does_not_stop_the_fold() {
        let mut detector = ScriptedDetector::new();
        detector.fail_on = vec![0, 1];
        let mut source = SyntheticSource::new(4, 10.0, 8, 8);
        let mut sink = MemorySink::default();
        let fold = run_frames(&detector, &mut source, Some(&mut sink), 10.0, |_, _| {}).unwrap();

        assert_eq!(fold.processed, 4);
        assert_eq!(sink.frames.len(), 4);
        assert!(fold.results.is_empty());
        assert_eq!(
            fold.failures.iter().map(|f| f.frame).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn mismatched_annotations_are_resized() {
        let mut detector = ScriptedDetector::new();
        detector.annotate_size = Some((5, 3));
        let mut source = SyntheticSource::new(2, 10.0, 20, 10);
        let mut sink = MemorySink::default();
        run_frames(&detector, &mut source, Some(&mut sink), 10.0, |_, _| {}).unwrap();

        assert!(sink.frames.iter().all(|f| f.dimensions() == (20, 10)));
    }

    #[test]
    fn wrong_hint_and_zero_fps_are_tolerated() {
        let pipeline = FramePipeline::new(DetectorHandle::with_backend(NullBackend::new()), settings());
        let summary = pipeline
            .process("stub://odd?frames=5&hint=2&fps=0", None)
            .unwrap();
        assert_eq!(summary.processed_frames, 5);
        assert_eq!(summary.total_frames, 2);
        assert_eq!(summary.fps, 30.0);
        assert_eq!(summary.duration, round2(5.0 / 30.0));
    }

    #[test]
    fn reruns_are_deterministic() {
        let run = || {
            let pipeline = FramePipeline::new(
                DetectorHandle::with_backend(ScriptedDetector::new()),
                settings(),
            );
            pipeline
                .process("stub://again?frames=4&fps=10", None)
                .unwrap()
                .frames
                .iter()
                .map(|f| (f.frame_index, f.person_count))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn progress_reports_every_frame() {
        let detector = NullBackend::new();
        let mut source = SyntheticSource::new(3, 10.0, 4, 4).with_hint(9);
        let mut seen = Vec::new();
        run_frames(&detector, &mut source, None, 10.0, |done, hint| seen.push((done, hint))).unwrap();
        assert_eq!(seen, vec![(1, 9), (2, 9), (3, 9)]);
    }

    #[test]
    fn unloaded_detector_and_unopenable_source() {
        let pipeline = FramePipeline::new(DetectorHandle::unloaded(), settings());
        assert!(matches!(
            pipeline.process("stub://x", None),
            Err(PipelineError::NotLoaded)
        ));

        let pipeline = FramePipeline::new(DetectorHandle::with_backend(NullBackend::new()), settings());
        assert!(matches!(
            pipeline.process("stub://x?frames=oops", None),
            Err(PipelineError::Open { .. })
        ));
    }

    #[test]
    fn output_post_condition() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.mp4");
        assert!(matches!(
            check_output(&missing, 1024),
            OutputReport::TooSmall { bytes: 0, .. }
        ));

        let tiny = dir.path().join("tiny.mp4");
        std::fs::write(&tiny, [0u8; 10]).unwrap();
        let summary = VideoSummary {
            total_frames: 0,
            processed_frames: 0,
            fps: 30.0,
            duration: 0.0,
            resolution: Resolution { width: 1, height: 1 },
            frames_with_detection: 0,
            frames: Vec::new(),
            detection_failures: Vec::new(),
            output: Some(check_output(&tiny, 1024)),
        };
        assert!(matches!(
            summary.require_output(),
            Err(PipelineError::OutputTooSmall { bytes: 10, .. })
        ));

        let good = dir.path().join("good.mp4");
        std::fs::write(&good, vec![0u8; 2048]).unwrap();
        assert_eq!(
            check_output(&good, 1024),
            OutputReport::Ready {
                path: good.clone(),
                bytes: 2048
            }
        );
    }
}
