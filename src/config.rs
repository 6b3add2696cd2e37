use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_MODEL_PATH: &str = "yolov8s.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_BATCH_SIZE: usize = 10;
const MAX_WORKERS: usize = 10;
const MAX_BATCH_SIZE: usize = 100;
const DEFAULT_MEMORY_THRESHOLD: f32 = 80.0;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_CODEC: &str = "libx264";
const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
const DEFAULT_MIN_OUTPUT_BYTES: u64 = 1024;
const DEFAULT_CLEANUP_DELAY_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct SentryConfigFile {
    api: Option<ApiConfigFile>,
    model: Option<ModelConfigFile>,
    batch: Option<BatchConfigFile>,
    video: Option<VideoConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<String>,
    path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BatchConfigFile {
    enabled: Option<bool>,
    default_max_workers: Option<usize>,
    default_batch_size: Option<usize>,
    max_workers: Option<usize>,
    max_batch_size: Option<usize>,
    memory_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct VideoConfigFile {
    default_fps: Option<f64>,
    codec: Option<String>,
    ffmpeg_bin: Option<String>,
    min_output_bytes: Option<u64>,
    cleanup_delay_ms: Option<u64>,
    temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub api_addr: String,
    pub max_body_bytes: usize,
    pub model: ModelSettings,
    pub batch: BatchSettings,
    pub video: VideoSettings,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// "tract" or "null".
    pub backend: String,
    pub path: PathBuf,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            backend: default_backend().to_string(),
            path: PathBuf::from(DEFAULT_MODEL_PATH),
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub enabled: bool,
    pub default_max_workers: usize,
    pub default_batch_size: usize,
    pub max_workers: usize,
    pub max_batch_size: usize,
    /// Used-memory percentage above which batch concurrency backs off.
    pub memory_threshold_percent: f32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_workers: DEFAULT_MAX_WORKERS,
            default_batch_size: DEFAULT_BATCH_SIZE,
            max_workers: MAX_WORKERS,
            max_batch_size: MAX_BATCH_SIZE,
            memory_threshold_percent: DEFAULT_MEMORY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    /// Used when the container reports no usable frame rate.
    pub default_fps: f64,
    /// Output codec handed to the encoder, independent of the source codec.
    pub codec: String,
    pub ffmpeg_bin: String,
    /// Encoded outputs smaller than this are treated as failed generation.
    pub min_output_bytes: u64,
    /// Grace period before request temp files are removed after a video
    /// response, so the transfer can finish reading.
    pub cleanup_delay: Duration,
    pub temp_dir: Option<PathBuf>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            default_fps: DEFAULT_FPS,
            codec: DEFAULT_CODEC.to_string(),
            ffmpeg_bin: DEFAULT_FFMPEG_BIN.to_string(),
            min_output_bytes: DEFAULT_MIN_OUTPUT_BYTES,
            cleanup_delay: Duration::from_millis(DEFAULT_CLEANUP_DELAY_MS),
            temp_dir: None,
        }
    }
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            model: ModelSettings::default(),
            batch: BatchSettings::default(),
            video: VideoSettings::default(),
        }
    }
}

fn default_backend() -> &'static str {
    if cfg!(feature = "backend-tract") {
        "tract"
    } else {
        "null"
    }
}

impl SentryConfig {
    /// Load from the JSON file named by `SENTRY_CONFIG` (optional), then apply
    /// environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTRY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentryConfigFile) -> Self {
        let defaults = Self::default();
        let api = file.api.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let batch = file.batch.unwrap_or_default();
        let video = file.video.unwrap_or_default();

        Self {
            api_addr: api.addr.unwrap_or(defaults.api_addr),
            max_body_bytes: api.max_body_bytes.unwrap_or(defaults.max_body_bytes),
            model: ModelSettings {
                backend: model.backend.unwrap_or(defaults.model.backend),
                path: model.path.unwrap_or(defaults.model.path),
                confidence_threshold: model
                    .confidence_threshold
                    .unwrap_or(defaults.model.confidence_threshold),
                iou_threshold: model.iou_threshold.unwrap_or(defaults.model.iou_threshold),
                input_size: model.input_size.unwrap_or(defaults.model.input_size),
            },
            batch: BatchSettings {
                enabled: batch.enabled.unwrap_or(defaults.batch.enabled),
                default_max_workers: batch
                    .default_max_workers
                    .unwrap_or(defaults.batch.default_max_workers),
                default_batch_size: batch
                    .default_batch_size
                    .unwrap_or(defaults.batch.default_batch_size),
                max_workers: batch.max_workers.unwrap_or(defaults.batch.max_workers),
                max_batch_size: batch.max_batch_size.unwrap_or(defaults.batch.max_batch_size),
                memory_threshold_percent: batch
                    .memory_threshold
                    .unwrap_or(defaults.batch.memory_threshold_percent),
            },
            video: VideoSettings {
                default_fps: video.default_fps.unwrap_or(defaults.video.default_fps),
                codec: video.codec.unwrap_or(defaults.video.codec),
                ffmpeg_bin: video.ffmpeg_bin.unwrap_or(defaults.video.ffmpeg_bin),
                min_output_bytes: video
                    .min_output_bytes
                    .unwrap_or(defaults.video.min_output_bytes),
                cleanup_delay: video
                    .cleanup_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.video.cleanup_delay),
                temp_dir: video.temp_dir.or(defaults.video.temp_dir),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("SENTRY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(backend) = non_empty_env("SENTRY_BACKEND") {
            self.model.backend = backend;
        }
        if let Some(path) = non_empty_env("SENTRY_MODEL") {
            self.model.path = PathBuf::from(path);
        }
        if let Some(threshold) = non_empty_env("SENTRY_MEMORY_THRESHOLD") {
            self.batch.memory_threshold_percent = threshold.parse().map_err(|_| {
                anyhow!("SENTRY_MEMORY_THRESHOLD must be a percentage between 0 and 100")
            })?;
        }
        if let Some(enabled) = non_empty_env("SENTRY_BATCH_ENABLED") {
            self.batch.enabled = enabled
                .parse()
                .map_err(|_| anyhow!("SENTRY_BATCH_ENABLED must be true or false"))?;
        }
        if let Some(codec) = non_empty_env("SENTRY_VIDEO_CODEC") {
            self.video.codec = codec;
        }
        if let Some(bin) = non_empty_env("SENTRY_FFMPEG_BIN") {
            self.video.ffmpeg_bin = bin;
        }
        if let Some(dir) = non_empty_env("SENTRY_TEMP_DIR") {
            self.video.temp_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.model.backend.as_str(), "tract" | "null") {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected tract or null)",
                self.model.backend
            ));
        }
        if !(0.0..=1.0).contains(&self.model.confidence_threshold) {
            return Err(anyhow!("model.confidence_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.model.iou_threshold) {
            return Err(anyhow!("model.iou_threshold must be within [0, 1]"));
        }
        if self.model.input_size == 0 {
            return Err(anyhow!("model.input_size must be greater than zero"));
        }
        let batch = &self.batch;
        if batch.max_workers == 0 || batch.max_batch_size == 0 {
            return Err(anyhow!("batch maxima must be greater than zero"));
        }
        if batch.default_max_workers == 0 || batch.default_max_workers > batch.max_workers {
            return Err(anyhow!(
                "batch.default_max_workers must be within [1, {}]",
                batch.max_workers
            ));
        }
        if batch.default_batch_size == 0 || batch.default_batch_size > batch.max_batch_size {
            return Err(anyhow!(
                "batch.default_batch_size must be within [1, {}]",
                batch.max_batch_size
            ));
        }
        if !(batch.memory_threshold_percent > 0.0 && batch.memory_threshold_percent <= 100.0) {
            return Err(anyhow!("batch.memory_threshold must be within (0, 100]"));
        }
        if !(self.video.default_fps.is_finite() && self.video.default_fps > 0.0) {
            return Err(anyhow!("video.default_fps must be positive"));
        }
        if self.video.codec.trim().is_empty() {
            return Err(anyhow!("video.codec must not be empty"));
        }
        if self.max_body_bytes == 0 {
            return Err(anyhow!("api.max_body_bytes must be greater than zero"));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
