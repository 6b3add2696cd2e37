//! HTTP and WebSocket service surface.
//!
//! Routes:
//! - `POST /api/v1/detect?annotate=`: raw image body
//! - `POST /api/v1/video?return_video=&filename=`: raw video body
//! - `POST /api/v1/batch`: JSON list of base64 images
//! - `GET  /api/v1/health`
//! - `GET  /ws/detect`: WebSocket live-frame session
//!
//! One thread per connection. Every connection is served to completion;
//! a failing request never stops the listener.

mod artifacts;
mod http;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::batch::{BatchCoordinator, BatchItem, BatchLimits, BatchOptions, MemoryPressurePolicy};
use crate::config::SentryConfig;
use crate::detect::DetectorHandle;
use crate::error::PipelineError;
use crate::imaging::decode_base64_payload;
use crate::live::LiveSession;
use crate::pipeline::{FramePipeline, VideoSummary};
use crate::single::detect_bytes;

use artifacts::{download_name, sanitize_file_name, RequestArtifacts};
use http::{peek_request_line, read_request, write_error, write_json, write_response, HttpRequest};

const WS_PATH: &str = "/ws/detect";

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

struct ServiceState {
    config: SentryConfig,
    detector: DetectorHandle,
    pipeline: FramePipeline,
    batch: BatchCoordinator,
}

pub struct ApiServer {
    config: SentryConfig,
    detector: DetectorHandle,
}

impl ApiServer {
    pub fn new(config: SentryConfig, detector: DetectorHandle) -> Self {
        Self { config, detector }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let listener = TcpListener::bind(&self.config.api_addr)
            .with_context(|| format!("bind api listener on {}", self.config.api_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let pipeline = FramePipeline::new(self.detector.clone(), self.config.video.clone());
        let batch = BatchCoordinator::new(self.detector.clone(), BatchLimits::from(&self.config.batch))
            .with_policy(MemoryPressurePolicy::system(
                self.config.batch.memory_threshold_percent,
            ));
        let state = Arc::new(ServiceState {
            config: self.config,
            detector: self.detector,
            pipeline,
            batch,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, state, shutdown_thread) {
                log::error!("detection api stopped: {}", err);
            }
        });
        log::info!("detection api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<ServiceState>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = state.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        log::warn!("request from {} rejected: {}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, state: &ServiceState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request_line = peek_request_line(&stream)?;
    let mut parts = request_line.split_whitespace();
    if parts.next() == Some("GET") && parts.next().map(|p| p.split('?').next()) == Some(Some(WS_PATH)) {
        return serve_websocket(stream, state);
    }

    let mut stream = stream;
    let request = match read_request(&mut stream, state.config.max_body_bytes) {
        Ok(request) => request,
        Err(err) => {
            write_error(&mut stream, err.status(), &err.to_string())?;
            return Err(anyhow!(err.to_string()));
        }
    };
    log::debug!("{} {} ({} bytes)", request.method, request.path, request.body.len());

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/api/v1/health") => write_json(&mut stream, 200, &health(state)),
        ("POST", "/api/v1/detect") => handle_detect(&mut stream, state, &request),
        ("POST", "/api/v1/video") => handle_video(&mut stream, state, &request),
        ("POST", "/api/v1/batch") => handle_batch(&mut stream, state, &request),
        (_, "/api/v1/health" | "/api/v1/detect" | "/api/v1/video" | "/api/v1/batch") => {
            write_error(&mut stream, 405, "method not allowed")
        }
        _ => write_error(&mut stream, 404, "not found"),
    }
}

fn serve_websocket(stream: TcpStream, state: &ServiceState) -> Result<()> {
    stream.set_read_timeout(None)?;
    let mut socket = tungstenite::accept(stream).map_err(|e| anyhow!("websocket handshake: {e}"))?;
    log::info!("live session opened");
    let frames = LiveSession::new(state.detector.clone()).run(&mut socket)?;
    log::info!("live session closed after {} frames", frames);
    Ok(())
}

/// Answer a pipeline failure with its status and a JSON error body.
fn fail(stream: &mut TcpStream, err: PipelineError) -> Result<()> {
    log::warn!("request failed: {}", err);
    write_error(stream, err.status_code(), &err.to_string())
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    model_loaded: bool,
    device: Option<String>,
    batch_processing_enabled: bool,
}

fn health(state: &ServiceState) -> Health {
    Health {
        status: "healthy",
        model_loaded: state.detector.is_loaded(),
        device: state.detector.device(),
        batch_processing_enabled: state.config.batch.enabled,
    }
}

fn handle_detect(stream: &mut TcpStream, state: &ServiceState, request: &HttpRequest) -> Result<()> {
    let annotate = match request.query_flag("annotate", false) {
        Ok(flag) => flag,
        Err(err) => return write_error(stream, 400, &err.to_string()),
    };
    let report = detect_bytes(&state.detector, &request.body, annotate).and_then(|d| d.to_report());
    match report {
        Ok(report) => write_json(stream, 200, &report),
        Err(err) => fail(stream, err),
    }
}

#[derive(Serialize)]
struct VideoReport<'a> {
    success: bool,
    filename: &'a str,
    #[serde(flatten)]
    summary: &'a VideoSummary,
}

fn handle_video(stream: &mut TcpStream, state: &ServiceState, request: &HttpRequest) -> Result<()> {
    let return_video = match request.query_flag("return_video", true) {
        Ok(flag) => flag,
        Err(err) => return write_error(stream, 400, &err.to_string()),
    };
    if request.body.is_empty() {
        return fail(stream, PipelineError::Decode("empty video upload".into()));
    }
    let filename = sanitize_file_name(request.query_value("filename").unwrap_or("upload.mp4"));

    let artifacts = RequestArtifacts::create(state.config.video.temp_dir.as_deref())
        .context("create request temp dir")?;
    let input = artifacts.path(&format!("input-{filename}"));
    std::fs::write(&input, &request.body).context("store uploaded video")?;
    let output = return_video.then(|| artifacts.path("output.mp4"));
    let input_str = input.to_string_lossy().into_owned();

    let summary = match state.pipeline.process(&input_str, output.as_deref()) {
        Ok(summary) => summary,
        Err(err) => {
            artifacts.release();
            return fail(stream, err);
        }
    };

    if !return_video {
        artifacts.release();
        return write_json(
            stream,
            200,
            &VideoReport {
                success: true,
                filename: &filename,
                summary: &summary,
            },
        );
    }

    let video = match summary.require_output().map(|path| std::fs::read(path)) {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            artifacts.release();
            return fail(stream, PipelineError::Io(err));
        }
        Err(err) => {
            artifacts.release();
            return fail(stream, err);
        }
    };
    let sent = write_response(
        stream,
        200,
        "video/mp4",
        &[(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", download_name(&filename)),
        )],
        &video,
    );
    artifacts.release_after(state.config.video.cleanup_delay);
    sent
}

#[derive(Deserialize)]
struct BatchImage {
    #[serde(default)]
    filename: Option<String>,
    data: String,
}

#[derive(Deserialize)]
struct BatchRequest {
    images: Vec<BatchImage>,
    #[serde(default)]
    max_workers: Option<usize>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    annotate: bool,
}

fn handle_batch(stream: &mut TcpStream, state: &ServiceState, request: &HttpRequest) -> Result<()> {
    if !state.config.batch.enabled {
        return write_error(stream, 503, "batch processing is disabled");
    }
    let body: BatchRequest = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(err) => {
            return fail(stream, PipelineError::InvalidArgument(format!("invalid batch request: {err}")))
        }
    };
    let items = body
        .images
        .into_iter()
        .enumerate()
        .map(|(i, image)| {
            let source = image.filename.unwrap_or_else(|| format!("image_{i}"));
            match decode_base64_payload(&image.data) {
                Ok(bytes) => BatchItem::new(source, bytes),
                Err(err) => BatchItem::rejected(source, err.to_string()),
            }
        })
        .collect();
    let options = BatchOptions {
        max_workers: body.max_workers,
        batch_size: body.batch_size,
        annotate: body.annotate,
    };
    match state.batch.run(items, options) {
        Ok(outcome) => write_json(stream, 200, &outcome),
        Err(err) => fail(stream, err),
    }
}
