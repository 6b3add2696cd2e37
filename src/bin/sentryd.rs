//! sentryd - person detection service
//!
//! Loads the configured detector, serves the HTTP/WebSocket API and runs
//! until Ctrl-C. A model that fails to load leaves the service up with
//! `model_loaded=false`; detection requests answer 503 until restart.

use anyhow::Result;
use std::sync::mpsc;

use person_sentry::{api::ApiServer, detect::load_configured, DetectorHandle, SentryConfig};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SentryConfig::load()?;
    let detector = DetectorHandle::unloaded();
    match load_configured(&config.model) {
        Ok(backend) => detector.install(backend),
        Err(err) => log::error!(
            "failed to load '{}' detector from {}: {}",
            config.model.backend,
            config.model.path.display(),
            err
        ),
    }

    let api_handle = ApiServer::new(config.clone(), detector).spawn()?;
    log::info!(
        "sentryd running on {} (batch processing {})",
        api_handle.addr,
        if config.batch.enabled { "enabled" } else { "disabled" }
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    log::info!("sentryd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
