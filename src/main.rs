//! rtsp-timelapse - RTSP timelapse capture and upload daemon
//!
//! Grabs still frames from an RTSP stream on a fixed interval, and on a
//! separate daily schedule assembles the accumulated frames into a video,
//! uploads it to YouTube, and optionally logs the result to a Google
//! spreadsheet.

mod assembly;
mod capture;
mod config;
mod events;
mod frames;
mod google;
mod schedule;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

use crate::capture::CaptureSettings;
use crate::config::Config;
use crate::events::{EventSink, PipelineEvent};
use crate::schedule::{CycleParams, SheetTarget};

/// Application version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Usage: rtsp-timelapse [auth] [config-path]
    let mut args = std::env::args().skip(1).peekable();
    let run_auth = args.peek().map(String::as_str) == Some("auth");
    if run_auth {
        args.next();
    }
    let config_path = args.next().map(PathBuf::from);

    let config = Config::load(config_path.as_deref())?;
    init_tracing(&config.logging.level)?;

    info!("Starting rtsp-timelapse v{}", VERSION);

    std::fs::create_dir_all(&config.logging.data_dir)
        .with_context(|| format!("Failed to create data dir: {:?}", config.logging.data_dir))?;

    if run_auth {
        // One-shot interactive consent so the first scheduled cycle finds
        // a valid token file.
        google::auth::generate_token(&config.google.secret_file, &config.token_file())
            .await
            .context("Interactive authorization failed")?;
        return Ok(());
    }

    config.validate()?;
    std::fs::create_dir_all(&config.capture.output_dir).with_context(|| {
        format!("Failed to create output dir: {:?}", config.capture.output_dir)
    })?;

    let (sink, mut events_rx) = EventSink::channel();

    // The log observer is the daemon's only consumer of pipeline events; a
    // UI would hold this receiver instead.
    let observer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                PipelineEvent::Message { scope, message } => {
                    info!(scope = scope.as_str(), "{message}");
                }
                PipelineEvent::Progress { scope, percent } => {
                    info!(scope = scope.as_str(), "{percent}% complete");
                }
            }
        }
    });

    let capture_handle = capture::start(
        CaptureSettings {
            ffmpeg_path: config.assembly.ffmpeg_path.clone(),
            rtsp_url: config.capture.rtsp_url.clone(),
            output_dir: config.capture.output_dir.clone(),
            interval: config.capture.interval(),
        },
        sink.clone(),
    );

    let upload_handle = if config.upload.enabled {
        let sheet = config.google.sheet.enabled.then(|| SheetTarget {
            sheet_id: config.google.sheet.sheet_id.clone(),
            sheet_title: config.google.sheet.sheet_title.clone(),
        });
        let params = CycleParams {
            ffmpeg_path: config.assembly.ffmpeg_path.clone(),
            input_dir: config.capture.output_dir.clone(),
            fps: config.assembly.fps,
            manifest_file: config.manifest_file(),
            secret_file: config.google.secret_file.clone(),
            token_file: config.token_file(),
            sheet,
        };
        Some(schedule::start(config.upload.frequency, params, sink.clone())?)
    } else {
        info!("upload scheduler disabled by configuration");
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }

    info!("Shutting down...");
    capture_handle.stop().await;
    if let Some(handle) = upload_handle {
        handle.stop().await;
    }

    drop(sink);
    let _ = observer.await;

    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level.
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
