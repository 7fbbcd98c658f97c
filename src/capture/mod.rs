//! Frame capture timer driving the external grabber.
//!
//! A capture session owns one interval timer. Every tick derives the
//! date/hour partition for the current local time, makes sure it exists,
//! and hands one grabber invocation to the runtime. A failed grab drops
//! that frame and nothing else; the timer keeps its cadence.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventScope, EventSink};
use crate::frames::FrameName;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("ffmpeg not found - is it installed?")]
    GrabberNotFound,
    #[error("frame grab exited with status {status}")]
    GrabFailed { status: std::process::ExitStatus },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything one capture session needs, fixed at start.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub ffmpeg_path: PathBuf,
    pub rtsp_url: String,
    pub output_dir: PathBuf,
    pub interval: Duration,
}

/// Handle to a running capture session.
///
/// Owns the timer exclusively; dropping or stopping it is the only way to
/// end the session. Restarting always builds a fresh session.
pub struct CaptureHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CaptureHandle {
    /// Cancel the timer and wait for the tick loop to wind down.
    ///
    /// A grab already handed to the runtime is left to finish on its own;
    /// the external process is not killed.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Start a capture session.
pub fn start(settings: CaptureSettings, sink: EventSink) -> CaptureHandle {
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        info!(
            rtsp_url = %settings.rtsp_url,
            output_dir = %settings.output_dir.display(),
            interval_secs = settings.interval.as_secs(),
            "starting capture timer"
        );
        sink.message(EventScope::Capture, "Capture started");

        let mut interval = tokio::time::interval(settings.interval);
        // The first tick of a tokio interval fires immediately; consume it
        // so the first grab happens one interval after start, like the
        // original timer.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    break;
                }
                _ = interval.tick() => {
                    let settings = settings.clone();
                    let sink = sink.clone();
                    // Each grab runs as its own task so a slow stream never
                    // delays the next tick. Overlapping grabs write distinct
                    // second-named files.
                    tokio::spawn(async move {
                        match grab_frame(&settings, FrameName::now()).await {
                            Ok(path) => {
                                sink.message(
                                    EventScope::Capture,
                                    format!("Captured: {}", path.display()),
                                );
                            }
                            Err(e) => {
                                warn!("frame grab failed: {e}");
                            }
                        }
                    });
                }
            }
        }

        sink.message(EventScope::Capture, "Capture stopped");
        info!("capture timer stopped");
    });

    CaptureHandle { cancel, task }
}

/// Grab a single frame into the store partition for `name`.
pub async fn grab_frame(
    settings: &CaptureSettings,
    name: FrameName,
) -> Result<PathBuf, CaptureError> {
    let hour_dir = name.hour_dir(&settings.output_dir);
    tokio::fs::create_dir_all(&hour_dir).await?;
    let frame_path = name.frame_path(&settings.output_dir);

    let status = run_grabber(&settings.ffmpeg_path, &settings.rtsp_url, &frame_path).await?;

    if status.success() {
        debug!(path = %frame_path.display(), "frame grabbed");
        Ok(frame_path)
    } else {
        Err(CaptureError::GrabFailed { status })
    }
}

async fn run_grabber(
    ffmpeg: &Path,
    rtsp_url: &str,
    out: &Path,
) -> Result<std::process::ExitStatus, CaptureError> {
    let mut child = Command::new(ffmpeg)
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-i")
        .arg(rtsp_url)
        .arg("-vframes")
        .arg("1")
        .arg("-q:v")
        .arg("1")
        .arg(out)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::GrabberNotFound
            } else {
                CaptureError::Io(e)
            }
        })?;

    Ok(child.wait().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PipelineEvent;
    use chrono::TimeZone;

    fn settings(output_dir: PathBuf) -> CaptureSettings {
        CaptureSettings {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            rtsp_url: "rtsp://localhost:8554/stream".into(),
            output_dir,
            interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn frame_lands_in_date_hour_partition() {
        let at = chrono::Local.with_ymd_and_hms(2024, 6, 1, 8, 15, 42).unwrap();
        let name = FrameName::from_datetime(at);
        let path = name.frame_path(Path::new("/frames"));
        assert_eq!(
            path,
            Path::new("/frames/2024-06-01/2024-06-01_08/2024-06-01_08-15-42.png")
        );
    }

    #[tokio::test]
    async fn grab_with_missing_binary_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path().to_path_buf());
        s.ffmpeg_path = PathBuf::from("/definitely/not/ffmpeg");

        let name = FrameName::now();
        let err = grab_frame(&s, name.clone()).await.unwrap_err();
        assert!(matches!(err, CaptureError::GrabberNotFound));
        // The partition directory is still created before the spawn attempt.
        assert!(name.hour_dir(dir.path()).exists());
    }

    #[tokio::test]
    async fn stop_emits_started_and_stopped_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, mut rx) = EventSink::channel();

        let handle = start(settings(dir.path().to_path_buf()), sink);
        // Give the loop a chance to announce itself before stopping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;

        let mut messages = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::Message { scope, message } = event {
                assert_eq!(scope, EventScope::Capture);
                messages.push(message);
            }
        }
        assert_eq!(messages.first().map(String::as_str), Some("Capture started"));
        assert_eq!(messages.last().map(String::as_str), Some("Capture stopped"));
    }
}
