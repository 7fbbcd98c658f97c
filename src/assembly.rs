//! Video assembly: concat manifest, external encoder, progress relay.
//!
//! Assembly consumes every frame currently in the store. The encoder's
//! stderr carries a running `frame=N` counter which is turned into
//! percentage progress events. Frames are only deleted after the encoder
//! exits cleanly; a failed encode leaves the store untouched for the next
//! cycle.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::events::{EventScope, EventSink, ProgressGate};
use crate::frames::{self, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("no frames found to assemble")]
    EmptyInput,
    #[error("encoder exited with status {status}")]
    EncodeFailed { status: std::process::ExitStatus },
    #[error("ffmpeg not found - is it installed?")]
    EncoderNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the concat-demuxer manifest for an ordered frame list.
///
/// Paths are written with forward slashes; the demuxer accepts them on
/// every platform. Each frame gets a fixed one-second display duration,
/// retimed by the encoder's `-r` flag.
pub fn build_manifest(frames: &[PathBuf]) -> String {
    let mut manifest = String::new();
    for frame in frames {
        let path = frame.to_string_lossy().replace('\\', "/");
        manifest.push_str(&format!("file '{}'\nduration 1\n", path));
    }
    manifest
}

/// Extract the encoded-frame counter from one encoder stderr line.
pub fn parse_encoded_frames(line: &str) -> Option<u64> {
    let rest = &line[line.find("frame=")? + "frame=".len()..];
    let rest = rest.trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Progress percentage for `encoded` of `total` frames, capped at 100.
pub fn encode_percent(encoded: u64, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (encoded as f64 / total as f64 * 100.0).round() as u64;
    percent.min(100) as u8
}

/// Assemble every pending frame under `input_dir` into one video.
///
/// Returns the output video path. On success the consumed frames and any
/// directories they emptied are gone; on any failure they are preserved.
pub async fn assemble(
    ffmpeg: &Path,
    input_dir: &Path,
    fps: u32,
    manifest_path: &Path,
    sink: &EventSink,
) -> Result<PathBuf, AssemblyError> {
    let frames = frames::collect_frames(input_dir)?;
    if frames.is_empty() {
        return Err(AssemblyError::EmptyInput);
    }

    info!(count = frames.len(), "assembling frames into video");
    sink.message(EventScope::Capture, "Creating video...");

    if let Some(parent) = manifest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(manifest_path, build_manifest(&frames)).await?;

    let video_path = input_dir.join("output.mp4");
    let status = run_encoder(ffmpeg, manifest_path, fps, &video_path, frames.len(), sink).await?;

    if !status.success() {
        error!(%status, "encoder failed, keeping frames");
        return Err(AssemblyError::EncodeFailed { status });
    }

    sink.message(
        EventScope::Capture,
        format!("Video created: {}", video_path.display()),
    );

    frames::delete_frames(input_dir, &frames)?;
    debug!(count = frames.len(), "consumed frames deleted");

    Ok(video_path)
}

async fn run_encoder(
    ffmpeg: &Path,
    manifest: &Path,
    fps: u32,
    out: &Path,
    total_frames: usize,
    sink: &EventSink,
) -> Result<std::process::ExitStatus, AssemblyError> {
    let mut child = Command::new(ffmpeg)
        .arg("-y")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(manifest)
        .arg("-c:v")
        .arg("libx264")
        .arg("-crf")
        .arg("17")
        .arg("-preset")
        .arg("veryslow")
        .arg("-pix_fmt")
        .arg("yuv420p")
        .arg("-r")
        .arg(fps.to_string())
        .arg("-an")
        .arg(out)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AssemblyError::EncoderNotFound
            } else {
                AssemblyError::Io(e)
            }
        })?;

    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        let mut gate = ProgressGate::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(encoded) = parse_encoded_frames(&line) {
                if let Some(percent) = gate.update(encode_percent(encoded, total_frames)) {
                    sink.progress(EventScope::Capture, percent);
                    sink.message(
                        EventScope::Capture,
                        format!("Creating video: {percent}% complete"),
                    );
                }
            }
        }
    }

    Ok(child.wait().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn manifest_lists_frames_in_order_with_durations() {
        let frames = vec![
            PathBuf::from("/f/2024-01-01/2024-01-01_00/2024-01-01_00-00-00.png"),
            PathBuf::from("/f/2024-01-01/2024-01-01_00/2024-01-01_00-00-05.png"),
            PathBuf::from("/f/2024-01-01/2024-01-01_00/2024-01-01_00-00-10.png"),
        ];
        let manifest = build_manifest(&frames);
        assert_eq!(
            manifest,
            "file '/f/2024-01-01/2024-01-01_00/2024-01-01_00-00-00.png'\nduration 1\n\
             file '/f/2024-01-01/2024-01-01_00/2024-01-01_00-00-05.png'\nduration 1\n\
             file '/f/2024-01-01/2024-01-01_00/2024-01-01_00-00-10.png'\nduration 1\n"
        );
    }

    #[test]
    fn manifest_uses_forward_slashes() {
        let frames = vec![PathBuf::from(r"C:\frames\2024-01-01_00-00-00.png")];
        let manifest = build_manifest(&frames);
        assert!(manifest.contains("file 'C:/frames/2024-01-01_00-00-00.png'"));
    }

    #[test]
    fn parses_frame_counter_from_stderr_line() {
        let line = "frame=  128 fps= 25 q=28.0 size=     512kB time=00:00:05.12";
        assert_eq!(parse_encoded_frames(line), Some(128));
        assert_eq!(parse_encoded_frames("frame=3 fps=0.0"), Some(3));
        assert_eq!(parse_encoded_frames("size= 12kB time=00:00:01"), None);
        assert_eq!(parse_encoded_frames("frame= N/A"), None);
    }

    #[test]
    fn percent_rounds_and_caps_at_100() {
        assert_eq!(encode_percent(0, 3), 0);
        assert_eq!(encode_percent(1, 3), 33);
        assert_eq!(encode_percent(2, 3), 67);
        assert_eq!(encode_percent(3, 3), 100);
        // Encoders can report more output frames than inputs.
        assert_eq!(encode_percent(9, 3), 100);
    }

    #[tokio::test]
    async fn empty_store_fails_before_touching_the_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _rx) = EventSink::channel();
        let manifest = dir.path().join("images_list.tmp");

        // The ffmpeg path points nowhere; reaching the encoder would fail
        // with EncoderNotFound instead of EmptyInput.
        let err = assemble(
            Path::new("/definitely/not/ffmpeg"),
            dir.path(),
            1,
            &manifest,
            &sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AssemblyError::EmptyInput));
        assert!(!manifest.exists());
    }

    #[tokio::test]
    async fn failed_encode_preserves_frames() {
        let dir = tempfile::tempdir().unwrap();
        let hour = dir.path().join("2024-01-01").join("2024-01-01_00");
        fs::create_dir_all(&hour).unwrap();
        let frame = hour.join("2024-01-01_00-00-00.png");
        fs::write(&frame, b"png").unwrap();

        let (sink, _rx) = EventSink::channel();
        let manifest = dir.path().join("images_list.tmp");

        let err = assemble(
            Path::new("/definitely/not/ffmpeg"),
            dir.path(),
            1,
            &manifest,
            &sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AssemblyError::EncoderNotFound));
        assert!(frame.exists());
    }
}
