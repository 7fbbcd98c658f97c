//! Video upload to the YouTube Data API.
//!
//! Uses the resumable upload protocol: one metadata POST returning an
//! upload URL, then one streamed PUT of the file body. Byte-level progress
//! is observed on the read side of the stream, so the reported percentage
//! tracks what has been handed to the transport.

use std::path::Path;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::info;

use super::{check_status, ApiError};
use crate::events::{EventScope, EventSink, ProgressGate};
use crate::google::auth::AuthClient;

const UPLOAD_ENDPOINT: &str =
    "https://www.googleapis.com/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status";
const WATCH_URL: &str = "https://youtu.be/";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("upload session returned no upload URL")]
    MissingUploadUrl,
    #[error("upload response carried no video id: {body}")]
    MissingVideoId { body: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upload a video file, returning its durable watch URL.
///
/// Progress events are emitted on the upload scope whenever the percentage
/// changes; the percentage never repeats or decreases within one upload.
pub async fn upload_video(
    auth: &AuthClient,
    title: &str,
    video_file: &Path,
    sink: &EventSink,
) -> Result<String, UploadError> {
    let file_size = tokio::fs::metadata(video_file).await?.len();

    let upload_url = begin_session(auth, title, file_size).await?;
    let video_id = send_body(auth, &upload_url, video_file, file_size, sink).await?;

    let video_url = format!("{WATCH_URL}{video_id}");
    info!(%video_url, "video uploaded");
    Ok(video_url)
}

/// Create the resumable session and return the per-upload URL.
async fn begin_session(
    auth: &AuthClient,
    title: &str,
    file_size: u64,
) -> Result<String, UploadError> {
    let metadata = json!({
        "snippet": { "title": title },
        "status": { "privacyStatus": "unlisted" },
    });

    let resp = auth
        .http()
        .post(UPLOAD_ENDPOINT)
        .header("Authorization", auth.bearer())
        .header("X-Upload-Content-Length", file_size)
        .header("X-Upload-Content-Type", "video/mp4")
        .json(&metadata)
        .send()
        .await
        .map_err(ApiError::from)?;

    let resp = check_status(resp).await?;
    resp.headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(UploadError::MissingUploadUrl)
}

/// Stream the file to the session URL, reporting byte progress.
async fn send_body(
    auth: &AuthClient,
    upload_url: &str,
    video_file: &Path,
    file_size: u64,
    sink: &EventSink,
) -> Result<String, UploadError> {
    let file = tokio::fs::File::open(video_file).await?;

    let progress_sink = sink.clone();
    let mut gate = ProgressGate::new();
    let mut bytes_sent: u64 = 0;

    let stream = ReaderStream::new(file).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            bytes_sent += bytes.len() as u64;
            let percent = if file_size == 0 {
                100
            } else {
                (bytes_sent as f64 / file_size as f64 * 100.0).round() as u8
            };
            if let Some(percent) = gate.update(percent) {
                progress_sink.progress(EventScope::Upload, percent);
                progress_sink.message(
                    EventScope::Upload,
                    format!("Upload video: {percent}% complete"),
                );
            }
        }
    });

    let resp = auth
        .http()
        .put(upload_url)
        .header("Authorization", auth.bearer())
        .header(reqwest::header::CONTENT_LENGTH, file_size)
        .header(reqwest::header::CONTENT_TYPE, "video/mp4")
        .body(reqwest::Body::wrap_stream(stream))
        .send()
        .await
        .map_err(ApiError::from)?;

    let resp = check_status(resp).await?;
    let body = resp.text().await.map_err(ApiError::from)?;

    extract_video_id(&body).ok_or(UploadError::MissingVideoId { body })
}

/// Pull a non-empty `id` out of the insert response.
pub(crate) fn extract_video_id(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
