//! Google API clients: OAuth, YouTube upload, Sheets append.

pub mod auth;
pub mod sheets;
pub mod youtube;

/// Transport or non-2xx failure talking to a Google API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Pass a successful response through, turn anything else into
/// [`ApiError::Status`] carrying the body for diagnostics.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }
}
