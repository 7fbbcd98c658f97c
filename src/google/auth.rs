//! OAuth client loading for the Google APIs.
//!
//! Credentials come from two files: a user-supplied client secret (the
//! `installed` application JSON downloaded from the API console) and a
//! token file this module writes after interactive consent. A token file
//! that parses is trusted as-is; staleness is left for the remote API to
//! reject, and the next scheduled cycle is the retry.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};
use url::Url;

use super::{check_status, ApiError};

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/spreadsheets",
];

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("client secret file is missing or malformed: {reason}")]
    SecretFileInvalid { reason: String },
    #[error("token file could not be parsed: {reason}")]
    TokenLoadFailed { reason: String },
    #[error("interactive consent failed: {reason}")]
    AuthFailed { reason: String },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
struct SecretFile {
    installed: ClientSecret,
}

/// The two fields this pipeline needs from the secret file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
}

/// An authenticated Google API client.
///
/// The token payload is kept as the opaque JSON blob the token endpoint
/// returned; only `access_token` is interpreted locally.
#[derive(Debug, Clone)]
pub struct AuthClient {
    access_token: String,
    http: reqwest::Client,
}

impl AuthClient {
    fn from_token(token: &Value) -> Result<Self, AuthError> {
        let access_token = token
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::TokenLoadFailed {
                reason: "token payload has no access_token".into(),
            })?
            .to_string();

        Ok(Self {
            access_token,
            http: reqwest::Client::new(),
        })
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Read and parse the user-supplied client secret file.
pub fn read_secret(path: &Path) -> Result<ClientSecret, AuthError> {
    let content = std::fs::read_to_string(path).map_err(|e| AuthError::SecretFileInvalid {
        reason: format!("{}: {e}", path.display()),
    })?;
    let secret: SecretFile =
        serde_json::from_str(&content).map_err(|e| AuthError::SecretFileInvalid {
            reason: e.to_string(),
        })?;
    Ok(secret.installed)
}

/// Load an authenticated client, running interactive consent only when no
/// token file exists yet.
pub async fn load_client(secret_file: &Path, token_file: &Path) -> Result<AuthClient, AuthError> {
    let secret = read_secret(secret_file)?;

    if token_file.exists() {
        let content =
            std::fs::read_to_string(token_file).map_err(|e| AuthError::TokenLoadFailed {
                reason: format!("{}: {e}", token_file.display()),
            })?;
        let token: Value =
            serde_json::from_str(&content).map_err(|e| AuthError::TokenLoadFailed {
                reason: e.to_string(),
            })?;
        return AuthClient::from_token(&token);
    }

    let token = consent_and_exchange(&secret).await?;
    persist_token(token_file, &token).await?;
    AuthClient::from_token(&token)
}

/// Run the interactive consent flow unconditionally and persist the result,
/// replacing any existing token file. Backs the `auth` subcommand so the
/// first scheduled cycle finds a valid token.
pub async fn generate_token(secret_file: &Path, token_file: &Path) -> Result<(), AuthError> {
    let secret = read_secret(secret_file)?;
    let token = consent_and_exchange(&secret).await?;
    persist_token(token_file, &token).await?;
    info!(path = %token_file.display(), "token saved");
    Ok(())
}

async fn persist_token(token_file: &Path, token: &Value) -> Result<(), AuthError> {
    if let Some(parent) = token_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(token_file, serde_json::to_string(token).unwrap_or_default()).await?;
    Ok(())
}

/// Open a loopback listener, direct the user through the browser consent
/// page, and exchange the returned code for a token payload.
async fn consent_and_exchange(secret: &ClientSecret) -> Result<Value, AuthError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    let redirect_uri = format!("http://127.0.0.1:{port}/");

    let consent_url = build_consent_url(&secret.client_id, &redirect_uri);
    info!("open this URL in a browser to authorize: {consent_url}");

    let code = wait_for_code(listener).await?;
    exchange_code(secret, &redirect_uri, &code).await
}

fn build_consent_url(client_id: &str, redirect_uri: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &SCOPES.join(" "))
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent")
        .finish();
    format!("{AUTH_ENDPOINT}?{query}")
}

/// Accept the single consent redirect and pull the `code` parameter out of
/// the request line.
async fn wait_for_code(listener: TcpListener) -> Result<String, AuthError> {
    let (mut stream, _) = listener.accept().await?;

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]).into_owned();

    let response = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n\
                    <html><body>Authorization received. You can close this window.</body></html>";
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!("failed to answer consent redirect: {e}");
    }

    parse_redirect_code(&request).ok_or_else(|| AuthError::AuthFailed {
        reason: "consent redirect carried no authorization code".into(),
    })
}

/// Extract `code` from the first line of the redirect HTTP request.
pub(crate) fn parse_redirect_code(request: &str) -> Option<String> {
    let path = request.lines().next()?.split_whitespace().nth(1)?;
    let url = Url::parse(&format!("http://localhost{path}")).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .filter(|code| !code.is_empty())
}

async fn exchange_code(
    secret: &ClientSecret,
    redirect_uri: &str,
    code: &str,
) -> Result<Value, AuthError> {
    let params = [
        ("code", code),
        ("client_id", secret.client_id.as_str()),
        ("client_secret", secret.client_secret.as_str()),
        ("redirect_uri", redirect_uri),
        ("grant_type", "authorization_code"),
    ];

    let resp = reqwest::Client::new()
        .post(TOKEN_ENDPOINT)
        .form(&params)
        .send()
        .await
        .map_err(ApiError::from)?;

    let resp = check_status(resp).await?;
    let token: Value = resp.json().await.map_err(ApiError::from)?;

    if token.get("access_token").and_then(Value::as_str).is_none() {
        return Err(AuthError::AuthFailed {
            reason: format!("token endpoint returned no access_token: {token}"),
        });
    }
    Ok(token)
}
