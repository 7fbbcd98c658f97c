//! Configuration loading from TOML files and environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub google: GoogleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Frame capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// RTSP stream to grab frames from.
    #[serde(default)]
    pub rtsp_url: String,
    /// Root directory frames are written under.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Seconds between captures.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            rtsp_url: String::new(),
            output_dir: default_output_dir(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

impl CaptureConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Video assembly configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Output frame rate of the assembled video.
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// ffmpeg executable used for both grabbing and encoding.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

/// Upload schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Whether the upload scheduler runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Frequency selector 1..=6 mapping to fixed daily fire hours.
    #[serde(default = "default_frequency")]
    pub frequency: u8,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            frequency: default_frequency(),
        }
    }
}

/// Google API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GoogleConfig {
    /// User-supplied OAuth client secret file (`installed` app JSON).
    #[serde(default)]
    pub secret_file: PathBuf,
    /// Persisted token file; defaults to `<data_dir>/token.json`.
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub sheet: SheetConfig,
}

/// Optional spreadsheet logging of upload results.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SheetConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Spreadsheet ID the row is appended to.
    #[serde(default)]
    pub sheet_id: String,
    /// Sheet/tab title, created on first append if missing.
    #[serde(default)]
    pub sheet_title: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Data directory for the token file and scratch files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_interval_seconds() -> u64 {
    5
}

fn default_output_dir() -> PathBuf {
    default_data_dir().join("frames")
}

fn default_fps() -> u32 {
    1
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_true() -> bool {
    true
}

fn default_frequency() -> u8 {
    1
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".rtsp-timelapse"))
        .unwrap_or_else(|| PathBuf::from(".rtsp-timelapse"))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::from_file(path)?
        } else {
            let default_paths = [
                PathBuf::from("config/default.toml"),
                dirs::config_dir()
                    .map(|d| d.join("rtsp-timelapse/config.toml"))
                    .unwrap_or_default(),
            ];

            let mut loaded = None;
            for path in &default_paths {
                if path.exists() {
                    loaded = Some(Self::from_file(path)?);
                    break;
                }
            }
            loaded.unwrap_or_default()
        };

        config.apply_env_overrides();

        config.logging.data_dir = expand_tilde(&config.logging.data_dir);
        config.capture.output_dir = expand_tilde(&config.capture.output_dir);
        config.google.secret_file = expand_tilde(&config.google.secret_file);
        if let Some(token_file) = &config.google.token_file {
            config.google.token_file = Some(expand_tilde(token_file));
        }

        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_RTSP_URL") {
            self.capture.rtsp_url = val;
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_OUTPUT_DIR") {
            self.capture.output_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_CAPTURE_INTERVAL") {
            if let Ok(v) = val.parse() {
                self.capture.interval_seconds = v;
            }
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_FPS") {
            if let Ok(v) = val.parse() {
                self.assembly.fps = v;
            }
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_FFMPEG") {
            self.assembly.ffmpeg_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_UPLOAD_FREQUENCY") {
            if let Ok(v) = val.parse() {
                self.upload.frequency = v;
            }
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_SECRET_FILE") {
            self.google.secret_file = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_DATA_DIR") {
            self.logging.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RTSP_TIMELAPSE_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Resolved token file path.
    pub fn token_file(&self) -> PathBuf {
        self.google
            .token_file
            .clone()
            .unwrap_or_else(|| self.logging.data_dir.join("token.json"))
    }

    /// Scratch path for the encoder's concat manifest.
    pub fn manifest_file(&self) -> PathBuf {
        self.logging.data_dir.join("images_list.tmp")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.capture.rtsp_url.is_empty() {
            anyhow::bail!("RTSP stream URL must be set");
        }
        if !self.capture.rtsp_url.starts_with("rtsp://")
            && !self.capture.rtsp_url.starts_with("rtsps://")
        {
            anyhow::bail!("Stream URL must use an rtsp:// or rtsps:// scheme");
        }
        if self.capture.rtsp_url.trim_end() != self.capture.rtsp_url {
            anyhow::bail!("Stream URL must not contain trailing whitespace");
        }
        if self.capture.interval_seconds == 0 {
            anyhow::bail!("Capture interval must be greater than 0");
        }
        if self.assembly.fps == 0 {
            anyhow::bail!("Assembly fps must be greater than 0");
        }
        if !(1..=6).contains(&self.upload.frequency) {
            anyhow::bail!("Upload frequency must be between 1 and 6");
        }
        if self.upload.enabled && self.google.secret_file.as_os_str().is_empty() {
            anyhow::bail!("Google client secret file must be set when uploads are enabled");
        }
        if self.google.sheet.enabled {
            if self.google.sheet.sheet_id.is_empty() {
                anyhow::bail!("Sheet ID cannot be empty when sheet logging is enabled");
            }
            if self.google.sheet.sheet_title.is_empty() {
                anyhow::bail!("Sheet title cannot be empty when sheet logging is enabled");
            }
        }
        Ok(())
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if path_str.starts_with("~") {
            if let Some(home) = dirs::home_dir() {
                return home.join(&path_str[2..]);
            }
        }
    }
    path.to_path_buf()
}
