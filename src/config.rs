use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use crate::errors::{BotError, Result};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum CaptureMode {
    #[serde(rename = "images")]
    Images,
    #[serde(rename = "video")]
    Video,
    /// Video when the camera advertises a stream, stills otherwise
    #[serde(rename = "auto")]
    Auto,
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self::Images
    }
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureMode::Images => write!(f, "images"),
            CaptureMode::Video => write!(f, "video"),
            CaptureMode::Auto => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bot: BotConfig,
    #[serde(default)]
    pub video: VideoConfig,
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub cameras: CamerasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub account: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,         // IANA name, e.g. "America/New_York"
    #[serde(default = "default_tz_abbrev")]
    pub tz_abbrev: String,        // Shown after the time range, e.g. "ET"
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default = "default_fetch_delay_ms")]
    pub fetch_delay_ms: u64,
    #[serde(default = "default_frame_counts")]
    pub frame_counts: Vec<u32>,
    #[serde(default)]
    pub capture: CaptureMode,
    #[serde(default)]
    pub timelapse_24h: bool,
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_durations")]
    pub durations: Vec<u64>,      // Seconds of live stream to capture
    #[serde(default)]
    pub speedup: bool,            // setpts=0.5*PTS, audio dropped
    #[serde(default)]
    pub two_phase: bool,          // Raw stream copy, then re-encode
    #[serde(default = "default_min_raw_bytes")]
    pub min_raw_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_video_service")]
    pub video_service: String,
    pub identifier: String,
    pub password: Option<String>,
    pub password_env: Option<String>, // Environment variable holding the password
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CamerasConfig {
    #[serde(default = "default_cameras_directory")]
    pub directory: PathBuf,
}

fn default_timezone() -> String { "America/New_York".to_string() }
fn default_tz_abbrev() -> String { "ET".to_string() }
fn default_framerate() -> u32 { 10 }
fn default_fetch_delay_ms() -> u64 { 6000 }
fn default_frame_counts() -> Vec<u32> { vec![150, 300, 450, 600, 750, 900] }
fn default_staging_root() -> PathBuf { PathBuf::from(".") }
fn default_stale_after_hours() -> u64 { 6 }
fn default_durations() -> Vec<u64> { vec![60, 90, 120, 180, 240, 360] }
fn default_min_raw_bytes() -> u64 { 500 * 1024 }
fn default_service() -> String { "https://bsky.social".to_string() }
fn default_video_service() -> String { "https://video.bsky.app".to_string() }
fn default_cameras_directory() -> PathBuf { PathBuf::from("cameras") }

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            durations: default_durations(),
            speedup: false,
            two_phase: false,
            min_raw_bytes: default_min_raw_bytes(),
        }
    }
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self { directory: default_cameras_directory() }
    }
}

impl PublisherConfig {
    /// Resolve the account secret, preferring the environment variable when named
    pub fn secret(&self) -> Result<String> {
        if let Some(ref var) = self.password_env {
            return std::env::var(var)
                .map_err(|_| BotError::config(format!("Environment variable '{}' is not set", var)));
        }
        self.password
            .clone()
            .ok_or_else(|| BotError::config("Publisher password is not configured"))
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = if path.ends_with(".json") {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };

        config.validate()?;
        info!("Loaded configuration for account '{}' from {}", config.bot.account, path);
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bot.account.is_empty() {
            return Err(BotError::config("bot.account must not be empty"));
        }
        if self.bot.framerate == 0 {
            return Err(BotError::config("bot.framerate must be positive"));
        }
        if self.bot.frame_counts.is_empty() || self.bot.frame_counts.contains(&0) {
            return Err(BotError::config("bot.frame_counts must list positive frame counts"));
        }
        if self.bot.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(BotError::config(format!("Unknown timezone '{}'", self.bot.timezone)));
        }
        if self.bot.capture != CaptureMode::Images
            && (self.video.durations.is_empty() || self.video.durations.contains(&0))
        {
            return Err(BotError::config("video.durations must list positive durations"));
        }
        Ok(())
    }
}
