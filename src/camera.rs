use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::errors::{BotError, Result};

const FETCH_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Camera {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub url: String,                      // Still image URL, or stream URL for video cameras
    #[serde(default)]
    pub latitude: f64,                    // 0.0 = unknown
    #[serde(default)]
    pub longitude: f64,                   // 0.0 = unknown
    #[serde(default, alias = "hasVideo")]
    pub has_video: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>, // Extra request headers (Referer, Origin, ...)
    #[serde(default)]
    pub resolve_redirect: bool,           // Stream URL answers with a redirect to a tokenized URL
}

impl Camera {
    pub fn has_coordinates(&self) -> bool {
        self.latitude != 0.0 && self.longitude != 0.0
    }
}

/// A live stream reference handed to the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSource {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

/// Where cameras come from and how their content is fetched.
///
/// `list` never fails: any problem reaching the source is logged and
/// reported as an empty list.
#[async_trait]
pub trait CameraDirectory: Send + Sync {
    async fn list(&self) -> Vec<Camera>;

    /// Download one still frame into `dest`. Returning `Ok` means the file is
    /// complete and flushed to disk.
    async fn fetch_frame(&self, camera: &Camera, dest: &Path) -> Result<()>;

    async fn stream_source(&self, camera: &Camera) -> Result<StreamSource>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CameraFile {
    Listed { cameras: Vec<Camera> },
    Many(Vec<Camera>),
    One(Camera),
}

/// Cameras defined as JSON/TOML files in a directory, fetched over HTTP.
pub struct FileCameraDirectory {
    directory: PathBuf,
    client: reqwest::Client,
    no_redirect: reqwest::Client,
}

impl FileCameraDirectory {
    pub fn new(directory: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()?;
        let no_redirect = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { directory, client, no_redirect })
    }

    fn load_cameras(&self) -> Vec<Camera> {
        let mut cameras = Vec::new();

        if !self.directory.exists() {
            warn!("Cameras directory '{}' does not exist, no cameras will be loaded", self.directory.display());
            return cameras;
        }

        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Error reading cameras directory '{}': {}", self.directory.display(), e);
                return cameras;
            }
        };

        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
        paths.sort();

        for path in paths {
            let Some(file_stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let parsed = match path.extension().and_then(|s| s.to_str()) {
                Some("json") => fs::read_to_string(&path)
                    .map_err(BotError::from)
                    .and_then(|content| serde_json::from_str::<CameraFile>(&content).map_err(BotError::from)),
                Some("toml") => fs::read_to_string(&path)
                    .map_err(BotError::from)
                    .and_then(|content| toml::from_str::<CameraFile>(&content).map_err(BotError::from)),
                _ => continue,
            };

            match parsed {
                Ok(file) => {
                    let loaded = name_cameras(file_stem, file);
                    debug!("Loaded {} camera(s) from {}", loaded.len(), path.display());
                    cameras.extend(loaded);
                }
                Err(e) => {
                    warn!("Error parsing camera file {}: {}", path.display(), e);
                }
            }
        }

        cameras
    }
}

/// Cameras without an explicit id take the file stem (suffixed by position for lists)
fn name_cameras(file_stem: &str, file: CameraFile) -> Vec<Camera> {
    match file {
        CameraFile::One(mut camera) => {
            if camera.id.is_empty() {
                camera.id = file_stem.to_string();
            }
            vec![camera]
        }
        CameraFile::Listed { cameras } | CameraFile::Many(cameras) => cameras
            .into_iter()
            .enumerate()
            .map(|(i, mut camera)| {
                if camera.id.is_empty() {
                    camera.id = format!("{}-{}", file_stem, i);
                }
                camera
            })
            .collect(),
    }
}

#[async_trait]
impl CameraDirectory for FileCameraDirectory {
    async fn list(&self) -> Vec<Camera> {
        let cameras = self.load_cameras();
        info!("Found {} cameras in {}", cameras.len(), self.directory.display());
        cameras
    }

    async fn fetch_frame(&self, camera: &Camera, dest: &Path) -> Result<()> {
        let mut request = self.client.get(&camera.url);
        for (name, value) in &camera.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let mut response = request.send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0usize;
        while let Some(chunk) = response.chunk().await? {
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        if written == 0 {
            return Err(BotError::fetch(format!("Empty response from {}", camera.url)));
        }
        Ok(())
    }

    async fn stream_source(&self, camera: &Camera) -> Result<StreamSource> {
        if !camera.resolve_redirect {
            return Ok(StreamSource { url: camera.url.clone(), headers: camera.headers.clone() });
        }

        let mut request = self.no_redirect.get(&camera.url);
        for (name, value) in &camera.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        if !response.status().is_redirection() {
            return Err(BotError::fetch(format!(
                "Expected a redirect from stream endpoint {}, got {}",
                camera.url,
                response.status()
            )));
        }

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| BotError::fetch("No redirect URL returned from stream endpoint"))?;
        let resolved = url::Url::parse(&camera.url)?.join(location)?;
        debug!("Resolved stream URL for camera {}: {}", camera.id, resolved);

        Ok(StreamSource { url: resolved.to_string(), headers: camera.headers.clone() })
    }
}
