use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::camera::Camera;
use crate::errors::Result;
use crate::frame_store::FrameStore;

const VIDEO_FILE: &str = "camera.mp4";
/// Present in staging directories kept with `--persist`; the stale sweep leaves them alone
const PERSIST_MARKER: &str = ".persist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Authenticated,
    CameraSelected,
    Capturing,
    Aborted,
    Captured,
    Assembled,
    Published,
    Failed,
    Cleaned,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Authenticated => "authenticated",
            RunState::CameraSelected => "camera-selected",
            RunState::Capturing => "capturing",
            RunState::Aborted => "aborted",
            RunState::Captured => "captured",
            RunState::Assembled => "assembled",
            RunState::Published => "published",
            RunState::Failed => "failed",
            RunState::Cleaned => "cleaned",
        };
        write!(f, "{}", name)
    }
}

/// One end-to-end execution for one camera. Owns the staging directory and
/// everything captured into it.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    state: RunState,
    staging_dir: PathBuf,
    camera: Option<Camera>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    frames: FrameStore,
}

impl Run {
    pub fn new(staging_root: &Path, account: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        let staging_dir = staging_root.join(format!(
            "{}{}-{}",
            staging_prefix(account),
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            id
        ));
        Self {
            frames: FrameStore::new(staging_dir.clone()),
            id,
            state: RunState::Idle,
            staging_dir,
            camera: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) {
        info!("[{}] {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn video_path(&self) -> PathBuf {
        self.staging_dir.join(VIDEO_FILE)
    }

    pub async fn select(&mut self, camera: Camera) -> Result<()> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        self.camera = Some(camera);
        Ok(())
    }

    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub fn mark_ended(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    /// Wall-clock bounds of the capture phase, once both are known
    pub fn capture_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.started_at?, self.ended_at?))
    }

    pub fn frames(&self) -> &FrameStore {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameStore {
        &mut self.frames
    }

    pub fn unique_image_count(&self) -> usize {
        self.frames.unique_count()
    }

    /// Remove the staging directory unless asked to keep it. Never fails the run.
    pub async fn cleanup(&mut self, persist: bool) {
        let exists = tokio::fs::try_exists(&self.staging_dir).await.unwrap_or(false);
        if persist {
            if exists {
                if let Err(e) = tokio::fs::write(self.staging_dir.join(PERSIST_MARKER), self.id.as_bytes()).await {
                    warn!("Failed to mark {} as persisted: {}", self.staging_dir.display(), e);
                }
            }
            info!("Keeping {}", self.staging_dir.display());
        } else if exists {
            match tokio::fs::remove_dir_all(&self.staging_dir).await {
                Ok(()) => info!("Removed {}", self.staging_dir.display()),
                Err(e) => warn!("Failed to cleanup {}: {}", self.staging_dir.display(), e),
            }
        }
        self.advance(RunState::Cleaned);
    }
}

fn staging_prefix(account: &str) -> String {
    format!("{}-assets-", account)
}

/// Remove staging directories of this account left behind by killed runs.
/// Directories kept with `--persist` are skipped. Returns how many were removed.
pub async fn sweep_stale_staging(staging_root: &Path, account: &str, max_age: Duration) -> usize {
    let prefix = staging_prefix(account);
    let mut entries = match tokio::fs::read_dir(staging_root).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read {} for stale staging cleanup: {}", staging_root.display(), e);
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_ours = entry.file_name().to_str().map_or(false, |name| name.starts_with(&prefix));
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        if !is_ours || !metadata.is_dir() {
            continue;
        }
        if tokio::fs::try_exists(path.join(PERSIST_MARKER)).await.unwrap_or(false) {
            debug!("Leaving persisted staging directory {}", path.display());
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            debug!("Leaving recent staging directory {}", path.display());
            continue;
        }

        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                removed += 1;
                info!("Removed stale staging directory {}", path.display());
            }
            Err(e) => warn!("Failed to remove stale staging directory {}: {}", path.display(), e),
        }
    }
    removed
}
