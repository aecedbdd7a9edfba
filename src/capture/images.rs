use std::path::Path;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::camera::{Camera, CameraDirectory};
use crate::errors::{BotError, Result};
use crate::frame_store::{CommitOutcome, FrameStore};

pub const MAX_FETCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCaptureSummary {
    pub requested: u32,
    pub duplicates: u32,
}

/// Fetches `N` still frames from one camera, spaced by a fixed delay.
pub struct ImageCaptureLoop<'a> {
    directory: &'a dyn CameraDirectory,
    camera: &'a Camera,
    fetch_delay: Duration,
}

impl<'a> ImageCaptureLoop<'a> {
    pub fn new(directory: &'a dyn CameraDirectory, camera: &'a Camera, fetch_delay: Duration) -> Self {
        Self { directory, camera, fetch_delay }
    }

    pub async fn run(&self, store: &mut FrameStore, frame_count: u32) -> Result<ImageCaptureSummary> {
        info!("Downloading traffic camera images. {} images...", frame_count);
        let mut duplicates = 0;

        for index in 0..frame_count {
            let path = store.path_for(index);
            self.fetch_with_retry(&path, index).await?;

            if store.commit(&path, index).await? == CommitOutcome::Duplicate {
                duplicates += 1;
            }

            if (index + 1) % 50 == 0 {
                info!("📷 {} / {} images fetched, {} unique", index + 1, frame_count, store.unique_count());
            }

            // No trailing sleep after the last frame
            if index + 1 < frame_count {
                sleep(self.fetch_delay).await;
            }
        }

        Ok(ImageCaptureSummary { requested: frame_count, duplicates })
    }

    async fn fetch_with_retry(&self, path: &Path, index: u32) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.directory.fetch_frame(self.camera, path).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Error downloading image {} (attempt {}/{}): {}",
                        index, attempt, MAX_FETCH_ATTEMPTS, e
                    );
                    // A partial frame must never reach the dedup gate or the encoder.
                    if let Err(remove_err) = tokio::fs::remove_file(path).await {
                        if remove_err.kind() != std::io::ErrorKind::NotFound {
                            return Err(remove_err.into());
                        }
                    }

                    if attempt == MAX_FETCH_ATTEMPTS {
                        return Err(BotError::fetch(format!(
                            "Giving up on image {} after {} attempts: {}",
                            index, MAX_FETCH_ATTEMPTS, e
                        )));
                    }

                    sleep(backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// 1s after the first failure, 2s after the second, ...
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::StreamSource;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves scripted responses in order; `None` is a failed fetch that leaves a partial file behind.
    struct ScriptedDirectory {
        responses: Mutex<Vec<Option<&'static str>>>,
        attempts: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedDirectory {
        fn new(mut responses: Vec<Option<&'static str>>) -> Self {
            responses.reverse();
            Self { responses: Mutex::new(responses), attempts: Mutex::new(Vec::new()) }
        }

        fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CameraDirectory for ScriptedDirectory {
        async fn list(&self) -> Vec<Camera> {
            Vec::new()
        }

        async fn fetch_frame(&self, _camera: &Camera, dest: &Path) -> Result<()> {
            self.attempts.lock().unwrap().push(tokio::time::Instant::now());
            let next = self.responses.lock().unwrap().pop().flatten();
            match next {
                Some(bytes) => {
                    std::fs::write(dest, bytes.as_bytes())?;
                    Ok(())
                }
                None => {
                    std::fs::write(dest, b"partial")?;
                    Err(BotError::fetch("connection reset"))
                }
            }
        }

        async fn stream_source(&self, camera: &Camera) -> Result<StreamSource> {
            Ok(StreamSource { url: camera.url.clone(), headers: Default::default() })
        }
    }

    fn camera() -> Camera {
        serde_json::from_str(r#"{"id":"7","name":"I-270 at SR-161","url":"http://cam/7.jpg"}"#).unwrap()
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_fatal_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::new(dir.path().to_path_buf());
        let directory = ScriptedDirectory::new(vec![None, None, None, None]);
        let camera = camera();

        let capture = ImageCaptureLoop::new(&directory, &camera, Duration::from_millis(6000));
        let result = capture.run(&mut store, 5).await;

        assert!(matches!(result, Err(BotError::Fetch { .. })));
        assert_eq!(directory.attempt_count(), 3);

        let attempts = directory.attempts.lock().unwrap().clone();
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(1));
        assert_eq!(attempts[2] - attempts[1], Duration::from_secs(2));
        assert!(!store.path_for(0).exists());
        assert_eq!(store.unique_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_is_replaced_by_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::new(dir.path().to_path_buf());
        let directory = ScriptedDirectory::new(vec![Some("a"), None, Some("b"), Some("b")]);
        let camera = camera();

        let capture = ImageCaptureLoop::new(&directory, &camera, Duration::from_millis(6000));
        let summary = capture.run(&mut store, 3).await.unwrap();

        assert_eq!(summary, ImageCaptureSummary { requested: 3, duplicates: 1 });
        assert_eq!(directory.attempt_count(), 4);
        assert_eq!(store.unique_count(), 2);
        assert_eq!(std::fs::read(store.path_for(1)).unwrap(), b"b");
        assert!(!store.path_for(2).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_frames_but_not_after_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::new(dir.path().to_path_buf());
        let directory = ScriptedDirectory::new(vec![Some("1"), Some("2"), Some("3")]);
        let camera = camera();

        let started = tokio::time::Instant::now();
        let capture = ImageCaptureLoop::new(&directory, &camera, Duration::from_millis(6000));
        capture.run(&mut store, 3).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_millis(12000));
    }
}
