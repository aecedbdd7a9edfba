use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::Result;
use crate::hasher::Fingerprint;

const CAPTURE_PREFIX: &str = "camera-";
const SEQUENCE_PREFIX: &str = "seq-";
const FRAME_EXTENSION: &str = ".jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Unique,
    Duplicate,
}

/// Still frames of one run inside its staging directory, with the set of
/// fingerprints seen so far. The set only grows.
#[derive(Debug)]
pub struct FrameStore {
    dir: PathBuf,
    fingerprints: HashSet<Fingerprint>,
}

impl FrameStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            fingerprints: HashSet::new(),
        }
    }

    /// Capture-time location of frame `index`. Retries of the same index land on the same file.
    pub fn path_for(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}{}{}", CAPTURE_PREFIX, index, FRAME_EXTENSION))
    }

    /// Input pattern for the encoder once frames have been renumbered
    pub fn encode_pattern(&self) -> PathBuf {
        self.dir.join(format!("{}%d{}", SEQUENCE_PREFIX, FRAME_EXTENSION))
    }

    pub fn unique_count(&self) -> usize {
        self.fingerprints.len()
    }

    /// Deduplication gate, called exactly once per completed download.
    /// Duplicates are deleted from disk immediately.
    pub async fn commit(&mut self, path: &Path, index: u32) -> Result<CommitOutcome> {
        let bytes = tokio::fs::read(path).await?;
        let fingerprint = Fingerprint::of(&bytes);

        if self.fingerprints.insert(fingerprint) {
            debug!("Frame {} is unique ({})", index, fingerprint);
            Ok(CommitOutcome::Unique)
        } else {
            info!("Skipping duplicate image {}", index);
            tokio::fs::remove_file(path).await?;
            Ok(CommitOutcome::Duplicate)
        }
    }

    /// Rename retained frames to a gap-free `seq-0..K-1` sequence in capture
    /// order. Returns K.
    pub async fn renumber_for_encode(&self) -> Result<usize> {
        let mut frames: Vec<(u32, PathBuf)> = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(capture_index) {
                frames.push((index, entry.path()));
            }
        }

        // Indices are not zero-padded, so lexical order would put 10 before 2.
        frames.sort_by_key(|(index, _)| *index);

        for (sequence, (_, path)) in frames.iter().enumerate() {
            let target = self.dir.join(format!("{}{}{}", SEQUENCE_PREFIX, sequence, FRAME_EXTENSION));
            tokio::fs::rename(path, target).await?;
        }

        debug!("Renumbered {} frames for encoding", frames.len());
        Ok(frames.len())
    }
}

fn capture_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(CAPTURE_PREFIX)?
        .strip_suffix(FRAME_EXTENSION)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_frame(store: &FrameStore, index: u32, content: &[u8]) -> PathBuf {
        let path = store.path_for(index);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[test]
    fn test_capture_index_parsing() {
        assert_eq!(capture_index("camera-0.jpg"), Some(0));
        assert_eq!(capture_index("camera-117.jpg"), Some(117));
        assert_eq!(capture_index("seq-3.jpg"), None);
        assert_eq!(capture_index("camera-x.jpg"), None);
        assert_eq!(capture_index("camera.mp4"), None);
    }

    #[tokio::test]
    async fn test_identical_frames_collapse_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::new(dir.path().to_path_buf());

        let mut duplicates = 0;
        for index in 0..5 {
            let path = write_frame(&store, index, b"static feed").await;
            if store.commit(&path, index).await.unwrap() == CommitOutcome::Duplicate {
                duplicates += 1;
                assert!(!path.exists());
            }
        }

        assert_eq!(store.unique_count(), 1);
        assert_eq!(duplicates, 4);
        assert!(store.path_for(0).exists());
    }

    #[tokio::test]
    async fn test_commit_order_does_not_change_unique_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::new(dir.path().to_path_buf());

        let contents: [&[u8]; 4] = [b"b", b"a", b"b", b"a"];
        for (index, content) in contents.iter().enumerate() {
            let path = write_frame(&store, index as u32, content).await;
            store.commit(&path, index as u32).await.unwrap();
        }

        assert_eq!(store.unique_count(), 2);
        assert!(store.path_for(0).exists());
        assert!(store.path_for(1).exists());
        assert!(!store.path_for(2).exists());
        assert!(!store.path_for(3).exists());
    }

    #[tokio::test]
    async fn test_renumber_closes_gaps_in_capture_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FrameStore::new(dir.path().to_path_buf());

        // 0, 2, 5, 7 and 10 unique, everything else a repeat of frame 0
        for index in 0..11u32 {
            let content = match index {
                2 | 5 | 7 | 10 => format!("frame {}", index),
                _ => "frame 0".to_string(),
            };
            let path = write_frame(&store, index, content.as_bytes()).await;
            store.commit(&path, index).await.unwrap();
        }
        assert_eq!(store.unique_count(), 5);

        let count = store.renumber_for_encode().await.unwrap();
        assert_eq!(count, 5);

        let expected = ["frame 0", "frame 2", "frame 5", "frame 7", "frame 10"];
        for (sequence, content) in expected.iter().enumerate() {
            let path = dir.path().join(format!("seq-{}.jpg", sequence));
            assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), *content);
        }
        assert!(!dir.path().join("seq-5.jpg").exists());
        assert!(!store.path_for(0).exists());
        assert!(store.encode_pattern().ends_with("seq-%d.jpg"));
    }
}
