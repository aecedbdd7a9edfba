mod bluesky;
pub mod caption;

pub use bluesky::BlueskyPublisher;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::info;

use crate::encoder::AspectRatio;
use crate::errors::{BotError, Result};

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Session {
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    pub pds: url::Url,
}

/// A processing job on the video service. `blob` is set when the upload
/// response already carried the finished blob.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job_id: String,
    pub blob: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending { state: String, progress: Option<u64> },
    Done(Value),
    Failed(String),
}

/// Link annotation over a UTF-8 byte range of the post text
#[derive(Debug, Clone, PartialEq)]
pub struct LinkFacet {
    pub byte_start: usize,
    pub byte_end: usize,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostDraft {
    pub text: String,
    pub link: Option<LinkFacet>,
    pub video: Value,
    pub aspect_ratio: AspectRatio,
}

#[async_trait]
pub trait SocialPublisher: Send + Sync {
    async fn login(&self, identifier: &str, secret: &str) -> Result<Session>;
    async fn upload_video(&self, session: &Session, video: Bytes) -> Result<JobHandle>;
    async fn poll_job(&self, session: &Session, job: &JobHandle) -> Result<JobState>;
    /// Returns the id of the created post
    async fn create_post(&self, session: &Session, post: &PostDraft) -> Result<String>;
}

/// Poll the job once per second until the video service hands back a blob.
pub async fn await_blob(publisher: &dyn SocialPublisher, session: &Session, job: &JobHandle) -> Result<Value> {
    if let Some(ref blob) = job.blob {
        return Ok(blob.clone());
    }

    loop {
        sleep(JOB_POLL_INTERVAL).await;
        match publisher.poll_job(session, job).await? {
            JobState::Pending { state, progress } => {
                info!("Processing: {} {}", state, progress.map(|p| format!("{}%", p)).unwrap_or_default());
            }
            JobState::Done(blob) => {
                info!("Video processing complete!");
                return Ok(blob);
            }
            JobState::Failed(message) => {
                return Err(BotError::publish(format!("Video processing failed: {}", message)));
            }
        }
    }
}
