use bytes::Bytes;
use chrono_tz::Tz;
use rand::seq::IndexedRandom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::assembler::VideoAssembler;
use crate::camera::{Camera, CameraDirectory};
use crate::capture::{ImageCaptureLoop, VideoSegmentCapture};
use crate::config::{CaptureMode, Config, VideoConfig};
use crate::encoder::{AspectRatio, Encoder};
use crate::errors::{BotError, Result};
use crate::frozen;
use crate::publisher::caption::{self, CaptionStyle};
use crate::publisher::{await_blob, PostDraft, Session, SocialPublisher};
use crate::run::{sweep_stale_staging, Run, RunState};

/// Everything a run needs from the account's configuration, already parsed.
#[derive(Debug, Clone)]
pub struct BotProfile {
    pub account: String,
    pub timezone: Tz,
    pub tz_abbrev: String,
    pub framerate: u32,
    pub fetch_delay: Duration,
    pub frame_counts: Vec<u32>,
    pub capture: CaptureMode,
    pub timelapse_24h: bool,
    pub staging_root: PathBuf,
    pub stale_after: Duration,
    pub video: VideoConfig,
}

impl BotProfile {
    pub fn from_config(config: &Config) -> Result<Self> {
        let bot = &config.bot;
        let timezone = bot
            .timezone
            .parse::<Tz>()
            .map_err(|e| BotError::config(format!("Invalid timezone '{}': {}", bot.timezone, e)))?;

        Ok(Self {
            account: bot.account.clone(),
            timezone,
            tz_abbrev: bot.tz_abbrev.clone(),
            framerate: bot.framerate,
            fetch_delay: Duration::from_millis(bot.fetch_delay_ms),
            frame_counts: bot.frame_counts.clone(),
            capture: bot.capture,
            timelapse_24h: bot.timelapse_24h,
            staging_root: bot.staging_root.clone(),
            stale_after: Duration::from_secs(bot.stale_after_hours * 3600),
            video: config.video.clone(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub persist: bool,
    pub camera_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// `post` is `None` for a dry run
    Completed { post: Option<String> },
    /// Nothing worth publishing, e.g. a frozen feed
    Aborted { reason: String },
    Failed(BotError),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Failed(_) => 1,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    /// Last state reached before cleanup
    pub terminal_state: RunState,
    pub staging_dir: PathBuf,
}

pub struct BotRunner {
    profile: BotProfile,
    options: RunOptions,
    credentials: Credentials,
    directory: Arc<dyn CameraDirectory>,
    publisher: Arc<dyn SocialPublisher>,
    encoder: Arc<dyn Encoder>,
}

impl BotRunner {
    pub fn new(
        profile: BotProfile,
        options: RunOptions,
        credentials: Credentials,
        directory: Arc<dyn CameraDirectory>,
        publisher: Arc<dyn SocialPublisher>,
        encoder: Arc<dyn Encoder>,
    ) -> Self {
        Self { profile, options, credentials, directory, publisher, encoder }
    }

    /// Execute one run end to end. Cleanup happens on every path.
    pub async fn run(&self) -> RunReport {
        let removed =
            sweep_stale_staging(&self.profile.staging_root, &self.profile.account, self.profile.stale_after).await;
        if removed > 0 {
            info!("🧹 Removed {} stale staging directories", removed);
        }

        let mut run = Run::new(&self.profile.staging_root, &self.profile.account);
        info!("🚀 Starting run {} for {}", run.id, self.profile.account);

        let outcome = match self.drive(&mut run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Run {} failed: {}", run.id, e);
                run.advance(RunState::Failed);
                RunOutcome::Failed(e)
            }
        };

        let terminal_state = run.state();
        run.cleanup(self.options.persist).await;

        RunReport {
            run_id: run.id.clone(),
            outcome,
            terminal_state,
            staging_dir: run.staging_dir().to_path_buf(),
        }
    }

    async fn drive(&self, run: &mut Run) -> Result<RunOutcome> {
        let session = self
            .publisher
            .login(&self.credentials.identifier, &self.credentials.secret)
            .await?;
        if session.did.is_empty() {
            return Err(BotError::publish("Failed to get DID after login"));
        }
        info!("Logged in as {} ({})", session.handle, session.did);
        run.advance(RunState::Authenticated);

        let cameras = self.directory.list().await;
        let camera = select_camera(&cameras, self.options.camera_id.as_deref())?.clone();
        info!("ID {}: {}", camera.id, camera.name);
        run.select(camera.clone()).await?;
        run.advance(RunState::CameraSelected);

        let use_video = match self.profile.capture {
            CaptureMode::Images => false,
            CaptureMode::Video => true,
            CaptureMode::Auto => camera.has_video,
        };

        run.mark_started();
        run.advance(RunState::Capturing);

        let video_path = run.video_path();
        let aspect_ratio = if use_video {
            let source = self.directory.stream_source(&camera).await?;
            let duration = choose(&self.profile.video.durations, "capture durations")?;
            let capture = VideoSegmentCapture::new(
                self.encoder.as_ref(),
                self.profile.video.speedup,
                self.profile.video.two_phase,
                self.profile.video.min_raw_bytes,
            );
            capture.run(&source, duration, run.staging_dir(), &video_path).await?;
            run.mark_ended();
            run.advance(RunState::Captured);

            let aspect_ratio = self.encoder.probe(&video_path).await?;
            run.advance(RunState::Assembled);
            aspect_ratio
        } else {
            let frame_count = choose(&self.profile.frame_counts, "frame counts")?;
            let capture = ImageCaptureLoop::new(self.directory.as_ref(), &camera, self.profile.fetch_delay);
            let summary = capture.run(run.frames_mut(), frame_count).await?;
            info!(
                "Download complete: {} requested, {} duplicates skipped",
                summary.requested, summary.duplicates
            );

            if let Some(reason) = frozen::check(&camera, run.unique_image_count()) {
                run.advance(RunState::Aborted);
                return Ok(RunOutcome::Aborted { reason });
            }
            run.mark_ended();
            run.advance(RunState::Captured);

            let assembler = VideoAssembler::new(self.encoder.as_ref(), self.profile.framerate);
            let video = assembler.assemble(run.frames(), &video_path).await?;
            debug!("{} frames in {} ({} bytes)", video.frames, video.path.display(), video.size_bytes);
            run.advance(RunState::Assembled);
            video.aspect_ratio
        };

        if self.options.dry_run {
            info!("Dry run - skipping post to Bluesky");
            return Ok(RunOutcome::Completed { post: None });
        }

        let post = self.publish(run, &session, aspect_ratio).await?;
        run.advance(RunState::Published);
        info!("Posted video to Bluesky successfully");
        Ok(RunOutcome::Completed { post: Some(post) })
    }

    async fn publish(&self, run: &Run, session: &Session, aspect_ratio: AspectRatio) -> Result<String> {
        let camera = run.camera().ok_or_else(|| BotError::publish("No camera selected"))?;
        let (started_at, ended_at) = run
            .capture_window()
            .ok_or_else(|| BotError::publish("Capture window was never recorded"))?;

        let video = Bytes::from(tokio::fs::read(run.video_path()).await?);
        let job = self.publisher.upload_video(session, video).await?;
        let blob = await_blob(self.publisher.as_ref(), session, &job).await?;

        let style = CaptionStyle {
            timezone: self.profile.timezone,
            tz_abbrev: &self.profile.tz_abbrev,
            timelapse_24h: self.profile.timelapse_24h,
        };
        let caption = caption::compose(camera, started_at, ended_at, &style);
        let draft = PostDraft { text: caption.text, link: caption.link, video: blob, aspect_ratio };
        self.publisher.create_post(session, &draft).await
    }
}

/// Exact id match when one is requested, otherwise a uniform pick.
pub fn select_camera<'a>(cameras: &'a [Camera], requested: Option<&str>) -> Result<&'a Camera> {
    if cameras.is_empty() {
        return Err(BotError::selection("No cameras available"));
    }
    let selected = match requested {
        Some(id) => cameras.iter().find(|c| c.id == id),
        None => cameras.choose(&mut rand::rng()),
    };
    selected.ok_or_else(|| BotError::selection("Could not select a camera"))
}

fn choose<T: Copy>(options: &[T], what: &str) -> Result<T> {
    options
        .choose(&mut rand::rng())
        .copied()
        .ok_or_else(|| BotError::config(format!("No {} configured", what)))
}
