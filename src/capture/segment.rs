use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::camera::StreamSource;
use crate::encoder::{EncodeInput, EncodeJob, Encoder, OutputPolicy};
use crate::errors::{BotError, Result};

const RAW_CAPTURE_FILE: &str = "raw.ts";

/// Records a bounded slice of a live stream into a finished video file.
pub struct VideoSegmentCapture<'a> {
    encoder: &'a dyn Encoder,
    speedup: bool,
    two_phase: bool,
    min_raw_bytes: u64,
}

impl<'a> VideoSegmentCapture<'a> {
    pub fn new(encoder: &'a dyn Encoder, speedup: bool, two_phase: bool, min_raw_bytes: u64) -> Self {
        Self { encoder, speedup, two_phase, min_raw_bytes }
    }

    /// Returns the size of the produced video in bytes.
    pub async fn run(&self, source: &StreamSource, duration_secs: u64, staging: &Path, output: &Path) -> Result<u64> {
        info!("Recording {}s of video...", duration_secs);
        let size = if self.two_phase {
            self.capture_two_phase(source, duration_secs, staging, output).await?
        } else {
            self.capture_direct(source, duration_secs, output).await?
        };
        info!("Video saved: {} ({:.2} MB)", output.display(), size as f64 / (1024.0 * 1024.0));
        Ok(size)
    }

    async fn capture_direct(&self, source: &StreamSource, duration_secs: u64, output: &Path) -> Result<u64> {
        let job = EncodeJob {
            input: EncodeInput::Stream(source.clone()),
            duration_secs: Some(duration_secs),
            output: OutputPolicy::H264 { speedup: self.speedup },
            output_path: output.to_path_buf(),
            timeout: capture_timeout(duration_secs),
        };
        let report = self.encoder.encode(&job).await?;
        if let Some(error) = report.error {
            return Err(BotError::capture(format!("Stream capture failed: {}", error)));
        }
        if report.output_bytes == 0 {
            return Err(BotError::capture("Stream capture produced an empty file"));
        }
        Ok(report.output_bytes)
    }

    async fn capture_two_phase(
        &self,
        source: &StreamSource,
        duration_secs: u64,
        staging: &Path,
        output: &Path,
    ) -> Result<u64> {
        let raw_path = staging.join(RAW_CAPTURE_FILE);
        let raw_job = EncodeJob {
            input: EncodeInput::Stream(source.clone()),
            duration_secs: Some(duration_secs),
            output: OutputPolicy::StreamCopy,
            output_path: raw_path.clone(),
            timeout: capture_timeout(duration_secs),
        };
        let raw = self.encoder.encode(&raw_job).await?;

        if let Some(error) = raw.error {
            if raw.output_bytes < self.min_raw_bytes {
                return Err(BotError::capture(format!(
                    "Raw capture failed with only {} bytes written: {}",
                    raw.output_bytes, error
                )));
            }
            warn!(
                "Raw capture reported an error but wrote {} bytes, continuing: {}",
                raw.output_bytes, error
            );
        }

        let encode_job = EncodeJob {
            input: EncodeInput::File(raw_path.clone()),
            duration_secs: None,
            output: OutputPolicy::H264 { speedup: self.speedup },
            output_path: output.to_path_buf(),
            timeout: capture_timeout(duration_secs),
        };
        let encoded = self.encoder.encode(&encode_job).await;

        if let Err(e) = tokio::fs::remove_file(&raw_path).await {
            warn!("Failed to remove raw capture {}: {}", raw_path.display(), e);
        }

        let encoded = encoded?;
        if let Some(error) = encoded.error {
            return Err(BotError::capture(format!("Re-encode of raw capture failed: {}", error)));
        }
        Ok(encoded.output_bytes)
    }
}

/// Generous bound for slow environments: three times the capture plus a minute
fn capture_timeout(duration_secs: u64) -> Duration {
    Duration::from_secs(duration_secs * 3 + 60)
}
