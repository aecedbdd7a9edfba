use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::encoder::{AspectRatio, EncodeInput, EncodeJob, Encoder, OutputPolicy};
use crate::errors::{BotError, Result};
use crate::frame_store::FrameStore;

const ASSEMBLE_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledVideo {
    pub path: PathBuf,
    pub frames: usize,
    pub size_bytes: u64,
    pub aspect_ratio: AspectRatio,
}

/// Turns the retained frames of a run into one video and measures it.
pub struct VideoAssembler<'a> {
    encoder: &'a dyn Encoder,
    framerate: u32,
}

impl<'a> VideoAssembler<'a> {
    pub fn new(encoder: &'a dyn Encoder, framerate: u32) -> Self {
        Self { encoder, framerate }
    }

    pub async fn assemble(&self, store: &FrameStore, output: &Path) -> Result<AssembledVideo> {
        info!("Generating video...");
        let frames = store.renumber_for_encode().await?;
        if frames == 0 {
            return Err(BotError::encoder("No frames to encode"));
        }

        let job = EncodeJob {
            input: EncodeInput::Frames { pattern: store.encode_pattern(), framerate: self.framerate },
            duration_secs: None,
            output: OutputPolicy::H264 { speedup: false },
            output_path: output.to_path_buf(),
            timeout: Duration::from_secs(ASSEMBLE_TIMEOUT_SECS),
        };
        let report = self.encoder.encode(&job).await?;
        if let Some(error) = report.error {
            return Err(BotError::encoder(format!("Video generation failed: {}", error)));
        }

        let aspect_ratio = self.encoder.probe(output).await?;
        info!(
            "Video generated: {} ({:.2} MB, {}x{})",
            output.display(),
            report.output_bytes as f64 / (1024.0 * 1024.0),
            aspect_ratio.width,
            aspect_ratio.height
        );
        info!("Total unique images: {}", store.unique_count());

        Ok(AssembledVideo {
            path: output.to_path_buf(),
            frames,
            size_bytes: report.output_bytes,
            aspect_ratio,
        })
    }
}
