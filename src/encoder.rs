use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::camera::StreamSource;
use crate::errors::{BotError, Result};

// Fixed output policy for every published video
const VIDEO_CODEC: &str = "libx264";
const PRESET: &str = "medium";
const CRF: &str = "23";
const PIXEL_FORMAT: &str = "yuv420p";
/// Output plays at twice the captured rate
const SPEEDUP_FILTER: &str = "setpts=0.5*PTS";

const PROBE_TIMEOUT_SECS: u64 = 30;
const STDERR_TAIL_CHARS: usize = 600;

#[derive(Debug, Clone, PartialEq)]
pub enum EncodeInput {
    Stream(StreamSource),
    Frames { pattern: PathBuf, framerate: u32 },
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputPolicy {
    H264 { speedup: bool },
    /// Copy packets untouched into MPEG-TS
    StreamCopy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    pub input: EncodeInput,
    pub duration_secs: Option<u64>,
    pub output: OutputPolicy,
    pub output_path: PathBuf,
    pub timeout: Duration,
}

/// Outcome of one encoder process. A process that ran but failed is not an
/// `Err`: callers decide whether the produced file is still usable.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeReport {
    pub error: Option<String>,
    pub output_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, job: &EncodeJob) -> Result<EncodeReport>;
    async fn probe(&self, path: &Path) -> Result<AspectRatio>;
}

pub struct FfmpegEncoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }

    pub fn args(job: &EncodeJob) -> Vec<String> {
        let mut args: Vec<String> = vec!["-y".into(), "-nostdin".into()];

        match &job.input {
            EncodeInput::Stream(source) => {
                if let Some(duration) = job.duration_secs {
                    args.extend(["-t".into(), duration.to_string()]);
                }
                if !source.headers.is_empty() {
                    let headers: String = source
                        .headers
                        .iter()
                        .map(|(name, value)| format!("{}: {}\r\n", name, value))
                        .collect();
                    args.extend(["-headers".into(), headers]);
                }
                args.extend(["-i".into(), source.url.clone()]);
            }
            EncodeInput::Frames { pattern, framerate } => {
                args.extend([
                    "-framerate".into(),
                    framerate.to_string(),
                    "-i".into(),
                    pattern.to_string_lossy().to_string(),
                ]);
            }
            EncodeInput::File(path) => {
                args.extend(["-i".into(), path.to_string_lossy().to_string()]);
            }
        }

        match job.output {
            OutputPolicy::H264 { speedup } => {
                args.extend([
                    "-c:v".into(), VIDEO_CODEC.into(),
                    "-preset".into(), PRESET.into(),
                    "-crf".into(), CRF.into(),
                    "-pix_fmt".into(), PIXEL_FORMAT.into(),
                ]);
                if speedup {
                    args.extend(["-vf".into(), SPEEDUP_FILTER.into(), "-an".into()]);
                }
            }
            OutputPolicy::StreamCopy => {
                args.extend(["-c".into(), "copy".into(), "-f".into(), "mpegts".into()]);
            }
        }

        args.push(job.output_path.to_string_lossy().to_string());
        args
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, job: &EncodeJob) -> Result<EncodeReport> {
        let args = Self::args(job);
        debug!("Running {} {}", self.ffmpeg, args.join(" "));

        let child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BotError::encoder(format!("Failed to execute {}: {}", self.ffmpeg, e)))?;

        // Dropping the child on timeout kills it.
        let error = match tokio::time::timeout(job.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => None,
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Some(format!("{} exited with {}: {}", self.ffmpeg, output.status, tail(&stderr)))
            }
            Ok(Err(e)) => Some(format!("Failed to wait for {}: {}", self.ffmpeg, e)),
            Err(_) => Some(format!("{} timed out after {}s", self.ffmpeg, job.timeout.as_secs())),
        };

        let output_bytes = tokio::fs::metadata(&job.output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        if let Some(ref message) = error {
            warn!("Encoder reported an error ({} bytes written): {}", output_bytes, message);
        }
        Ok(EncodeReport { error, output_bytes })
    }

    async fn probe(&self, path: &Path) -> Result<AspectRatio> {
        let output = tokio::time::timeout(
            Duration::from_secs(PROBE_TIMEOUT_SECS),
            Command::new(&self.ffprobe)
                .args([
                    "-v", "error",
                    "-select_streams", "v:0",
                    "-show_entries", "stream=width,height",
                    "-of", "csv=p=0",
                ])
                .arg(path)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| BotError::encoder(format!("{} timed out", self.ffprobe)))?
        .map_err(|e| BotError::encoder(format!("Failed to execute {}: {}", self.ffprobe, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BotError::encoder(format!("{} failed: {}", self.ffprobe, tail(&stderr))));
        }

        parse_dimensions(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `width,height` as printed by ffprobe's csv writer
pub fn parse_dimensions(output: &str) -> Result<AspectRatio> {
    let line = output.lines().next().unwrap_or("").trim();
    let (width, height) = line
        .split_once(',')
        .ok_or_else(|| BotError::encoder(format!("Unexpected probe output: '{}'", line)))?;

    let width: u32 = width.trim().parse()
        .map_err(|_| BotError::encoder(format!("Invalid width in probe output: '{}'", line)))?;
    let height: u32 = height.trim().trim_end_matches(',').parse()
        .map_err(|_| BotError::encoder(format!("Invalid height in probe output: '{}'", line)))?;

    if width == 0 || height == 0 {
        return Err(BotError::encoder(format!("Degenerate video dimensions: {}x{}", width, height)));
    }
    Ok(AspectRatio { width, height })
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    if text.len() <= STDERR_TAIL_CHARS {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL_CHARS;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_frame_assembly_args() {
        let job = EncodeJob {
            input: EncodeInput::Frames { pattern: PathBuf::from("/tmp/run/seq-%d.jpg"), framerate: 10 },
            duration_secs: None,
            output: OutputPolicy::H264 { speedup: false },
            output_path: PathBuf::from("/tmp/run/camera.mp4"),
            timeout: Duration::from_secs(600),
        };
        assert_eq!(
            FfmpegEncoder::args(&job).join(" "),
            "-y -nostdin -framerate 10 -i /tmp/run/seq-%d.jpg -c:v libx264 -preset medium -crf 23 -pix_fmt yuv420p /tmp/run/camera.mp4"
        );
    }

    #[test]
    fn test_stream_args_with_headers_and_speedup() {
        let mut headers = BTreeMap::new();
        headers.insert("Referer".to_string(), "https://www.idrivearkansas.com/".to_string());
        let job = EncodeJob {
            input: EncodeInput::Stream(StreamSource { url: "https://s/live.m3u8?token=1".into(), headers }),
            duration_secs: Some(90),
            output: OutputPolicy::H264 { speedup: true },
            output_path: PathBuf::from("out.mp4"),
            timeout: Duration::from_secs(330),
        };
        let args = FfmpegEncoder::args(&job);

        let t = args.iter().position(|a| a == "-t").unwrap();
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert!(t < i, "duration must bound the input");
        assert_eq!(args[t + 1], "90");
        assert!(args.contains(&"Referer: https://www.idrivearkansas.com/\r\n".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "setpts=0.5*PTS"));
        assert!(args.contains(&"-an".to_string()));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_stream_copy_args() {
        let job = EncodeJob {
            input: EncodeInput::Stream(StreamSource { url: "rtsp://cam/1".into(), headers: BTreeMap::new() }),
            duration_secs: Some(60),
            output: OutputPolicy::StreamCopy,
            output_path: PathBuf::from("raw.ts"),
            timeout: Duration::from_secs(240),
        };
        let args = FfmpegEncoder::args(&job).join(" ");
        assert_eq!(args, "-y -nostdin -t 60 -i rtsp://cam/1 -c copy -f mpegts raw.ts");
    }

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("1280,720\n").unwrap(), AspectRatio { width: 1280, height: 720 });
        assert_eq!(parse_dimensions("352,240,\n").unwrap(), AspectRatio { width: 352, height: 240 });
        assert!(parse_dimensions("").is_err());
        assert!(parse_dimensions("0,0").is_err());
        assert!(parse_dimensions("N/A,N/A").is_err());
    }

    #[test]
    fn test_tail_keeps_end_of_long_output() {
        let long = "x".repeat(1000) + "fatal: 404";
        assert!(tail(&long).ends_with("fatal: 404"));
        assert_eq!(tail(&long).len(), STDERR_TAIL_CHARS);
    }
}
