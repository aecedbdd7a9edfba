use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod assembler;
mod camera;
mod capture;
mod config;
mod encoder;
mod errors;
mod frame_store;
mod frozen;
mod hasher;
mod publisher;
mod run;
mod runner;

use camera::{Camera, CameraDirectory, FileCameraDirectory};
use config::Config;
use encoder::FfmpegEncoder;
use publisher::BlueskyPublisher;
use runner::{BotProfile, BotRunner, Credentials, RunOptions, RunOutcome};

#[derive(Parser, Debug)]
#[command(name = "trafficcam-bot", about = "Posts traffic camera timelapses to Bluesky")]
struct Args {
    /// Print the available cameras and exit
    #[arg(long)]
    list: bool,

    /// Capture and encode, but do not post
    #[arg(long)]
    dry_run: bool,

    /// Keep the staging directory after the run
    #[arg(long)]
    persist: bool,

    /// Use this camera instead of a random one
    #[arg(long)]
    id: Option<String>,

    /// Configuration file (.toml or .json)
    #[arg(short, long, default_value = "bot.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries `--list` output only
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trafficcam_bot=debug,info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let directory = Arc::new(FileCameraDirectory::new(config.cameras.directory.clone())?);

    if args.list {
        write_camera_list(&mut std::io::stdout().lock(), &directory.list().await)?;
        return Ok(());
    }

    let profile = BotProfile::from_config(&config)?;
    let credentials = Credentials {
        identifier: config.publisher.identifier.clone(),
        secret: config.publisher.secret()?,
    };
    let options = RunOptions { dry_run: args.dry_run, persist: args.persist, camera_id: args.id };
    let publisher = Arc::new(BlueskyPublisher::new(&config.publisher.service, &config.publisher.video_service)?);

    let runner = BotRunner::new(
        profile,
        options,
        credentials,
        directory,
        publisher,
        Arc::new(FfmpegEncoder::new()),
    );
    let report = runner.run().await;

    match &report.outcome {
        RunOutcome::Completed { post: Some(uri) } => info!("✅ Run {} posted {}", report.run_id, uri),
        RunOutcome::Completed { post: None } => info!("✅ Run {} finished without posting", report.run_id),
        RunOutcome::Aborted { reason } => warn!("Run {} aborted: {}", report.run_id, reason),
        RunOutcome::Failed(_) => {}
    }

    std::process::exit(report.outcome.exit_code());
}

fn write_camera_list<W: Write>(out: &mut W, cameras: &[Camera]) -> std::io::Result<()> {
    if cameras.is_empty() {
        return writeln!(out, "No cameras available");
    }
    for camera in cameras {
        writeln!(out, "{}", camera.id)?;
        if camera.has_coordinates() {
            writeln!(out, "  {} ({}, {})", camera.name, camera.latitude, camera.longitude)?;
        } else {
            writeln!(out, "  {}", camera.name)?;
        }
    }
    Ok(())
}
