//! Pitwall Edge - in-vehicle stream agent
//!
//! Supervises the encoder, listens for cloud commands over WebSocket, and
//! reports heartbeats and auto-quality requests back over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! export PITWALL_CLOUD_URL=https://pitwall.example.com
//! export PITWALL_TRUCK_TOKEN=s3cret
//! export PITWALL_CAMERAS="main=/dev/video0,chase=/dev/video2"
//! export PITWALL_RTMP_URL=rtmp://a.rtmp.youtube.com/live2
//! export PITWALL_STREAM_KEY=xxxx-xxxx-xxxx-xxxx
//! pitwall-edge
//!
//! # Fixed quality, no auto downshift
//! PITWALL_AUTO_QUALITY=0 PITWALL_PROFILE=480p pitwall-edge
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use pitwall::edge::{
    AgentConfig, CloudClient, CommandListener, EdgeAgent, EncoderSpec, Supervisor,
    SupervisorPolicy,
};
use pitwall::{CameraSlot, QualityProfile, RedactedString};

/// Edge configuration from environment
struct Config {
    cloud_url: String,
    truck_token: RedactedString,
    encoder: EncoderSpec,
    profile: QualityProfile,
    auto_quality: bool,
    status_file: Option<PathBuf>,
    youtube_url: Option<String>,
}

impl Config {
    fn from_env() -> Result<Self> {
        let cloud_url = std::env::var("PITWALL_CLOUD_URL")
            .context("PITWALL_CLOUD_URL environment variable not set")?;
        let truck_token = std::env::var("PITWALL_TRUCK_TOKEN")
            .map(RedactedString::from)
            .context("PITWALL_TRUCK_TOKEN environment variable not set")?;

        let inputs = parse_cameras(&std::env::var("PITWALL_CAMERAS").unwrap_or_default())?;
        let rtmp_url = std::env::var("PITWALL_RTMP_URL")
            .unwrap_or_else(|_| "rtmp://a.rtmp.youtube.com/live2".to_string());
        let stream_key = RedactedString::from(std::env::var("PITWALL_STREAM_KEY").unwrap_or_default());

        let mut encoder = EncoderSpec::ffmpeg(rtmp_url, stream_key, inputs);
        if let Ok(program) = std::env::var("PITWALL_ENCODER") {
            encoder.program = program;
        }
        if let Ok(signature) = std::env::var("PITWALL_ORPHAN_SIGNATURE") {
            encoder.orphan_signature = Some(signature).filter(|s| !s.trim().is_empty());
        }

        let profile = match std::env::var("PITWALL_PROFILE") {
            Ok(p) => p.parse().context("Invalid PITWALL_PROFILE")?,
            Err(_) => QualityProfile::default(),
        };

        // Auto quality on by default, disable with PITWALL_AUTO_QUALITY=0
        let auto_quality = std::env::var("PITWALL_AUTO_QUALITY")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let status_file = std::env::var("PITWALL_STATUS_FILE").map(PathBuf::from).ok();
        let youtube_url = std::env::var("PITWALL_YOUTUBE_URL").ok();

        Ok(Self {
            cloud_url,
            truck_token,
            encoder,
            profile,
            auto_quality,
            status_file,
            youtube_url,
        })
    }
}

/// `main=/dev/video0,chase=rtsp://10.0.0.5/stream`
fn parse_cameras(spec: &str) -> Result<HashMap<CameraSlot, String>> {
    let mut inputs = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, input)) = entry.split_once('=') else {
            bail!("Invalid camera entry '{}' (expected slot=input)", entry);
        };
        let slot: CameraSlot = name.trim().parse()?;
        inputs.insert(slot, input.trim().to_string());
    }
    Ok(inputs)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = Config::from_env()?;

    info!("Pitwall edge starting");
    info!("  Cloud: {}", config.cloud_url);
    info!("  Cameras: {:?}", config.encoder.cameras());
    info!("  Encoder: {}", config.encoder.program);
    info!("  Profile: {}", config.profile);
    info!("  Auto quality: {}", config.auto_quality);
    if let Some(ref path) = config.status_file {
        info!("  Status file: {:?}", path);
    }
    if config.encoder.cameras().is_empty() {
        warn!("  No cameras configured (set PITWALL_CAMERAS)");
    }
    if !config.encoder.output_configured() {
        warn!("  Stream key not configured (set PITWALL_STREAM_KEY)");
    }

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let cameras = config.encoder.cameras();
    let output_configured = config.encoder.output_configured();
    let (supervisor, handle) = Supervisor::new(
        SupervisorPolicy::default(),
        config.encoder,
        config.profile,
        config.status_file,
    );
    tracker.spawn(supervisor.run(cancel.clone()));

    let cloud = Arc::new(CloudClient::new(&config.cloud_url, config.truck_token.clone())?);
    let agent = Arc::new(
        EdgeAgent::new(
            handle,
            cloud,
            cameras,
            output_configured,
            AgentConfig {
                auto_quality: config.auto_quality,
                ..Default::default()
            },
        )
        .with_youtube_url(config.youtube_url),
    );

    let (command_tx, command_rx) = mpsc::channel(32);
    let listener = CommandListener::new(&config.cloud_url, config.truck_token, command_tx);
    tracker.spawn(listener.run(cancel.clone()));
    tracker.spawn(agent.run(command_rx, cancel.clone()));

    tracker.close();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to wait for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");
    cancel.cancel();

    if tokio::time::timeout(Duration::from_secs(10), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 10s");
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("pitwall=info".parse()?),
        )
        .init();
    Ok(())
}
