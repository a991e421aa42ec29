//! Pitwall Cloud - stream control coordinator
//!
//! Serves the operator API and the edge push channel, tracks every
//! vehicle's stream state and sweeps out stale edges and lost commands.
//!
//! ## Usage
//!
//! ```bash
//! # Two vehicles, the first with an edge token
//! PITWALL_VEHICLES="gp-2026:car-7:s3cret,gp-2026:car-9" pitwall-cloud
//!
//! # Protect operator routes
//! PITWALL_ADMIN_TOKEN=letmein PITWALL_BIND=127.0.0.1:9000 pitwall-cloud
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use pitwall::cloud::{ControlPlane, PlaneConfig, StaticDirectory};
use pitwall::RedactedString;

/// Cloud configuration from environment
struct Config {
    bind: SocketAddr,
    admin_token: Option<RedactedString>,
    vehicles: String,
    plane: PlaneConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let bind = std::env::var("PITWALL_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("PITWALL_BIND is not a socket address")?;

        let admin_token = std::env::var("PITWALL_ADMIN_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(RedactedString::from);

        let vehicles = std::env::var("PITWALL_VEHICLES").unwrap_or_default();

        let mut plane = PlaneConfig::default();
        if let Some(ms) = env_u64("PITWALL_SWEEP_INTERVAL_MS") {
            plane.sweep_interval = Duration::from_millis(ms.max(100));
        }
        if let Some(ms) = env_u64("PITWALL_SWITCH_MIN_INTERVAL_MS") {
            plane.switch_min_interval_ms = ms;
        }

        Ok(Self {
            bind,
            admin_token,
            vehicles,
            plane,
        })
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let config = Config::from_env()?;
    let directory = StaticDirectory::parse(&config.vehicles)?;

    info!("Pitwall cloud starting");
    info!("  Bind: {}", config.bind);
    info!("  Vehicles: {}", directory.len());
    info!("  Sweep interval: {:?}", config.plane.sweep_interval);
    info!("  Switch min interval: {}ms", config.plane.switch_min_interval_ms);
    if config.admin_token.is_none() {
        warn!("  PITWALL_ADMIN_TOKEN unset: operator routes are open");
    }
    if directory.is_empty() {
        warn!("  No vehicles registered (set PITWALL_VEHICLES)");
    }

    let plane = Arc::new(ControlPlane::new(Arc::new(directory), config.plane));

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(plane.clone().run_sweeper(cancel.clone()));

    let web_cancel = cancel.clone();
    let web_plane = plane.clone();
    tracker.spawn(async move {
        if let Err(e) =
            pitwall::web::start(web_plane, config.bind, config.admin_token, web_cancel.clone()).await
        {
            error!("Web server error: {:#}", e);
            web_cancel.cancel();
        }
    });

    tracker.close();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
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
