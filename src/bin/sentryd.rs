//! sentryd - multi-camera motion recording daemon
//!
//! This daemon:
//! 1. Loads the camera configuration (file + environment)
//! 2. Starts one monitor loop per enabled camera (or the cameras named on
//!    the command line)
//! 3. Runs the health and recording-duration scanners
//! 4. Logs fleet status periodically until Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use camera_sentry::{Fleet, SentryConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion-triggered recording for a fleet of cameras")]
struct Args {
    /// Config file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "SENTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Start only these cameras (repeatable). Defaults to every enabled camera.
    #[arg(long = "camera")]
    cameras: Vec<String>,

    /// Seconds between status log lines; 0 disables them.
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SentryConfig::load_from(args.config.as_deref()).context("load configuration")?;
    if config.cameras.is_empty() {
        log::warn!("no cameras configured");
    }
    log::info!(
        "sentryd {} starting with {} configured cameras",
        env!("CARGO_PKG_VERSION"),
        config.cameras.len()
    );

    let fleet = Fleet::new(config);
    fleet.start_scanners().context("start scanners")?;

    if args.cameras.is_empty() {
        let started = fleet.start_enabled();
        log::info!("{} cameras running", started);
    } else {
        for name in &args.cameras {
            fleet
                .start_camera(name)
                .map_err(|e| anyhow!("failed to start {}: {}", name, e))?;
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("sentryd waiting for shutdown signal (Ctrl-C)...");
    if args.status_interval == 0 {
        let _ = rx.recv();
    } else {
        let interval = Duration::from_secs(args.status_interval);
        while let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
            match serde_json::to_string(&fleet.status()) {
                Ok(status) => log::info!("status: {}", status),
                Err(e) => log::warn!("failed to serialize status: {}", e),
            }
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    fleet.shutdown();
    log::info!("sentryd stopped");
    Ok(())
}
