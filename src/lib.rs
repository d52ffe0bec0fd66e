mod db;
pub mod device;
pub mod error;
pub mod ipc;
pub mod models;
pub mod recording;
pub mod settings;
pub mod tracker;
mod utils;

pub use db::Database;
pub use error::TrackerError;
pub use settings::TrackerSettings;
pub use tracker::{ChannelStatus, OvenTracker};

use tokio::io::BufReader;

fn debug_enabled() -> bool {
    std::env::var("OVEN_TRACKER_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Runs the recorder: serves operator requests on stdin/stdout until EOF,
/// then closes the device and drains pending writes.
pub async fn run() -> anyhow::Result<()> {
    let level = if debug_enabled() {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("Oven tracker starting up...");

    let settings = TrackerSettings::load()?;
    let tracker = OvenTracker::open(&settings).await?;

    if let Err(err) = tracker.connect_device().await {
        log::error!(
            "Device {} unavailable, recording disabled until restart: {err}",
            settings.serial.port
        );
    }

    let served = ipc::serve(&tracker, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await;
    let stopped = tracker.shutdown().await;
    served?;
    stopped
}
