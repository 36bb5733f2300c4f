//! axon-stream-qos: runs the QoS control loop against a simulated link and
//! prints the final controller, receiver and counter state as JSON.
//!
//! Environment:
//! - `AXON_QOS_CONFIG`: JSON `QosConfig` file
//! - `AXON_QOS_PRESET`: gaming | balanced | quality | low_bandwidth (unset: legacy bounds)
//! - `AXON_QOS_LOOPBACK`: JSON `LoopbackConfig` file
//! - `AXON_QOS_VPN`: `1` to run in VPN mode

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axon_stream_qos::config;
use axon_stream_qos::qos::Preset;
use axon_stream_qos::streaming::{loopback, LoopbackConfig};

const PRESET_ENV: &str = "AXON_QOS_PRESET";
const LOOPBACK_ENV: &str = "AXON_QOS_LOOPBACK";
const VPN_ENV: &str = "AXON_QOS_VPN";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("axon-stream-qos v{}", env!("CARGO_PKG_VERSION"));

    let qos = config::load_default().context("Failed to load QoS config")?;

    let profile = match std::env::var(PRESET_ENV) {
        Ok(name) => {
            let preset: Preset = name.parse()?;
            info!("Using {:?} preset", preset);
            Some(preset.profile())
        }
        Err(_) => None,
    };

    let mut run_config = match std::env::var(LOOPBACK_ENV) {
        Ok(path) => load_loopback(Path::new(&path))?,
        Err(_) => LoopbackConfig::default(),
    };
    if std::env::var(VPN_ENV).is_ok_and(|value| value == "1") {
        run_config.vpn_mode = true;
    }

    let report = loopback::run(&run_config, &qos, profile).await?;

    info!(
        "Final operating point: {} kbps, {}x{} @ {} fps ({})",
        report.sender.bitrate_kbps,
        report.sender.width,
        report.sender.height,
        report.sender.fps,
        report.sender.state
    );

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    println!("{}", json);

    Ok(())
}

fn load_loopback(path: &Path) -> Result<LoopbackConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read loopback config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse loopback config {}", path.display()))
}
