/*!
 * QoS Configuration
 *
 * Loop timing, eviction limits, filter tuning and the legacy operating
 * bounds used when no streaming profile has been applied.
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{QosError, QosResult};
use crate::qos::profile::Resolution;

/// Environment variable pointing at a JSON config file
pub const CONFIG_ENV: &str = "AXON_QOS_CONFIG";

/// QoS loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Feedback report cadence (ms)
    pub feedback_interval_ms: u64,
    /// Maximum retained packet-arrival records on the receiver
    pub arrival_history_cap: usize,
    /// Pending sent-packet records older than this are evicted (ms)
    pub sent_packet_timeout_ms: u64,
    /// Sliding window for the ack-timing bandwidth estimate (ms)
    pub timing_window_ms: u64,
    /// Minimum feedback cycles between two resolution changes
    pub resolution_cooldown_cycles: u64,
    /// Kalman process noise
    pub process_noise: f64,
    /// Kalman measurement noise
    pub measurement_noise: f64,

    // Legacy bounds, used while no profile is active
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub target_bitrate_kbps: u32,
    pub target_fps: u32,
    pub min_fps: u32,
    pub resolution: Resolution,
    pub min_fec_ratio: f32,
    pub max_fec_ratio: f32,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            feedback_interval_ms: 200,
            arrival_history_cap: 1000,
            sent_packet_timeout_ms: 5000,
            timing_window_ms: 1000,
            resolution_cooldown_cycles: 10, // ~2s at 200ms
            process_noise: 1e-3,
            measurement_noise: 0.1,
            min_bitrate_kbps: 1000,
            max_bitrate_kbps: 20_000,
            target_bitrate_kbps: 5_000, // ~5 Mbps for 1080p
            target_fps: 60,
            min_fps: 30,
            resolution: Resolution::new(1920, 1080),
            min_fec_ratio: 0.05,
            max_fec_ratio: 0.5,
        }
    }
}

impl QosConfig {
    pub fn feedback_interval(&self) -> Duration {
        Duration::from_millis(self.feedback_interval_ms)
    }

    pub fn sent_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.sent_packet_timeout_ms)
    }

    pub fn timing_window(&self) -> Duration {
        Duration::from_millis(self.timing_window_ms)
    }

    /// Rejects configurations the control loop cannot run with
    pub fn validate(&self) -> QosResult<()> {
        let invalid = |reason: String| Err(QosError::Config(reason));

        if self.feedback_interval_ms == 0 {
            return invalid("feedback_interval_ms must be > 0".into());
        }
        if self.arrival_history_cap < 2 {
            return invalid("arrival_history_cap must be >= 2".into());
        }
        if self.min_bitrate_kbps > self.max_bitrate_kbps {
            return invalid(format!(
                "min_bitrate_kbps {} exceeds max_bitrate_kbps {}",
                self.min_bitrate_kbps, self.max_bitrate_kbps
            ));
        }
        if self.min_fps == 0 || self.min_fps > self.target_fps {
            return invalid(format!("min_fps {} must be in 1..={}", self.min_fps, self.target_fps));
        }
        if !(0.0..=1.0).contains(&self.min_fec_ratio)
            || !(0.0..=1.0).contains(&self.max_fec_ratio)
            || self.min_fec_ratio > self.max_fec_ratio
        {
            return invalid(format!(
                "FEC bounds [{}, {}] must be ordered within [0, 1]",
                self.min_fec_ratio, self.max_fec_ratio
            ));
        }
        if self.process_noise <= 0.0 || self.measurement_noise <= 0.0 {
            return invalid("Kalman noise constants must be positive".into());
        }
        Ok(())
    }
}

/// Load a config from a JSON file
pub fn load(path: &Path) -> Result<QosConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: QosConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config.validate()?;
    info!("Loaded QoS config from {}", path.display());
    Ok(config)
}

/// Default config file location (`<config dir>/axon/qos.json`)
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("axon").join("qos.json"))
}

/// Resolve `AXON_QOS_CONFIG`, then the default location, then built-in defaults
pub fn load_default() -> Result<QosConfig> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return load(Path::new(&path));
    }

    match default_path() {
        Some(path) if path.exists() => load(&path),
        _ => {
            debug!("No QoS config file found, using defaults");
            Ok(QosConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = QosConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.feedback_interval(), Duration::from_millis(200));
        assert_eq!(config.arrival_history_cap, 1000);
        assert_eq!(config.sent_packet_timeout(), Duration::from_secs(5));
        assert_eq!(config.timing_window(), Duration::from_secs(1));
    }

    #[test]
    fn test_legacy_target_within_bounds() {
        let config = QosConfig::default();
        assert!(config.target_bitrate_kbps >= config.min_bitrate_kbps);
        assert!(config.target_bitrate_kbps <= config.max_bitrate_kbps);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: QosConfig =
            serde_json::from_str(r#"{ "feedback_interval_ms": 100, "min_fps": 15 }"#).unwrap();
        assert_eq!(config.feedback_interval_ms, 100);
        assert_eq!(config.min_fps, 15);
        assert_eq!(config.arrival_history_cap, 1000);
    }

    #[test]
    fn test_validate_rejects_inverted_bitrate_bounds() {
        let config = QosConfig {
            min_bitrate_kbps: 30_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(QosError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_fec_bounds() {
        let config = QosConfig {
            min_fec_ratio: 0.6,
            max_fec_ratio: 0.3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("axon-qos-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "resolution_cooldown_cycles": 5 }"#).unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.resolution_cooldown_cycles, 5);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("axon-qos-does-not-exist.json");
        assert!(load(&path).is_err());
    }
}
