/*!
 * Streaming Profiles
 *
 * Read-only operating envelopes selected per session: bitrate bounds,
 * resolution and FPS ladders, which dimension to sacrifice first, and
 * FEC bounds.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QosError, QosResult};

/// Output resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Streaming profile (preset)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingProfile {
    pub name: String,
    pub target_bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub target_fps: u32,
    pub min_fps: u32,
    /// Highest to lowest
    pub resolution_ladder: Vec<Resolution>,
    /// Highest to lowest
    pub fps_ladder: Vec<u32>,
    /// Relative importance of frame rate
    pub fps_weight: f32,
    /// Relative importance of picture quality (resolution)
    pub quality_weight: f32,
    /// Below 0.3 the controller never steps resolution back up on its own
    pub recovery_aggressiveness: f32,
    pub min_fec_ratio: f32,
    pub max_fec_ratio: f32,
}

impl StreamingProfile {
    pub fn validate(&self) -> QosResult<()> {
        let invalid = |reason: String| Err(QosError::InvalidProfile(format!("{}: {}", self.name, reason)));

        if self.resolution_ladder.is_empty() {
            return invalid("empty resolution ladder".into());
        }
        if self.resolution_ladder.iter().any(|r| r.width == 0 || r.height == 0) {
            return invalid("zero-sized resolution rung".into());
        }
        if self.fps_ladder.is_empty() {
            return invalid("empty fps ladder".into());
        }
        if self.fps_ladder.windows(2).any(|pair| pair[0] <= pair[1]) {
            return invalid("fps ladder must be strictly descending".into());
        }
        if self.min_bitrate_kbps > self.target_bitrate_kbps
            || self.target_bitrate_kbps > self.max_bitrate_kbps
        {
            return invalid(format!(
                "bitrate bounds {} <= {} <= {} violated",
                self.min_bitrate_kbps, self.target_bitrate_kbps, self.max_bitrate_kbps
            ));
        }
        if self.min_fps == 0 || self.min_fps > self.target_fps {
            return invalid(format!("min_fps {} must be in 1..={}", self.min_fps, self.target_fps));
        }
        if !self.fps_ladder.iter().any(|&fps| fps >= self.min_fps && fps <= self.target_fps) {
            return invalid("no fps rung between min_fps and target_fps".into());
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
        if !self.fps_weight.is_finite()
            || !self.quality_weight.is_finite()
            || !self.recovery_aggressiveness.is_finite()
        {
            return invalid("weights must be finite".into());
        }
        Ok(())
    }

    /// Whether frame rate outranks resolution when something must give
    pub fn prefers_fps(&self) -> bool {
        self.fps_weight > self.quality_weight
    }

    /// Index of the highest fps rung not above `target_fps`
    pub fn target_fps_index(&self) -> usize {
        self.fps_ladder
            .iter()
            .position(|&fps| fps <= self.target_fps)
            .unwrap_or(0)
    }

    /// Index of the lowest fps rung not below `min_fps`
    pub fn min_fps_index(&self) -> usize {
        self.fps_ladder
            .iter()
            .rposition(|&fps| fps >= self.min_fps)
            .unwrap_or(0)
    }

    pub fn lowest_resolution_index(&self) -> usize {
        self.resolution_ladder.len().saturating_sub(1)
    }
}

/// Built-in profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    /// Smooth motion first; resolution is the first thing to go
    Gaming,
    Balanced,
    /// Sharp picture first; conservative recovery
    Quality,
    /// Constrained links
    LowBandwidth,
}

fn standard_ladder() -> Vec<Resolution> {
    vec![
        Resolution::new(1920, 1080),
        Resolution::new(1600, 900),
        Resolution::new(1280, 720),
        Resolution::new(960, 540),
        Resolution::new(640, 360),
    ]
}

impl Preset {
    pub fn profile(&self) -> StreamingProfile {
        match self {
            Preset::Gaming => StreamingProfile {
                name: "gaming".into(),
                target_bitrate_kbps: 20_000,
                min_bitrate_kbps: 2_000,
                max_bitrate_kbps: 30_000,
                target_fps: 120,
                min_fps: 30,
                resolution_ladder: standard_ladder(),
                fps_ladder: vec![144, 120, 90, 60, 45, 30],
                fps_weight: 0.7,
                quality_weight: 0.3,
                recovery_aggressiveness: 0.8,
                min_fec_ratio: 0.05,
                max_fec_ratio: 0.5,
            },
            Preset::Balanced => StreamingProfile {
                name: "balanced".into(),
                target_bitrate_kbps: 12_000,
                min_bitrate_kbps: 1_500,
                max_bitrate_kbps: 20_000,
                target_fps: 60,
                min_fps: 24,
                resolution_ladder: standard_ladder(),
                fps_ladder: vec![60, 48, 30, 24],
                fps_weight: 0.5,
                quality_weight: 0.5,
                recovery_aggressiveness: 0.5,
                min_fec_ratio: 0.05,
                max_fec_ratio: 0.4,
            },
            Preset::Quality => StreamingProfile {
                name: "quality".into(),
                target_bitrate_kbps: 25_000,
                min_bitrate_kbps: 4_000,
                max_bitrate_kbps: 40_000,
                target_fps: 60,
                min_fps: 20,
                resolution_ladder: vec![
                    Resolution::new(2560, 1440),
                    Resolution::new(1920, 1080),
                    Resolution::new(1280, 720),
                ],
                fps_ladder: vec![60, 45, 30, 20],
                fps_weight: 0.3,
                quality_weight: 0.7,
                recovery_aggressiveness: 0.2,
                min_fec_ratio: 0.02,
                max_fec_ratio: 0.3,
            },
            Preset::LowBandwidth => StreamingProfile {
                name: "low_bandwidth".into(),
                target_bitrate_kbps: 3_000,
                min_bitrate_kbps: 500,
                max_bitrate_kbps: 5_000,
                target_fps: 30,
                min_fps: 15,
                resolution_ladder: vec![
                    Resolution::new(1280, 720),
                    Resolution::new(960, 540),
                    Resolution::new(640, 360),
                ],
                fps_ladder: vec![30, 24, 20, 15],
                fps_weight: 0.5,
                quality_weight: 0.5,
                recovery_aggressiveness: 0.4,
                min_fec_ratio: 0.1,
                max_fec_ratio: 0.5,
            },
        }
    }
}

impl FromStr for Preset {
    type Err = QosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "gaming" => Ok(Preset::Gaming),
            "balanced" => Ok(Preset::Balanced),
            "quality" => Ok(Preset::Quality),
            "low_bandwidth" | "low" => Ok(Preset::LowBandwidth),
            _ => Err(QosError::UnknownPreset(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_presets_validate() {
        for preset in [Preset::Gaming, Preset::Balanced, Preset::Quality, Preset::LowBandwidth] {
            let profile = preset.profile();
            assert!(profile.validate().is_ok(), "{:?} invalid", preset);
        }
    }

    #[test]
    fn test_gaming_prefers_fps_quality_does_not() {
        assert!(Preset::Gaming.profile().prefers_fps());
        assert!(!Preset::Quality.profile().prefers_fps());
        // equal weights favour quality
        assert!(!Preset::Balanced.profile().prefers_fps());
    }

    #[test]
    fn test_quality_preset_is_conservative() {
        assert!(Preset::Quality.profile().recovery_aggressiveness < 0.3);
    }

    #[test]
    fn test_fps_indices() {
        let profile = Preset::Gaming.profile();
        // ladder 144, 120, 90, 60, 45, 30; target 120, min 30
        assert_eq!(profile.target_fps_index(), 1);
        assert_eq!(profile.min_fps_index(), 5);
        assert_eq!(profile.lowest_resolution_index(), 4);
    }

    #[test]
    fn test_validate_rejects_empty_ladders() {
        let mut profile = Preset::Balanced.profile();
        profile.resolution_ladder.clear();
        assert!(matches!(profile.validate(), Err(QosError::InvalidProfile(_))));

        let mut profile = Preset::Balanced.profile();
        profile.fps_ladder.clear();
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unordered_fps_ladder() {
        let mut profile = Preset::Balanced.profile();
        profile.fps_ladder = vec![30, 60];
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bitrate_order() {
        let mut profile = Preset::Balanced.profile();
        profile.min_bitrate_kbps = profile.target_bitrate_kbps + 1;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_fec_bounds() {
        let mut profile = Preset::Balanced.profile();
        profile.max_fec_ratio = 1.5;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!("gaming".parse::<Preset>().unwrap(), Preset::Gaming);
        assert_eq!("Low-Bandwidth".parse::<Preset>().unwrap(), Preset::LowBandwidth);
        assert!(matches!("cinema".parse::<Preset>(), Err(QosError::UnknownPreset(_))));
    }

    #[test]
    fn test_profile_json_round_trip_keeps_ladders() {
        let profile = Preset::Quality.profile();
        let json = serde_json::to_string(&profile).unwrap();
        let parsed: StreamingProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn test_resolution_display() {
        assert_eq!(Resolution::new(1280, 720).to_string(), "1280x720");
        assert_eq!(Resolution::new(1280, 720).pixels(), 921_600);
    }
}
