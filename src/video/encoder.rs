/*!
 * Video Encoder Control
 *
 * The encoder collaborator as seen from the QoS controller, plus a
 * simulated encoder that honours the contract without touching hardware.
 */

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Codec;

/// Encoder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Target framerate (frames per second)
    pub fps: u32,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Codec to use
    pub codec: Codec,
    /// Keyframe interval (GOP size)
    pub keyframe_interval: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_kbps: 5000,
            codec: Codec::H264,
            keyframe_interval: 120, // Every 2 seconds at 60fps
        }
    }
}

impl EncoderConfig {
    /// Byte budget for one frame at the configured bitrate and fps
    pub fn frame_budget_bytes(&self) -> usize {
        if self.fps == 0 {
            return 0;
        }
        (self.bitrate_kbps as u64 * 1000 / 8 / self.fps as u64) as usize
    }
}

/// Encoder collaborator contract
pub trait EncoderControl: Send {
    /// Apply new encoding parameters. Called every feedback cycle, possibly
    /// with unchanged values.
    fn reconfigure(&mut self, bitrate_kbps: u32, fps: u32, width: u32, height: u32) -> Result<()>;

    /// Request an immediate full (non-predicted) frame
    fn force_keyframe(&mut self) -> Result<()>;

    /// Codec identifier for telemetry
    fn codec_name(&self) -> &str;
}

/// Encoder stand-in that tracks applied parameters and keyframe requests
#[derive(Debug, Clone)]
pub struct SimulatedEncoder {
    config: EncoderConfig,
    frame_count: u64,
    keyframe_requests: u64,
    request_keyframe_flag: bool,
}

impl SimulatedEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        info!(
            "Initializing simulated {} encoder: {}x{} @ {} fps, {} kbps",
            config.codec.name(),
            config.width,
            config.height,
            config.fps,
            config.bitrate_kbps
        );

        Self {
            config,
            frame_count: 0,
            keyframe_requests: 0,
            request_keyframe_flag: false,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn keyframe_requests(&self) -> u64 {
        self.keyframe_requests
    }

    /// Produce the next frame's size in bytes and whether it is a keyframe
    pub fn next_frame(&mut self) -> (usize, bool) {
        self.frame_count += 1;

        let interval = self.config.keyframe_interval.max(1) as u64;
        let is_keyframe = self.request_keyframe_flag || (self.frame_count - 1) % interval == 0;
        self.request_keyframe_flag = false;

        let budget = self.config.frame_budget_bytes();
        // Keyframes cost roughly three predicted frames
        let size = if is_keyframe { budget * 3 } else { budget };

        (size.max(1), is_keyframe)
    }
}

impl EncoderControl for SimulatedEncoder {
    fn reconfigure(&mut self, bitrate_kbps: u32, fps: u32, width: u32, height: u32) -> Result<()> {
        if fps == 0 || width == 0 || height == 0 {
            anyhow::bail!("Invalid encoder parameters: {}x{} @ {} fps", width, height, fps);
        }

        let resized = width != self.config.width || height != self.config.height;

        self.config.bitrate_kbps = bitrate_kbps;
        self.config.fps = fps;
        self.config.width = width;
        self.config.height = height;

        if resized {
            // New dimensions need a fresh reference frame
            self.request_keyframe_flag = true;
            info!("Simulated encoder resized to {}x{}", width, height);
        }

        debug!(
            "Simulated encoder reconfigured: {} kbps, {} fps, {}x{}",
            bitrate_kbps, fps, width, height
        );

        Ok(())
    }

    fn force_keyframe(&mut self) -> Result<()> {
        self.keyframe_requests += 1;
        self.request_keyframe_flag = true;
        Ok(())
    }

    fn codec_name(&self) -> &str {
        self.config.codec.name()
    }
}
