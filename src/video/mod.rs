/*!
 * Video Encoding Module
 *
 * Encoder-side collaborator contract driven by the QoS controller.
 * The controller only ever pushes an operating point (bitrate, fps,
 * resolution) and keyframe requests through `EncoderControl`.
 */

pub mod encoder;

pub use encoder::{EncoderConfig, EncoderControl, SimulatedEncoder};

use serde::{Deserialize, Serialize};

/// Video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// H.264/AVC codec (widely supported)
    H264,
    /// H.265/HEVC codec (better compression, less support)
    H265,
}

impl Codec {
    /// Identifier reported in telemetry
    pub fn name(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
        }
    }
}
