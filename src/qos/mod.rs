/*!
 * QoS Module
 *
 * Sender-side congestion control: delay-gradient filtering, ack-timing
 * bandwidth estimation, streaming profiles and the AIMD controller that
 * ties them together.
 */

pub mod bandwidth;
pub mod controller;
pub mod kalman;
pub mod profile;

pub use bandwidth::{AckSample, BandwidthEstimator};
pub use controller::{OperatingPoint, QosController, QosState, QosStats, ResolutionCallback};
pub use kalman::DelayGradientFilter;
pub use profile::{Preset, Resolution, StreamingProfile};
