/*!
 * Axon Stream QoS Library
 *
 * Adaptive quality control for desktop streaming: receiver statistics,
 * feedback reports, congestion estimation and the controller that picks
 * bitrate, frame rate, resolution and FEC strength.
 */

pub mod config;
pub mod error;
pub mod fec;
pub mod feedback;
pub mod metrics;
pub mod qos;
pub mod receiver;
pub mod streaming;
pub mod transport;
pub mod video;

// Re-export commonly used types
pub use config::QosConfig;
pub use error::{QosError, QosResult};
pub use feedback::FeedbackMessage;
pub use metrics::QosMetrics;
pub use qos::{Preset, QosController, QosState, QosStats, StreamingProfile};
pub use receiver::{NackTracker, ReceiverSession};
pub use streaming::SenderSession;
