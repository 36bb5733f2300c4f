/*!
 * Receiver Module
 *
 * Viewer-side half of the control loop: arrival statistics, NACK hints and
 * the session that reports back to the sender every feedback interval.
 */

pub mod nack;
pub mod reporter;
pub mod stats;

pub use nack::{NackTracker, RetransmissionSource};
pub use reporter::ReceiverSession;
pub use stats::{ArrivalRecord, MediaPacketHeader, ReceiverStats, ReceiverStatsSnapshot};
