/*!
 * Streaming Module
 *
 * Sender-side session plumbing around the QoS controller, and an
 * in-process loopback that exercises the full control loop.
 */

pub mod loopback;
pub mod session;

pub use loopback::{CapacityChange, LinkConfig, LoopbackConfig, LoopbackReport};
pub use session::SenderSession;
