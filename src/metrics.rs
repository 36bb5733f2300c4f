//! Counters for the QoS control loop.
//!
//! Cheap, lock-free and shareable: clones observe the same counters, so the
//! controller, the feedback task and whoever reports on the session can all
//! hold one.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Aggregated control-loop counters
#[derive(Clone, Debug, Default)]
pub struct QosMetrics {
    feedback_accepted: Arc<AtomicU64>,
    feedback_rejected: Arc<AtomicU64>,
    keyframes_requested: Arc<AtomicU64>,
    resolution_changes: Arc<AtomicU64>,
    collaborator_failures: Arc<AtomicU64>,
    feedback_sent: Arc<AtomicU64>,
    feedback_send_skipped: Arc<AtomicU64>,
}

/// Point-in-time copy of [`QosMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub feedback_accepted: u64,
    pub feedback_rejected: u64,
    pub keyframes_requested: u64,
    pub resolution_changes: u64,
    pub collaborator_failures: u64,
    pub feedback_sent: u64,
    pub feedback_send_skipped: u64,
}

impl QosMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A feedback message was decoded and applied
    pub fn record_feedback_accepted(&self) {
        self.feedback_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A feedback message was malformed and dropped
    pub fn record_feedback_rejected(&self) {
        self.feedback_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keyframe_requested(&self) {
        self.keyframes_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolution_change(&self) {
        self.resolution_changes.fetch_add(1, Ordering::Relaxed);
    }

    /// The encoder or FEC collaborator refused a command
    pub fn record_collaborator_failure(&self) {
        self.collaborator_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_feedback_sent(&self) {
        self.feedback_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// The receiver could not hand a report to its transport
    pub fn record_feedback_send_skipped(&self) {
        self.feedback_send_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn feedback_accepted(&self) -> u64 {
        self.feedback_accepted.load(Ordering::Relaxed)
    }

    pub fn feedback_rejected(&self) -> u64 {
        self.feedback_rejected.load(Ordering::Relaxed)
    }

    pub fn keyframes_requested(&self) -> u64 {
        self.keyframes_requested.load(Ordering::Relaxed)
    }

    pub fn resolution_changes(&self) -> u64 {
        self.resolution_changes.load(Ordering::Relaxed)
    }

    pub fn collaborator_failures(&self) -> u64 {
        self.collaborator_failures.load(Ordering::Relaxed)
    }

    pub fn feedback_sent(&self) -> u64 {
        self.feedback_sent.load(Ordering::Relaxed)
    }

    pub fn feedback_send_skipped(&self) -> u64 {
        self.feedback_send_skipped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            feedback_accepted: self.feedback_accepted(),
            feedback_rejected: self.feedback_rejected(),
            keyframes_requested: self.keyframes_requested(),
            resolution_changes: self.resolution_changes(),
            collaborator_failures: self.collaborator_failures(),
            feedback_sent: self.feedback_sent(),
            feedback_send_skipped: self.feedback_send_skipped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn metrics_start_at_zero() {
        let metrics = QosMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn clones_share_counters() {
        let metrics = QosMetrics::new();
        let clone = metrics.clone();
        clone.record_feedback_accepted();
        clone.record_feedback_rejected();
        metrics.record_keyframe_requested();

        assert_eq!(metrics.feedback_accepted(), 1);
        assert_eq!(metrics.feedback_rejected(), 1);
        assert_eq!(clone.keyframes_requested(), 1);
    }

    #[test]
    fn counters_are_thread_safe() {
        let metrics = QosMetrics::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        metrics.record_feedback_sent();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.feedback_sent(), 1000);
    }
}
