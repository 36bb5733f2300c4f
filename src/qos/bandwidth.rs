/*!
 * Bandwidth Estimator
 *
 * Sender-side ack timing. Every sent packet is remembered until its
 * acknowledgment arrives (or it goes stale); matched pairs feed a 1 s
 * throughput window and a delay-gradient sample into the Kalman filter.
 *
 * One-way delay is approximated as RTT/2. Only its trend is used, so the
 * asymmetric part of the path cancels out between successive samples.
 */

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use super::kalman::DelayGradientFilter;

/// A packet that left the sender and has not been acknowledged yet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentPacket {
    pub sequence: u16,
    pub bytes: usize,
    pub sent_at: Instant,
}

/// What a matched acknowledgment yielded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AckSample {
    pub rtt_ms: f64,
    /// Delay-gradient sample (ms/s) fed into the filter; absent for the
    /// very first ack
    pub gradient: Option<f64>,
}

/// A matched send/ack pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingPair {
    pub sent_at: Instant,
    pub acked_at: Instant,
    pub bytes: usize,
}

#[derive(Debug)]
pub struct BandwidthEstimator {
    pending: HashMap<u16, SentPacket>,
    /// Insertion order of `pending`, oldest first, for staleness eviction
    send_order: VecDeque<(u16, Instant)>,
    window: VecDeque<TimingPair>,
    filter: DelayGradientFilter,
    stale_timeout: Duration,
    window_len: Duration,
    estimate_kbps: f64,
    /// Previous one-way delay sample (ms) and when it was taken
    last_one_way: Option<(f64, Instant)>,
    last_rtt_ms: Option<f64>,
}

impl BandwidthEstimator {
    pub fn new(filter: DelayGradientFilter, stale_timeout: Duration, window_len: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            send_order: VecDeque::new(),
            window: VecDeque::new(),
            filter,
            stale_timeout,
            window_len,
            estimate_kbps: 0.0,
            last_one_way: None,
            last_rtt_ms: None,
        }
    }

    /// Record a packet leaving the sender
    pub fn on_packet_sent(&mut self, sequence: u16, bytes: usize, sent_at: Instant) {
        self.evict_stale(sent_at);

        self.pending.insert(
            sequence,
            SentPacket {
                sequence,
                bytes,
                sent_at,
            },
        );
        self.send_order.push_back((sequence, sent_at));
    }

    /// Match an acknowledgment. `None` when the sequence is unknown,
    /// already acknowledged or expired.
    pub fn on_ack_received(&mut self, sequence: u16, acked_at: Instant) -> Option<AckSample> {
        self.evict_stale(acked_at);

        let Some(sent) = self.pending.remove(&sequence) else {
            debug!("Ack for unknown or expired packet {}", sequence);
            return None;
        };

        let rtt_ms = duration_ms(acked_at.saturating_duration_since(sent.sent_at));
        self.last_rtt_ms = Some(rtt_ms);
        let one_way_ms = rtt_ms / 2.0;

        let mut gradient = None;
        if let Some((previous_ms, previous_at)) = self.last_one_way {
            let elapsed = acked_at.saturating_duration_since(previous_at).as_secs_f64();
            if elapsed > 0.0 {
                let rate = (one_way_ms - previous_ms) / elapsed;
                self.filter.update(rate);
                gradient = Some(rate);
            }
        }
        self.last_one_way = Some((one_way_ms, acked_at));

        self.window.push_back(TimingPair {
            sent_at: sent.sent_at,
            acked_at,
            bytes: sent.bytes,
        });
        self.trim_window(acked_at);
        self.recompute_estimate();

        Some(AckSample { rtt_ms, gradient })
    }

    /// Feed an externally measured gradient sample (ms/s) into the filter
    pub fn observe_gradient(&mut self, gradient: f64) -> f64 {
        self.filter.update(gradient)
    }

    /// Throughput of acknowledged bytes over the window, in kbps
    pub fn estimated_bandwidth_kbps(&self) -> f64 {
        self.estimate_kbps
    }

    /// Filtered delay gradient in ms/s
    pub fn delay_gradient(&self) -> f64 {
        self.filter.estimate()
    }

    pub fn last_rtt_ms(&self) -> Option<f64> {
        self.last_rtt_ms
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some(&(sequence, sent_at)) = self.send_order.front() {
            if now.saturating_duration_since(sent_at) <= self.stale_timeout {
                break;
            }
            self.send_order.pop_front();

            // The sequence number may have wrapped and been reused since
            if let Some(entry) = self.pending.get(&sequence) {
                if entry.sent_at == sent_at {
                    self.pending.remove(&sequence);
                }
            }
        }
    }

    fn trim_window(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(front.acked_at) <= self.window_len {
                break;
            }
            self.window.pop_front();
        }
    }

    fn recompute_estimate(&mut self) {
        if self.window.len() < 2 {
            return;
        }
        let (Some(first), Some(last)) = (self.window.front(), self.window.back()) else {
            return;
        };

        let elapsed = last.acked_at.saturating_duration_since(first.acked_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let total_bytes: usize = self.window.iter().map(|pair| pair.bytes).sum();
        self.estimate_kbps = 8.0 * total_bytes as f64 / elapsed / 1000.0;
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new(
            DelayGradientFilter::default(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_ack_for_unknown_sequence_is_noop() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();
        assert_eq!(estimator.on_ack_received(7, start), None);
        assert_eq!(estimator.window_len(), 0);
        assert_eq!(estimator.estimated_bandwidth_kbps(), 0.0);
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();
        estimator.on_packet_sent(1, 1000, start);
        estimator.on_ack_received(1, start + ms(40));
        assert_eq!(estimator.window_len(), 1);

        assert_eq!(estimator.on_ack_received(1, start + ms(50)), None);
        assert_eq!(estimator.window_len(), 1);
    }

    #[test]
    fn test_rtt_from_matched_ack() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();
        estimator.on_packet_sent(1, 1200, start);
        let sample = estimator.on_ack_received(1, start + ms(60)).unwrap();
        assert!((sample.rtt_ms - 60.0).abs() < 1e-6);
        assert_eq!(sample.gradient, None);
        assert_eq!(estimator.last_rtt_ms(), Some(sample.rtt_ms));
    }

    #[test]
    fn test_bandwidth_over_window() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();

        // 11 packets of 1250 bytes acked 100ms apart: 13,750 bytes over 1s
        for i in 0..11u16 {
            let sent = start + ms(i as u64 * 100);
            estimator.on_packet_sent(i, 1250, sent);
            estimator.on_ack_received(i, sent + ms(20));
        }

        let expected = 8.0 * 13_750.0 / 1.0 / 1000.0;
        assert!((estimator.estimated_bandwidth_kbps() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_window_trims_to_one_second() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();
        for i in 0..30u16 {
            let sent = start + ms(i as u64 * 100);
            estimator.on_packet_sent(i, 1000, sent);
            estimator.on_ack_received(i, sent + ms(10));
        }
        assert_eq!(estimator.window_len(), 11);
    }

    #[test]
    fn test_growing_delay_gives_positive_gradient() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();

        // RTT grows by 20ms every 100ms: one-way grows 10ms per 0.1s
        for i in 0..20u16 {
            let sent = start + ms(i as u64 * 100);
            let rtt = 40 + i as u64 * 20;
            estimator.on_packet_sent(i, 1000, sent);
            let sample = estimator.on_ack_received(i, sent + ms(rtt));
            if i > 0 {
                let gradient = sample.unwrap().gradient.unwrap();
                // 10ms over 120ms between acks
                assert!((gradient - 10.0 / 0.12).abs() < 1e-6);
            }
        }
        assert!(estimator.delay_gradient() > 5.0);
    }

    #[test]
    fn test_stable_delay_gives_zero_gradient() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();
        for i in 0..20u16 {
            let sent = start + ms(i as u64 * 50);
            estimator.on_packet_sent(i, 1000, sent);
            estimator.on_ack_received(i, sent + ms(30));
        }
        assert!(estimator.delay_gradient().abs() < 1e-9);
    }

    #[test]
    fn test_stale_pending_records_evicted() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();
        for i in 0..100u16 {
            estimator.on_packet_sent(i, 1000, start + ms(i as u64));
        }
        assert_eq!(estimator.pending_len(), 100);

        estimator.on_packet_sent(500, 1000, start + ms(5_200));
        // everything sent before 200ms is older than 5s
        assert_eq!(estimator.pending_len(), 1);

        assert_eq!(estimator.on_ack_received(3, start + ms(5_300)), None);
    }

    #[test]
    fn test_reused_sequence_survives_eviction_of_old_entry() {
        let mut estimator = BandwidthEstimator::default();
        let start = Instant::now();
        estimator.on_packet_sent(9, 1000, start);
        estimator.on_packet_sent(9, 1000, start + ms(4_000));

        estimator.on_packet_sent(10, 1000, start + ms(5_500));
        assert_eq!(estimator.pending_len(), 2);
        let sample = estimator.on_ack_received(9, start + ms(5_600)).unwrap();
        assert!(sample.gradient.is_none());
        assert_eq!(estimator.window_len(), 1);
    }

    #[test]
    fn test_observe_gradient_feeds_filter() {
        let mut estimator = BandwidthEstimator::default();
        let estimate = estimator.observe_gradient(-2.0);
        assert!(estimate < -1.0);
        assert_eq!(estimator.delay_gradient(), estimate);
    }
}
