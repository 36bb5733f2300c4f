//! Retransmission requests.
//!
//! The feedback task asks a `RetransmissionSource` for a couple of missing
//! sequence numbers each cycle. `NackTracker` builds that list from the
//! arrival stream itself.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Gaps older than this are not worth a retransmission any more
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(1);
pub const DEFAULT_CAPACITY: usize = 64;

/// Receiver-side collaborator producing NACK hints
pub trait RetransmissionSource: Send + Sync {
    /// Observe an arriving sequence number
    fn on_packet_received(&self, sequence: u16, now: Instant);

    /// Up to `max` currently missing sequence numbers, oldest first. A gap
    /// stays listed until the packet arrives or the gap expires.
    fn missing_sequences(&self, max: usize, now: Instant) -> Vec<u16>;
}

#[derive(Debug)]
struct GapState {
    highest: Option<u16>,
    /// (sequence, detected at), oldest first
    missing: VecDeque<(u16, Instant)>,
}

/// Gap detector over 16-bit sequence numbers
#[derive(Debug)]
pub struct NackTracker {
    state: Mutex<GapState>,
    max_age: Duration,
    capacity: usize,
}

impl NackTracker {
    pub fn new(max_age: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(GapState {
                highest: None,
                missing: VecDeque::new(),
            }),
            max_age,
            capacity: capacity.max(1),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock().missing.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, state: &mut GapState, now: Instant) {
        while let Some(&(_, detected_at)) = state.missing.front() {
            if now.saturating_duration_since(detected_at) <= self.max_age {
                break;
            }
            state.missing.pop_front();
        }
    }
}

impl Default for NackTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE, DEFAULT_CAPACITY)
    }
}

impl RetransmissionSource for NackTracker {
    fn on_packet_received(&self, sequence: u16, now: Instant) {
        let mut state = self.lock();
        self.expire(&mut state, now);

        let Some(highest) = state.highest else {
            state.highest = Some(sequence);
            return;
        };

        let delta = sequence.wrapping_sub(highest) as i16;
        if delta > 0 {
            // Only the newest `capacity` gaps of a long burst can ever be kept
            let first_gap = (delta as usize).saturating_sub(self.capacity).max(1);
            for offset in first_gap..delta as usize {
                state.missing.push_back((highest.wrapping_add(offset as u16), now));
            }
            while state.missing.len() > self.capacity {
                state.missing.pop_front();
            }
            if delta > 1 {
                debug!("Sequence gap {}..{}", highest.wrapping_add(1), sequence);
            }
            state.highest = Some(sequence);
        } else if let Some(position) = state.missing.iter().position(|&(s, _)| s == sequence) {
            state.missing.remove(position);
        }
    }

    fn missing_sequences(&self, max: usize, now: Instant) -> Vec<u16> {
        let mut state = self.lock();
        self.expire(&mut state, now);

        state.missing.iter().take(max).map(|&(sequence, _)| sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_in_order_stream_has_no_gaps() {
        let tracker = NackTracker::default();
        let now = Instant::now();
        for sequence in 0..100u16 {
            tracker.on_packet_received(sequence, now);
        }
        assert_eq!(tracker.pending_len(), 0);
        assert!(tracker.missing_sequences(2, now).is_empty());
    }

    #[test]
    fn test_gaps_listed_oldest_first_until_filled() {
        let tracker = NackTracker::default();
        let now = Instant::now();
        tracker.on_packet_received(10, now);
        tracker.on_packet_received(14, now);

        assert_eq!(tracker.missing_sequences(2, now), vec![11, 12]);
        // asking again does not consume anything
        assert_eq!(tracker.missing_sequences(2, now), vec![11, 12]);
        assert_eq!(tracker.pending_len(), 3);

        tracker.on_packet_received(11, now);
        tracker.on_packet_received(12, now);
        assert_eq!(tracker.missing_sequences(2, now), vec![13]);
    }

    #[test]
    fn test_late_arrival_clears_gap() {
        let tracker = NackTracker::default();
        let now = Instant::now();
        tracker.on_packet_received(1, now);
        tracker.on_packet_received(4, now);
        tracker.on_packet_received(2, now);

        assert_eq!(tracker.missing_sequences(8, now), vec![3]);
    }

    #[test]
    fn test_gap_across_wraparound() {
        let tracker = NackTracker::default();
        let now = Instant::now();
        tracker.on_packet_received(65_534, now);
        tracker.on_packet_received(1, now);

        assert_eq!(tracker.missing_sequences(8, now), vec![65_535, 0]);
    }

    #[test]
    fn test_gaps_expire() {
        let tracker = NackTracker::default();
        let start = Instant::now();
        tracker.on_packet_received(0, start);
        tracker.on_packet_received(3, start);
        tracker.on_packet_received(6, start + ms(600));

        // the first gap is older than 1s by now
        assert_eq!(tracker.missing_sequences(8, start + ms(1_200)), vec![4, 5]);
    }

    #[test]
    fn test_capacity_keeps_newest_gaps() {
        let tracker = NackTracker::new(DEFAULT_MAX_AGE, 4);
        let now = Instant::now();
        tracker.on_packet_received(0, now);
        tracker.on_packet_received(100, now);

        assert_eq!(tracker.pending_len(), 4);
        assert_eq!(tracker.missing_sequences(8, now), vec![96, 97, 98, 99]);
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let tracker = NackTracker::default();
        let now = Instant::now();
        tracker.on_packet_received(5, now);
        tracker.on_packet_received(5, now);
        tracker.on_packet_received(6, now);
        assert_eq!(tracker.pending_len(), 0);
    }
}
