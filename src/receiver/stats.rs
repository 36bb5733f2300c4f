/*!
 * Receiver Statistics
 *
 * Accumulates per-packet arrival data on the viewer side: loss from
 * sequence gaps, RFC 3550 inter-arrival jitter, a short-window bandwidth
 * figure and decode/render timings. `build_feedback` turns the counters
 * gathered since the previous call into a `FeedbackMessage`.
 */

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::QosConfig;
use crate::feedback::FeedbackMessage;

/// Window the receive bandwidth is measured over
pub const BANDWIDTH_WINDOW: Duration = Duration::from_secs(1);
/// FPS estimates above this come from a too-short window and are discarded
pub const MAX_PLAUSIBLE_FPS: f64 = 300.0;

const TIMING_SMOOTHING: f64 = 0.1;

/// Fields of an incoming media packet the statistics need
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPacketHeader {
    pub sequence: u16,
    /// Sender clock in ms; only differences between packets are used
    pub send_timestamp_ms: u32,
    pub payload_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrivalRecord {
    pub sequence: u16,
    pub send_timestamp_ms: u32,
    pub received_at: Instant,
    pub payload_size: usize,
}

/// Point-in-time view for telemetry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiverStatsSnapshot {
    pub packets_received: u64,
    pub packets_expected: u64,
    pub packets_lost: u64,
    pub loss_ratio: f64,
    pub jitter_ms: f64,
    pub bandwidth_kbps: f64,
    pub fps: f64,
    pub avg_decode_ms: f64,
    pub avg_render_ms: f64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub last_sequence: Option<u16>,
}

/// Counters reset by every report
#[derive(Debug, Default)]
struct IntervalCounters {
    received: u32,
    expected: u32,
    frames_dropped: u32,
    transit_sum_ms: f64,
    transit_count: u32,
}

#[derive(Debug)]
pub struct ReceiverStats {
    history_cap: usize,
    /// Local reference point for transit times
    epoch: Instant,
    highest_sequence: Option<u16>,
    total_received: u64,
    total_expected: u64,
    jitter_ms: f64,
    last_transit_ms: Option<f64>,
    history: VecDeque<ArrivalRecord>,
    interval: IntervalCounters,
    previous_mean_transit_ms: Option<f64>,
    last_report_at: Option<Instant>,
    decode_ms: Option<f64>,
    render_ms: Option<f64>,
    decoded_at: VecDeque<Instant>,
    frames_decoded: u64,
    frames_dropped: u64,
    fps: f64,
    rtt_ms: Option<u16>,
}

impl ReceiverStats {
    pub fn new(history_cap: usize) -> Self {
        Self {
            history_cap: history_cap.max(2),
            epoch: Instant::now(),
            highest_sequence: None,
            total_received: 0,
            total_expected: 0,
            jitter_ms: 0.0,
            last_transit_ms: None,
            history: VecDeque::with_capacity(history_cap),
            interval: IntervalCounters::default(),
            previous_mean_transit_ms: None,
            last_report_at: None,
            decode_ms: None,
            render_ms: None,
            decoded_at: VecDeque::new(),
            frames_decoded: 0,
            frames_dropped: 0,
            fps: 0.0,
            rtt_ms: None,
        }
    }

    pub fn from_config(config: &QosConfig) -> Self {
        Self::new(config.arrival_history_cap)
    }

    pub fn on_packet_received(&mut self, header: MediaPacketHeader, received_at: Instant) {
        self.total_received += 1;
        self.interval.received += 1;

        match self.highest_sequence {
            None => {
                self.highest_sequence = Some(header.sequence);
                self.total_expected = 1;
                self.interval.expected += 1;
            }
            Some(highest) => {
                let delta = header.sequence.wrapping_sub(highest) as i16;
                if delta > 0 {
                    // Everything between the old highest and this one is now expected
                    self.total_expected += delta as u64;
                    self.interval.expected += delta as u32;
                    self.highest_sequence = Some(header.sequence);
                } else {
                    debug!("Late or duplicate packet {}", header.sequence);
                }
            }
        }

        let received_ms = received_at.saturating_duration_since(self.epoch).as_secs_f64() * 1000.0;
        let transit = received_ms - header.send_timestamp_ms as f64;
        if let Some(previous) = self.last_transit_ms {
            let d = (transit - previous).abs();
            self.jitter_ms += (d - self.jitter_ms) / 16.0;
        }
        self.last_transit_ms = Some(transit);
        self.interval.transit_sum_ms += transit;
        self.interval.transit_count += 1;

        self.history.push_back(ArrivalRecord {
            sequence: header.sequence,
            send_timestamp_ms: header.send_timestamp_ms,
            received_at,
            payload_size: header.payload_size,
        });
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }
    }

    pub fn on_frame_decoded(&mut self, decode_ms: f64, now: Instant) {
        self.frames_decoded += 1;
        self.decode_ms = Some(smooth(self.decode_ms, decode_ms));

        self.decoded_at.push_back(now);
        while self.decoded_at.len() > self.history_cap {
            self.decoded_at.pop_front();
        }
        self.update_fps();
    }

    pub fn on_frame_rendered(&mut self, render_ms: f64) {
        self.render_ms = Some(smooth(self.render_ms, render_ms));
    }

    pub fn on_frame_dropped(&mut self) {
        self.frames_dropped += 1;
        self.interval.frames_dropped += 1;
    }

    pub fn set_rtt_sample(&mut self, rtt_ms: u16) {
        self.rtt_ms = Some(rtt_ms);
    }

    /// Report for the interval since the previous call and reset the
    /// interval counters. `None` until the first packet has arrived.
    pub fn build_feedback(&mut self, nacks: Vec<u16>, now: Instant) -> Option<FeedbackMessage> {
        let last_sequence = self.highest_sequence?;
        let interval = std::mem::take(&mut self.interval);

        let mean_transit = (interval.transit_count > 0)
            .then(|| interval.transit_sum_ms / interval.transit_count as f64);
        let mut delay_gradient = 0.0;
        if let (Some(mean), Some(previous), Some(reported_at)) =
            (mean_transit, self.previous_mean_transit_ms, self.last_report_at)
        {
            let elapsed = now.saturating_duration_since(reported_at).as_secs_f64();
            if elapsed > 0.0 {
                delay_gradient = (mean - previous) / elapsed;
            }
        }
        if mean_transit.is_some() {
            self.previous_mean_transit_ms = mean_transit;
        }
        self.last_report_at = Some(now);

        Some(FeedbackMessage {
            last_sequence,
            packets_received: interval.received,
            packets_lost: interval.expected.saturating_sub(interval.received),
            jitter_ms: self.jitter_ms as f32,
            bandwidth_kbps: self.bandwidth_kbps().round() as u32,
            delay_gradient: delay_gradient as f32,
            rtt_ms: self.rtt_ms,
            decode_time_ms: self.decode_ms.map(|ms| ms as f32),
            frames_dropped: interval.frames_dropped,
            nacks,
        })
    }

    pub fn loss_ratio(&self) -> f64 {
        if self.total_expected == 0 {
            return 0.0;
        }
        self.total_expected.saturating_sub(self.total_received) as f64 / self.total_expected as f64
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms
    }

    /// Received payload rate over the last second of history, in kbps
    pub fn bandwidth_kbps(&self) -> f64 {
        let Some(newest) = self.history.back() else {
            return 0.0;
        };

        let mut bytes = 0usize;
        let mut oldest = newest.received_at;
        for record in self.history.iter().rev() {
            if newest.received_at.saturating_duration_since(record.received_at) > BANDWIDTH_WINDOW {
                break;
            }
            bytes += record.payload_size;
            oldest = record.received_at;
        }

        let span = newest.received_at.saturating_duration_since(oldest).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        8.0 * bytes as f64 / span / 1000.0
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            packets_received: self.total_received,
            packets_expected: self.total_expected,
            packets_lost: self.total_expected.saturating_sub(self.total_received),
            loss_ratio: self.loss_ratio(),
            jitter_ms: self.jitter_ms,
            bandwidth_kbps: self.bandwidth_kbps(),
            fps: self.fps,
            avg_decode_ms: self.decode_ms.unwrap_or(0.0),
            avg_render_ms: self.render_ms.unwrap_or(0.0),
            frames_decoded: self.frames_decoded,
            frames_dropped: self.frames_dropped,
            last_sequence: self.highest_sequence,
        }
    }

    /// Frames decoded between the oldest and newest retained arrivals,
    /// divided by that span
    fn update_fps(&mut self) {
        let (Some(oldest), Some(newest)) = (self.history.front(), self.history.back()) else {
            return;
        };
        let span = newest.received_at.saturating_duration_since(oldest.received_at);
        if span.is_zero() {
            return;
        }

        let frames = self
            .decoded_at
            .iter()
            .filter(|&&at| at >= oldest.received_at && at <= newest.received_at)
            .count();
        let fps = frames as f64 / span.as_secs_f64();
        if fps > MAX_PLAUSIBLE_FPS {
            debug!("Discarding implausible FPS estimate {:.0}", fps);
            return;
        }
        self.fps = fps;
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self::from_config(&QosConfig::default())
    }
}

fn smooth(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(value) => value + TIMING_SMOOTHING * (sample - value),
        None => sample,
    }
}
