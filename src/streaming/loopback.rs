/*!
 * Loopback Simulation
 *
 * Runs a sender session and a receiver session against each other over a
 * simulated link with finite capacity, a fixed propagation delay, a
 * bounded queue and optional periodic loss. Time is virtual and advances
 * in 1 ms steps, so a ten second run completes in milliseconds and is
 * fully deterministic.
 *
 * Frames come from a `SimulatedEncoder`, are split into MTU-sized packets,
 * protected with XOR parity at the ratio the controller picked and paced
 * evenly across the frame interval.
 */

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::session::SenderSession;
use crate::config::QosConfig;
use crate::fec::{FecControl, XorFecEncoder};
use crate::metrics::{MetricsSnapshot, QosMetrics};
use crate::qos::{QosController, QosStats, Resolution, StreamingProfile};
use crate::receiver::{MediaPacketHeader, NackTracker, ReceiverSession, ReceiverStatsSnapshot};
use crate::transport::ChannelTransport;
use crate::video::{EncoderConfig, EncoderControl, SimulatedEncoder};

const DECODE_MS: f64 = 3.0;
const RENDER_MS: f64 = 1.0;

/// Simulated network path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub capacity_kbps: u32,
    /// One-way propagation delay
    pub base_delay_ms: u64,
    /// Drop every Nth packet; 0 disables
    pub loss_every: u32,
    /// Packets that would wait longer than this in the queue are dropped
    pub max_queue_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            capacity_kbps: 25_000,
            base_delay_ms: 20,
            loss_every: 0,
            max_queue_ms: 250,
        }
    }
}

/// Step change of link capacity during the run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityChange {
    pub at_ms: u64,
    pub capacity_kbps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    pub duration_ms: u64,
    pub mtu: usize,
    pub link: LinkConfig,
    pub capacity_change: Option<CapacityChange>,
    pub vpn_mode: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            mtu: 1200,
            link: LinkConfig::default(),
            capacity_change: None,
            vpn_mode: false,
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct LoopbackReport {
    pub sender: QosStats,
    pub receiver: ReceiverStatsSnapshot,
    pub metrics: MetricsSnapshot,
    pub packets_sent: u64,
    pub parity_packets: u64,
    pub packets_dropped: u64,
    pub keyframes_sent: u64,
    pub resolution_changes: Vec<Resolution>,
}

/// Encoder handle shared between the controller and the frame source
#[derive(Clone)]
struct SharedEncoder {
    inner: Arc<Mutex<SimulatedEncoder>>,
    codec: &'static str,
}

impl EncoderControl for SharedEncoder {
    fn reconfigure(&mut self, bitrate_kbps: u32, fps: u32, width: u32, height: u32) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reconfigure(bitrate_kbps, fps, width, height)
    }

    fn force_keyframe(&mut self) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .force_keyframe()
    }

    fn codec_name(&self) -> &str {
        self.codec
    }
}

#[derive(Clone, Default)]
struct SharedFec(Arc<Mutex<XorFecEncoder>>);

impl FecControl for SharedFec {
    fn set_redundancy_ratio(&mut self, ratio: f32) -> Result<()> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_redundancy_ratio(ratio)
    }

    fn redundancy_ratio(&self) -> f32 {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .redundancy_ratio()
    }
}

#[derive(Debug, Clone, Copy)]
struct OutgoingPacket {
    send_at: Instant,
    size: usize,
    frame_id: u64,
    frame_end: bool,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    arrive_at: Instant,
    header: MediaPacketHeader,
    frame_id: u64,
    frame_end: bool,
}

/// FIFO bottleneck with a tail-drop queue
struct SimulatedLink {
    config: LinkConfig,
    busy_until: Option<Instant>,
    packets_seen: u64,
    dropped: u64,
    in_flight: VecDeque<InFlight>,
}

impl SimulatedLink {
    fn new(config: LinkConfig) -> Self {
        Self {
            config,
            busy_until: None,
            packets_seen: 0,
            dropped: 0,
            in_flight: VecDeque::new(),
        }
    }

    /// Returns false when the packet was dropped
    fn transmit(&mut self, packet: InFlight, now: Instant) -> bool {
        self.packets_seen += 1;
        if self.config.loss_every > 0 && self.packets_seen % self.config.loss_every as u64 == 0 {
            self.dropped += 1;
            return false;
        }

        let start = match self.busy_until {
            Some(busy) if busy > now => busy,
            _ => now,
        };
        if start.saturating_duration_since(now) > Duration::from_millis(self.config.max_queue_ms) {
            self.dropped += 1;
            return false;
        }

        let bits = packet.header.payload_size as f64 * 8.0;
        let serialization = Duration::from_secs_f64(bits / (self.config.capacity_kbps.max(1) as f64 * 1000.0));
        let done = start + serialization;
        self.busy_until = Some(done);

        self.in_flight.push_back(InFlight {
            arrive_at: done + Duration::from_millis(self.config.base_delay_ms),
            ..packet
        });
        true
    }

    fn arrivals(&mut self, now: Instant) -> Vec<InFlight> {
        let mut due = Vec::new();
        while let Some(front) = self.in_flight.front() {
            if front.arrive_at > now {
                break;
            }
            if let Some(packet) = self.in_flight.pop_front() {
                due.push(packet);
            }
        }
        due
    }
}

/// Run the sender/receiver pair for `config.duration_ms` of virtual time
pub async fn run(
    config: &LoopbackConfig,
    qos: &QosConfig,
    profile: Option<StreamingProfile>,
) -> Result<LoopbackReport> {
    let encoder = Arc::new(Mutex::new(SimulatedEncoder::new(EncoderConfig::default())));
    let fec = SharedFec::default();
    let metrics = QosMetrics::new();

    let shared_encoder = SharedEncoder {
        inner: encoder.clone(),
        codec: EncoderConfig::default().codec.name(),
    };
    let controller = QosController::new(qos.clone(), Box::new(shared_encoder), Box::new(fec.clone()))
        .with_metrics(metrics.clone());

    let mut sender = SenderSession::new(controller);
    let mut resolution_rx = sender.take_resolution_changes();
    sender.set_vpn_mode(config.vpn_mode);
    if let Some(profile) = profile {
        sender.apply_preset(profile)?;
    }

    let (transport, mut feedback_rx) = ChannelTransport::new(16);
    let receiver = ReceiverSession::new(qos.clone(), Arc::new(transport), Arc::new(NackTracker::default()))
        .with_metrics(metrics.clone());
    let rtt_ms = (2 * config.link.base_delay_ms).min(u16::MAX as u64) as u16;
    receiver.set_rtt_sample(rtt_ms);

    info!(
        "Loopback run: {} ms over {} kbps link, {} ms delay",
        config.duration_ms, config.link.capacity_kbps, config.link.base_delay_ms
    );

    let mut link = SimulatedLink::new(config.link.clone());
    let mtu = config.mtu.max(1);
    let base = Instant::now();
    let report_interval = qos.feedback_interval();
    let mut next_frame_at = base;
    let mut next_report_at = base + report_interval;
    let mut pending: VecDeque<OutgoingPacket> = VecDeque::new();
    let mut feedback_queue: VecDeque<(Instant, Bytes)> = VecDeque::new();
    let mut broken_frames: HashSet<u64> = HashSet::new();
    let mut sequence: u16 = 0;
    let mut frame_id: u64 = 0;
    let mut packets_sent: u64 = 0;
    let mut parity_packets: u64 = 0;
    let mut keyframes_sent: u64 = 0;

    for t in 0..=config.duration_ms {
        let now = base + Duration::from_millis(t);

        if let Some(change) = config.capacity_change {
            if change.at_ms == t {
                info!("Link capacity -> {} kbps", change.capacity_kbps);
                link.config.capacity_kbps = change.capacity_kbps;
            }
        }

        for arrival in link.arrivals(now) {
            receiver.on_packet_received(arrival.header, arrival.arrive_at);
            if arrival.frame_end {
                if broken_frames.remove(&arrival.frame_id) {
                    receiver.on_frame_dropped();
                } else {
                    receiver.on_frame_decoded(DECODE_MS, arrival.arrive_at);
                    receiver.on_frame_rendered(RENDER_MS);
                }
            }
        }

        while feedback_queue.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((at, payload)) = feedback_queue.pop_front() {
                sender.handle_feedback(&payload, at);
            }
        }

        if now >= next_frame_at {
            let (size, keyframe, fps) = {
                let mut encoder = encoder.lock().unwrap_or_else(PoisonError::into_inner);
                let (size, keyframe) = encoder.next_frame();
                (size, keyframe, encoder.config().fps.max(1))
            };
            if keyframe {
                keyframes_sent += 1;
            }

            let payloads: Vec<Bytes> = (0..size.div_ceil(mtu))
                .map(|i| Bytes::from(vec![0u8; mtu.min(size - i * mtu)]))
                .collect();
            let parity = fec.0.lock().unwrap_or_else(PoisonError::into_inner).protect(&payloads);
            parity_packets += parity.len() as u64;

            let frame_interval = Duration::from_secs_f64(1.0 / fps as f64);
            let sizes: Vec<usize> = payloads.iter().chain(parity.iter()).map(|p| p.len()).collect();
            let spacing = frame_interval / sizes.len().max(1) as u32;
            for (i, &size) in sizes.iter().enumerate() {
                pending.push_back(OutgoingPacket {
                    send_at: now + spacing * i as u32,
                    size,
                    frame_id,
                    frame_end: i + 1 == sizes.len(),
                });
            }

            frame_id += 1;
            next_frame_at += frame_interval;
        }

        while pending.front().is_some_and(|p| p.send_at <= now) {
            let Some(packet) = pending.pop_front() else {
                break;
            };
            let header = MediaPacketHeader {
                sequence,
                send_timestamp_ms: t as u32,
                payload_size: packet.size,
            };
            sender.on_packet_sent(sequence, packet.size, now);
            packets_sent += 1;
            sequence = sequence.wrapping_add(1);

            let delivered = link.transmit(
                InFlight {
                    arrive_at: now,
                    header,
                    frame_id: packet.frame_id,
                    frame_end: packet.frame_end,
                },
                now,
            );
            if !delivered {
                if packet.frame_end {
                    receiver.on_frame_dropped();
                } else {
                    broken_frames.insert(packet.frame_id);
                }
            }
        }

        if now >= next_report_at {
            receiver.send_report(now).await;
            while let Ok(payload) = feedback_rx.try_recv() {
                let arrive_at = now + Duration::from_millis(config.link.base_delay_ms);
                feedback_queue.push_back((arrive_at, payload));
            }
            next_report_at += report_interval;
        }
    }

    let mut resolution_changes = Vec::new();
    if let Some(rx) = resolution_rx.as_mut() {
        while let Ok(resolution) = rx.try_recv() {
            resolution_changes.push(resolution);
        }
    }

    debug!("Loopback finished after {} packets", packets_sent);

    Ok(LoopbackReport {
        sender: sender.stats(),
        receiver: receiver.stats(),
        metrics: metrics.snapshot(),
        packets_sent,
        parity_packets,
        packets_dropped: link.dropped,
        keyframes_sent,
        resolution_changes,
    })
}
