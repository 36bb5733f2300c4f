/*!
 * QoS Controller
 *
 * Sender-side AIMD state machine. Every feedback report moves the
 * controller through INCREASE / HOLD / DECREASE and then pushes the
 * resulting operating point (bitrate, fps, resolution, FEC ratio) to the
 * encoder and FEC collaborators.
 *
 * Bitrate is the first lever. Once it is pinned at the floor, the active
 * profile decides whether resolution or frame rate gives way next.
 * Without a profile only the frame rate is touched.
 */

use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::bandwidth::BandwidthEstimator;
use super::kalman::DelayGradientFilter;
use super::profile::{Resolution, StreamingProfile};
use crate::config::QosConfig;
use crate::error::QosResult;
use crate::fec::FecControl;
use crate::feedback::FeedbackMessage;
use crate::metrics::QosMetrics;
use crate::video::EncoderControl;

/// Smoothed loss at which bitrate is cut regardless of delay
pub const HIGH_LOSS: f64 = 0.05;
/// Smoothed loss at which a keyframe is forced
pub const CRITICAL_LOSS: f64 = 0.10;
/// Smoothed loss under which recovery is allowed
pub const LOW_LOSS: f64 = 0.02;
/// Filtered delay gradient (ms/s) signalling a growing queue
pub const OVERUSE_GRADIENT: f64 = 5.0;
/// Filtered delay gradient (ms/s) signalling a draining queue
pub const UNDERUSE_GRADIENT: f64 = -1.0;
/// Overuse threshold multiplier on VPN paths
pub const VPN_THRESHOLD_SCALE: f64 = 1.5;
/// Starting bitrate multiplier on VPN paths
pub const VPN_START_FACTOR: f64 = 0.8;

const DECREASE_FACTOR: f64 = 0.85;
const INCREASE_FACTOR: f64 = 1.05;
const LOSS_SMOOTHING: f64 = 0.5;
const RTT_SMOOTHING: f64 = 0.125;
/// Fractions of the target bitrate above which fps / resolution recover
const FPS_RECOVERY_FRACTION: f64 = 0.6;
const RESOLUTION_RECOVERY_FRACTION: f64 = 0.8;
const MIN_RECOVERY_AGGRESSIVENESS: f32 = 0.3;

/// Controller decision for one feedback cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QosState {
    Increase,
    Hold,
    Decrease,
}

impl fmt::Display for QosState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QosState::Increase => "INCREASE",
            QosState::Hold => "HOLD",
            QosState::Decrease => "DECREASE",
        };
        f.write_str(name)
    }
}

/// Parameters currently pushed to the collaborators
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperatingPoint {
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub resolution: Resolution,
    pub fec_ratio: f32,
    /// Rung in the profile's resolution ladder (0 without a profile)
    pub resolution_index: usize,
    /// Rung in the profile's fps ladder (0 without a profile)
    pub fps_index: usize,
}

/// Read-only view of the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QosStats {
    pub bitrate_kbps: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub loss_ratio: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub state: QosState,
    pub fec_ratio: f32,
    pub estimated_bandwidth_kbps: f64,
    pub delay_gradient: f64,
    pub decode_time_ms: f64,
    pub resolution_index: usize,
    pub fps_index: usize,
    pub profile: Option<String>,
    pub codec: String,
    pub vpn_mode: bool,
    pub cycles: u64,
}

/// Invoked with (width, height) whenever the controller picks a new resolution
pub type ResolutionCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

pub struct QosController {
    config: QosConfig,
    profile: Option<StreamingProfile>,
    vpn_mode: bool,
    point: OperatingPoint,
    state: QosState,
    bandwidth: BandwidthEstimator,
    smoothed_loss: Option<f64>,
    smoothed_rtt_ms: Option<f64>,
    jitter_ms: f64,
    decode_time_ms: f64,
    cycles: u64,
    last_resolution_change: Option<u64>,
    encoder: Box<dyn EncoderControl>,
    fec: Box<dyn FecControl>,
    resolution_callback: Option<ResolutionCallback>,
    metrics: QosMetrics,
}

impl QosController {
    /// Controller running on the legacy bounds from `config`
    pub fn new(
        config: QosConfig,
        encoder: Box<dyn EncoderControl>,
        fec: Box<dyn FecControl>,
    ) -> Self {
        let bandwidth = BandwidthEstimator::new(
            DelayGradientFilter::new(config.process_noise, config.measurement_noise),
            config.sent_packet_timeout(),
            config.timing_window(),
        );
        let point = OperatingPoint {
            bitrate_kbps: config
                .target_bitrate_kbps
                .clamp(config.min_bitrate_kbps, config.max_bitrate_kbps),
            fps: config.target_fps,
            resolution: config.resolution,
            fec_ratio: config.min_fec_ratio,
            resolution_index: 0,
            fps_index: 0,
        };

        info!(
            "QoS controller initialized: {} kbps, {} @ {} fps ({})",
            point.bitrate_kbps,
            point.resolution,
            point.fps,
            encoder.codec_name()
        );

        Self {
            config,
            profile: None,
            vpn_mode: false,
            point,
            state: QosState::Hold,
            bandwidth,
            smoothed_loss: None,
            smoothed_rtt_ms: None,
            jitter_ms: 0.0,
            decode_time_ms: 0.0,
            cycles: 0,
            last_resolution_change: None,
            encoder,
            fec,
            resolution_callback: None,
            metrics: QosMetrics::new(),
        }
    }

    /// Share counters with the rest of the session
    pub fn with_metrics(mut self, metrics: QosMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Switch to a streaming profile and restart from its target point
    pub fn apply_preset(&mut self, profile: StreamingProfile) -> QosResult<()> {
        profile.validate()?;

        let previous_resolution = self.point.resolution;
        let fps_index = profile.target_fps_index();
        self.point = OperatingPoint {
            bitrate_kbps: self.start_bitrate(
                profile.target_bitrate_kbps,
                profile.min_bitrate_kbps,
                profile.max_bitrate_kbps,
            ),
            fps: profile.fps_ladder[fps_index],
            resolution: profile.resolution_ladder[0],
            fec_ratio: profile.min_fec_ratio,
            resolution_index: 0,
            fps_index,
        };
        self.last_resolution_change = None;

        info!(
            "Applied '{}' profile: {} kbps, {} @ {} fps",
            profile.name, self.point.bitrate_kbps, self.point.resolution, self.point.fps
        );
        self.profile = Some(profile);

        if self.point.resolution != previous_resolution {
            self.notify_resolution();
        }
        self.push_operating_point();
        Ok(())
    }

    /// Raise the overuse threshold for tunnelled paths. Before the first
    /// report this also lowers the starting bitrate.
    pub fn set_vpn_mode(&mut self, enabled: bool) {
        if self.vpn_mode == enabled {
            return;
        }
        self.vpn_mode = enabled;
        info!("VPN mode {}", if enabled { "enabled" } else { "disabled" });

        if self.cycles == 0 {
            let (min, max, target) = self.bitrate_bounds();
            self.point.bitrate_kbps = self.start_bitrate(target, min, max);
            debug!("Starting bitrate now {} kbps", self.point.bitrate_kbps);
            self.push_operating_point();
        }
    }

    pub fn set_resolution_callback(&mut self, callback: ResolutionCallback) {
        self.resolution_callback = Some(callback);
    }

    /// Pin the bitrate, clamped to the active bounds
    pub fn set_bitrate_kbps(&mut self, kbps: u32) {
        let (min, max, _) = self.bitrate_bounds();
        self.point.bitrate_kbps = kbps.clamp(min, max);
    }

    pub fn on_packet_sent(&mut self, sequence: u16, bytes: usize, now: Instant) {
        self.bandwidth.on_packet_sent(sequence, bytes, now);
    }

    pub fn on_ack_received(&mut self, sequence: u16, now: Instant) {
        if let Some(sample) = self.bandwidth.on_ack_received(sequence, now) {
            self.observe_rtt(sample.rtt_ms);
        }
    }

    /// Run one control cycle for a decoded receiver report
    pub fn on_feedback(&mut self, report: &FeedbackMessage, now: Instant) -> QosState {
        self.cycles += 1;

        if let Some(loss) = report.loss_ratio() {
            let smoothed = match self.smoothed_loss {
                Some(previous) => previous * (1.0 - LOSS_SMOOTHING) + loss * LOSS_SMOOTHING,
                None => loss,
            };
            self.smoothed_loss = Some(smoothed);
        }
        if let Some(rtt) = report.rtt_ms {
            self.observe_rtt(rtt as f64);
        }
        self.jitter_ms = report.jitter_ms as f64;
        if let Some(decode) = report.decode_time_ms {
            self.decode_time_ms = decode as f64;
        }

        // The report doubles as an ack for its highest sequence number. The
        // receiver's own gradient is used when the ack yields no sample.
        let own_gradient = match self.bandwidth.on_ack_received(report.last_sequence, now) {
            Some(sample) => {
                self.observe_rtt(sample.rtt_ms);
                sample.gradient
            }
            None => None,
        };
        if own_gradient.is_none() {
            self.bandwidth.observe_gradient(report.delay_gradient as f64);
        }

        let loss = self.smoothed_loss.unwrap_or(0.0);
        let gradient = self.bandwidth.delay_gradient();
        let state = self.decide(loss, gradient);

        if loss >= CRITICAL_LOSS {
            self.request_keyframe(loss);
        }

        match state {
            QosState::Decrease => self.decrease(),
            QosState::Increase => self.increase(),
            QosState::Hold => {}
        }
        self.point.fec_ratio = self.fec_ratio_for(loss);

        if state != self.state {
            info!(
                "QoS {} -> {} (loss {:.1}%, gradient {:.2} ms/s)",
                self.state,
                state,
                loss * 100.0,
                gradient
            );
        }
        self.state = state;

        debug!(
            "Cycle {}: {} kbps, {} @ {} fps, FEC {:.2}",
            self.cycles,
            self.point.bitrate_kbps,
            self.point.resolution,
            self.point.fps,
            self.point.fec_ratio
        );

        self.push_operating_point();
        state
    }

    pub fn stats(&self) -> QosStats {
        QosStats {
            bitrate_kbps: self.point.bitrate_kbps,
            fps: self.point.fps,
            width: self.point.resolution.width,
            height: self.point.resolution.height,
            loss_ratio: self.smoothed_loss.unwrap_or(0.0),
            rtt_ms: self.smoothed_rtt_ms.unwrap_or(0.0),
            jitter_ms: self.jitter_ms,
            state: self.state,
            fec_ratio: self.point.fec_ratio,
            estimated_bandwidth_kbps: self.bandwidth.estimated_bandwidth_kbps(),
            delay_gradient: self.bandwidth.delay_gradient(),
            decode_time_ms: self.decode_time_ms,
            resolution_index: self.point.resolution_index,
            fps_index: self.point.fps_index,
            profile: self.profile.as_ref().map(|p| p.name.clone()),
            codec: self.encoder.codec_name().to_string(),
            vpn_mode: self.vpn_mode,
            cycles: self.cycles,
        }
    }

    pub fn operating_point(&self) -> OperatingPoint {
        self.point
    }

    pub fn state(&self) -> QosState {
        self.state
    }

    pub fn profile(&self) -> Option<&StreamingProfile> {
        self.profile.as_ref()
    }

    pub fn metrics(&self) -> &QosMetrics {
        &self.metrics
    }

    fn decide(&self, loss: f64, gradient: f64) -> QosState {
        if loss >= HIGH_LOSS || gradient > self.overuse_threshold() {
            QosState::Decrease
        } else if loss <= LOW_LOSS && gradient < UNDERUSE_GRADIENT {
            QosState::Increase
        } else {
            QosState::Hold
        }
    }

    fn overuse_threshold(&self) -> f64 {
        if self.vpn_mode {
            OVERUSE_GRADIENT * VPN_THRESHOLD_SCALE
        } else {
            OVERUSE_GRADIENT
        }
    }

    /// (min, max, target) in kbps
    fn bitrate_bounds(&self) -> (u32, u32, u32) {
        match &self.profile {
            Some(p) => (p.min_bitrate_kbps, p.max_bitrate_kbps, p.target_bitrate_kbps),
            None => (
                self.config.min_bitrate_kbps,
                self.config.max_bitrate_kbps,
                self.config.target_bitrate_kbps,
            ),
        }
    }

    fn fec_bounds(&self) -> (f32, f32) {
        match &self.profile {
            Some(p) => (p.min_fec_ratio, p.max_fec_ratio),
            None => (self.config.min_fec_ratio, self.config.max_fec_ratio),
        }
    }

    fn start_bitrate(&self, target: u32, min: u32, max: u32) -> u32 {
        let start = if self.vpn_mode {
            (target as f64 * VPN_START_FACTOR) as u32
        } else {
            target
        };
        start.clamp(min, max)
    }

    fn fec_ratio_for(&self, loss: f64) -> f32 {
        let (min, max) = self.fec_bounds();
        if loss < LOW_LOSS {
            min
        } else if loss < HIGH_LOSS {
            (2.0 * min).min(max)
        } else if loss <= CRITICAL_LOSS {
            (0.6 * max).max(min)
        } else {
            max
        }
    }

    fn observe_rtt(&mut self, sample_ms: f64) {
        let smoothed = match self.smoothed_rtt_ms {
            Some(previous) => previous + RTT_SMOOTHING * (sample_ms - previous),
            None => sample_ms,
        };
        self.smoothed_rtt_ms = Some(smoothed);
    }

    fn decrease(&mut self) {
        let (min, _, _) = self.bitrate_bounds();
        let at_floor = self.point.bitrate_kbps <= min;
        let reduced = (self.point.bitrate_kbps as f64 * DECREASE_FACTOR) as u32;
        self.point.bitrate_kbps = reduced.max(min);

        if !at_floor {
            return;
        }

        match self.profile.clone() {
            Some(profile) => self.degrade(&profile),
            None => {
                if self.point.fps > self.config.min_fps {
                    info!(
                        "Bitrate at floor, dropping to {} fps",
                        self.config.min_fps
                    );
                    self.point.fps = self.config.min_fps;
                }
            }
        }
    }

    /// Give up one rung of the less important dimension
    fn degrade(&mut self, profile: &StreamingProfile) {
        let resolution_exhausted =
            self.point.resolution_index >= profile.lowest_resolution_index();
        let fps_exhausted = self.point.fps_index >= profile.min_fps_index();

        if profile.prefers_fps() {
            if !resolution_exhausted {
                self.step_resolution(profile, self.point.resolution_index + 1);
            } else if !fps_exhausted {
                self.step_fps(profile, self.point.fps_index + 1);
            }
        } else if !fps_exhausted {
            self.step_fps(profile, self.point.fps_index + 1);
        } else if !resolution_exhausted {
            self.step_resolution(profile, self.point.resolution_index + 1);
        }
    }

    fn increase(&mut self) {
        let (_, max, target) = self.bitrate_bounds();
        let raised = (self.point.bitrate_kbps as f64 * INCREASE_FACTOR) as u32;
        self.point.bitrate_kbps = raised.min(max);

        let bitrate = self.point.bitrate_kbps as f64;
        let target = target as f64;

        match self.profile.clone() {
            Some(profile) => {
                if bitrate > target * FPS_RECOVERY_FRACTION
                    && self.point.fps_index > profile.target_fps_index()
                {
                    self.step_fps(&profile, self.point.fps_index - 1);
                }
                if bitrate > target * RESOLUTION_RECOVERY_FRACTION
                    && profile.recovery_aggressiveness >= MIN_RECOVERY_AGGRESSIVENESS
                    && self.point.resolution_index > 0
                {
                    self.step_resolution(&profile, self.point.resolution_index - 1);
                }
            }
            None => {
                if bitrate > target * FPS_RECOVERY_FRACTION
                    && self.point.fps < self.config.target_fps
                {
                    info!("Restoring {} fps", self.config.target_fps);
                    self.point.fps = self.config.target_fps;
                }
            }
        }
    }

    fn step_fps(&mut self, profile: &StreamingProfile, index: usize) {
        let Some(&fps) = profile.fps_ladder.get(index) else {
            return;
        };
        info!("FPS {} -> {}", self.point.fps, fps);
        self.point.fps_index = index;
        self.point.fps = fps;
    }

    /// Move to another resolution rung unless the cooldown is still running
    fn step_resolution(&mut self, profile: &StreamingProfile, index: usize) {
        if let Some(changed_at) = self.last_resolution_change {
            if self.cycles.saturating_sub(changed_at) < self.config.resolution_cooldown_cycles {
                debug!("Resolution change suppressed by cooldown");
                return;
            }
        }
        let Some(&resolution) = profile.resolution_ladder.get(index) else {
            return;
        };

        info!("Resolution {} -> {}", self.point.resolution, resolution);
        self.point.resolution_index = index;
        self.point.resolution = resolution;
        self.last_resolution_change = Some(self.cycles);
        self.metrics.record_resolution_change();
        self.notify_resolution();
    }

    fn notify_resolution(&self) {
        if let Some(callback) = &self.resolution_callback {
            callback(self.point.resolution.width, self.point.resolution.height);
        }
    }

    fn request_keyframe(&mut self, loss: f64) {
        warn!("Critical loss {:.1}%, forcing keyframe", loss * 100.0);
        self.metrics.record_keyframe_requested();
        if let Err(e) = self.encoder.force_keyframe() {
            warn!("Encoder rejected keyframe request: {}", e);
            self.metrics.record_collaborator_failure();
        }
    }

    fn push_operating_point(&mut self) {
        let OperatingPoint {
            bitrate_kbps,
            fps,
            resolution,
            fec_ratio,
            ..
        } = self.point;

        if let Err(e) = self
            .encoder
            .reconfigure(bitrate_kbps, fps, resolution.width, resolution.height)
        {
            warn!("Encoder reconfigure failed: {}", e);
            self.metrics.record_collaborator_failure();
        }
        if let Err(e) = self.fec.set_redundancy_ratio(fec_ratio) {
            warn!("FEC update failed: {}", e);
            self.metrics.record_collaborator_failure();
        }
    }
}
