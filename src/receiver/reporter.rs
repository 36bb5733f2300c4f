/*!
 * Receiver Session
 *
 * Owns the receiver statistics for one stream. Media packets are fed in
 * from the receive path while a background task emits a feedback report
 * every feedback interval.
 */

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::nack::RetransmissionSource;
use super::stats::{MediaPacketHeader, ReceiverStats, ReceiverStatsSnapshot};
use crate::config::QosConfig;
use crate::feedback::MAX_NACKS;
use crate::metrics::QosMetrics;
use crate::transport::FeedbackTransport;

pub struct ReceiverSession {
    id: Uuid,
    config: QosConfig,
    stats: Arc<Mutex<ReceiverStats>>,
    nacks: Arc<dyn RetransmissionSource>,
    transport: Arc<dyn FeedbackTransport>,
    metrics: QosMetrics,
    is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ReceiverSession {
    pub fn new(
        config: QosConfig,
        transport: Arc<dyn FeedbackTransport>,
        nacks: Arc<dyn RetransmissionSource>,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(session = %id, "Receiver session created");

        Self {
            id,
            stats: Arc::new(Mutex::new(ReceiverStats::from_config(&config))),
            config,
            nacks,
            transport,
            metrics: QosMetrics::new(),
            is_running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            task: None,
        }
    }

    pub fn with_metrics(mut self, metrics: QosMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metrics(&self) -> &QosMetrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn on_packet_received(&self, header: MediaPacketHeader, now: Instant) {
        self.nacks.on_packet_received(header.sequence, now);
        lock(&self.stats).on_packet_received(header, now);
    }

    pub fn on_frame_decoded(&self, decode_ms: f64, now: Instant) {
        lock(&self.stats).on_frame_decoded(decode_ms, now);
    }

    pub fn on_frame_rendered(&self, render_ms: f64) {
        lock(&self.stats).on_frame_rendered(render_ms);
    }

    pub fn on_frame_dropped(&self) {
        lock(&self.stats).on_frame_dropped();
    }

    pub fn set_rtt_sample(&self, rtt_ms: u16) {
        lock(&self.stats).set_rtt_sample(rtt_ms);
    }

    pub fn stats(&self) -> ReceiverStatsSnapshot {
        lock(&self.stats).snapshot()
    }

    /// Build and send one report now. Returns whether a report went out.
    pub async fn send_report(&self, now: Instant) -> bool {
        emit_report(&self.stats, &*self.nacks, &*self.transport, &self.metrics, now).await
    }

    /// Start the periodic feedback task
    pub async fn start(&mut self) -> Result<()> {
        if self.is_running.load(Ordering::SeqCst) {
            warn!(session = %self.id, "Receiver session already running");
            return Ok(());
        }
        self.is_running.store(true, Ordering::SeqCst);
        // A permit left over from an earlier stop must not end this run
        self.shutdown = Arc::new(Notify::new());

        let id = self.id;
        let period = self.config.feedback_interval();
        let stats = self.stats.clone();
        let nacks = self.nacks.clone();
        let transport = self.transport.clone();
        let metrics = self.metrics.clone();
        let is_running = self.is_running.clone();
        let shutdown = self.shutdown.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(session = %id, "Feedback loop started every {:?}", period);

            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.notified() => break,
                }
                if !is_running.load(Ordering::SeqCst) {
                    break;
                }

                let now = tokio::time::Instant::now().into_std();
                emit_report(&stats, &*nacks, &*transport, &metrics, now).await;
            }

            is_running.store(false, Ordering::SeqCst);
            info!(session = %id, "Feedback loop stopped");
            Ok(())
        }));

        Ok(())
    }

    /// Stop the feedback task and wait for it to finish
    pub async fn stop(&mut self) -> Result<()> {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| anyhow::anyhow!("Feedback task join error: {}", e))??;
        }

        info!(session = %self.id, "Receiver session stopped");
        Ok(())
    }
}

fn lock(stats: &Mutex<ReceiverStats>) -> MutexGuard<'_, ReceiverStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn emit_report(
    stats: &Mutex<ReceiverStats>,
    nacks: &dyn RetransmissionSource,
    transport: &dyn FeedbackTransport,
    metrics: &QosMetrics,
    now: Instant,
) -> bool {
    let hints = nacks.missing_sequences(MAX_NACKS, now);

    // Only building the report happens under the lock, never the send
    let payload = {
        let mut stats = lock(stats);
        match stats.build_feedback(hints, now) {
            Some(report) => report.encode(),
            None => return false,
        }
    };

    match transport.send(payload).await {
        Ok(()) => {
            metrics.record_feedback_sent();
            true
        }
        Err(e) => {
            debug!("Feedback send skipped: {}", e);
            metrics.record_feedback_send_skipped();
            false
        }
    }
}
