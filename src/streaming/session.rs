/*!
 * Sender Session
 *
 * Wraps the QoS controller for one outgoing stream. The transmit path
 * reports every packet it sends; a background task decodes incoming
 * feedback reports and runs a control cycle for each.
 */

use anyhow::Result;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QosResult;
use crate::feedback::FeedbackMessage;
use crate::metrics::QosMetrics;
use crate::qos::{OperatingPoint, QosController, QosState, QosStats, Resolution, StreamingProfile};

pub struct SenderSession {
    id: Uuid,
    controller: Arc<Mutex<QosController>>,
    metrics: QosMetrics,
    is_streaming: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<Result<()>>>,
    resolution_rx: Option<mpsc::UnboundedReceiver<Resolution>>,
}

impl SenderSession {
    /// Take ownership of a configured controller. Resolution changes it
    /// decides on are queued for the capture pipeline, see
    /// [`SenderSession::take_resolution_changes`].
    pub fn new(mut controller: QosController) -> Self {
        let id = Uuid::new_v4();
        let metrics = controller.metrics().clone();

        let (resolution_tx, resolution_rx) = mpsc::unbounded_channel();
        controller.set_resolution_callback(Box::new(move |width, height| {
            // Nobody listening is fine
            let _ = resolution_tx.send(Resolution::new(width, height));
        }));

        info!(session = %id, "Sender session created");

        Self {
            id,
            controller: Arc::new(Mutex::new(controller)),
            metrics,
            is_streaming: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            task: None,
            resolution_rx: Some(resolution_rx),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metrics(&self) -> &QosMetrics {
        &self.metrics
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming.load(Ordering::SeqCst)
    }

    /// Resolution changes for the capture pipeline. Can be taken once.
    pub fn take_resolution_changes(&mut self) -> Option<mpsc::UnboundedReceiver<Resolution>> {
        self.resolution_rx.take()
    }

    pub fn apply_preset(&self, profile: StreamingProfile) -> QosResult<()> {
        lock(&self.controller).apply_preset(profile)
    }

    pub fn set_vpn_mode(&self, enabled: bool) {
        lock(&self.controller).set_vpn_mode(enabled);
    }

    /// Hook for the transmit path
    pub fn on_packet_sent(&self, sequence: u16, bytes: usize, now: Instant) {
        lock(&self.controller).on_packet_sent(sequence, bytes, now);
    }

    pub fn on_ack_received(&self, sequence: u16, now: Instant) {
        lock(&self.controller).on_ack_received(sequence, now);
    }

    /// Decode one report and run a control cycle. Malformed reports are
    /// counted and dropped.
    pub fn handle_feedback(&self, payload: &[u8], now: Instant) -> Option<QosState> {
        ingest(&self.controller, &self.metrics, payload, now)
    }

    pub fn stats(&self) -> QosStats {
        lock(&self.controller).stats()
    }

    pub fn operating_point(&self) -> OperatingPoint {
        lock(&self.controller).operating_point()
    }

    /// Consume feedback from `feedback_rx` until stopped or the channel closes
    pub async fn start(&mut self, mut feedback_rx: mpsc::Receiver<Bytes>) -> Result<()> {
        if self.is_streaming.load(Ordering::SeqCst) {
            warn!(session = %self.id, "Sender session already running");
            return Ok(());
        }
        self.is_streaming.store(true, Ordering::SeqCst);
        // A permit left over from an earlier stop must not end this run
        self.shutdown = Arc::new(Notify::new());

        let id = self.id;
        let controller = self.controller.clone();
        let metrics = self.metrics.clone();
        let is_streaming = self.is_streaming.clone();
        let shutdown = self.shutdown.clone();

        self.task = Some(tokio::spawn(async move {
            info!(session = %id, "Feedback ingest started");

            while is_streaming.load(Ordering::SeqCst) {
                let payload = tokio::select! {
                    received = feedback_rx.recv() => match received {
                        Some(payload) => payload,
                        None => {
                            debug!(session = %id, "Feedback channel closed");
                            break;
                        }
                    },
                    _ = shutdown.notified() => break,
                };

                let now = tokio::time::Instant::now().into_std();
                ingest(&controller, &metrics, &payload, now);
            }

            is_streaming.store(false, Ordering::SeqCst);
            info!(session = %id, "Feedback ingest stopped");
            Ok(())
        }));

        Ok(())
    }

    /// Stop the ingest task and wait for it
    pub async fn stop(&mut self) -> Result<()> {
        self.is_streaming.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| anyhow::anyhow!("Feedback ingest join error: {}", e))??;
        }

        info!(session = %self.id, "Sender session stopped");
        Ok(())
    }
}

fn lock(controller: &Mutex<QosController>) -> MutexGuard<'_, QosController> {
    controller.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ingest(
    controller: &Mutex<QosController>,
    metrics: &QosMetrics,
    payload: &[u8],
    now: Instant,
) -> Option<QosState> {
    match FeedbackMessage::decode(payload) {
        Ok(report) => {
            metrics.record_feedback_accepted();
            Some(lock(controller).on_feedback(&report, now))
        }
        Err(e) => {
            warn!("Dropping malformed feedback: {}", e);
            metrics.record_feedback_rejected();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QosConfig;
    use crate::fec::XorFecEncoder;
    use crate::qos::Preset;
    use crate::video::{EncoderConfig, SimulatedEncoder};
    use std::time::Duration;

    fn session() -> SenderSession {
        let controller = QosController::new(
            QosConfig::default(),
            Box::new(SimulatedEncoder::new(EncoderConfig::default())),
            Box::new(XorFecEncoder::default()),
        );
        SenderSession::new(controller)
    }

    fn report(lost: u32) -> FeedbackMessage {
        FeedbackMessage {
            last_sequence: 0,
            packets_received: 100 - lost,
            packets_lost: lost,
            jitter_ms: 2.0,
            bandwidth_kbps: 8_000,
            delay_gradient: 0.0,
            rtt_ms: Some(20),
            decode_time_ms: None,
            frames_dropped: 0,
            nacks: vec![],
        }
    }

    #[test]
    fn test_malformed_feedback_is_counted_and_ignored() {
        let session = session();
        let before = session.stats();

        assert_eq!(session.handle_feedback(&[0xFB, 1, 0], Instant::now()), None);
        assert_eq!(session.metrics().feedback_rejected(), 1);
        assert_eq!(session.metrics().feedback_accepted(), 0);
        assert_eq!(session.stats(), before);
    }

    #[test]
    fn test_valid_feedback_runs_a_cycle() {
        let session = session();
        session.apply_preset(Preset::Balanced.profile()).unwrap();

        let state = session.handle_feedback(&report(10).encode(), Instant::now());
        assert_eq!(state, Some(QosState::Decrease));
        assert_eq!(session.metrics().feedback_accepted(), 1);
        assert_eq!(session.stats().cycles, 1);
    }

    #[test]
    fn test_resolution_changes_are_queued() {
        let mut session = session();
        let mut changes = session.take_resolution_changes().unwrap();
        assert!(session.take_resolution_changes().is_none());

        session.apply_preset(Preset::LowBandwidth.profile()).unwrap();
        assert_eq!(changes.try_recv().unwrap(), Resolution::new(1280, 720));
    }

    #[tokio::test]
    async fn test_ingest_task_consumes_feedback() {
        let mut session = session();
        let (tx, rx) = mpsc::channel(8);
        session.start(rx).await.unwrap();
        assert!(session.is_streaming());

        tx.send(report(0).encode()).await.unwrap();
        tx.send(Bytes::from_static(b"garbage")).await.unwrap();

        for _ in 0..100 {
            if session.metrics().feedback_accepted() + session.metrics().feedback_rejected() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.metrics().feedback_accepted(), 1);
        assert_eq!(session.metrics().feedback_rejected(), 1);

        session.stop().await.unwrap();
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_restart_after_stop_consumes_feedback() {
        let mut session = session();
        session.stop().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        session.start(rx).await.unwrap();
        tx.send(report(0).encode()).await.unwrap();

        for _ in 0..100 {
            if session.metrics().feedback_accepted() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.metrics().feedback_accepted(), 1);
        assert!(session.is_streaming());
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ingest_task_ends_when_channel_closes() {
        let mut session = session();
        let (tx, rx) = mpsc::channel(1);
        session.start(rx).await.unwrap();
        drop(tx);

        for _ in 0..100 {
            if !session.is_streaming() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!session.is_streaming());
        session.stop().await.unwrap();
    }
}
