/*!
 * Feedback Transport
 *
 * Best-effort carrier for encoded feedback reports. Nothing here retries:
 * the next report is the retry.
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Largest datagram accepted by `UdpFeedbackTransport::recv`
const MAX_DATAGRAM: usize = 1500;

#[async_trait]
pub trait FeedbackTransport: Send + Sync {
    /// Hand one encoded report to the peer. An error means this report is
    /// lost; callers do not retry.
    async fn send(&self, payload: Bytes) -> Result<()>;
}

/// In-process transport over a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FeedbackTransport for ChannelTransport {
    async fn send(&self, payload: Bytes) -> Result<()> {
        // Never wait for room; a full or closed channel drops the report
        self.tx
            .try_send(payload)
            .map_err(|e| anyhow::anyhow!("feedback channel unavailable: {}", e))
    }
}

/// Reports as UDP datagrams to a fixed peer
#[derive(Debug)]
pub struct UdpFeedbackTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpFeedbackTransport {
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("Failed to bind feedback socket on {}", local))?;
        info!(
            "Feedback transport bound on {} -> {}",
            socket.local_addr().context("Failed to read local address")?,
            peer
        );
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to read local address")
    }

    /// Receive the next datagram, from any source
    pub async fn recv(&self) -> Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .context("Failed to receive feedback datagram")?;
        debug!("Received {} byte datagram from {}", len, from);
        buf.truncate(len);
        Ok(Bytes::from(buf))
    }

    /// Forward every received datagram into `tx` until the channel closes
    pub async fn forward_to(&self, tx: mpsc::Sender<Bytes>) -> Result<()> {
        loop {
            let datagram = self.recv().await?;
            if tx.send(datagram).await.is_err() {
                debug!("Feedback consumer gone, stopping forwarder");
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl FeedbackTransport for UdpFeedbackTransport {
    async fn send(&self, payload: Bytes) -> Result<()> {
        self.socket
            .send_to(&payload, self.peer)
            .await
            .with_context(|| format!("Failed to send feedback to {}", self.peer))?;
        Ok(())
    }
}
