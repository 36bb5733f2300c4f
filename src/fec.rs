//! Forward error correction collaborator.
//!
//! The QoS controller only sets a redundancy ratio. `XorFecEncoder` turns
//! that ratio into a group size and emits one XOR parity payload per group,
//! which is enough to rebuild a single lost payload in that group.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// Largest group protected by a single parity payload
pub const MAX_GROUP_SIZE: usize = 48;

/// FEC collaborator contract
pub trait FecControl: Send {
    /// Fraction of redundant data added per group of packets
    fn set_redundancy_ratio(&mut self, ratio: f32) -> Result<()>;

    fn redundancy_ratio(&self) -> f32;
}

/// Single-parity XOR FEC
#[derive(Debug, Clone, Default)]
pub struct XorFecEncoder {
    ratio: f32,
}

impl XorFecEncoder {
    pub fn new(ratio: f32) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
        }
    }

    /// Source payloads per parity payload, `None` when FEC is off
    pub fn group_size(&self) -> Option<usize> {
        if self.ratio <= 0.0 {
            return None;
        }
        let k = (1.0 / self.ratio).ceil() as usize;
        Some(k.clamp(1, MAX_GROUP_SIZE))
    }

    /// Build parity payloads for `payloads`, one per group
    pub fn protect(&self, payloads: &[Bytes]) -> Vec<Bytes> {
        let Some(k) = self.group_size() else {
            return Vec::new();
        };

        payloads.chunks(k).map(xor_parity).collect()
    }

    /// Rebuild the single missing payload of a group from its parity.
    ///
    /// Returns `None` unless exactly one entry of `group` is missing.
    pub fn recover(group: &[Option<Bytes>], parity: &Bytes) -> Option<Bytes> {
        let missing = group.iter().filter(|p| p.is_none()).count();
        if missing != 1 || parity.len() < 2 {
            return None;
        }

        let mut acc = parity.to_vec();
        for payload in group.iter().flatten() {
            xor_into(&mut acc, payload);
        }

        let len = u16::from_be_bytes([acc[0], acc[1]]) as usize;
        if len > acc.len() - 2 {
            return None;
        }
        Some(Bytes::copy_from_slice(&acc[2..2 + len]))
    }
}

impl FecControl for XorFecEncoder {
    fn set_redundancy_ratio(&mut self, ratio: f32) -> Result<()> {
        if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
            anyhow::bail!("FEC redundancy ratio {} outside [0, 1]", ratio);
        }
        if (ratio - self.ratio).abs() > f32::EPSILON {
            debug!("FEC redundancy ratio {:.3} -> {:.3}", self.ratio, ratio);
        }
        self.ratio = ratio;
        Ok(())
    }

    fn redundancy_ratio(&self) -> f32 {
        self.ratio
    }
}

/// Length-prefixed XOR of all payloads, padded to the longest
fn xor_parity(group: &[Bytes]) -> Bytes {
    let longest = group.iter().map(|p| p.len()).max().unwrap_or(0);
    let mut acc = vec![0u8; longest + 2];
    for payload in group {
        xor_into(&mut acc, payload);
    }

    let mut out = BytesMut::with_capacity(acc.len());
    out.put_slice(&acc);
    out.freeze()
}

/// XOR a length-prefixed payload into the accumulator
fn xor_into(acc: &mut Vec<u8>, payload: &[u8]) {
    if acc.len() < payload.len() + 2 {
        acc.resize(payload.len() + 2, 0);
    }
    let len = (payload.len() as u16).to_be_bytes();
    acc[0] ^= len[0];
    acc[1] ^= len[1];
    for (dst, src) in acc[2..].iter_mut().zip(payload) {
        *dst ^= src;
    }
}
