/*!
 * Feedback Message
 *
 * Receiver -> sender report emitted once per feedback interval.
 *
 * Wire layout (big-endian):
 *
 * ```text
 * type u8 (0xFB) | version u8 (1) | flags u8 | last_seq u16
 * received u32 | lost u32 | jitter_ms f32 | bandwidth_kbps u32
 * delay_gradient f32 | rtt_ms u16 | decode_time_ms f32
 * frames_dropped u32 | nack_count u8 | nack_count x u16
 * ```
 *
 * flags bit 0: `rtt_ms` present, bit 1: `decode_time_ms` present.
 */

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{QosError, QosResult};

pub const MESSAGE_TYPE: u8 = 0xFB;
pub const WIRE_VERSION: u8 = 1;
pub const MAX_NACKS: usize = 2;
/// Encoded size without NACK entries
pub const BASE_LEN: usize = 36;

const FLAG_RTT: u8 = 0b01;
const FLAG_DECODE: u8 = 0b10;

/// Receiver report. Counts cover the interval since the previous report.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackMessage {
    pub last_sequence: u16,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub jitter_ms: f32,
    pub bandwidth_kbps: u32,
    /// Receiver-side delay trend in ms/s
    pub delay_gradient: f32,
    pub rtt_ms: Option<u16>,
    pub decode_time_ms: Option<f32>,
    pub frames_dropped: u32,
    pub nacks: Vec<u16>,
}

impl FeedbackMessage {
    /// Loss fraction of this report, `None` when no packets were accounted
    pub fn loss_ratio(&self) -> Option<f64> {
        let total = self.packets_received as u64 + self.packets_lost as u64;
        if total == 0 {
            return None;
        }
        Some(self.packets_lost as f64 / total as f64)
    }

    pub fn encoded_len(&self) -> usize {
        BASE_LEN + 2 * self.nacks.len().min(MAX_NACKS)
    }

    /// Serialize; NACK hints beyond `MAX_NACKS` are dropped
    pub fn encode(&self) -> Bytes {
        let nacks = &self.nacks[..self.nacks.len().min(MAX_NACKS)];

        let mut flags = 0;
        if self.rtt_ms.is_some() {
            flags |= FLAG_RTT;
        }
        if self.decode_time_ms.is_some() {
            flags |= FLAG_DECODE;
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(MESSAGE_TYPE);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(flags);
        buf.put_u16(self.last_sequence);
        buf.put_u32(self.packets_received);
        buf.put_u32(self.packets_lost);
        buf.put_f32(self.jitter_ms);
        buf.put_u32(self.bandwidth_kbps);
        buf.put_f32(self.delay_gradient);
        buf.put_u16(self.rtt_ms.unwrap_or(0));
        buf.put_f32(self.decode_time_ms.unwrap_or(0.0));
        buf.put_u32(self.frames_dropped);
        buf.put_u8(nacks.len() as u8);
        for &sequence in nacks {
            buf.put_u16(sequence);
        }
        buf.freeze()
    }

    /// Parse and validate a report. Anything malformed is rejected whole.
    pub fn decode(mut buf: &[u8]) -> QosResult<Self> {
        if buf.len() < BASE_LEN {
            return Err(QosError::Truncated {
                needed: BASE_LEN,
                actual: buf.len(),
            });
        }

        let message_type = buf.get_u8();
        if message_type != MESSAGE_TYPE {
            return Err(QosError::UnknownMessageType(message_type));
        }
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(QosError::UnsupportedVersion(version));
        }

        let flags = buf.get_u8();
        let last_sequence = buf.get_u16();
        let packets_received = buf.get_u32();
        let packets_lost = buf.get_u32();
        let jitter_ms = buf.get_f32();
        let bandwidth_kbps = buf.get_u32();
        let delay_gradient = buf.get_f32();
        let rtt_raw = buf.get_u16();
        let decode_raw = buf.get_f32();
        let frames_dropped = buf.get_u32();
        let nack_count = buf.get_u8();

        if nack_count as usize > MAX_NACKS {
            return Err(QosError::TooManyNacks(nack_count));
        }
        let needed = 2 * nack_count as usize;
        if buf.remaining() < needed {
            return Err(QosError::Truncated {
                needed: BASE_LEN + needed,
                actual: BASE_LEN + buf.remaining(),
            });
        }
        let nacks = (0..nack_count).map(|_| buf.get_u16()).collect();
        if buf.has_remaining() {
            return Err(QosError::TrailingBytes {
                trailing: buf.remaining(),
            });
        }

        if !jitter_ms.is_finite() || jitter_ms < 0.0 {
            return Err(QosError::InvalidField("jitter_ms"));
        }
        if !delay_gradient.is_finite() {
            return Err(QosError::InvalidField("delay_gradient"));
        }
        let decode_time_ms = if flags & FLAG_DECODE != 0 {
            if !decode_raw.is_finite() || decode_raw < 0.0 {
                return Err(QosError::InvalidField("decode_time_ms"));
            }
            Some(decode_raw)
        } else {
            None
        };
        let rtt_ms = (flags & FLAG_RTT != 0).then_some(rtt_raw);

        Ok(Self {
            last_sequence,
            packets_received,
            packets_lost,
            jitter_ms,
            bandwidth_kbps,
            delay_gradient,
            rtt_ms,
            decode_time_ms,
            frames_dropped,
            nacks,
        })
    }
}
