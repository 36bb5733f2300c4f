//! Typed errors for the QoS crate.
//!
//! Collaborator seams (encoder, FEC, transport) return `anyhow::Result`; the
//! errors here cover what this crate itself validates.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum QosError {
    #[error("feedback message truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("unknown feedback message type 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unsupported feedback wire version {0}")]
    UnsupportedVersion(u8),

    #[error("feedback carries {0} NACK hints (max 2)")]
    TooManyNacks(u8),

    #[error("feedback has {trailing} trailing bytes")]
    TrailingBytes { trailing: usize },

    #[error("feedback field `{0}` is out of range")]
    InvalidField(&'static str),

    #[error("invalid streaming profile: {0}")]
    InvalidProfile(String),

    #[error("unknown preset `{0}`")]
    UnknownPreset(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type QosResult<T> = std::result::Result<T, QosError>;
