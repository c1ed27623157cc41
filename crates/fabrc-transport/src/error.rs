use crate::wire::Epid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("fatal connection error to {peer}: {reason}")]
    Fatal { peer: Epid, reason: String },

    #[error("connection timeout after {timeout_ms}ms to {peer}")]
    ConnectionTimeout { peer: Epid, timeout_ms: u64 },

    #[error("not connected to {peer}")]
    NotConnected { peer: Epid },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid packet: {reason}")]
    InvalidPacket { reason: String },

    #[error("unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("message of {size} bytes does not fit receive buffer of {capacity} bytes")]
    MessageTruncated { size: usize, capacity: usize },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("send buffer released out of post order: {reason}")]
    BufferOrder { reason: String },

    #[error("stale handle: slot {index} generation {generation}")]
    StaleHandle { index: u32, generation: u32 },

    #[error("verbs {op} failed: {reason}")]
    Verbs { op: &'static str, reason: String },

    #[error("endpoint closed")]
    EndpointClosed,
}

impl TransportError {
    /// True for errors that terminate the endpoint session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Fatal { .. } | TransportError::Verbs { .. } | TransportError::EndpointClosed
        )
    }

    pub(crate) fn fatal(peer: Epid, reason: impl Into<String>) -> Self {
        TransportError::Fatal {
            peer,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
