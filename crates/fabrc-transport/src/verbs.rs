//! Interface to the NIC.
//!
//! The protocol core only sees queue pairs, work requests, completions and
//! memory handles through [`TransportStrategy`]. How payload bytes are moved
//! between application memory and wire buffers, and whether a large message
//! may use RDMA at all, is decided by a [`CopyStrategy`].

use crate::error::Result;
use crate::wire::Epid;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Queue pair number.
pub type QpNum = u32;

/// Memory that can be registered with the NIC.
pub type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Local key that no registration ever returns. Drain markers use it so
/// they can never complete successfully on the wire.
pub const INVALID_LKEY: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpKind {
    /// Unreliable datagram, one per endpoint, addressed per send.
    Datagram,
    /// Reliable connected, bound to one remote QP.
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_READ: Self = Self(1);
    pub const LOCAL_WRITE: Self = Self(2);
    pub const REMOTE_READ: Self = Self(4);
    pub const REMOTE_WRITE: Self = Self(8);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// A registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemHandle {
    pub lkey: u32,
    pub rkey: u32,
    pub offset: usize,
    pub len: usize,
}

/// What a send work request id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrKind {
    /// A send buffer slot.
    Send = 1,
    /// A rendezvous RDMA write, payload is the transfer token.
    RdmaWrite = 2,
    /// A drain marker, payload is the QP number.
    DrainMarker = 3,
}

/// Work request id: a 2-bit kind tag over a 62-bit payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrId(u64);

impl WrId {
    const PAYLOAD_MASK: u64 = (1u64 << 62) - 1;

    pub fn new(kind: WrKind, payload: u64) -> Self {
        Self(((kind as u64) << 62) | (payload & Self::PAYLOAD_MASK))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn kind(self) -> Option<WrKind> {
        match self.0 >> 62 {
            1 => Some(WrKind::Send),
            2 => Some(WrKind::RdmaWrite),
            3 => Some(WrKind::DrainMarker),
            _ => None,
        }
    }

    pub fn payload(self) -> u64 {
        self.0 & Self::PAYLOAD_MASK
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SendOp<'a> {
    Send {
        data: &'a [u8],
        lkey: u32,
        /// Required on datagram QPs, ignored on reliable ones.
        dest: Option<Epid>,
    },
    RdmaWrite {
        data: &'a [u8],
        lkey: u32,
        rkey: u32,
        remote_offset: usize,
        imm: u32,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SendWr<'a> {
    pub wr_id: WrId,
    pub op: SendOp<'a>,
    /// Request a completion for this work request.
    pub signaled: bool,
}

/// Outcome of posting a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStatus {
    Posted,
    /// Posted on a reliable path that guarantees delivery; no ack needed.
    Delivered,
    /// Send queue full; retry later.
    NoResources,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    Success,
    /// Flushed because the QP is in the error state.
    FlushError,
    LocalProtectionError,
    RemoteAccessError,
    RetryExceeded,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    Recv,
    RecvRdmaWithImm,
}

/// One work completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub qp_num: QpNum,
    pub imm: Option<u32>,
    /// Sender of a received datagram.
    pub src: Option<Epid>,
    /// Received packet bytes.
    pub data: Option<Bytes>,
}

/// Blocks until the NIC may have new receive completions.
pub trait EventSource: Send + Sync {
    /// Returns true if signalled before `timeout` elapsed.
    fn wait(&self, timeout: Duration) -> bool;
}

/// Queue-pair level operations of a NIC.
pub trait TransportStrategy: Send {
    fn name(&self) -> &str;

    /// Address of this NIC port.
    fn local_epid(&self) -> Epid;

    fn create_qp(&mut self, kind: QpKind) -> Result<QpNum>;

    /// Binds a reliable QP to its remote counterpart and moves it to RTS.
    fn connect_qp(&mut self, qp: QpNum, remote: Epid, remote_qp: QpNum) -> Result<()>;

    /// Moves a QP to the error state, flushing all posted work.
    fn modify_qp_to_error(&mut self, qp: QpNum) -> Result<()>;

    fn destroy_qp(&mut self, qp: QpNum);

    /// `Err` is fatal; a full send queue is `Ok(PostStatus::NoResources)`.
    fn post_send(&mut self, qp: QpNum, wr: SendWr<'_>) -> Result<PostStatus>;

    fn post_recv(&mut self, qp: QpNum, wr_id: u64) -> Result<()>;

    fn poll_send_cq(&mut self, max_batch: usize) -> Vec<Completion>;

    fn poll_recv_cq(&mut self, max_batch: usize) -> Vec<Completion>;

    fn register_memory(
        &mut self,
        buf: &SharedBuf,
        offset: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemHandle>;

    fn deregister_memory(&mut self, handle: MemHandle);

    /// Source for the optional receive notification thread.
    fn event_source(&self) -> Option<Arc<dyn EventSource>> {
        None
    }
}

/// How a rendezvous window moves its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RndvStrategy {
    /// Sender writes directly into the receiver's registered window.
    RdmaWrite,
    /// Sender pushes sequenced long-data packets that the receiver copies.
    LongData,
}

/// Moves payload bytes and picks the large-message strategy.
pub trait CopyStrategy: Send {
    fn name(&self) -> &'static str;

    fn copy_to_wire(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    fn copy_from_wire(&self, dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }

    /// Strategy for one window given whether RDMA resources are available.
    fn rendezvous_strategy(&self, window_len: usize, rdma_available: bool) -> RndvStrategy;
}

/// Host memory: RDMA whenever the receiver can register the window.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCopy;

impl CopyStrategy for HostCopy {
    fn name(&self) -> &'static str {
        "host"
    }

    fn rendezvous_strategy(&self, _window_len: usize, rdma_available: bool) -> RndvStrategy {
        if rdma_available {
            RndvStrategy::RdmaWrite
        } else {
            RndvStrategy::LongData
        }
    }
}

/// Memory the NIC cannot target directly; every window is copied.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyOnly;

impl CopyStrategy for CopyOnly {
    fn name(&self) -> &'static str {
        "copy-only"
    }

    fn rendezvous_strategy(&self, _window_len: usize, _rdma_available: bool) -> RndvStrategy {
        RndvStrategy::LongData
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr_id_tagging() {
        let id = WrId::new(WrKind::RdmaWrite, 0x1234_5678);
        assert_eq!(id.kind(), Some(WrKind::RdmaWrite));
        assert_eq!(id.payload(), 0x1234_5678);
        assert_eq!(WrId::from_raw(id.raw()), id);
        assert_eq!(WrId::from_raw(7).kind(), None);
    }

    #[test]
    fn test_access_flags() {
        let flags = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        assert!(flags.contains(AccessFlags::REMOTE_WRITE));
        assert!(!flags.contains(AccessFlags::REMOTE_READ));
    }

    #[test]
    fn test_copy_strategies() {
        assert_eq!(HostCopy.rendezvous_strategy(4096, true), RndvStrategy::RdmaWrite);
        assert_eq!(HostCopy.rendezvous_strategy(4096, false), RndvStrategy::LongData);
        assert_eq!(CopyOnly.rendezvous_strategy(4096, true), RndvStrategy::LongData);
        let mut dst = [0u8; 3];
        CopyOnly.copy_from_wire(&mut dst, b"abc");
        assert_eq!(&dst, b"abc");
    }
}
