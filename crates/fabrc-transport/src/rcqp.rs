//! Reliable connected QP resources and their drain protocol.
//!
//! Every connection in reliable mode owns one active [`RcQp`] plus any
//! number of older ones that are draining after an error or a reconnect.
//! A draining resource accepts no new work. If sends are still outstanding
//! a drain marker with an invalid lkey is posted behind them; completions
//! arrive in post order, so the marker's completion proves every earlier
//! send has completed too. The resource is freed only when both its posted
//! send and posted receive counts are zero.

use crate::buffer::{RecvPool, SendAllocator};
use crate::error::Result;
use crate::stats::ProtoStats;
use crate::verbs::{PostStatus, QpNum, SendOp, SendWr, TransportStrategy, WrId, WrKind, INVALID_LKEY};
use crate::wire::Epid;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcQpState {
    /// Created, waiting for the remote QP number.
    Initialized,
    Connected,
    Draining,
}

#[derive(Debug)]
pub struct RcQp {
    pub qp: QpNum,
    pub peer: Epid,
    pub reconnect_count: u8,
    pub state: RcQpState,
    pub remote_qp: Option<QpNum>,
    /// Sends, RDMA writes and drain markers posted and not yet completed.
    pub send_posted: u32,
    pub drain_marker_posted: bool,
    pub allocator: SendAllocator,
    pub recv: RecvPool,
}

impl RcQp {
    pub fn new(qp: QpNum, peer: Epid, reconnect_count: u8, recv_buffers: usize, coalesce: u32) -> Self {
        Self {
            qp,
            peer,
            reconnect_count,
            state: RcQpState::Initialized,
            remote_qp: None,
            send_posted: 0,
            drain_marker_posted: false,
            allocator: SendAllocator::new(coalesce),
            recv: RecvPool::new(recv_buffers),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state == RcQpState::Draining
    }

    pub fn is_ready(&self) -> bool {
        self.state == RcQpState::Connected
    }

    pub fn is_empty(&self) -> bool {
        self.send_posted == 0 && self.recv.posted() == 0
    }

    pub fn send_completed(&mut self, n: u32) {
        debug_assert!(self.send_posted >= n, "send completions exceed posted sends");
        self.send_posted = self.send_posted.saturating_sub(n);
    }

    /// Draining with buffered sends behind no marker: the marker could not
    /// be posted yet.
    pub fn needs_drain_marker(&self) -> bool {
        self.is_draining() && !self.allocator.is_empty() && !self.drain_marker_posted
    }

    /// Moves the resource to draining. Posts a drain marker if sends are
    /// outstanding. Idempotent.
    pub fn begin_drain(
        &mut self,
        transport: &mut dyn TransportStrategy,
        move_to_error: bool,
        stats: &ProtoStats,
    ) -> Result<()> {
        if self.is_draining() {
            return Ok(());
        }
        self.state = RcQpState::Draining;
        ProtoStats::inc(stats.rc_qp_draining());
        if move_to_error {
            transport.modify_qp_to_error(self.qp)?;
        }
        self.post_drain_marker(transport, stats)?;
        debug!(
            qp = self.qp,
            peer = %self.peer,
            send_posted = self.send_posted,
            recv_posted = self.recv.posted(),
            "rc_qp draining"
        );
        Ok(())
    }

    /// Posts the drain marker if one is owed. A full send queue leaves it
    /// owed; the reaper retries until it goes out. Returns whether it was
    /// posted by this call.
    pub fn post_drain_marker(&mut self, transport: &mut dyn TransportStrategy, stats: &ProtoStats) -> Result<bool> {
        if !self.needs_drain_marker() {
            return Ok(false);
        }
        let wr = SendWr {
            wr_id: WrId::new(WrKind::DrainMarker, self.qp as u64),
            op: SendOp::Send {
                data: &[],
                lkey: INVALID_LKEY,
                dest: None,
            },
            signaled: true,
        };
        match transport.post_send(self.qp, wr)? {
            PostStatus::NoResources => {
                ProtoStats::inc(stats.drain_marker_deferred());
                warn!(qp = self.qp, peer = %self.peer, "no room for drain marker");
                Ok(false)
            }
            PostStatus::Posted | PostStatus::Delivered => {
                self.send_posted += 1;
                self.drain_marker_posted = true;
                ProtoStats::inc(stats.drain_markers_posted());
                Ok(true)
            }
        }
    }
}

/// The transport resources of one connection.
#[derive(Debug, Default)]
pub struct RcQpSet {
    active: Option<RcQp>,
    draining: Vec<RcQp>,
}

impl RcQpSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&RcQp> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut RcQp> {
        self.active.as_mut()
    }

    /// Active resource if it is connected and can take new sends.
    pub fn ready_mut(&mut self) -> Option<&mut RcQp> {
        self.active.as_mut().filter(|qp| qp.is_ready())
    }

    pub fn find_mut(&mut self, qp: QpNum) -> Option<&mut RcQp> {
        if let Some(active) = self.active.as_mut() {
            if active.qp == qp {
                return Some(active);
            }
        }
        self.draining.iter_mut().find(|r| r.qp == qp)
    }

    pub fn contains(&self, qp: QpNum) -> bool {
        self.active.as_ref().is_some_and(|r| r.qp == qp) || self.draining.iter().any(|r| r.qp == qp)
    }

    pub fn draining_count(&self) -> usize {
        self.draining.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.draining.is_empty()
    }

    /// Installs a fresh active resource, moving any previous one to the
    /// draining list. The caller must have started its drain.
    pub fn install(&mut self, rc: RcQp) -> Option<QpNum> {
        let old = self.active.replace(rc);
        let old_qp = old.as_ref().map(|r| r.qp);
        if let Some(old) = old {
            debug_assert!(old.is_draining(), "replacing a non-draining rc_qp");
            self.draining.push(old);
        }
        old_qp
    }

    /// Moves the active resource to the draining list.
    pub fn retire_active(&mut self) -> Option<QpNum> {
        let old = self.active.take()?;
        let qp = old.qp;
        self.draining.push(old);
        Some(qp)
    }

    /// Removes and returns the resource if it is draining and empty.
    pub fn take_if_freeable(&mut self, qp: QpNum) -> Option<RcQp> {
        if self.active.as_ref().is_some_and(|r| r.qp == qp && r.is_draining() && r.is_empty()) {
            return self.active.take();
        }
        let pos = self
            .draining
            .iter()
            .position(|r| r.qp == qp && r.is_draining() && r.is_empty())?;
        Some(self.draining.swap_remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &RcQp> {
        self.active.iter().chain(self.draining.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RcQp> {
        self.active.iter_mut().chain(self.draining.iter_mut())
    }

    pub fn qp_nums(&self) -> Vec<QpNum> {
        self.iter().map(|r| r.qp).collect()
    }
}
