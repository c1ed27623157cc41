//! Completion reaping.
//!
//! The reaper is the only place that frees send buffers and that moves a
//! draining QP to freed. Send completions arrive in post order per QP, so a
//! signaled completion releases every unsignaled slot posted before it, and
//! a drain marker's completion releases everything left on its QP.

use crate::buffer::SbufHandle;
use crate::error::Result;
use crate::proto::Proto;
use crate::rendezvous::split_rdma_token;
use crate::scb::{ScbArena, ScbId};
use crate::stats::ProtoStats;
use crate::verbs::{Completion, QpNum, WcOpcode, WrId, WrKind};
use crate::wire::Epid;
use std::time::Instant;
use tracing::{debug, trace, warn};

fn drop_local_outstanding(scbs: &mut ScbArena, ids: &[ScbId]) {
    for id in ids {
        if let Some(scb) = scbs.get_mut(*id) {
            scb.local_outstanding = scb.local_outstanding.saturating_sub(1);
        }
    }
}

impl Proto {
    fn draining_qps(&self) -> usize {
        self.conns.values().map(|c| c.rc_qps.draining_count()).sum()
    }

    /// Polls the send CQ. Unless forced, polling waits until enough send
    /// buffers are outstanding to be worth it, or until RDMA writes or
    /// drains are pending.
    pub(crate) fn reap_sends(&mut self, now: Instant, force: bool) -> Result<usize> {
        let worth_it = force
            || self.rdma_outstanding > 0
            || self.draining_qps() > 0
            || self.send_pool.num_outstanding() >= self.cfg.send_reap_thresh;
        if !worth_it {
            return Ok(0);
        }
        let draining = self.draining_qps() > 0;
        if draining {
            self.retry_drain_markers();
        }
        let mut handled = 0;
        loop {
            let batch = self.transport.poll_send_cq(self.cfg.cq_batch);
            if batch.is_empty() {
                break;
            }
            for wc in batch {
                handled += 1;
                self.on_send_completion(wc, now)?;
            }
        }
        if handled > 0 {
            trace!(handled, outstanding = self.send_pool.num_outstanding(), "reaped send completions");
        }
        if handled > 0 || draining {
            self.free_drained_qps();
        }
        Ok(handled)
    }

    fn on_send_completion(&mut self, wc: Completion, now: Instant) -> Result<()> {
        ProtoStats::inc(self.stats.send_completions());
        let success = wc.status.is_success();
        if !success {
            ProtoStats::inc(self.stats.completion_errors());
        }
        let wr = WrId::from_raw(wc.wr_id);
        let peer = self.qp_owner.get(&wc.qp_num).copied();
        match wr.kind() {
            Some(WrKind::Send) => self.on_buffer_completion(wc.qp_num, peer, SbufHandle::from_u64(wr.payload()))?,
            Some(WrKind::RdmaWrite) => {
                self.rdma_outstanding = self.rdma_outstanding.saturating_sub(1);
                if let Some(rc) = peer
                    .and_then(|p| self.conns.get_mut(&p))
                    .and_then(|c| c.rc_qps.find_mut(wc.qp_num))
                {
                    rc.send_completed(1);
                }
                let (send_id, window) = split_rdma_token(wr.payload());
                if let Some(done) = self.rndv.on_rdma_write_done(send_id, window, success, &self.stats) {
                    self.finish_rndv(done);
                }
            }
            Some(WrKind::DrainMarker) => {
                let Proto {
                    conns,
                    send_pool,
                    scbs,
                    ..
                } = self;
                if let Some(rc) = peer
                    .and_then(|p| conns.get_mut(&p))
                    .and_then(|c| c.rc_qps.find_mut(wc.qp_num))
                {
                    let released = send_pool.release_all(&mut rc.allocator)?;
                    rc.send_completed(released.count as u32 + 1);
                    drop_local_outstanding(scbs, &released.scbs);
                    debug!(
                        qp = rc.qp,
                        peer = %rc.peer,
                        released = released.count,
                        send_posted = rc.send_posted,
                        "drain marker completed"
                    );
                }
            }
            None => warn!(wr_id = wc.wr_id, "send completion with unknown work request kind"),
        }
        if !success {
            match peer {
                Some(peer) => self.on_qp_completion_error(peer, wc.qp_num, now)?,
                None if wc.qp_num == self.ud.qp => {
                    warn!(qp = wc.qp_num, status = ?wc.status, "datagram send failed");
                }
                None => {}
            }
        }
        Ok(())
    }

    fn on_buffer_completion(&mut self, qp: QpNum, peer: Option<Epid>, handle: SbufHandle) -> Result<()> {
        let Proto {
            ud,
            conns,
            send_pool,
            scbs,
            ..
        } = self;
        let (alloc, posted) = if qp == ud.qp {
            (&mut ud.alloc, &mut ud.send_posted)
        } else {
            match peer.and_then(|p| conns.get_mut(&p)).and_then(|c| c.rc_qps.find_mut(qp)) {
                Some(rc) => (&mut rc.allocator, &mut rc.send_posted),
                None => {
                    debug!(qp, "send completion for unknown qp");
                    return Ok(());
                }
            }
        };
        if alloc.is_empty() {
            // Already released by a drain marker.
            return Ok(());
        }
        let coalesce = alloc.coalesce() as usize;
        let released = send_pool.free(alloc, handle, coalesce)?;
        *posted = posted.saturating_sub(released.count as u32);
        drop_local_outstanding(scbs, &released.scbs);
        Ok(())
    }

    /// A send failed on `qp`. Only an error on the active QP of a
    /// connection triggers recovery; errors on draining QPs are expected.
    fn on_qp_completion_error(&mut self, peer: Epid, qp: QpNum, now: Instant) -> Result<()> {
        let active = self
            .conns
            .get(&peer)
            .and_then(|c| c.rc_qps.active())
            .is_some_and(|rc| rc.qp == qp && !rc.is_draining());
        if active {
            self.on_rc_qp_error(peer, qp, now)?;
        }
        Ok(())
    }

    /// Polls the receive CQ, dispatches packets and reposts receives.
    pub(crate) fn reap_recvs(&mut self, now: Instant) -> Result<usize> {
        let mut handled = 0;
        loop {
            let batch = self.transport.poll_recv_cq(self.cfg.cq_batch);
            if batch.is_empty() {
                break;
            }
            for wc in batch {
                handled += 1;
                self.on_recv_completion(wc, now)?;
            }
        }
        if handled == 0 {
            return Ok(0);
        }
        self.replenish_recvs()?;
        self.free_drained_qps();
        self.send_owed_acks(now)?;
        Ok(handled)
    }

    fn on_recv_completion(&mut self, wc: Completion, now: Instant) -> Result<()> {
        ProtoStats::inc(self.stats.recv_completions());
        let peer = self.qp_owner.get(&wc.qp_num).copied();
        if wc.qp_num == self.ud.qp {
            self.ud.recv.completed();
        } else if let Some(rc) = peer
            .and_then(|p| self.conns.get_mut(&p))
            .and_then(|c| c.rc_qps.find_mut(wc.qp_num))
        {
            rc.recv.completed();
        }

        if !wc.status.is_success() {
            ProtoStats::inc(self.stats.completion_errors());
            if let Some(peer) = peer {
                self.on_qp_completion_error(peer, wc.qp_num, now)?;
            }
            return Ok(());
        }
        match wc.opcode {
            WcOpcode::RecvRdmaWithImm => {
                let Some(imm) = wc.imm else {
                    return Ok(());
                };
                if let Some(recv_id) = self.rndv.on_rdma_imm(imm, self.transport.as_mut()) {
                    self.rndv_progress(recv_id, now)?;
                }
            }
            WcOpcode::Recv => {
                if let Some(data) = wc.data {
                    self.handle_packet(data, now)?;
                }
            }
            other => debug!(opcode = ?other, "unexpected receive completion opcode"),
        }
        Ok(())
    }

    /// Refills the datagram QP and every usable reliable QP.
    fn replenish_recvs(&mut self) -> Result<()> {
        let Proto {
            ud,
            conns,
            transport,
            ..
        } = self;
        ud.recv.replenish(transport.as_mut(), ud.qp)?;
        for conn in conns.values_mut() {
            if let Some(rc) = conn.rc_qps.active_mut().filter(|rc| !rc.is_draining()) {
                rc.recv.replenish(transport.as_mut(), rc.qp)?;
            }
        }
        Ok(())
    }
}
