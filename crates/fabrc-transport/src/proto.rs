//! Per-endpoint protocol engine.
//!
//! [`Proto`] owns every connection, flow, buffer pool, timer and transfer of
//! one endpoint. It is not synchronized itself; the endpoint serializes all
//! access behind its progress lock. Application callbacks are collected in
//! [`Proto::take_completed`] instead of being invoked, so the caller can run
//! them after releasing the lock.
//!
//! Data packets travel over the active reliable QP of a connection in
//! reliable mode and over the endpoint's datagram QP otherwise. Control
//! packets (acks, error checks, connection handshakes) always use the
//! datagram QP, so they keep flowing while a reliable QP is being replaced.

use crate::buffer::{RecvPool, SendAllocator, SendPool};
use crate::config::{ProtoConfig, TransportMode};
use crate::connection::{ConnState, PeerConnection};
use crate::ctrlq::{CtrlEnqueue, CtrlMsg, CtrlQueue};
use crate::error::{Result, TransportError};
use crate::flow::{flush, CreditPolicy, FlowClass, FlowKey, FlushOutcome, PacketSink};
use crate::mq::{MatchQueue, PostedRecv, RecvCallback, Received, Unexpected};
use crate::psn::Psn;
use crate::rcqp::RcQp;
use crate::reliability::{backoff, err_chk_psn};
use crate::rendezvous::RndvEngine;
use crate::scb::{Scb, ScbArena, ScbId, ScbKind, SendCallback};
use crate::stats::ProtoStats;
use crate::timer::TimerQueue;
use crate::verbs::{CopyStrategy, PostStatus, QpKind, QpNum, SendOp, SendWr, TransportStrategy, WrId, WrKind};
use crate::wire::{self, Epid, Opcode, PacketFlags, PacketHeader, CHECKSUM_LEN, HEADER_LEN};
use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Cooperative timers of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Oldest unacked packet of a flow may have timed out.
    Ack(FlowKey),
    /// Retry a flush stopped by credits or send resources.
    Send(FlowKey),
    CtrlQueue,
    ConnectRetry(Epid),
    DisconnectRetry(Epid),
}

/// An application callback ready to run.
pub enum Completed {
    Send(SendCallback, Result<usize>),
    Recv(RecvCallback, Result<Received>),
}

impl Completed {
    pub fn run(self) {
        match self {
            Completed::Send(cb, result) => cb(result),
            Completed::Recv(cb, result) => cb(result),
        }
    }
}

/// Counts of work still in flight, for diagnostics at teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InflightReport {
    pub scbs: usize,
    pub posted_recvs: usize,
    pub unexpected: usize,
    pub send_transfers: usize,
    pub recv_transfers: usize,
    pub send_buffers: usize,
    pub ctrl_queued: usize,
    pub rc_qps: usize,
}

/// The endpoint's datagram QP.
#[derive(Debug)]
pub(crate) struct UdLane {
    pub qp: QpNum,
    pub alloc: SendAllocator,
    pub recv: RecvPool,
    pub send_posted: u32,
}

/// Eager message being reassembled from in-order fragments.
#[derive(Debug)]
pub(crate) struct Partial {
    pub data: Vec<u8>,
    pub len: usize,
}

/// One QP send path for the duration of a post.
pub(crate) struct Lane<'a> {
    pub qp: QpNum,
    pub alloc: &'a mut SendAllocator,
    pub posted: &'a mut u32,
    pub dest: Option<Epid>,
}

impl<'a> Lane<'a> {
    fn datagram(ud: &'a mut UdLane, dest: Epid) -> Self {
        Lane {
            qp: ud.qp,
            alloc: &mut ud.alloc,
            posted: &mut ud.send_posted,
            dest: Some(dest),
        }
    }

    fn reliable(rc: &'a mut RcQp) -> Self {
        Lane {
            qp: rc.qp,
            alloc: &mut rc.allocator,
            posted: &mut rc.send_posted,
            dest: None,
        }
    }
}

/// Copies one packet into a send slot and posts it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn post_packet(
    transport: &mut dyn TransportStrategy,
    pool: &mut SendPool,
    lane: &mut Lane<'_>,
    header: &PacketHeader,
    payload: &[u8],
    checksum: bool,
    force_signal: bool,
    scb: Option<ScbId>,
    stats: &ProtoStats,
) -> Result<PostStatus> {
    let Some((handle, prev)) = pool.alloc(lane.alloc) else {
        return Ok(PostStatus::NoResources);
    };
    let mut header = *header;
    if checksum {
        header.flags.insert(PacketFlags::CKSUM);
    }
    let written = pool.write(handle, |buf| {
        let end = HEADER_LEN + payload.len();
        let needed = end + if checksum { CHECKSUM_LEN } else { 0 };
        if needed > buf.len() {
            return Err(TransportError::PayloadTooLarge {
                size: needed,
                max_size: buf.len(),
            });
        }
        wire::write_header(buf, &header)?;
        buf[HEADER_LEN..end].copy_from_slice(payload);
        if checksum {
            wire::seal_checksum(buf, end)
        } else {
            Ok(end)
        }
    });
    if let Err(e) = written {
        pool.unalloc(lane.alloc, handle, prev)?;
        return Err(e);
    }
    if let Some(id) = scb {
        pool.attach_scb(handle, id)?;
    }
    let signaled = lane.alloc.next_signaled() || force_signal;
    let lkey = pool.lkey();
    let (qp, dest) = (lane.qp, lane.dest);
    let posted = pool.with_packet(handle, |packet| {
        transport.post_send(
            qp,
            SendWr {
                wr_id: WrId::new(WrKind::Send, handle.to_u64()),
                op: SendOp::Send {
                    data: packet,
                    lkey,
                    dest,
                },
                signaled,
            },
        )
    })?;
    match posted {
        Ok(PostStatus::NoResources) => {
            lane.alloc.undo_signaled();
            pool.unalloc(lane.alloc, handle, prev)?;
            Ok(PostStatus::NoResources)
        }
        Ok(status) => {
            *lane.posted += 1;
            ProtoStats::inc(stats.packets_sent());
            ProtoStats::add(stats.bytes_sent(), payload.len() as u64);
            Ok(status)
        }
        Err(e) => {
            lane.alloc.undo_signaled();
            pool.unalloc(lane.alloc, handle, prev)?;
            Err(e)
        }
    }
}

/// Posts scb fragments over one lane; `None` means the connection has no
/// usable transport right now.
struct WireSink<'a> {
    transport: &'a mut dyn TransportStrategy,
    pool: &'a mut SendPool,
    lane: Option<Lane<'a>>,
    checksum: bool,
    reconnect_count: u8,
    stats: &'a ProtoStats,
}

impl PacketSink for WireSink<'_> {
    fn post_scb(&mut self, id: ScbId, scbs: &mut ScbArena, signal_last: bool) -> Result<PostStatus> {
        let Some(lane) = self.lane.as_mut() else {
            return Ok(PostStatus::NoResources);
        };
        let Some(scb) = scbs.get_mut(id) else {
            return Ok(PostStatus::Posted);
        };
        let mut status = PostStatus::Posted;
        while scb.frags_posted < scb.nfrag {
            let frag = scb.frags_posted;
            let last = frag + 1 == scb.nfrag;
            let mut header = scb.frag_header(frag);
            header.reconnect_count = self.reconnect_count;
            let payload = scb.frag_payload(frag);
            status = post_packet(
                &mut *self.transport,
                &mut *self.pool,
                lane,
                &header,
                &payload,
                self.checksum,
                signal_last && last,
                Some(id),
                self.stats,
            )?;
            if status == PostStatus::NoResources {
                return Ok(status);
            }
            scb.frags_posted += 1;
            scb.local_outstanding += 1;
            if scb.retransmits > 0 {
                ProtoStats::inc(self.stats.retransmits());
            }
        }
        Ok(status)
    }
}

pub struct Proto {
    pub(crate) cfg: ProtoConfig,
    pub(crate) policy: CreditPolicy,
    pub(crate) epid: Epid,
    pub(crate) transport: Box<dyn TransportStrategy>,
    pub(crate) copy: Box<dyn CopyStrategy>,
    pub(crate) ud: UdLane,
    pub(crate) send_pool: SendPool,
    pub(crate) conns: BTreeMap<Epid, PeerConnection>,
    pub(crate) qp_owner: HashMap<QpNum, Epid>,
    pub(crate) scbs: ScbArena,
    pub(crate) ctrlq: CtrlQueue,
    pub(crate) timers: TimerQueue<TimerKey>,
    pub(crate) rndv: RndvEngine,
    pub(crate) rndv_recvs: HashMap<u32, RecvCallback>,
    pub(crate) mq: MatchQueue,
    pub(crate) partial: HashMap<FlowKey, Partial>,
    /// Flows owing a coalesced ACK at the end of the receive batch.
    pub(crate) ack_owed: Vec<FlowKey>,
    pub(crate) stats: Arc<ProtoStats>,
    pub(crate) completed: Vec<Completed>,
    /// Peers lost to a fatal error, with the reason.
    pub(crate) failed: HashMap<Epid, String>,
    pub(crate) rdma_outstanding: u32,
    /// Inbound disconnect requests that closed a connection.
    pub(crate) disconnects_received: u64,
    next_epoch: u32,
    closed: bool,
}

impl std::fmt::Debug for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proto")
            .field("epid", &self.epid)
            .field("transport", &self.transport.name())
            .field("copy", &self.copy.name())
            .field("connections", &self.conns.len())
            .field("scbs", &self.scbs.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Proto {
    pub fn new(
        mut transport: Box<dyn TransportStrategy>,
        copy: Box<dyn CopyStrategy>,
        cfg: ProtoConfig,
        stats: Arc<ProtoStats>,
    ) -> Result<Self> {
        cfg.validate()?;
        let epid = transport.local_epid();
        let qp = transport.create_qp(QpKind::Datagram)?;
        let mut send_pool = SendPool::new(
            cfg.send_buffers,
            HEADER_LEN + cfg.mtu + CHECKSUM_LEN,
            cfg.send_cq_coalesce,
        )?;
        send_pool.register(transport.as_mut())?;
        let mut ud = UdLane {
            qp,
            alloc: SendAllocator::new(cfg.send_cq_coalesce),
            recv: RecvPool::new(cfg.ud_recv_buffers),
            send_posted: 0,
        };
        ud.recv.replenish(transport.as_mut(), qp)?;
        info!(
            epid = %epid,
            transport = transport.name(),
            mode = ?cfg.mode,
            ud_qp = qp,
            send_buffers = send_pool.total(),
            "protocol engine initialized"
        );
        Ok(Self {
            policy: CreditPolicy::from_config(&cfg),
            epid,
            transport,
            copy,
            ud,
            send_pool,
            conns: BTreeMap::new(),
            qp_owner: HashMap::new(),
            scbs: ScbArena::new(),
            ctrlq: CtrlQueue::new(),
            timers: TimerQueue::new(),
            rndv: RndvEngine::new(cfg.rndv_window, cfg.rndv_prefetch, cfg.mr_cache_entries),
            rndv_recvs: HashMap::new(),
            mq: MatchQueue::new(),
            partial: HashMap::new(),
            ack_owed: Vec::new(),
            stats,
            completed: Vec::new(),
            failed: HashMap::new(),
            rdma_outstanding: 0,
            disconnects_received: 0,
            next_epoch: rand::thread_rng().gen_range(1..0x1_0000),
            closed: false,
            cfg,
        })
    }

    pub fn epid(&self) -> Epid {
        self.epid
    }

    pub fn config(&self) -> &ProtoConfig {
        &self.cfg
    }

    pub fn stats(&self) -> &Arc<ProtoStats> {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn connection(&self, peer: Epid) -> Option<&PeerConnection> {
        self.conns.get(&peer)
    }

    pub fn rndv(&self) -> &RndvEngine {
        &self.rndv
    }

    pub fn send_pool(&self) -> &SendPool {
        &self.send_pool
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Callbacks ready to run; the caller runs them outside the lock.
    pub fn take_completed(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.completed)
    }

    pub(crate) fn take_epoch(&mut self) -> u32 {
        let epoch = self.next_epoch;
        self.next_epoch = self.next_epoch.wrapping_add(1).max(1);
        epoch
    }

    pub(crate) fn is_reliable(&self) -> bool {
        self.cfg.mode == TransportMode::Reliable
    }

    pub fn inflight(&self) -> InflightReport {
        let counts = self.rndv.counts();
        InflightReport {
            scbs: self.scbs.len(),
            posted_recvs: self.mq.posted_len() + self.rndv_recvs.len(),
            unexpected: self.mq.unexpected_len(),
            send_transfers: counts.sends,
            recv_transfers: counts.recvs,
            send_buffers: self.send_pool.num_outstanding(),
            ctrl_queued: self.ctrlq.len(),
            rc_qps: self.conns.values().map(|c| c.rc_qps.iter().count()).sum(),
        }
    }

    /// Runs one progress pass: reaps completions, then fires due timers.
    /// Returns the number of events handled.
    pub fn poll_at(&mut self, now: Instant) -> Result<usize> {
        if self.closed {
            return Err(TransportError::EndpointClosed);
        }
        let mut events = self.reap_sends(now, false)?;
        events += self.reap_recvs(now)?;
        while let Some(key) = self.timers.pop_expired(now) {
            trace!(?key, "timer fired");
            self.on_timer(key, now)?;
            events += 1;
        }
        Ok(events)
    }

    fn on_timer(&mut self, key: TimerKey, now: Instant) -> Result<()> {
        match key {
            TimerKey::Ack(flow) => self.on_ack_timer(flow, now),
            TimerKey::Send(flow) => {
                self.reap_sends(now, true)?;
                self.flush_flow(flow, now)?;
                if flow.class == FlowClass::Bulk {
                    self.post_rdma_windows(flow.peer, now)?;
                }
                Ok(())
            }
            TimerKey::CtrlQueue => {
                self.reap_sends(now, true)?;
                self.service_ctrlq(now)
            }
            TimerKey::ConnectRetry(peer) => self.on_connect_timer(peer, now),
            TimerKey::DisconnectRetry(peer) => self.on_disconnect_timer(peer, now),
        }
    }

    // Application operations.

    /// Queues `data` to `peer`, connecting first if needed. The callback
    /// receives the byte count once the message is acknowledged.
    pub fn send(&mut self, peer: Epid, data: Bytes, callback: Option<SendCallback>, now: Instant) -> Result<()> {
        if data.len() > u32::MAX as usize {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                max_size: u32::MAX as usize,
            });
        }
        self.ensure_connected(peer, now)?;
        ProtoStats::inc(self.stats.messages_sent());
        let key = FlowKey::new(peer, FlowClass::Message);
        let len = data.len();
        if len > self.cfg.rndv_threshold {
            let send_id = self.rndv.start_send(peer, data, callback);
            let mut header = PacketHeader::new(Opcode::Rts, self.epid, FlowClass::Message.id());
            header.aux = send_id;
            header.msg_len = len as u32;
            let scb = Scb::new(key, ScbKind::Message, header, Bytes::new(), self.cfg.mtu);
            ProtoStats::inc(self.stats.rts_sent());
            debug!(peer = %peer, send_id, len, "rendezvous send");
            self.queue_scb(key, scb, now)?;
            return Ok(());
        }
        let mut header = PacketHeader::new(Opcode::Data, self.epid, FlowClass::Message.id());
        header.msg_len = len as u32;
        let mut scb = Scb::new(key, ScbKind::Message, header, data, self.cfg.mtu);
        if let Some(cb) = callback {
            scb = scb.with_callback(cb);
        }
        self.queue_scb(key, scb, now)?;
        Ok(())
    }

    /// Posts a receive for the next message from `src` (any source if
    /// `None`) of at most `capacity` bytes.
    pub fn receive(&mut self, src: Option<Epid>, capacity: usize, callback: RecvCallback, now: Instant) -> Result<()> {
        if self.closed {
            return Err(TransportError::EndpointClosed);
        }
        let recv = PostedRecv { src, capacity, callback };
        if let Some((recv, msg)) = self.mq.post(recv) {
            self.complete_match(recv, msg, now)?;
        }
        Ok(())
    }

    pub(crate) fn complete_match(&mut self, recv: PostedRecv, msg: Unexpected, now: Instant) -> Result<()> {
        match msg {
            Unexpected::Eager { src, data } => {
                let result = if data.len() > recv.capacity {
                    Err(TransportError::MessageTruncated {
                        size: data.len(),
                        capacity: recv.capacity,
                    })
                } else {
                    Ok(Received {
                        src,
                        data: data.to_vec(),
                    })
                };
                self.completed.push(Completed::Recv(recv.callback, result));
                Ok(())
            }
            Unexpected::Rts { src, send_id, len } => self.start_rndv_recv(recv, src, send_id, len, now),
        }
    }

    /// Idle when nothing is queued or unacknowledged to `peer`.
    pub fn flows_idle(&self, peer: Epid) -> bool {
        self.conns.get(&peer).map_or(true, |c| c.flows_idle()) && !self.rndv.has_transfers_with(peer)
    }

    pub fn connection_state(&self, peer: Epid) -> Option<(ConnState, ConnState)> {
        self.conns.get(&peer).map(|c| (c.outgoing, c.incoming))
    }

    pub fn peers(&self) -> Vec<Epid> {
        self.conns.keys().copied().collect()
    }

    pub(crate) fn ensure_connected(&mut self, peer: Epid, now: Instant) -> Result<()> {
        if self.closed {
            return Err(TransportError::EndpointClosed);
        }
        if let Some(reason) = self.failed.get(&peer) {
            return Err(TransportError::fatal(peer, reason.clone()));
        }
        match self.conns.get(&peer).map(|c| c.outgoing) {
            Some(ConnState::Disconnecting) => Err(TransportError::NotConnected { peer }),
            Some(ConnState::Connecting) | Some(ConnState::Connected) => Ok(()),
            Some(ConnState::None) | None => self.connect(peer, now),
        }
    }

    /// Enqueues an scb on its flow and tries to post it.
    pub(crate) fn queue_scb(&mut self, key: FlowKey, scb: Scb, now: Instant) -> Result<ScbId> {
        self.ensure_connected(key.peer, now)?;
        let id = self.scbs.insert(scb);
        if let Some(conn) = self.conns.get_mut(&key.peer) {
            conn.flow_mut(key.class).enqueue(&mut self.scbs, id);
        }
        self.flush_flow(key, now)?;
        Ok(id)
    }

    // Flow control.

    /// Posts what the credit window allows on one flow.
    pub(crate) fn flush_flow(&mut self, key: FlowKey, now: Instant) -> Result<()> {
        let reliable = self.is_reliable();
        let Proto {
            conns,
            transport,
            send_pool,
            ud,
            scbs,
            stats,
            cfg,
            policy,
            ..
        } = self;
        let Some(conn) = conns.get_mut(&key.peer) else {
            return Ok(());
        };
        if !conn.can_send() || !conn.flow(key.class).has_work() {
            return Ok(());
        }
        let PeerConnection {
            flows,
            rc_qps,
            reconnect_count,
            ..
        } = conn;
        let lane = if reliable {
            rc_qps.ready_mut().map(Lane::reliable)
        } else {
            Some(Lane::datagram(ud, key.peer))
        };
        let mut sink = WireSink {
            transport: transport.as_mut(),
            pool: send_pool,
            lane,
            checksum: cfg.checksum,
            reconnect_count: *reconnect_count,
            stats: stats.as_ref(),
        };
        let flow = &mut flows[key.class as usize];
        let report = flush(flow, scbs, &mut sink, policy, stats.as_ref(), now)?;
        if report.posted > 0 || report.retransmitted > 0 {
            trace!(
                flow = %key,
                posted = report.posted,
                retransmitted = report.retransmitted,
                credits = flow.credits,
                outcome = ?report.outcome,
                "flushed"
            );
        }
        if let Some(deadline) = report.ack_deadline {
            self.timers.request(TimerKey::Ack(key), deadline);
        }
        if report.outcome != FlushOutcome::Drained {
            self.timers.request(TimerKey::Send(key), now + self.cfg.send_retry());
        }
        for id in report.delivered {
            if let Some(scb) = self.scbs.remove(id) {
                self.release_scb(scb, true);
            }
        }
        Ok(())
    }

    pub(crate) fn flush_peer(&mut self, peer: Epid, now: Instant) -> Result<()> {
        self.flush_flow(FlowKey::new(peer, FlowClass::Message), now)?;
        self.flush_flow(FlowKey::new(peer, FlowClass::Bulk), now)?;
        self.post_rdma_windows(peer, now)
    }

    /// Completes an scb that left the flow by acknowledgement or reliable
    /// delivery.
    pub(crate) fn release_scb(&mut self, mut scb: Scb, delivered: bool) {
        if delivered {
            ProtoStats::inc(self.stats.scbs_delivered());
        } else {
            ProtoStats::inc(self.stats.scbs_acked());
        }
        match scb.kind {
            ScbKind::Message => {
                let len = scb.len();
                if let Some((cb, result)) = scb.complete(Ok(len)) {
                    self.completed.push(Completed::Send(cb, result));
                }
            }
            ScbKind::LongData { send_id, window, bytes } => {
                if let Some(done) = self.rndv.on_long_data_acked(send_id, window, bytes) {
                    self.finish_rndv(done);
                }
            }
        }
    }

    /// Fails every queued and unacknowledged scb to `peer`.
    pub(crate) fn fail_flows(&mut self, peer: Epid, make_err: &dyn Fn() -> TransportError) {
        let Some(conn) = self.conns.get_mut(&peer) else {
            return;
        };
        let mut ids: Vec<ScbId> = Vec::new();
        for flow in conn.flows.iter_mut() {
            ids.extend(flow.pending.drain(..));
            ids.extend(flow.unacked.drain(..));
            flow.retransmit.clear();
            flow.recv.ack_pending = false;
        }
        for class in [FlowClass::Message, FlowClass::Bulk] {
            let key = FlowKey::new(peer, class);
            self.timers.cancel(TimerKey::Ack(key));
            self.timers.cancel(TimerKey::Send(key));
        }
        let failed = ids.len();
        for id in ids {
            if let Some(mut scb) = self.scbs.remove(id) {
                if let Some((cb, _)) = scb.complete(Ok(0)) {
                    self.completed.push(Completed::Send(cb, Err(make_err())));
                }
            }
        }
        if failed > 0 {
            debug!(peer = %peer, failed, "failed queued sends");
        }
    }

    // Acknowledgement timers.

    /// Earliest ack deadline on a flow and the local send completions still
    /// pending on its oldest packet.
    fn ack_head(&self, key: FlowKey) -> Option<(Instant, u32)> {
        let flow = self.conns.get(&key.peer)?.flow(key.class);
        let head = self.scbs.get(*flow.unacked.front()?)?;
        let deadline = flow
            .unacked
            .iter()
            .filter_map(|id| self.scbs.get(*id).and_then(|s| s.abs_timeout))
            .min()?;
        Some((deadline, head.local_outstanding))
    }

    fn on_ack_timer(&mut self, key: FlowKey, now: Instant) -> Result<()> {
        let Some((deadline, outstanding)) = self.ack_head(key) else {
            return Ok(());
        };
        if deadline > now {
            self.timers.request(TimerKey::Ack(key), deadline);
            return Ok(());
        }
        if outstanding > 0 {
            self.reap_sends(now, true)?;
            if self.ack_head(key).is_some_and(|(_, o)| o > 0) {
                ProtoStats::inc(self.stats.send_dma_wait());
                self.timers.request(TimerKey::Ack(key), now + self.policy.ack_timeout);
                return Ok(());
            }
        }
        self.send_err_chk(key)?;

        let factor = self.cfg.ack_timeout_factor;
        let max = self.cfg.ack_timeout_max();
        let policy = self.policy;
        let Some(conn) = self.conns.get_mut(&key.peer) else {
            return Ok(());
        };
        let flow = conn.flow_mut(key.class);
        let mut next: Option<Instant> = None;
        for id in flow.unacked.iter() {
            if let Some(scb) = self.scbs.get_mut(*id) {
                if scb.abs_timeout.is_some_and(|t| t <= now) {
                    scb.ack_timeout = backoff(scb.ack_timeout, factor, max);
                    scb.abs_timeout = Some(now + scb.ack_timeout);
                }
                next = match (next, scb.abs_timeout) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        if flow.shrink(&policy) {
            ProtoStats::inc(self.stats.credit_shrinks());
        }
        flow.credits_inc_psn = flow.xmit_seq;
        if let Some(at) = next {
            self.timers.request(TimerKey::Ack(key), at);
        }
        Ok(())
    }

    /// Asks the receiver of a flow to report its state.
    pub(crate) fn send_err_chk(&mut self, key: FlowKey) -> Result<()> {
        let Some(conn) = self.conns.get(&key.peer) else {
            return Ok(());
        };
        let psn = err_chk_psn(conn.flow(key.class), &self.scbs);
        let mut header = self.ctrl_header(Opcode::ErrChk, key);
        header.psn = psn;
        header.reconnect_count = conn.reconnect_count;
        if self.send_ctrl(key.peer, &header, &[])? != PostStatus::NoResources {
            ProtoStats::inc(self.stats.err_chk_sent());
            debug!(flow = %key, psn = %psn, "sent err_chk");
        }
        Ok(())
    }

    // Control messages.

    pub(crate) fn ctrl_header(&self, opcode: Opcode, key: FlowKey) -> PacketHeader {
        PacketHeader::new(opcode, self.epid, key.class.id())
    }

    /// Posts a control packet on the datagram QP.
    pub(crate) fn send_ctrl(&mut self, peer: Epid, header: &PacketHeader, payload: &[u8]) -> Result<PostStatus> {
        let mut lane = Lane::datagram(&mut self.ud, peer);
        post_packet(
            self.transport.as_mut(),
            &mut self.send_pool,
            &mut lane,
            header,
            payload,
            self.cfg.checksum,
            false,
            None,
            &self.stats,
        )
    }

    fn count_ctrl(&self, opcode: Opcode) {
        match opcode {
            Opcode::Ack => ProtoStats::inc(self.stats.acks_sent()),
            Opcode::Nak => ProtoStats::inc(self.stats.naks_sent()),
            Opcode::Becn => ProtoStats::inc(self.stats.becn_sent()),
            _ => {}
        }
    }

    /// Sends an ack-family message, queueing it when the send path is
    /// busy. Queued messages keep their order behind earlier ones.
    pub(crate) fn send_ack_family(&mut self, key: FlowKey, header: PacketHeader, now: Instant) -> Result<()> {
        if self.ctrlq.is_empty() && self.send_ctrl(key.peer, &header, &[])? != PostStatus::NoResources {
            self.count_ctrl(header.opcode);
            return Ok(());
        }
        match self.ctrlq.enqueue(CtrlMsg { flow: key, header }) {
            CtrlEnqueue::Queued => ProtoStats::inc(self.stats.ctrl_msgs_queued()),
            CtrlEnqueue::Replaced => ProtoStats::inc(self.stats.ack_overwrites()),
            CtrlEnqueue::AlreadyQueued => {}
            CtrlEnqueue::Overflow => ProtoStats::inc(self.stats.ctrl_msg_queue_overflow()),
        }
        self.timers.request(TimerKey::CtrlQueue, now + self.cfg.ctrlq_retry());
        Ok(())
    }

    fn service_ctrlq(&mut self, now: Instant) -> Result<()> {
        while let Some(msg) = self.ctrlq.front().copied() {
            if self.send_ctrl(msg.flow.peer, &msg.header, &[])? == PostStatus::NoResources {
                self.timers.request(TimerKey::CtrlQueue, now + self.cfg.ctrlq_retry());
                return Ok(());
            }
            self.ctrlq.pop_front();
            self.count_ctrl(msg.header.opcode);
        }
        Ok(())
    }

    pub(crate) fn send_ack(&mut self, key: FlowKey, now: Instant) -> Result<()> {
        let Some(conn) = self.conns.get_mut(&key.peer) else {
            return Ok(());
        };
        let recv = &mut conn.flow_mut(key.class).recv;
        recv.ack_pending = false;
        let ack = recv.last_received();
        let mut header = self.ctrl_header(Opcode::Ack, key);
        header.ack_psn = ack;
        self.send_ack_family(key, header, now)
    }

    pub(crate) fn send_nak(&mut self, key: FlowKey, ack_psn: Psn, missing: Psn, now: Instant) -> Result<()> {
        let mut header = self.ctrl_header(Opcode::Nak, key);
        header.ack_psn = ack_psn;
        header.psn = missing;
        debug!(flow = %key, ack = %ack_psn, missing = %missing, "sending nak");
        self.send_ack_family(key, header, now)
    }

    pub(crate) fn send_becn(&mut self, key: FlowKey, now: Instant) -> Result<()> {
        if let Some(conn) = self.conns.get_mut(&key.peer) {
            conn.flow_mut(key.class).recv.becn_pending = false;
        }
        let header = self.ctrl_header(Opcode::Becn, key);
        self.send_ack_family(key, header, now)
    }

    /// Sends the ACKs and BECNs coalesced over a receive batch.
    pub(crate) fn send_owed_acks(&mut self, now: Instant) -> Result<()> {
        let owed = std::mem::take(&mut self.ack_owed);
        for key in owed {
            let (ack, becn) = match self.conns.get(&key.peer) {
                Some(conn) => {
                    let recv = &conn.flow(key.class).recv;
                    (recv.ack_pending, recv.becn_pending)
                }
                None => continue,
            };
            if becn {
                self.send_becn(key, now)?;
            }
            if ack {
                self.send_ack(key, now)?;
            }
        }
        Ok(())
    }

    // Teardown.

    /// Starts draining every reliable QP. Returns how many are still held.
    pub fn drain_all_qps(&mut self) -> Result<usize> {
        let Proto {
            conns,
            transport,
            stats,
            ..
        } = self;
        for conn in conns.values_mut() {
            for rc in conn.rc_qps.iter_mut() {
                rc.begin_drain(transport.as_mut(), true, stats)?;
            }
            conn.rc_qps.retire_active();
        }
        self.free_drained_qps();
        Ok(self.conns.values().map(|c| c.rc_qps.iter().count()).sum())
    }

    /// Posts drain markers that a full send queue refused earlier.
    pub(crate) fn retry_drain_markers(&mut self) {
        let Proto {
            conns,
            transport,
            stats,
            ..
        } = self;
        for rc in conns.values_mut().flat_map(|c| c.rc_qps.iter_mut()) {
            if let Err(e) = rc.post_drain_marker(transport.as_mut(), stats) {
                warn!(qp = rc.qp, peer = %rc.peer, error = %e, "drain marker post failed");
            }
        }
    }

    /// Destroys every draining QP whose posted work has all completed.
    pub(crate) fn free_drained_qps(&mut self) {
        let Proto {
            conns,
            transport,
            qp_owner,
            stats,
            send_pool,
            ..
        } = self;
        for conn in conns.values_mut() {
            for qp in conn.rc_qps.qp_nums() {
                if let Some(mut rc) = conn.rc_qps.take_if_freeable(qp) {
                    if let Err(e) = send_pool.release_all(&mut rc.allocator) {
                        debug!(qp, error = %e, "releasing slots of freed qp");
                    }
                    transport.destroy_qp(rc.qp);
                    qp_owner.remove(&rc.qp);
                    ProtoStats::inc(stats.rc_qp_freed());
                    debug!(qp = rc.qp, peer = %rc.peer, "rc_qp freed");
                }
            }
        }
    }

    /// Tears the engine down. Every outstanding operation completes with
    /// [`TransportError::EndpointClosed`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let peers: Vec<Epid> = self.conns.keys().copied().collect();
        for peer in peers {
            self.fail_flows(peer, &|| TransportError::EndpointClosed);
            self.fail_rndv(peer, &|| TransportError::EndpointClosed);
        }
        for recv in self.mq.drain_posted() {
            self.completed
                .push(Completed::Recv(recv.callback, Err(TransportError::EndpointClosed)));
        }
        for (_, cb) in self.rndv_recvs.drain() {
            self.completed.push(Completed::Recv(cb, Err(TransportError::EndpointClosed)));
        }
        for conn in self.conns.values() {
            for rc in conn.rc_qps.iter() {
                self.transport.destroy_qp(rc.qp);
            }
        }
        self.conns.clear();
        self.qp_owner.clear();
        self.send_pool.deregister(self.transport.as_mut());
        self.transport.destroy_qp(self.ud.qp);
        self.closed = true;
        info!(epid = %self.epid, "protocol engine closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowCredits;
    use crate::sim::SimFabric;
    use crate::verbs::HostCopy;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn engine(fabric: &SimFabric, epid: u64, cfg: ProtoConfig) -> Proto {
        Proto::new(
            Box::new(fabric.nic(Epid(epid))),
            Box::new(HostCopy),
            cfg,
            Arc::new(ProtoStats::new()),
        )
        .unwrap()
    }

    fn pump(a: &mut Proto, b: &mut Proto, now: Instant) {
        for _ in 0..16 {
            let n = a.poll_at(now).unwrap() + b.poll_at(now).unwrap();
            if n == 0 {
                break;
            }
        }
    }

    fn small_cfg() -> ProtoConfig {
        ProtoConfig::default()
            .with_flow_credits(FlowCredits::fixed(8))
            .with_send_buffers(64, 4, 0)
    }

    #[test]
    fn test_eager_send_and_receive() {
        let fabric = SimFabric::new();
        let mut a = engine(&fabric, 1, small_cfg());
        let mut b = engine(&fabric, 2, small_cfg());
        let now = Instant::now();
        let got = Arc::new(Mutex::new(None));
        let slot = got.clone();
        b.receive(None, 64, Box::new(move |r| *slot.lock() = Some(r)), now)
            .unwrap();
        let sent = Arc::new(Mutex::new(None));
        let sent_slot = sent.clone();
        a.send(
            Epid(2),
            Bytes::from_static(b"hello"),
            Some(Box::new(move |r| *sent_slot.lock() = Some(r))),
            now,
        )
        .unwrap();
        pump(&mut a, &mut b, now);
        for c in a.take_completed().into_iter().chain(b.take_completed()) {
            c.run();
        }
        let received = got.lock().take().unwrap().unwrap();
        assert_eq!(received.src, Epid(1));
        assert_eq!(received.data, b"hello");
        assert_eq!(sent.lock().take().unwrap().unwrap(), 5);
        assert!(a.flows_idle(Epid(2)));
    }

    #[test]
    fn test_unexpected_message_waits_for_receive() {
        let fabric = SimFabric::new();
        let mut a = engine(&fabric, 1, small_cfg());
        let mut b = engine(&fabric, 2, small_cfg());
        let now = Instant::now();
        a.send(Epid(2), Bytes::from(vec![3u8; 10_000]), None, now).unwrap();
        pump(&mut a, &mut b, now);
        assert_eq!(b.inflight().unexpected, 1);

        let got = Arc::new(Mutex::new(None));
        let slot = got.clone();
        b.receive(Some(Epid(1)), 100, Box::new(move |r| *slot.lock() = Some(r)), now)
            .unwrap();
        for c in b.take_completed() {
            c.run();
        }
        let result = got.lock().take().unwrap();
        assert!(matches!(result, Err(TransportError::MessageTruncated { size: 10_000, capacity: 100 })));
    }

    #[test]
    fn test_send_pool_exhaustion_retries_on_timer() {
        let fabric = SimFabric::new();
        let mut a = engine(&fabric, 1, small_cfg());
        let mut b = engine(&fabric, 2, small_cfg());
        let mut now = Instant::now();
        a.connect(Epid(2), now).unwrap();
        pump(&mut a, &mut b, now);
        fabric.set_send_budget(Epid(1), Some(0));
        a.send(Epid(2), Bytes::from_static(b"later"), None, now).unwrap();
        assert!(a.stats.snapshot().send_no_resources >= 1);
        fabric.set_send_budget(Epid(1), None);
        now += Duration::from_millis(1);
        pump(&mut a, &mut b, now);
        assert_eq!(b.inflight().unexpected, 1);
    }

    #[test]
    fn test_close_fails_outstanding_work() {
        let fabric = SimFabric::new();
        let mut a = engine(&fabric, 1, small_cfg());
        let now = Instant::now();
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        a.send(
            Epid(9),
            Bytes::from_static(b"nobody"),
            Some(Box::new(move |r| *slot.lock() = Some(r))),
            now,
        )
        .unwrap();
        a.receive(None, 8, Box::new(|_| {}), now).unwrap();
        a.close();
        let completed = a.take_completed();
        assert_eq!(completed.len(), 2);
        for c in completed {
            c.run();
        }
        assert!(matches!(
            result.lock().take(),
            Some(Err(TransportError::EndpointClosed))
        ));
        assert!(matches!(a.poll_at(now), Err(TransportError::EndpointClosed)));
    }
}
