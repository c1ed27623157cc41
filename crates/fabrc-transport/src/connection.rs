//! Peer connection state machine.
//!
//! Outgoing and incoming directions are tracked separately; each runs
//! `None -> Connecting -> Connected -> Disconnecting -> None` (the incoming
//! side passes through `Connecting` implicitly when it accepts a request).
//! Connection packets carry the requester's epoch, a monotonically growing
//! connection key, and a reconnection count. Packets that do not match the
//! current epoch and count are stale or duplicate: they are dropped and
//! counted, never treated as errors.

use crate::config::ProtoConfig;
use crate::error::{Result, TransportError};
use crate::flow::{CreditPolicy, Flow, FlowClass, FlowKey, NUM_FLOW_CLASSES};
use crate::proto::{Completed, Proto, TimerKey};
use crate::rcqp::{RcQp, RcQpSet, RcQpState};
use crate::reliability::replay_unacked;
use crate::scb::ScbId;
use crate::stats::ProtoStats;
use crate::verbs::{PostStatus, QpKind, QpNum};
use crate::wire::{ConnectPayload, Epid, Opcode, PacketFlags, PacketHeader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    None,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::None => "NONE",
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(s)
    }
}

/// Decision on an incoming CONNECT_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestVerdict {
    /// New connection from the peer; receive state starts over.
    Accept,
    /// Same connection, higher reconnection count: rebind transport.
    Reconnect,
    /// Repeat of an accepted request; reply again.
    Duplicate,
    /// Older than what we know; drop without reply.
    Stale,
}

/// Decision on an incoming CONNECT_REPLY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    Established,
    Reconnected,
    Duplicate,
    Stale,
}

/// Decision when a connect or disconnect retry timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    Resend { next: Instant },
    TimedOut,
    Idle,
}

pub struct PeerConnection {
    pub peer: Epid,
    pub outgoing: ConnState,
    pub incoming: ConnState,
    /// Epoch of our current outgoing connection.
    pub epoch: u32,
    /// Epoch of the peer's connection to us.
    pub remote_epoch: Option<u32>,
    /// Reconnection count of our outgoing transport binding.
    pub reconnect_count: u8,
    pub remote_reconnect_count: u8,
    /// A reconnection handshake is running under the logical connection.
    pub reconnecting: bool,
    pub flows: [Flow; NUM_FLOW_CLASSES],
    pub rc_qps: RcQpSet,
    pub connect_attempts: u32,
    connect_started: Option<Instant>,
    retry_interval: Duration,
    disconnect_started: Option<Instant>,
    pub outgoing_connects: u64,
    pub incoming_connects: u64,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("outgoing", &self.outgoing)
            .field("incoming", &self.incoming)
            .field("epoch", &self.epoch)
            .field("remote_epoch", &self.remote_epoch)
            .field("reconnect_count", &self.reconnect_count)
            .field("reconnecting", &self.reconnecting)
            .finish()
    }
}

impl PeerConnection {
    pub fn new(peer: Epid, policy: &CreditPolicy, max_reorder: usize) -> Self {
        Self {
            peer,
            outgoing: ConnState::None,
            incoming: ConnState::None,
            epoch: 0,
            remote_epoch: None,
            reconnect_count: 0,
            remote_reconnect_count: 0,
            reconnecting: false,
            flows: [
                Flow::new(FlowKey::new(peer, FlowClass::Message), policy, max_reorder),
                Flow::new(FlowKey::new(peer, FlowClass::Bulk), policy, max_reorder),
            ],
            rc_qps: RcQpSet::new(),
            connect_attempts: 0,
            connect_started: None,
            retry_interval: Duration::ZERO,
            disconnect_started: None,
            outgoing_connects: 0,
            incoming_connects: 0,
        }
    }

    pub fn flow(&self, class: FlowClass) -> &Flow {
        &self.flows[class as usize]
    }

    pub fn flow_mut(&mut self, class: FlowClass) -> &mut Flow {
        &mut self.flows[class as usize]
    }

    pub fn is_connected(&self) -> bool {
        self.outgoing == ConnState::Connected
    }

    /// Data may flow: connected and not mid-reconnect.
    pub fn can_send(&self) -> bool {
        self.outgoing == ConnState::Connected && !self.reconnecting
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing == ConnState::None && self.incoming == ConnState::None
    }

    pub fn flows_idle(&self) -> bool {
        self.flows.iter().all(|f| f.is_idle())
    }

    /// `None -> Connecting` under a fresh epoch. Returns false if the
    /// outgoing side is already past `None`.
    pub fn start_connect(&mut self, epoch: u32, now: Instant, cfg: &ProtoConfig, policy: &CreditPolicy) -> bool {
        if self.outgoing != ConnState::None {
            return false;
        }
        self.outgoing = ConnState::Connecting;
        self.epoch = epoch;
        self.reconnect_count = 0;
        self.reconnecting = false;
        self.connect_attempts = 1;
        self.connect_started = Some(now);
        self.retry_interval = cfg.connect_retry();
        for flow in self.flows.iter_mut() {
            flow.reset_send(policy);
        }
        info!(peer = %self.peer, epoch, "outgoing connection: NONE -> CONNECTING");
        true
    }

    /// Starts a reconnection handshake under the current logical connection.
    pub fn start_reconnect(&mut self, now: Instant, cfg: &ProtoConfig) -> u8 {
        self.reconnect_count = self.reconnect_count.wrapping_add(1);
        self.reconnecting = true;
        self.connect_attempts = 1;
        self.connect_started = Some(now);
        self.retry_interval = cfg.connect_retry();
        info!(peer = %self.peer, reconnect_count = self.reconnect_count, "reconnecting");
        self.reconnect_count
    }

    /// Classifies a CONNECT_REQUEST. Epochs are compared with wrapping
    /// arithmetic, and only while the incoming side is up: once it is
    /// closed any other epoch is a new run of the peer and is accepted.
    pub fn on_connect_request(&mut self, epoch: u32, reconnect_count: u8) -> RequestVerdict {
        let connected = self.incoming == ConnState::Connected;
        match self.remote_epoch {
            Some(known) if epoch == known && !connected => RequestVerdict::Stale,
            Some(known) if connected && (epoch.wrapping_sub(known) as i32) < 0 => RequestVerdict::Stale,
            Some(known) if epoch == known => {
                let delta = reconnect_count.wrapping_sub(self.remote_reconnect_count) as i8;
                if delta == 0 {
                    RequestVerdict::Duplicate
                } else if delta > 0 {
                    self.remote_reconnect_count = reconnect_count;
                    RequestVerdict::Reconnect
                } else {
                    RequestVerdict::Stale
                }
            }
            _ => {
                self.remote_epoch = Some(epoch);
                self.remote_reconnect_count = reconnect_count;
                self.incoming = ConnState::Connected;
                self.incoming_connects += 1;
                for flow in self.flows.iter_mut() {
                    flow.recv.reset();
                }
                info!(peer = %self.peer, epoch, "incoming connection: NONE -> CONNECTED");
                RequestVerdict::Accept
            }
        }
    }

    pub fn on_connect_reply(&mut self, epoch: u32, reconnect_count: u8) -> ReplyVerdict {
        if epoch != self.epoch || reconnect_count != self.reconnect_count {
            return ReplyVerdict::Stale;
        }
        match self.outgoing {
            ConnState::Connecting => {
                self.outgoing = ConnState::Connected;
                self.outgoing_connects += 1;
                self.connect_started = None;
                info!(peer = %self.peer, epoch, "outgoing connection: CONNECTING -> CONNECTED");
                ReplyVerdict::Established
            }
            ConnState::Connected if self.reconnecting => {
                self.reconnecting = false;
                self.connect_started = None;
                info!(peer = %self.peer, reconnect_count, "reconnected");
                ReplyVerdict::Reconnected
            }
            ConnState::Connected => ReplyVerdict::Duplicate,
            _ => ReplyVerdict::Stale,
        }
    }

    /// `Connected/Connecting -> Disconnecting`. Returns false if there is no
    /// outgoing connection to close.
    pub fn start_disconnect(&mut self, now: Instant, cfg: &ProtoConfig) -> bool {
        match self.outgoing {
            ConnState::Connected | ConnState::Connecting => {
                info!(peer = %self.peer, from = %self.outgoing, "outgoing connection: -> DISCONNECTING");
                self.outgoing = ConnState::Disconnecting;
                self.reconnecting = false;
                self.connect_started = None;
                self.disconnect_started = Some(now);
                self.retry_interval = cfg.disconnect_retry();
                true
            }
            _ => false,
        }
    }

    /// Handles a DISCONNECT_REQUEST. A reply is always owed; returns whether
    /// this request moved the incoming side to `None`.
    pub fn on_disconnect_request(&mut self, epoch: u32) -> bool {
        if self.incoming == ConnState::Connected && self.remote_epoch == Some(epoch) {
            self.incoming = ConnState::Disconnecting;
            info!(peer = %self.peer, epoch, "incoming connection: CONNECTED -> DISCONNECTING -> NONE");
            self.incoming = ConnState::None;
            return true;
        }
        false
    }

    /// Handles a DISCONNECT_REPLY. Returns whether the outgoing side closed.
    pub fn on_disconnect_reply(&mut self, epoch: u32) -> bool {
        if self.outgoing == ConnState::Disconnecting && epoch == self.epoch {
            self.close_outgoing();
            return true;
        }
        false
    }

    pub fn close_outgoing(&mut self) {
        info!(peer = %self.peer, "outgoing connection: DISCONNECTING -> NONE");
        self.outgoing = ConnState::None;
        self.disconnect_started = None;
        self.reconnecting = false;
    }

    /// Connect retry timer: back off until the connect timeout.
    pub fn on_connect_timer(&mut self, now: Instant, cfg: &ProtoConfig) -> RetryVerdict {
        let pending = self.outgoing == ConnState::Connecting || (self.outgoing == ConnState::Connected && self.reconnecting);
        let Some(started) = self.connect_started.filter(|_| pending) else {
            return RetryVerdict::Idle;
        };
        if now.saturating_duration_since(started) >= cfg.connect_timeout() {
            return RetryVerdict::TimedOut;
        }
        self.connect_attempts += 1;
        self.retry_interval = (self.retry_interval * 2).min(cfg.connect_retry_max());
        RetryVerdict::Resend {
            next: now + self.retry_interval,
        }
    }

    pub fn next_connect_retry(&self, now: Instant) -> Instant {
        now + self.retry_interval
    }

    /// Disconnect retry timer: resend until the disconnect timeout.
    pub fn on_disconnect_timer(&mut self, now: Instant, cfg: &ProtoConfig) -> RetryVerdict {
        let Some(started) = self.disconnect_started.filter(|_| self.outgoing == ConnState::Disconnecting) else {
            return RetryVerdict::Idle;
        };
        if now.saturating_duration_since(started) >= cfg.disconnect_timeout() {
            return RetryVerdict::TimedOut;
        }
        RetryVerdict::Resend {
            next: now + self.retry_interval,
        }
    }
}

impl Proto {
    /// Opens the outgoing direction to `peer`. The handshake completes
    /// during progress; sends queued meanwhile wait on their flows.
    pub fn connect(&mut self, peer: Epid, now: Instant) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::EndpointClosed);
        }
        if let Some(reason) = self.failed.get(&peer) {
            return Err(TransportError::fatal(peer, reason.clone()));
        }
        let epoch = self.take_epoch();
        let Proto {
            conns,
            scbs,
            cfg,
            policy,
            ..
        } = self;
        let conn = conns
            .entry(peer)
            .or_insert_with(|| PeerConnection::new(peer, policy, cfg.max_reorder));
        if !conn.start_connect(epoch, now, cfg, policy) {
            return Ok(());
        }
        // Work queued before the handshake gets PSNs of the new connection.
        for flow in conn.flows.iter_mut() {
            let pending: Vec<ScbId> = flow.pending.drain(..).collect();
            for id in pending {
                if let Some(scb) = scbs.get_mut(id) {
                    scb.frags_posted = 0;
                }
                flow.enqueue(scbs, id);
            }
        }
        if self.is_reliable() {
            self.ensure_rc_qp(peer, 0)?;
        }
        self.send_connect_request(peer)?;
        if let Some(conn) = self.conns.get(&peer) {
            self.timers
                .reschedule(TimerKey::ConnectRetry(peer), conn.next_connect_retry(now));
        }
        Ok(())
    }

    /// Active QP of the connection, created with `generation` if there is
    /// none or the current one is draining.
    pub(crate) fn ensure_rc_qp(&mut self, peer: Epid, generation: u8) -> Result<QpNum> {
        let Proto {
            conns,
            transport,
            qp_owner,
            cfg,
            stats,
            ..
        } = self;
        let Some(conn) = conns.get_mut(&peer) else {
            return Err(TransportError::NotConnected { peer });
        };
        if let Some(rc) = conn.rc_qps.active().filter(|rc| !rc.is_draining()) {
            return Ok(rc.qp);
        }
        let qp = transport.create_qp(QpKind::Reliable)?;
        let mut rc = RcQp::new(qp, peer, generation, cfg.rc_recv_buffers, cfg.send_cq_coalesce);
        rc.recv.replenish(transport.as_mut(), qp)?;
        conn.rc_qps.install(rc);
        qp_owner.insert(qp, peer);
        ProtoStats::inc(stats.rc_qp_created());
        debug!(peer = %peer, qp, generation, "rc_qp created");
        Ok(qp)
    }

    /// Binds the active QP to the peer's QP. A QP already bound to a
    /// different remote QP is replaced, since the peer has moved on.
    fn bind_rc_qp(&mut self, peer: Epid, remote_qp: QpNum) -> Result<()> {
        let Proto {
            conns,
            transport,
            stats,
            ..
        } = self;
        let Some(rc) = conns.get_mut(&peer).and_then(|c| c.rc_qps.active_mut()) else {
            return Ok(());
        };
        match rc.state {
            RcQpState::Connected if rc.remote_qp == Some(remote_qp) => return Ok(()),
            RcQpState::Connected => {
                warn!(peer = %peer, qp = rc.qp, bound = ?rc.remote_qp, offered = remote_qp, "peer changed qp");
                let generation = rc.reconnect_count;
                rc.begin_drain(transport.as_mut(), true, stats)?;
                self.ensure_rc_qp(peer, generation)?;
            }
            RcQpState::Initialized => {}
            RcQpState::Draining => return Ok(()),
        }
        let Proto {
            conns, transport, ..
        } = self;
        if let Some(rc) = conns.get_mut(&peer).and_then(|c| c.rc_qps.active_mut()) {
            transport.connect_qp(rc.qp, peer, remote_qp)?;
            rc.state = RcQpState::Connected;
            rc.remote_qp = Some(remote_qp);
            debug!(peer = %peer, qp = rc.qp, remote_qp, "rc_qp connected");
        }
        Ok(())
    }

    fn active_qp_num(&self, peer: Epid) -> u32 {
        self.conns
            .get(&peer)
            .and_then(|c| c.rc_qps.active())
            .filter(|rc| !rc.is_draining())
            .map_or(0, |rc| rc.qp)
    }

    pub(crate) fn send_connect_request(&mut self, peer: Epid) -> Result<()> {
        let Some(conn) = self.conns.get(&peer) else {
            return Ok(());
        };
        let mut header = PacketHeader::new(Opcode::ConnectRequest, self.epid, 0);
        if conn.reconnecting {
            header.flags.insert(PacketFlags::RECONNECT);
        }
        header.reconnect_count = conn.reconnect_count;
        let payload = ConnectPayload {
            epoch: conn.epoch,
            reconnect_count: conn.reconnect_count as u32,
            qp_num: self.active_qp_num(peer),
        };
        if self.send_ctrl(peer, &header, &payload.encode())? != PostStatus::NoResources {
            ProtoStats::inc(self.stats.connect_requests_sent());
        }
        Ok(())
    }

    fn send_connect_reply(&mut self, peer: Epid, request: ConnectPayload) -> Result<()> {
        let mut header = PacketHeader::new(Opcode::ConnectReply, self.epid, 0);
        header.reconnect_count = request.reconnect_count as u8;
        let payload = ConnectPayload {
            epoch: request.epoch,
            reconnect_count: request.reconnect_count,
            qp_num: self.active_qp_num(peer),
        };
        if self.send_ctrl(peer, &header, &payload.encode())? != PostStatus::NoResources {
            ProtoStats::inc(self.stats.connect_replies_sent());
        }
        Ok(())
    }

    pub(crate) fn on_connect_request(&mut self, header: PacketHeader, request: ConnectPayload, _now: Instant) -> Result<()> {
        let peer = header.src;
        if self.is_closed() {
            return Ok(());
        }
        let count = request.reconnect_count as u8;
        let Proto {
            conns, cfg, policy, ..
        } = self;
        let conn = conns
            .entry(peer)
            .or_insert_with(|| PeerConnection::new(peer, policy, cfg.max_reorder));
        let verdict = conn.on_connect_request(request.epoch, count);
        debug!(peer = %peer, epoch = request.epoch, reconnect_count = count, ?verdict, "connect request");
        match verdict {
            RequestVerdict::Stale => {
                ProtoStats::inc(self.stats.stale_connect_dropped());
                return Ok(());
            }
            RequestVerdict::Duplicate => ProtoStats::inc(self.stats.duplicate_connect_dropped()),
            RequestVerdict::Accept => {
                self.failed.remove(&peer);
                for class in [FlowClass::Message, FlowClass::Bulk] {
                    self.partial.remove(&FlowKey::new(peer, class));
                }
            }
            RequestVerdict::Reconnect => {}
        }
        if self.is_reliable() {
            if !self.rebind_for_request(peer, verdict, count)? {
                ProtoStats::inc(self.stats.stale_connect_dropped());
                return Ok(());
            }
            self.bind_rc_qp(peer, request.qp_num)?;
        }
        self.send_connect_reply(peer, request)
    }

    /// Makes sure the active QP matches the requester's generation. Returns
    /// false when the request is older than our transport binding.
    fn rebind_for_request(&mut self, peer: Epid, verdict: RequestVerdict, generation: u8) -> Result<bool> {
        let current = self
            .conns
            .get(&peer)
            .and_then(|c| c.rc_qps.active())
            .filter(|rc| !rc.is_draining())
            .map(|rc| rc.reconnect_count);
        let Some(current) = current else {
            self.ensure_rc_qp(peer, generation)?;
            self.adopt_generation(peer, generation);
            return Ok(true);
        };
        if verdict != RequestVerdict::Reconnect {
            return Ok(true);
        }
        let delta = generation.wrapping_sub(current) as i8;
        if delta < 0 {
            return Ok(false);
        }
        if delta > 0 {
            let Proto {
                conns,
                transport,
                stats,
                ..
            } = self;
            if let Some(rc) = conns.get_mut(&peer).and_then(|c| c.rc_qps.active_mut()) {
                rc.begin_drain(transport.as_mut(), true, stats)?;
            }
            self.ensure_rc_qp(peer, generation)?;
            self.adopt_generation(peer, generation);
            info!(peer = %peer, generation, "rc_qp replaced for peer reconnect");
        }
        Ok(true)
    }

    fn adopt_generation(&mut self, peer: Epid, generation: u8) {
        if let Some(conn) = self.conns.get_mut(&peer) {
            if (generation.wrapping_sub(conn.reconnect_count) as i8) > 0 {
                conn.reconnect_count = generation;
            }
        }
    }

    pub(crate) fn on_connect_reply(&mut self, header: PacketHeader, reply: ConnectPayload, now: Instant) -> Result<()> {
        let peer = header.src;
        let Some(conn) = self.conns.get_mut(&peer) else {
            ProtoStats::inc(self.stats.stale_connect_dropped());
            return Ok(());
        };
        let verdict = conn.on_connect_reply(reply.epoch, reply.reconnect_count as u8);
        match verdict {
            ReplyVerdict::Stale => {
                ProtoStats::inc(self.stats.stale_connect_dropped());
                return Ok(());
            }
            ReplyVerdict::Duplicate => {
                ProtoStats::inc(self.stats.duplicate_connect_dropped());
                return Ok(());
            }
            ReplyVerdict::Established | ReplyVerdict::Reconnected => {}
        }
        if self.is_reliable() {
            self.bind_rc_qp(peer, reply.qp_num)?;
        }
        self.timers.cancel(TimerKey::ConnectRetry(peer));
        ProtoStats::inc(self.stats.connects_established());
        if verdict == ReplyVerdict::Reconnected {
            // Packets posted on the failed QP may never have left it.
            if let Some(conn) = self.conns.get_mut(&peer) {
                for class in [FlowClass::Message, FlowClass::Bulk] {
                    replay_unacked(conn.flow_mut(class), &mut self.scbs);
                }
            }
        }
        self.flush_peer(peer, now)
    }

    pub(crate) fn on_connect_timer(&mut self, peer: Epid, now: Instant) -> Result<()> {
        let cfg = self.cfg.clone();
        let Some(conn) = self.conns.get_mut(&peer) else {
            return Ok(());
        };
        match conn.on_connect_timer(now, &cfg) {
            RetryVerdict::Idle => Ok(()),
            RetryVerdict::Resend { next } => {
                debug!(peer = %peer, attempt = conn.connect_attempts, "resending connect request");
                self.send_connect_request(peer)?;
                self.timers.reschedule(TimerKey::ConnectRetry(peer), next);
                Ok(())
            }
            RetryVerdict::TimedOut => {
                ProtoStats::inc(self.stats.connect_timeouts());
                if conn.reconnecting {
                    return self.fatal(peer, "reconnection timed out");
                }
                warn!(peer = %peer, attempts = conn.connect_attempts, "connect timed out");
                conn.outgoing = ConnState::None;
                let timeout_ms = cfg.connect_timeout().as_millis() as u64;
                let make_err = || TransportError::ConnectionTimeout { peer, timeout_ms };
                self.fail_flows(peer, &make_err);
                self.fail_rndv(peer, &make_err);
                Ok(())
            }
        }
    }

    /// The active QP of `peer` failed. With reconnection allowed it is
    /// drained and replaced under the same logical connection; otherwise
    /// the connection is lost.
    pub(crate) fn on_rc_qp_error(&mut self, peer: Epid, qp: QpNum, now: Instant) -> Result<()> {
        warn!(peer = %peer, qp, "rc_qp entered error state");
        if !self.cfg.allow_reconnect {
            return self.fatal(peer, format!("rc_qp {} failed and reconnection is disabled", qp));
        }
        let Proto {
            conns,
            transport,
            stats,
            cfg,
            ..
        } = self;
        let Some(conn) = conns.get_mut(&peer) else {
            return Ok(());
        };
        if let Some(rc) = conn.rc_qps.active_mut() {
            rc.begin_drain(transport.as_mut(), true, stats)?;
        }
        if conn.outgoing != ConnState::Connected {
            // The peer's reconnect request will bring a new QP.
            conn.rc_qps.retire_active();
            self.free_drained_qps();
            return Ok(());
        }
        let generation = conn.start_reconnect(now, cfg);
        let next = conn.next_connect_retry(now);
        ProtoStats::inc(stats.reconnects());
        self.ensure_rc_qp(peer, generation)?;
        self.send_connect_request(peer)?;
        self.timers.reschedule(TimerKey::ConnectRetry(peer), next);
        self.free_drained_qps();
        Ok(())
    }

    /// Terminates everything with `peer`. Later operations to it fail with
    /// the same reason until the peer connects again.
    pub(crate) fn fatal(&mut self, peer: Epid, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        error!(peer = %peer, reason = %reason, "fatal connection error");
        ProtoStats::inc(self.stats.fatal_errors());
        self.failed.insert(peer, reason.clone());
        self.fail_flows(peer, &|| TransportError::fatal(peer, reason.clone()));
        self.fail_rndv(peer, &|| TransportError::fatal(peer, reason.clone()));
        for recv in self.mq.take_posted_from(peer) {
            self.completed.push(Completed::Recv(
                recv.callback,
                Err(TransportError::fatal(peer, reason.clone())),
            ));
        }
        self.ctrlq.purge_peer(peer);
        self.timers.cancel(TimerKey::ConnectRetry(peer));
        self.timers.cancel(TimerKey::DisconnectRetry(peer));
        for class in [FlowClass::Message, FlowClass::Bulk] {
            self.partial.remove(&FlowKey::new(peer, class));
        }
        let Proto {
            conns,
            transport,
            stats,
            ..
        } = self;
        if let Some(conn) = conns.get_mut(&peer) {
            for rc in conn.rc_qps.iter_mut() {
                rc.begin_drain(transport.as_mut(), true, stats)?;
            }
            conn.rc_qps.retire_active();
            conn.outgoing = ConnState::None;
            conn.incoming = ConnState::None;
            conn.reconnecting = false;
        }
        self.free_drained_qps();
        Ok(())
    }

    /// Starts closing the outgoing direction to `peer`. Anything still
    /// queued fails with [`TransportError::NotConnected`].
    pub fn disconnect(&mut self, peer: Epid, now: Instant) -> Result<()> {
        let cfg = self.cfg.clone();
        let Some(conn) = self.conns.get_mut(&peer) else {
            return Ok(());
        };
        if !conn.start_disconnect(now, &cfg) {
            return Ok(());
        }
        self.timers.cancel(TimerKey::ConnectRetry(peer));
        self.fail_flows(peer, &|| TransportError::NotConnected { peer });
        self.fail_rndv(peer, &|| TransportError::NotConnected { peer });
        self.send_disconnect_request(peer)?;
        self.timers
            .reschedule(TimerKey::DisconnectRetry(peer), now + cfg.disconnect_retry());
        Ok(())
    }

    fn send_disconnect_request(&mut self, peer: Epid) -> Result<()> {
        let Some(conn) = self.conns.get(&peer) else {
            return Ok(());
        };
        let header = PacketHeader::new(Opcode::DisconnectRequest, self.epid, 0);
        let payload = ConnectPayload {
            epoch: conn.epoch,
            reconnect_count: conn.reconnect_count as u32,
            qp_num: 0,
        };
        if self.send_ctrl(peer, &header, &payload.encode())? != PostStatus::NoResources {
            ProtoStats::inc(self.stats.disconnect_requests_sent());
        }
        Ok(())
    }

    /// Every request gets a reply, duplicates included, so a peer whose
    /// reply was lost still completes its disconnect.
    pub(crate) fn on_disconnect_request(&mut self, header: PacketHeader, request: ConnectPayload, _now: Instant) -> Result<()> {
        let peer = header.src;
        ProtoStats::inc(self.stats.disconnect_requests_received());
        let closed = self
            .conns
            .get_mut(&peer)
            .is_some_and(|c| c.on_disconnect_request(request.epoch));
        if closed {
            self.disconnects_received += 1;
            for class in [FlowClass::Message, FlowClass::Bulk] {
                self.partial.remove(&FlowKey::new(peer, class));
            }
        }
        let reply = PacketHeader::new(Opcode::DisconnectReply, self.epid, 0);
        let payload = ConnectPayload {
            epoch: request.epoch,
            reconnect_count: request.reconnect_count,
            qp_num: 0,
        };
        if self.send_ctrl(peer, &reply, &payload.encode())? != PostStatus::NoResources {
            ProtoStats::inc(self.stats.disconnect_replies_sent());
        }
        if closed {
            self.maybe_release(peer)?;
        }
        Ok(())
    }

    pub(crate) fn on_disconnect_reply(&mut self, header: PacketHeader, reply: ConnectPayload, _now: Instant) -> Result<()> {
        let peer = header.src;
        let closed = self
            .conns
            .get_mut(&peer)
            .is_some_and(|c| c.on_disconnect_reply(reply.epoch));
        if !closed {
            ProtoStats::inc(self.stats.stale_connect_dropped());
            return Ok(());
        }
        self.timers.cancel(TimerKey::DisconnectRetry(peer));
        self.maybe_release(peer)
    }

    pub(crate) fn on_disconnect_timer(&mut self, peer: Epid, now: Instant) -> Result<()> {
        let cfg = self.cfg.clone();
        let Some(conn) = self.conns.get_mut(&peer) else {
            return Ok(());
        };
        match conn.on_disconnect_timer(now, &cfg) {
            RetryVerdict::Idle => Ok(()),
            RetryVerdict::Resend { next } => {
                self.send_disconnect_request(peer)?;
                self.timers.reschedule(TimerKey::DisconnectRetry(peer), next);
                Ok(())
            }
            RetryVerdict::TimedOut => {
                ProtoStats::inc(self.stats.disconnect_timeouts());
                warn!(peer = %peer, "disconnect timed out");
                conn.close_outgoing();
                self.maybe_release(peer)
            }
        }
    }

    /// Drains the transport of a connection closed in both directions.
    fn maybe_release(&mut self, peer: Epid) -> Result<()> {
        let Proto {
            conns,
            transport,
            stats,
            ..
        } = self;
        let Some(conn) = conns.get_mut(&peer).filter(|c| c.is_closed()) else {
            return Ok(());
        };
        for rc in conn.rc_qps.iter_mut() {
            rc.begin_drain(transport.as_mut(), true, stats)?;
        }
        conn.rc_qps.retire_active();
        debug!(peer = %peer, "connection closed in both directions");
        self.free_drained_qps();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (PeerConnection, ProtoConfig, CreditPolicy) {
        let cfg = ProtoConfig::default();
        let policy = CreditPolicy::from_config(&cfg);
        (PeerConnection::new(Epid(7), &policy, 64), cfg, policy)
    }

    #[test]
    fn test_outgoing_handshake() {
        let (mut c, cfg, policy) = conn();
        let now = Instant::now();
        assert!(c.start_connect(5, now, &cfg, &policy));
        assert!(!c.start_connect(6, now, &cfg, &policy));
        assert_eq!(c.outgoing, ConnState::Connecting);
        assert_eq!(c.on_connect_reply(4, 0), ReplyVerdict::Stale);
        assert_eq!(c.on_connect_reply(5, 0), ReplyVerdict::Established);
        assert_eq!(c.on_connect_reply(5, 0), ReplyVerdict::Duplicate);
        assert!(c.can_send());
    }

    #[test]
    fn test_incoming_requests() {
        let (mut c, _, _) = conn();
        assert_eq!(c.on_connect_request(10, 0), RequestVerdict::Accept);
        assert_eq!(c.incoming, ConnState::Connected);
        assert_eq!(c.on_connect_request(10, 0), RequestVerdict::Duplicate);
        assert_eq!(c.on_connect_request(9, 0), RequestVerdict::Stale);
        assert_eq!(c.on_connect_request(10, 1), RequestVerdict::Reconnect);
        assert_eq!(c.on_connect_request(10, 0), RequestVerdict::Stale);
        assert_eq!(c.on_connect_request(11, 0), RequestVerdict::Accept);
        assert_eq!(c.incoming_connects, 2);
    }

    #[test]
    fn test_disconnect_request_transitions_once() {
        let (mut c, _, _) = conn();
        c.on_connect_request(3, 0);
        let transitions = (0..5).filter(|_| c.on_disconnect_request(3)).count();
        assert_eq!(transitions, 1);
        assert_eq!(c.incoming, ConnState::None);
        assert_eq!(c.on_connect_request(3, 0), RequestVerdict::Stale);
    }

    #[test]
    fn test_restarted_peer_with_lower_epoch_accepted() {
        let (mut c, _, _) = conn();
        assert_eq!(c.on_connect_request(40000, 0), RequestVerdict::Accept);
        assert!(c.on_disconnect_request(40000));
        assert_eq!(c.on_connect_request(1200, 0), RequestVerdict::Accept);
        assert_eq!(c.remote_epoch, Some(1200));
        assert_eq!(c.incoming, ConnState::Connected);
        assert_eq!(c.on_connect_request(40000, 0), RequestVerdict::Stale);
        assert_eq!(c.incoming_connects, 2);
    }

    #[test]
    fn test_epoch_order_survives_wrap() {
        let (mut c, _, _) = conn();
        assert_eq!(c.on_connect_request(u32::MAX, 0), RequestVerdict::Accept);
        assert_eq!(c.on_connect_request(u32::MAX - 1, 0), RequestVerdict::Stale);
        assert_eq!(c.on_connect_request(2, 0), RequestVerdict::Accept);
    }

    #[test]
    fn test_outgoing_disconnect() {
        let (mut c, cfg, policy) = conn();
        let now = Instant::now();
        c.start_connect(1, now, &cfg, &policy);
        c.on_connect_reply(1, 0);
        assert!(c.start_disconnect(now, &cfg));
        assert!(!c.start_disconnect(now, &cfg));
        assert!(!c.on_disconnect_reply(2));
        assert!(c.on_disconnect_reply(1));
        assert!(!c.on_disconnect_reply(1));
        assert!(c.is_closed());
    }

    #[test]
    fn test_reconnect_reply() {
        let (mut c, cfg, policy) = conn();
        let now = Instant::now();
        c.start_connect(1, now, &cfg, &policy);
        c.on_connect_reply(1, 0);
        assert_eq!(c.start_reconnect(now, &cfg), 1);
        assert!(!c.can_send());
        assert_eq!(c.on_connect_reply(1, 0), ReplyVerdict::Stale);
        assert_eq!(c.on_connect_reply(1, 1), ReplyVerdict::Reconnected);
        assert!(c.can_send());
    }

    #[test]
    fn test_connect_timer_backoff_and_timeout() {
        let (mut c, cfg, policy) = conn();
        let now = Instant::now();
        assert_eq!(c.on_connect_timer(now, &cfg), RetryVerdict::Idle);
        c.start_connect(1, now, &cfg, &policy);
        let first = match c.on_connect_timer(now, &cfg) {
            RetryVerdict::Resend { next } => next,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(first, now + cfg.connect_retry() * 2);
        let late = now + cfg.connect_timeout();
        assert_eq!(c.on_connect_timer(late, &cfg), RetryVerdict::TimedOut);
    }

    #[test]
    fn test_disconnect_timer() {
        let (mut c, cfg, policy) = conn();
        let now = Instant::now();
        c.start_connect(1, now, &cfg, &policy);
        c.on_connect_reply(1, 0);
        c.start_disconnect(now, &cfg);
        assert!(matches!(c.on_disconnect_timer(now, &cfg), RetryVerdict::Resend { .. }));
        assert_eq!(
            c.on_disconnect_timer(now + cfg.disconnect_timeout(), &cfg),
            RetryVerdict::TimedOut
        );
    }
}
