//! Rendezvous engine for large messages.
//!
//! The sender announces a message with an RTS. Once the receiver has matched
//! it to a posted receive it grants the message one window at a time with a
//! CTS, keeping at most `1 + prefetch` windows outstanding. For each window
//! the receiver picks the strategy: an RDMA write into a registered slice of
//! the receive buffer, or long-data packets on the bulk flow that it copies
//! in. The offset and length bookkeeping lives here and survives transport
//! rebinds; a window whose RDMA write fails is simply posted again once the
//! connection is usable.
//!
//! [`RndvEngine`] only keeps state; the `Proto` methods at the end of this
//! module turn grants into CTS packets, long data and RDMA writes.

use crate::error::{Result, TransportError};
use crate::flow::{FlowClass, FlowKey};
use crate::mq::{PostedRecv, Received};
use crate::proto::{Completed, Proto, TimerKey};
use crate::scb::{Scb, ScbKind, SendCallback};
use crate::stats::ProtoStats;
use crate::verbs::{
    AccessFlags, CopyStrategy, MemHandle, PostStatus, RndvStrategy, SendOp, SendWr, SharedBuf, TransportStrategy, WrId,
    WrKind,
};
use crate::wire::{CtsPayload, Epid, Opcode, PacketHeader};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// CTS strategy code for long data.
pub const CTS_LONG_DATA: u32 = 0;
/// CTS strategy code for an RDMA write window.
pub const CTS_RDMA_WRITE: u32 = 1;

/// Receive transfer ids travel in the upper half of the RDMA immediate.
const RECV_ID_MASK: u32 = 0xFFFF;
/// Windows at or above this index cannot be named by an immediate and are
/// always granted as long data.
pub const IMM_WINDOW_LIMIT: u32 = 1 << 16;

pub fn encode_imm(recv_id: u32, window: u32) -> u32 {
    ((recv_id & RECV_ID_MASK) << 16) | (window & (IMM_WINDOW_LIMIT - 1))
}

pub fn decode_imm(imm: u32) -> (u32, u32) {
    (imm >> 16, imm & (IMM_WINDOW_LIMIT - 1))
}

const TOKEN_WINDOW_BITS: u32 = 30;

/// Packs a send transfer window into the 62-bit work request payload.
pub fn rdma_token(send_id: u32, window: u32) -> u64 {
    ((send_id as u64) << TOKEN_WINDOW_BITS) | (window as u64 & ((1 << TOKEN_WINDOW_BITS) - 1))
}

pub fn split_rdma_token(token: u64) -> (u32, u32) {
    (
        (token >> TOKEN_WINDOW_BITS) as u32,
        (token & ((1 << TOKEN_WINDOW_BITS) - 1)) as u32,
    )
}

/// Bounded set of receive-window registrations.
#[derive(Debug)]
pub struct MrCache {
    capacity: usize,
    entries: HashMap<(u32, u32), MemHandle>,
}

impl MrCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn has_room(&self) -> bool {
        self.entries.len() < self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, recv_id: u32, window: u32, mr: MemHandle) {
        self.entries.insert((recv_id, window), mr);
    }

    fn remove(&mut self, recv_id: u32, window: u32) -> Option<MemHandle> {
        self.entries.remove(&(recv_id, window))
    }

    fn remove_transfer(&mut self, recv_id: u32) -> Vec<MemHandle> {
        let keys: Vec<_> = self.entries.keys().filter(|(id, _)| *id == recv_id).copied().collect();
        keys.into_iter().filter_map(|k| self.entries.remove(&k)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Granted by a CTS, not on the wire.
    Granted,
    Posted,
}

#[derive(Debug, Clone, Copy)]
pub struct SendWindow {
    pub cts: CtsPayload,
    pub state: WindowState,
    /// Long-data bytes of this window acknowledged so far.
    pub acked: usize,
}

pub struct SendTransfer {
    pub id: u32,
    pub peer: Epid,
    pub data: Bytes,
    pub recv_id: Option<u32>,
    pub windows: BTreeMap<u32, SendWindow>,
    /// Bytes confirmed delivered.
    pub completed: usize,
    /// Source registration for RDMA windows, made on first use.
    pub mr: Option<(SharedBuf, MemHandle)>,
    callback: Option<SendCallback>,
}

impl SendTransfer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.completed >= self.data.len()
    }

    /// Granted RDMA windows waiting to be posted, in window order.
    pub fn granted_rdma(&self) -> Vec<CtsPayload> {
        self.windows
            .values()
            .filter(|w| w.state == WindowState::Granted && w.cts.strategy == CTS_RDMA_WRITE)
            .map(|w| w.cts)
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    pub offset: usize,
    pub len: usize,
    pub strategy: RndvStrategy,
    pub received: usize,
}

pub struct RecvTransfer {
    pub id: u32,
    pub peer: Epid,
    pub send_id: u32,
    pub len: usize,
    pub capacity: usize,
    pub buf: SharedBuf,
    window_size: usize,
    next_window: u32,
    nwindows: u32,
    pub windows: BTreeMap<u32, RecvWindow>,
    pub completed: usize,
    /// Most windows ever outstanding at once.
    pub peak_outstanding: usize,
    pub windows_granted: u32,
}

impl RecvTransfer {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.len && self.windows.is_empty()
    }

    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock())
    }
}

/// A finished transfer on either side.
pub enum RndvDone {
    Send {
        peer: Epid,
        callback: Option<SendCallback>,
        result: Result<usize>,
        /// Source registration the caller must release.
        mr: Option<MemHandle>,
    },
    Recv {
        transfer: RecvTransfer,
        result: Result<()>,
    },
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RndvCounts {
    pub sends: usize,
    pub recvs: usize,
}

pub struct RndvEngine {
    sends: HashMap<u32, SendTransfer>,
    recvs: HashMap<u32, RecvTransfer>,
    next_send_id: u32,
    next_recv_id: u32,
    window: usize,
    prefetch: u32,
    pub mr_cache: MrCache,
}

impl RndvEngine {
    pub fn new(window: usize, prefetch: u32, mr_cache_entries: usize) -> Self {
        Self {
            sends: HashMap::new(),
            recvs: HashMap::new(),
            next_send_id: 1,
            next_recv_id: 1,
            window: window.max(1),
            prefetch,
            mr_cache: MrCache::new(mr_cache_entries),
        }
    }

    pub fn counts(&self) -> RndvCounts {
        RndvCounts {
            sends: self.sends.len(),
            recvs: self.recvs.len(),
        }
    }

    pub fn max_outstanding(&self) -> usize {
        1 + self.prefetch as usize
    }

    pub fn send(&self, id: u32) -> Option<&SendTransfer> {
        self.sends.get(&id)
    }

    pub fn send_mut(&mut self, id: u32) -> Option<&mut SendTransfer> {
        self.sends.get_mut(&id)
    }

    pub fn recv(&self, id: u32) -> Option<&RecvTransfer> {
        self.recvs.get(&id)
    }

    pub fn recv_transfers(&self) -> impl Iterator<Item = &RecvTransfer> {
        self.recvs.values()
    }

    /// Ids of send transfers to `peer` with RDMA windows waiting to post.
    pub fn sends_with_granted(&self, peer: Epid) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .sends
            .values()
            .filter(|t| t.peer == peer && t.windows.values().any(|w| w.state == WindowState::Granted))
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether any transfer with `peer` is still running.
    pub fn has_transfers_with(&self, peer: Epid) -> bool {
        self.sends.values().any(|t| t.peer == peer) || self.recvs.values().any(|t| t.peer == peer)
    }

    pub fn start_send(&mut self, peer: Epid, data: Bytes, callback: Option<SendCallback>) -> u32 {
        let id = self.next_send_id;
        self.next_send_id = self.next_send_id.wrapping_add(1).max(1);
        self.sends.insert(
            id,
            SendTransfer {
                id,
                peer,
                data,
                recv_id: None,
                windows: BTreeMap::new(),
                completed: 0,
                mr: None,
                callback,
            },
        );
        id
    }

    fn alloc_recv_id(&mut self) -> u32 {
        loop {
            let id = self.next_recv_id;
            self.next_recv_id = (self.next_recv_id + 1) & RECV_ID_MASK;
            if self.next_recv_id == 0 {
                self.next_recv_id = 1;
            }
            if !self.recvs.contains_key(&id) {
                return id;
            }
        }
    }

    /// Creates the receive side of a matched RTS. A message longer than
    /// `capacity` is still pulled in full so the sender completes; the
    /// receive then fails with a truncation error.
    pub fn start_recv(&mut self, peer: Epid, send_id: u32, len: usize, capacity: usize) -> u32 {
        let id = self.alloc_recv_id();
        let nwindows = len.div_ceil(self.window) as u32;
        self.recvs.insert(
            id,
            RecvTransfer {
                id,
                peer,
                send_id,
                len,
                capacity,
                buf: Arc::new(Mutex::new(vec![0u8; len])),
                window_size: self.window,
                next_window: 0,
                nwindows,
                windows: BTreeMap::new(),
                completed: 0,
                peak_outstanding: 0,
                windows_granted: 0,
            },
        );
        id
    }

    /// Grants windows up to the outstanding bound and returns their CTS.
    pub fn grant_windows(
        &mut self,
        recv_id: u32,
        rdma_available: bool,
        transport: &mut dyn TransportStrategy,
        copy: &dyn CopyStrategy,
        stats: &ProtoStats,
    ) -> Result<Vec<CtsPayload>> {
        let bound = self.max_outstanding();
        let Some(transfer) = self.recvs.get_mut(&recv_id) else {
            return Ok(Vec::new());
        };
        let mut granted = Vec::new();
        while transfer.windows.len() < bound && transfer.next_window < transfer.nwindows {
            let window = transfer.next_window;
            let offset = window as usize * transfer.window_size;
            let len = transfer.window_size.min(transfer.len - offset);
            let rdma_available = rdma_available && window < IMM_WINDOW_LIMIT;
            let cache_room = self.mr_cache.has_room();
            if rdma_available && !cache_room {
                ProtoStats::inc(stats.mr_cache_full());
            }
            let mut strategy = copy.rendezvous_strategy(len, rdma_available && cache_room);
            let mut rkey = 0;
            if strategy == RndvStrategy::RdmaWrite {
                let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
                match transport.register_memory(&transfer.buf, offset, len, access) {
                    Ok(mr) => {
                        rkey = mr.rkey;
                        self.mr_cache.insert(recv_id, window, mr);
                    }
                    Err(e) => {
                        warn!(recv_id, window, error = %e, "window registration failed, using long data");
                        strategy = RndvStrategy::LongData;
                    }
                }
            }
            match strategy {
                RndvStrategy::RdmaWrite => ProtoStats::inc(stats.rdma_windows()),
                RndvStrategy::LongData => ProtoStats::inc(stats.long_data_windows()),
            }
            transfer.windows.insert(
                window,
                RecvWindow {
                    offset,
                    len,
                    strategy,
                    received: 0,
                },
            );
            transfer.next_window += 1;
            transfer.windows_granted += 1;
            transfer.peak_outstanding = transfer.peak_outstanding.max(transfer.windows.len());
            granted.push(CtsPayload {
                send_id: transfer.send_id,
                recv_id,
                window,
                offset: offset as u32,
                length: len as u32,
                strategy: match strategy {
                    RndvStrategy::RdmaWrite => CTS_RDMA_WRITE,
                    RndvStrategy::LongData => CTS_LONG_DATA,
                },
                rkey,
                remote_offset: 0,
            });
        }
        if !granted.is_empty() {
            debug!(recv_id, windows = granted.len(), outstanding = transfer.windows.len(), "granted rendezvous windows");
        }
        Ok(granted)
    }

    /// Records a CTS at the sender. Returns false for an unknown transfer or
    /// a repeated window.
    pub fn on_cts(&mut self, cts: CtsPayload) -> bool {
        let Some(transfer) = self.sends.get_mut(&cts.send_id) else {
            return false;
        };
        transfer.recv_id = Some(cts.recv_id);
        if transfer.windows.contains_key(&cts.window) {
            return false;
        }
        transfer.windows.insert(
            cts.window,
            SendWindow {
                cts,
                state: WindowState::Granted,
                acked: 0,
            },
        );
        true
    }

    pub fn mark_posted(&mut self, send_id: u32, window: u32) {
        if let Some(w) = self.sends.get_mut(&send_id).and_then(|t| t.windows.get_mut(&window)) {
            w.state = WindowState::Posted;
        }
    }

    /// Local completion of an RDMA write. A failed write returns its window
    /// to `Granted` so it is posted again.
    pub fn on_rdma_write_done(&mut self, send_id: u32, window: u32, success: bool, stats: &ProtoStats) -> Option<RndvDone> {
        let transfer = self.sends.get_mut(&send_id)?;
        if !success {
            if let Some(w) = transfer.windows.get_mut(&window) {
                w.state = WindowState::Granted;
                ProtoStats::inc(stats.rndv_retries());
                debug!(send_id, window, "rdma window will be retried");
            }
            return None;
        }
        let w = transfer.windows.remove(&window)?;
        transfer.completed += w.cts.length as usize;
        self.finish_send_if_done(send_id)
    }

    /// Acknowledged long-data bytes of one window of a send transfer.
    pub fn on_long_data_acked(&mut self, send_id: u32, window: u32, bytes: usize) -> Option<RndvDone> {
        let transfer = self.sends.get_mut(&send_id)?;
        let w = transfer.windows.get_mut(&window)?;
        w.acked += bytes;
        transfer.completed += bytes;
        if w.acked >= w.cts.length as usize {
            transfer.windows.remove(&window);
        }
        self.finish_send_if_done(send_id)
    }

    fn finish_send_if_done(&mut self, send_id: u32) -> Option<RndvDone> {
        if !self.sends.get(&send_id)?.is_complete() {
            return None;
        }
        let mut transfer = self.sends.remove(&send_id)?;
        let len = transfer.len();
        debug!(send_id, peer = %transfer.peer, len, "rendezvous send complete");
        Some(RndvDone::Send {
            peer: transfer.peer,
            callback: transfer.callback.take(),
            result: Ok(len),
            mr: transfer.mr.take().map(|(_, mr)| mr),
        })
    }

    /// Copies long-data payload into the receive buffer. Returns true if
    /// the packet completed its window.
    pub fn on_long_data(&mut self, recv_id: u32, offset: usize, payload: &[u8], copy: &dyn CopyStrategy) -> Option<bool> {
        let transfer = self.recvs.get_mut(&recv_id)?;
        let (&key, window) = transfer
            .windows
            .iter_mut()
            .find(|(_, w)| offset >= w.offset && offset < w.offset + w.len)?;
        let end = offset + payload.len();
        if end > window.offset + window.len {
            return None;
        }
        {
            let mut buf = transfer.buf.lock();
            copy.copy_from_wire(&mut buf[offset..end], payload);
        }
        window.received += payload.len();
        if window.received < window.len {
            return Some(false);
        }
        transfer.completed += window.len;
        transfer.windows.remove(&key);
        Some(true)
    }

    /// Handles the immediate of a completed RDMA write. Returns the receive
    /// transfer id if a window completed; the registration is released.
    pub fn on_rdma_imm(&mut self, imm: u32, transport: &mut dyn TransportStrategy) -> Option<u32> {
        let (recv_id, window) = decode_imm(imm);
        let transfer = self.recvs.get_mut(&recv_id)?;
        let w = transfer.windows.remove(&window)?;
        transfer.completed += w.len;
        if let Some(mr) = self.mr_cache.remove(recv_id, window) {
            transport.deregister_memory(mr);
        }
        Some(recv_id)
    }

    /// Removes a receive transfer whose bytes have all arrived.
    pub fn finish_recv_if_done(&mut self, recv_id: u32) -> Option<RndvDone> {
        let t = self.recvs.get(&recv_id)?;
        if !t.is_complete() || t.next_window < t.nwindows {
            return None;
        }
        let transfer = self.recvs.remove(&recv_id)?;
        let result = if transfer.len > transfer.capacity {
            Err(TransportError::MessageTruncated {
                size: transfer.len,
                capacity: transfer.capacity,
            })
        } else {
            Ok(())
        };
        debug!(recv_id, peer = %transfer.peer, len = transfer.len, "rendezvous receive complete");
        Some(RndvDone::Recv { transfer, result })
    }

    /// Abandons every transfer with `peer`, releasing registrations.
    pub fn fail_peer(&mut self, peer: Epid, reason: &str, transport: &mut dyn TransportStrategy) -> Vec<RndvDone> {
        let mut done = Vec::new();
        let send_ids: Vec<u32> = self.sends.values().filter(|t| t.peer == peer).map(|t| t.id).collect();
        for id in send_ids {
            if let Some(mut t) = self.sends.remove(&id) {
                if let Some((_, mr)) = t.mr.take() {
                    transport.deregister_memory(mr);
                }
                done.push(RndvDone::Send {
                    peer,
                    callback: t.callback.take(),
                    result: Err(TransportError::fatal(peer, reason)),
                    mr: None,
                });
            }
        }
        let recv_ids: Vec<u32> = self.recvs.values().filter(|t| t.peer == peer).map(|t| t.id).collect();
        for id in recv_ids {
            for mr in self.mr_cache.remove_transfer(id) {
                transport.deregister_memory(mr);
            }
            if let Some(transfer) = self.recvs.remove(&id) {
                done.push(RndvDone::Recv {
                    transfer,
                    result: Err(TransportError::fatal(peer, reason)),
                });
            }
        }
        done
    }
}

impl Proto {
    /// A posted receive matched an RTS: start pulling the message.
    pub(crate) fn start_rndv_recv(&mut self, recv: PostedRecv, src: Epid, send_id: u32, len: usize, now: Instant) -> Result<()> {
        let recv_id = self.rndv.start_recv(src, send_id, len, recv.capacity);
        self.rndv_recvs.insert(recv_id, recv.callback);
        debug!(recv_id, send_id, peer = %src, len, "rendezvous receive matched");
        self.rndv_progress(recv_id, now)
    }

    /// Completes a receive transfer or grants its next windows.
    pub(crate) fn rndv_progress(&mut self, recv_id: u32, now: Instant) -> Result<()> {
        if let Some(done) = self.rndv.finish_recv_if_done(recv_id) {
            self.finish_rndv(done);
            return Ok(());
        }
        let Some(peer) = self.rndv.recv(recv_id).map(|t| t.peer) else {
            return Ok(());
        };
        let rdma = self.cfg.rdma_enabled
            && self.is_reliable()
            && self
                .conns
                .get(&peer)
                .and_then(|c| c.rc_qps.active())
                .is_some_and(|rc| rc.is_ready());
        let granted = self
            .rndv
            .grant_windows(recv_id, rdma, self.transport.as_mut(), self.copy.as_ref(), &self.stats)?;
        let key = FlowKey::new(peer, FlowClass::Message);
        for cts in granted {
            let mut header = PacketHeader::new(Opcode::Cts, self.epid, FlowClass::Message.id());
            header.aux = cts.send_id;
            let scb = Scb::new(key, ScbKind::Message, header, Bytes::copy_from_slice(&cts.encode()), self.cfg.mtu);
            ProtoStats::inc(self.stats.cts_sent());
            self.queue_scb(key, scb, now)?;
        }
        Ok(())
    }

    pub(crate) fn on_cts(&mut self, peer: Epid, cts: CtsPayload, now: Instant) -> Result<()> {
        let in_range = self.rndv.send(cts.send_id).is_some_and(|t| {
            t.peer == peer
                && cts.length > 0
                && (cts.offset as usize)
                    .checked_add(cts.length as usize)
                    .is_some_and(|end| end <= t.len())
        });
        if !in_range {
            ProtoStats::inc(self.stats.invalid_packets());
            debug!(peer = %peer, send_id = cts.send_id, window = cts.window, "cts for unknown transfer or range");
            return Ok(());
        }
        if !self.rndv.on_cts(cts) {
            return Ok(());
        }
        if cts.strategy == CTS_RDMA_WRITE {
            self.post_rdma_windows(peer, now)
        } else {
            self.post_long_data(peer, cts, now)
        }
    }

    /// Queues a long-data window on the bulk flow.
    fn post_long_data(&mut self, peer: Epid, cts: CtsPayload, now: Instant) -> Result<()> {
        let Some(data) = self.rndv.send(cts.send_id).map(|t| t.data.clone()) else {
            return Ok(());
        };
        let key = FlowKey::new(peer, FlowClass::Bulk);
        let chunk = self.cfg.mtu * self.cfg.long_data_frags.max(1) as usize;
        let end = (cts.offset + cts.length) as usize;
        let mut offset = cts.offset as usize;
        while offset < end {
            let next = (offset + chunk).min(end);
            let mut header = PacketHeader::new(Opcode::LongData, self.epid, FlowClass::Bulk.id());
            header.aux = cts.recv_id;
            header.offset = offset as u32;
            header.msg_len = data.len() as u32;
            let kind = ScbKind::LongData {
                send_id: cts.send_id,
                window: cts.window,
                bytes: next - offset,
            };
            let scb = Scb::new(key, kind, header, data.slice(offset..next), self.cfg.mtu);
            self.queue_scb(key, scb, now)?;
            offset = next;
        }
        self.rndv.mark_posted(cts.send_id, cts.window);
        Ok(())
    }

    /// Posts every granted RDMA window to `peer` that the active QP can
    /// take. Windows stay granted while the connection is being rebound.
    pub(crate) fn post_rdma_windows(&mut self, peer: Epid, now: Instant) -> Result<()> {
        if !self.is_reliable() {
            return Ok(());
        }
        for send_id in self.rndv.sends_with_granted(peer) {
            let windows = self.rndv.send(send_id).map(|t| t.granted_rdma()).unwrap_or_default();
            for cts in windows {
                match self.post_rdma_window(peer, send_id, cts)? {
                    Some(PostStatus::NoResources) => {
                        let key = FlowKey::new(peer, FlowClass::Bulk);
                        self.timers.request(TimerKey::Send(key), now + self.cfg.send_retry());
                        return Ok(());
                    }
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
        }
        Ok(())
    }

    /// `None` when there is no usable QP to post on.
    fn post_rdma_window(&mut self, peer: Epid, send_id: u32, cts: CtsPayload) -> Result<Option<PostStatus>> {
        let Proto {
            conns,
            transport,
            rndv,
            stats,
            rdma_outstanding,
            ..
        } = self;
        let Some(rc) = conns
            .get_mut(&peer)
            .filter(|c| c.can_send())
            .and_then(|c| c.rc_qps.ready_mut())
        else {
            return Ok(None);
        };
        let Some(transfer) = rndv.send_mut(send_id) else {
            return Ok(Some(PostStatus::Posted));
        };
        let lkey = match &transfer.mr {
            Some((_, mr)) => mr.lkey,
            None => {
                let buf: SharedBuf = Arc::new(Mutex::new(transfer.data.to_vec()));
                let mr = transport.register_memory(&buf, 0, transfer.data.len(), AccessFlags::LOCAL_READ)?;
                let lkey = mr.lkey;
                transfer.mr = Some((buf, mr));
                lkey
            }
        };
        let start = cts.offset as usize;
        let end = start + cts.length as usize;
        let wr = SendWr {
            wr_id: WrId::new(WrKind::RdmaWrite, rdma_token(send_id, cts.window)),
            op: SendOp::RdmaWrite {
                data: &transfer.data[start..end],
                lkey,
                rkey: cts.rkey,
                remote_offset: cts.remote_offset as usize,
                imm: encode_imm(cts.recv_id, cts.window),
            },
            signaled: true,
        };
        let status = transport.post_send(rc.qp, wr)?;
        if status == PostStatus::NoResources {
            return Ok(Some(status));
        }
        rc.send_posted += 1;
        *rdma_outstanding += 1;
        rndv.mark_posted(send_id, cts.window);
        ProtoStats::inc(stats.rdma_writes_posted());
        trace!(peer = %peer, send_id, window = cts.window, len = cts.length, "rdma write posted");
        Ok(Some(status))
    }

    /// Hands a finished transfer to its callback.
    pub(crate) fn finish_rndv(&mut self, done: RndvDone) {
        match done {
            RndvDone::Send {
                callback, result, mr, ..
            } => {
                if let Some(mr) = mr {
                    self.transport.deregister_memory(mr);
                }
                if let Some(cb) = callback {
                    self.completed.push(Completed::Send(cb, result));
                }
            }
            RndvDone::Recv { transfer, result } => {
                let Some(cb) = self.rndv_recvs.remove(&transfer.id) else {
                    return;
                };
                let result = result.map(|()| Received {
                    src: transfer.peer,
                    data: transfer.take_data(),
                });
                self.completed.push(Completed::Recv(cb, result));
            }
        }
    }

    /// Abandons every transfer with `peer`, completing each with `make_err`.
    pub(crate) fn fail_rndv(&mut self, peer: Epid, make_err: &dyn Fn() -> TransportError) {
        let reason = make_err().to_string();
        let done = self.rndv.fail_peer(peer, &reason, self.transport.as_mut());
        for mut d in done {
            match &mut d {
                RndvDone::Send { result, .. } => *result = Err(make_err()),
                RndvDone::Recv { result, .. } => *result = Err(make_err()),
            }
            self.finish_rndv(d);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFabric;
    use crate::verbs::HostCopy;

    const MB: usize = 1024 * 1024;

    #[test]
    fn test_imm_and_token_packing() {
        assert_eq!(decode_imm(encode_imm(0x1234, 9)), (0x1234, 9));
        assert_eq!(split_rdma_token(rdma_token(77, 3)), (77, 3));
        let token = rdma_token(u32::MAX, 0xFFFF);
        assert!(token < 1 << 62);
        assert_eq!(split_rdma_token(token), (u32::MAX, 0xFFFF));
    }

    #[test]
    fn test_windows_bounded_by_prefetch() {
        let fabric = SimFabric::new();
        let mut nic = fabric.nic(Epid(1));
        let stats = ProtoStats::new();
        let mut engine = RndvEngine::new(MB, 1, 8);
        let id = engine.start_recv(Epid(2), 5, 10 * MB, 10 * MB);
        let cts = engine.grant_windows(id, false, &mut nic, &HostCopy, &stats).unwrap();
        assert_eq!(cts.len(), 2);
        assert!(cts.iter().all(|c| c.strategy == CTS_LONG_DATA));
        assert!(engine.grant_windows(id, false, &mut nic, &HostCopy, &stats).unwrap().is_empty());

        let payload = vec![7u8; MB];
        assert_eq!(engine.on_long_data(id, 0, &payload, &HostCopy), Some(true));
        let next = engine.grant_windows(id, false, &mut nic, &HostCopy, &stats).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].window, 2);
        assert_eq!(engine.recv(id).unwrap().peak_outstanding, 2);
    }

    #[test]
    fn test_mr_cache_full_falls_back_to_long_data() {
        let fabric = SimFabric::new();
        let mut nic = fabric.nic(Epid(1));
        let stats = ProtoStats::new();
        let mut engine = RndvEngine::new(MB, 2, 1);
        let id = engine.start_recv(Epid(2), 5, 3 * MB, 3 * MB);
        let cts = engine.grant_windows(id, true, &mut nic, &HostCopy, &stats).unwrap();
        assert_eq!(cts[0].strategy, CTS_RDMA_WRITE);
        assert_eq!(cts[1].strategy, CTS_LONG_DATA);
        assert_eq!(cts[2].strategy, CTS_LONG_DATA);
        assert_eq!(stats.snapshot().mr_cache_full, 2);
        assert_eq!(fabric.registered_regions(Epid(1)), 1);

        assert_eq!(engine.on_rdma_imm(encode_imm(id, 0), &mut nic), Some(id));
        assert!(engine.mr_cache.is_empty());
        assert_eq!(fabric.registered_regions(Epid(1)), 0);
    }

    #[test]
    fn test_windows_past_imm_limit_use_long_data() {
        let fabric = SimFabric::new();
        let mut nic = fabric.nic(Epid(1));
        let stats = ProtoStats::new();
        let window = 64;
        let nwindows = IMM_WINDOW_LIMIT as usize + 1;
        let mut engine = RndvEngine::new(window, 0, 8);
        let id = engine.start_recv(Epid(2), 1, window * nwindows, window * nwindows);
        let payload = [3u8; 64];
        let mut rdma = 0;
        loop {
            let cts = engine.grant_windows(id, true, &mut nic, &HostCopy, &stats).unwrap();
            let Some(cts) = cts.first() else {
                break;
            };
            if cts.strategy == CTS_RDMA_WRITE {
                assert!(cts.window < IMM_WINDOW_LIMIT);
                assert_eq!(engine.on_rdma_imm(encode_imm(id, cts.window), &mut nic), Some(id));
                rdma += 1;
            } else {
                assert!(cts.window >= IMM_WINDOW_LIMIT);
                assert_eq!(engine.on_long_data(id, cts.offset as usize, &payload, &HostCopy), Some(true));
            }
        }
        assert_eq!(rdma, IMM_WINDOW_LIMIT);
        assert_eq!(stats.snapshot().long_data_windows, 1);
        match engine.finish_recv_if_done(id) {
            Some(RndvDone::Recv { result: Ok(()), transfer }) => assert_eq!(transfer.windows_granted as usize, nwindows),
            _ => panic!("transfer should be complete"),
        }
        assert_eq!(fabric.registered_regions(Epid(1)), 0);
    }

    #[test]
    fn test_send_completes_after_all_windows() {
        let stats = ProtoStats::new();
        let mut engine = RndvEngine::new(4, 0, 4);
        let id = engine.start_send(Epid(2), Bytes::from(vec![1u8; 6]), None);
        let cts = |window, offset, length, strategy| CtsPayload {
            send_id: id,
            recv_id: 3,
            window,
            offset,
            length,
            strategy,
            rkey: 0,
            remote_offset: 0,
        };
        assert!(engine.on_cts(cts(0, 0, 4, CTS_RDMA_WRITE)));
        assert!(!engine.on_cts(cts(0, 0, 4, CTS_RDMA_WRITE)));
        assert_eq!(engine.sends_with_granted(Epid(2)), vec![id]);
        engine.mark_posted(id, 0);
        assert!(engine.on_rdma_write_done(id, 0, false, &stats).is_none());
        assert_eq!(engine.send(id).unwrap().granted_rdma().len(), 1);
        assert!(engine.on_rdma_write_done(id, 0, true, &stats).is_none());

        assert!(engine.on_cts(cts(1, 4, 2, CTS_LONG_DATA)));
        assert!(engine.on_long_data_acked(id, 1, 1).is_none());
        assert_eq!(engine.send(id).unwrap().windows[&1].acked, 1);
        match engine.on_long_data_acked(id, 1, 1) {
            Some(RndvDone::Send { result, .. }) => assert_eq!(result.unwrap(), 6),
            _ => panic!("send should be complete"),
        }
        assert_eq!(stats.snapshot().rndv_retries, 1);
        assert_eq!(engine.counts(), RndvCounts::default());
    }

    #[test]
    fn test_truncated_receive_reports_error() {
        let fabric = SimFabric::new();
        let mut nic = fabric.nic(Epid(1));
        let stats = ProtoStats::new();
        let mut engine = RndvEngine::new(8, 0, 0);
        let id = engine.start_recv(Epid(2), 1, 8, 4);
        engine.grant_windows(id, false, &mut nic, &HostCopy, &stats).unwrap();
        engine.on_long_data(id, 0, &[1u8; 8], &HostCopy);
        match engine.finish_recv_if_done(id) {
            Some(RndvDone::Recv { result: Err(TransportError::MessageTruncated { size: 8, capacity: 4 }), .. }) => {}
            _ => panic!("expected truncation"),
        }
    }

    #[test]
    fn test_fail_peer_releases_everything() {
        let fabric = SimFabric::new();
        let mut nic = fabric.nic(Epid(1));
        let stats = ProtoStats::new();
        let mut engine = RndvEngine::new(8, 0, 4);
        engine.start_send(Epid(2), Bytes::from_static(b"abc"), None);
        let id = engine.start_recv(Epid(2), 1, 16, 16);
        engine.grant_windows(id, true, &mut nic, &HostCopy, &stats).unwrap();
        engine.start_send(Epid(3), Bytes::from_static(b"xyz"), None);
        let done = engine.fail_peer(Epid(2), "gone", &mut nic);
        assert_eq!(done.len(), 2);
        assert_eq!(engine.counts().sends, 1);
        assert_eq!(fabric.registered_regions(Epid(1)), 0);
    }
}
