//! Software fabric for testing without hardware.
//!
//! A [`SimFabric`] connects any number of [`SimNic`]s. Sends execute
//! synchronously at post time: the payload lands in the target's receive
//! completion queue and the sender gets its completion immediately. Reliable
//! QPs follow verbs error semantics closely enough for the drain protocol:
//! a QP in the error state flushes everything posted to it, and error
//! completions are reported even for unsignaled work requests.
//!
//! Faults are injected through the fabric handle: packet drop predicates,
//! random loss, QP errors, send-queue exhaustion and congestion marking.

use crate::error::{Result, TransportError};
use crate::verbs::{
    AccessFlags, Completion, EventSource, MemHandle, PostStatus, QpKind, QpNum, SendOp, SendWr,
    SharedBuf, TransportStrategy, WcOpcode, WcStatus, INVALID_LKEY,
};
use crate::wire::{self, Epid};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

impl Default for QpState {
    fn default() -> Self {
        Self::Reset
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FabricStats {
    pub packets: u64,
    pub dropped: u64,
    pub rnr_drops: u64,
    pub rdma_writes: u64,
    pub rdma_bytes: u64,
    pub error_completions: u64,
    pub fecn_marked: u64,
}

type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

struct SimQp {
    kind: QpKind,
    state: QpState,
    remote: Option<(Epid, QpNum)>,
    recv_posted: VecDeque<u64>,
}

struct SimMr {
    buf: SharedBuf,
    offset: usize,
    len: usize,
    access: AccessFlags,
}

#[derive(Default)]
struct SimNotifier {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl SimNotifier {
    fn notify(&self) {
        *self.ready.lock() = true;
        self.cond.notify_all();
    }
}

impl EventSource for SimNotifier {
    fn wait(&self, timeout: Duration) -> bool {
        let mut guard = self.ready.lock();
        self.cond.wait_while_for(&mut guard, |ready| !*ready, timeout);
        let was_ready = *guard;
        *guard = false;
        was_ready
    }
}

struct NicState {
    ud_qp: Option<QpNum>,
    qps: HashMap<QpNum, SimQp>,
    send_cq: VecDeque<Completion>,
    recv_cq: VecDeque<Completion>,
    mrs: HashMap<u32, SimMr>,
    send_budget: Option<usize>,
    reliable_hint: bool,
    notifier: Arc<SimNotifier>,
}

impl NicState {
    fn new() -> Self {
        Self {
            ud_qp: None,
            qps: HashMap::new(),
            send_cq: VecDeque::new(),
            recv_cq: VecDeque::new(),
            mrs: HashMap::new(),
            send_budget: None,
            reliable_hint: false,
            notifier: Arc::new(SimNotifier::default()),
        }
    }

    fn flush_recvs(&mut self, qp: QpNum) {
        let Some(q) = self.qps.get_mut(&qp) else {
            return;
        };
        while let Some(wr_id) = q.recv_posted.pop_front() {
            self.recv_cq.push_back(Completion {
                wr_id,
                status: WcStatus::FlushError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                qp_num: qp,
                imm: None,
                src: None,
                data: None,
            });
        }
        self.notifier.notify();
    }

    fn to_error(&mut self, qp: QpNum) {
        if let Some(q) = self.qps.get_mut(&qp) {
            q.state = QpState::Error;
        }
        self.flush_recvs(qp);
    }

    fn send_completion(&mut self, wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: usize, qp: QpNum) {
        self.send_cq.push_back(Completion {
            wr_id,
            status,
            opcode,
            byte_len: byte_len as u32,
            qp_num: qp,
            imm: None,
            src: None,
            data: None,
        });
    }
}

struct FabricState {
    nics: HashMap<Epid, NicState>,
    next_qp: QpNum,
    next_key: u32,
    drop_filter: Option<DropFilter>,
    drop_rate: f64,
    rng: StdRng,
    fecn_depth: Option<usize>,
    stats: FabricStats,
}

impl FabricState {
    /// Places a packet or immediate in the target's receive queue. Returns
    /// false if the target cannot take it.
    fn deliver(&mut self, target: Epid, qp: QpNum, src: Epid, data: Option<&[u8]>, imm: Option<u32>, byte_len: usize) -> bool {
        let fecn_depth = self.fecn_depth;
        let Some(nic) = self.nics.get_mut(&target) else {
            return false;
        };
        let Some(q) = nic.qps.get_mut(&qp) else {
            return false;
        };
        if q.state == QpState::Error {
            return false;
        }
        let Some(wr_id) = q.recv_posted.pop_front() else {
            self.stats.rnr_drops += 1;
            return false;
        };
        let data = data.map(|d| {
            let mut bytes = d.to_vec();
            if fecn_depth.is_some_and(|depth| nic.recv_cq.len() >= depth) {
                wire::mark_fecn(&mut bytes);
                self.stats.fecn_marked += 1;
            }
            Bytes::from(bytes)
        });
        nic.recv_cq.push_back(Completion {
            wr_id,
            status: WcStatus::Success,
            opcode: if imm.is_some() {
                WcOpcode::RecvRdmaWithImm
            } else {
                WcOpcode::Recv
            },
            byte_len: byte_len as u32,
            qp_num: qp,
            imm,
            src: Some(src),
            data,
        });
        nic.notifier.notify();
        true
    }

    fn should_drop(&mut self, data: &[u8]) -> bool {
        if let Some(filter) = self.drop_filter.as_mut() {
            if filter(data) {
                return true;
            }
        }
        self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate.min(1.0))
    }

    fn fail_local(&mut self, owner: Epid, qp: QpNum, wr_id: u64, status: WcStatus, opcode: WcOpcode) {
        self.stats.error_completions += 1;
        if let Some(nic) = self.nics.get_mut(&owner) {
            nic.send_completion(wr_id, status, opcode, 0, qp);
            if nic.qps.get(&qp).is_some_and(|q| q.kind == QpKind::Reliable) {
                nic.to_error(qp);
            }
        }
    }
}

/// Shared handle to a simulated fabric.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<Mutex<FabricState>>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    pub fn new() -> Self {
        Self::with_seed(0x5eed)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FabricState {
                nics: HashMap::new(),
                next_qp: 1,
                next_key: 1,
                drop_filter: None,
                drop_rate: 0.0,
                rng: StdRng::seed_from_u64(seed),
                fecn_depth: None,
                stats: FabricStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.inner.lock()
    }

    /// Attaches a NIC at `epid`.
    pub fn nic(&self, epid: Epid) -> SimNic {
        self.lock().nics.entry(epid).or_insert_with(NicState::new);
        SimNic {
            fabric: self.clone(),
            epid,
        }
    }

    /// Drops every packet for which `filter` returns true.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        self.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.lock().drop_filter = None;
    }

    pub fn set_drop_rate(&self, rate: f64) {
        self.lock().drop_rate = rate;
    }

    /// Marks FECN on packets arriving at a receive queue holding at least
    /// `depth` unpolled completions.
    pub fn set_congestion_depth(&self, depth: Option<usize>) {
        self.lock().fecn_depth = depth;
    }

    /// Limits how many more sends `epid` may post before the NIC reports a
    /// full send queue. `None` removes the limit.
    pub fn set_send_budget(&self, epid: Epid, budget: Option<usize>) {
        if let Some(nic) = self.lock().nics.get_mut(&epid) {
            nic.send_budget = budget;
        }
    }

    /// Reliable sends from `epid` report guaranteed delivery.
    pub fn set_reliable_hint(&self, epid: Epid, enabled: bool) {
        if let Some(nic) = self.lock().nics.get_mut(&epid) {
            nic.reliable_hint = enabled;
        }
    }

    /// Forces a QP into the error state as if the link had failed.
    pub fn inject_qp_error(&self, epid: Epid, qp: QpNum) {
        if let Some(nic) = self.lock().nics.get_mut(&epid) {
            nic.to_error(qp);
        }
    }

    /// QPs of a NIC with their kind and state, ordered by number.
    pub fn qps(&self, epid: Epid) -> Vec<(QpNum, QpKind, QpState)> {
        let st = self.lock();
        let mut out: Vec<_> = st
            .nics
            .get(&epid)
            .map(|nic| nic.qps.iter().map(|(n, q)| (*n, q.kind, q.state)).collect())
            .unwrap_or_default();
        out.sort_by_key(|(n, _, _)| *n);
        out
    }

    pub fn registered_regions(&self, epid: Epid) -> usize {
        self.lock().nics.get(&epid).map_or(0, |nic| nic.mrs.len())
    }

    pub fn stats(&self) -> FabricStats {
        self.lock().stats.clone()
    }
}

/// One NIC port on a [`SimFabric`].
pub struct SimNic {
    fabric: SimFabric,
    epid: Epid,
}

impl SimNic {
    pub fn fabric(&self) -> &SimFabric {
        &self.fabric
    }
}

impl TransportStrategy for SimNic {
    fn name(&self) -> &str {
        "sim"
    }

    fn local_epid(&self) -> Epid {
        self.epid
    }

    fn create_qp(&mut self, kind: QpKind) -> Result<QpNum> {
        let mut st = self.fabric.lock();
        let num = st.next_qp;
        st.next_qp += 1;
        let nic = st.nics.get_mut(&self.epid).ok_or_else(|| TransportError::Verbs {
            op: "create_qp",
            reason: format!("no nic at {}", self.epid),
        })?;
        let state = match kind {
            QpKind::Datagram => QpState::ReadyToSend,
            QpKind::Reliable => QpState::Init,
        };
        nic.qps.insert(
            num,
            SimQp {
                kind,
                state,
                remote: None,
                recv_posted: VecDeque::new(),
            },
        );
        if kind == QpKind::Datagram && nic.ud_qp.is_none() {
            nic.ud_qp = Some(num);
        }
        trace!(epid = %self.epid, qp = num, ?kind, "sim qp created");
        Ok(num)
    }

    fn connect_qp(&mut self, qp: QpNum, remote: Epid, remote_qp: QpNum) -> Result<()> {
        let mut st = self.fabric.lock();
        let q = st
            .nics
            .get_mut(&self.epid)
            .and_then(|nic| nic.qps.get_mut(&qp))
            .ok_or_else(|| TransportError::Verbs {
                op: "connect_qp",
                reason: format!("unknown qp {}", qp),
            })?;
        if q.state == QpState::Error {
            return Err(TransportError::Verbs {
                op: "connect_qp",
                reason: format!("qp {} is in error state", qp),
            });
        }
        q.remote = Some((remote, remote_qp));
        q.state = QpState::ReadyToSend;
        Ok(())
    }

    fn modify_qp_to_error(&mut self, qp: QpNum) -> Result<()> {
        let mut st = self.fabric.lock();
        let nic = st.nics.get_mut(&self.epid).ok_or_else(|| TransportError::Verbs {
            op: "modify_qp",
            reason: format!("no nic at {}", self.epid),
        })?;
        nic.to_error(qp);
        Ok(())
    }

    fn destroy_qp(&mut self, qp: QpNum) {
        let mut st = self.fabric.lock();
        if let Some(nic) = st.nics.get_mut(&self.epid) {
            nic.qps.remove(&qp);
            if nic.ud_qp == Some(qp) {
                nic.ud_qp = None;
            }
        }
    }

    fn post_send(&mut self, qp: QpNum, wr: SendWr<'_>) -> Result<PostStatus> {
        let owner = self.epid;
        let mut guard = self.fabric.lock();
        let st = &mut *guard;
        let wr_id = wr.wr_id.raw();
        let opcode = match wr.op {
            SendOp::Send { .. } => WcOpcode::Send,
            SendOp::RdmaWrite { .. } => WcOpcode::RdmaWrite,
        };

        let nic = st.nics.get_mut(&owner).ok_or_else(|| TransportError::Verbs {
            op: "post_send",
            reason: format!("no nic at {}", owner),
        })?;
        let (kind, state, remote) = match nic.qps.get(&qp) {
            Some(q) => (q.kind, q.state, q.remote),
            None => {
                return Err(TransportError::Verbs {
                    op: "post_send",
                    reason: format!("unknown qp {}", qp),
                })
            }
        };
        // A full send queue refuses work even when the QP is in error.
        if let Some(budget) = nic.send_budget.as_mut() {
            if *budget == 0 {
                return Ok(PostStatus::NoResources);
            }
            *budget -= 1;
        }
        if state == QpState::Error {
            st.stats.error_completions += 1;
            if let Some(nic) = st.nics.get_mut(&owner) {
                nic.send_completion(wr_id, WcStatus::FlushError, opcode, 0, qp);
            }
            return Ok(PostStatus::Posted);
        }
        let reliable_hint = nic.reliable_hint;
        let lkey = match wr.op {
            SendOp::Send { lkey, .. } | SendOp::RdmaWrite { lkey, .. } => lkey,
        };
        if lkey == INVALID_LKEY || !nic.mrs.contains_key(&lkey) {
            st.fail_local(owner, qp, wr_id, WcStatus::LocalProtectionError, opcode);
            return Ok(PostStatus::Posted);
        }

        match wr.op {
            SendOp::Send { data, dest, .. } => {
                let target = match kind {
                    QpKind::Datagram => {
                        let dest = dest.ok_or_else(|| TransportError::Verbs {
                            op: "post_send",
                            reason: "datagram send without destination".into(),
                        })?;
                        st.nics.get(&dest).and_then(|n| n.ud_qp).map(|q| (dest, q))
                    }
                    QpKind::Reliable => remote,
                };
                st.stats.packets += 1;
                match target {
                    Some((target_epid, target_qp)) => {
                        if st.should_drop(data) {
                            st.stats.dropped += 1;
                        } else {
                            let delivered = st.deliver(target_epid, target_qp, owner, Some(data), None, data.len());
                            if !delivered && kind == QpKind::Reliable {
                                st.fail_local(owner, qp, wr_id, WcStatus::RetryExceeded, opcode);
                                return Ok(PostStatus::Posted);
                            }
                        }
                    }
                    None if kind == QpKind::Reliable => {
                        st.fail_local(owner, qp, wr_id, WcStatus::RetryExceeded, opcode);
                        return Ok(PostStatus::Posted);
                    }
                    None => st.stats.dropped += 1,
                }
                if wr.signaled {
                    if let Some(nic) = st.nics.get_mut(&owner) {
                        nic.send_completion(wr_id, WcStatus::Success, opcode, data.len(), qp);
                    }
                }
                if kind == QpKind::Reliable && reliable_hint {
                    Ok(PostStatus::Delivered)
                } else {
                    Ok(PostStatus::Posted)
                }
            }
            SendOp::RdmaWrite {
                data,
                rkey,
                remote_offset,
                imm,
                ..
            } => {
                let Some((target_epid, target_qp)) = remote.filter(|_| kind == QpKind::Reliable) else {
                    st.fail_local(owner, qp, wr_id, WcStatus::RetryExceeded, opcode);
                    return Ok(PostStatus::Posted);
                };
                let region = st.nics.get(&target_epid).and_then(|n| n.mrs.get(&rkey)).and_then(|mr| {
                    let fits = remote_offset + data.len() <= mr.len;
                    (fits && mr.access.contains(AccessFlags::REMOTE_WRITE))
                        .then(|| (mr.buf.clone(), mr.offset + remote_offset))
                });
                let Some((buf, start)) = region else {
                    st.fail_local(owner, qp, wr_id, WcStatus::RemoteAccessError, opcode);
                    return Ok(PostStatus::Posted);
                };
                {
                    let mut target = buf.lock();
                    target[start..start + data.len()].copy_from_slice(data);
                }
                st.stats.rdma_writes += 1;
                st.stats.rdma_bytes += data.len() as u64;
                if !st.deliver(target_epid, target_qp, owner, None, Some(imm), data.len()) {
                    st.fail_local(owner, qp, wr_id, WcStatus::RetryExceeded, opcode);
                    return Ok(PostStatus::Posted);
                }
                if wr.signaled {
                    if let Some(nic) = st.nics.get_mut(&owner) {
                        nic.send_completion(wr_id, WcStatus::Success, opcode, data.len(), qp);
                    }
                }
                Ok(PostStatus::Posted)
            }
        }
    }

    fn post_recv(&mut self, qp: QpNum, wr_id: u64) -> Result<()> {
        let mut st = self.fabric.lock();
        let nic = st.nics.get_mut(&self.epid).ok_or_else(|| TransportError::Verbs {
            op: "post_recv",
            reason: format!("no nic at {}", self.epid),
        })?;
        let q = nic.qps.get_mut(&qp).ok_or_else(|| TransportError::Verbs {
            op: "post_recv",
            reason: format!("unknown qp {}", qp),
        })?;
        q.recv_posted.push_back(wr_id);
        if q.state == QpState::Error {
            nic.flush_recvs(qp);
        }
        Ok(())
    }

    fn poll_send_cq(&mut self, max_batch: usize) -> Vec<Completion> {
        let mut st = self.fabric.lock();
        match st.nics.get_mut(&self.epid) {
            Some(nic) => {
                let n = max_batch.min(nic.send_cq.len());
                nic.send_cq.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    fn poll_recv_cq(&mut self, max_batch: usize) -> Vec<Completion> {
        let mut st = self.fabric.lock();
        match st.nics.get_mut(&self.epid) {
            Some(nic) => {
                let n = max_batch.min(nic.recv_cq.len());
                nic.recv_cq.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    fn register_memory(
        &mut self,
        buf: &SharedBuf,
        offset: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemHandle> {
        let mut st = self.fabric.lock();
        let key = st.next_key;
        st.next_key += 1;
        let nic = st.nics.get_mut(&self.epid).ok_or_else(|| TransportError::Verbs {
            op: "register_memory",
            reason: format!("no nic at {}", self.epid),
        })?;
        nic.mrs.insert(
            key,
            SimMr {
                buf: buf.clone(),
                offset,
                len,
                access,
            },
        );
        Ok(MemHandle {
            lkey: key,
            rkey: key,
            offset,
            len,
        })
    }

    fn deregister_memory(&mut self, handle: MemHandle) {
        let mut st = self.fabric.lock();
        if let Some(nic) = st.nics.get_mut(&self.epid) {
            nic.mrs.remove(&handle.lkey);
        }
    }

    fn event_source(&self) -> Option<Arc<dyn EventSource>> {
        let st = self.fabric.lock();
        st.nics
            .get(&self.epid)
            .map(|nic| nic.notifier.clone() as Arc<dyn EventSource>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::{WrId, WrKind};

    fn region(nic: &mut SimNic, len: usize, access: AccessFlags) -> (SharedBuf, MemHandle) {
        let buf: SharedBuf = Arc::new(Mutex::new(vec![0u8; len]));
        let mr = nic.register_memory(&buf, 0, len, access).unwrap();
        (buf, mr)
    }

    fn send<'a>(data: &'a [u8], lkey: u32, dest: Option<Epid>, signaled: bool) -> SendWr<'a> {
        SendWr {
            wr_id: WrId::new(WrKind::Send, 1),
            op: SendOp::Send { data, lkey, dest },
            signaled,
        }
    }

    #[test]
    fn test_datagram_delivery() {
        let fabric = SimFabric::new();
        let mut a = fabric.nic(Epid(1));
        let mut b = fabric.nic(Epid(2));
        let qa = a.create_qp(QpKind::Datagram).unwrap();
        let qb = b.create_qp(QpKind::Datagram).unwrap();
        b.post_recv(qb, 77).unwrap();
        let (_, mr) = region(&mut a, 64, AccessFlags::LOCAL_WRITE);

        let status = a.post_send(qa, send(b"ping", mr.lkey, Some(Epid(2)), true)).unwrap();
        assert_eq!(status, PostStatus::Posted);
        let sent = a.poll_send_cq(8);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].status.is_success());

        let got = b.poll_recv_cq(8);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].wr_id, 77);
        assert_eq!(got[0].src, Some(Epid(1)));
        assert_eq!(got[0].data.as_deref(), Some(&b"ping"[..]));
    }

    #[test]
    fn test_unsignaled_success_has_no_completion() {
        let fabric = SimFabric::new();
        let mut a = fabric.nic(Epid(1));
        let _b = fabric.nic(Epid(2));
        let qa = a.create_qp(QpKind::Datagram).unwrap();
        let (_, mr) = region(&mut a, 64, AccessFlags::LOCAL_WRITE);
        a.post_send(qa, send(b"x", mr.lkey, Some(Epid(2)), false)).unwrap();
        assert!(a.poll_send_cq(8).is_empty());
        assert_eq!(fabric.stats().rnr_drops, 0);
    }

    #[test]
    fn test_drop_filter() {
        let fabric = SimFabric::new();
        let mut a = fabric.nic(Epid(1));
        let mut b = fabric.nic(Epid(2));
        let qa = a.create_qp(QpKind::Datagram).unwrap();
        let qb = b.create_qp(QpKind::Datagram).unwrap();
        b.post_recv(qb, 1).unwrap();
        b.post_recv(qb, 2).unwrap();
        let (_, mr) = region(&mut a, 64, AccessFlags::LOCAL_WRITE);
        fabric.set_drop_filter(|data| data == b"drop");
        a.post_send(qa, send(b"drop", mr.lkey, Some(Epid(2)), false)).unwrap();
        a.post_send(qa, send(b"keep", mr.lkey, Some(Epid(2)), false)).unwrap();
        let got = b.poll_recv_cq(8);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data.as_deref(), Some(&b"keep"[..]));
        assert_eq!(fabric.stats().dropped, 1);
    }

    #[test]
    fn test_error_qp_flushes_and_rejects_invalid_lkey() {
        let fabric = SimFabric::new();
        let mut a = fabric.nic(Epid(1));
        let mut b = fabric.nic(Epid(2));
        let qa = a.create_qp(QpKind::Reliable).unwrap();
        let qb = b.create_qp(QpKind::Reliable).unwrap();
        a.connect_qp(qa, Epid(2), qb).unwrap();
        b.connect_qp(qb, Epid(1), qa).unwrap();
        a.post_recv(qa, 10).unwrap();
        a.post_recv(qa, 11).unwrap();

        let marker = SendWr {
            wr_id: WrId::new(WrKind::DrainMarker, qa as u64),
            op: SendOp::Send {
                data: &[],
                lkey: INVALID_LKEY,
                dest: None,
            },
            signaled: true,
        };
        a.post_send(qa, marker).unwrap();
        let sent = a.poll_send_cq(8);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, WcStatus::LocalProtectionError);
        assert_eq!(WrId::from_raw(sent[0].wr_id).kind(), Some(WrKind::DrainMarker));

        let flushed = a.poll_recv_cq(8);
        assert_eq!(flushed.len(), 2);
        assert!(flushed.iter().all(|c| c.status == WcStatus::FlushError));
        assert_eq!(fabric.qps(Epid(1))[0].2, QpState::Error);
    }

    #[test]
    fn test_rdma_write_with_immediate() {
        let fabric = SimFabric::new();
        let mut a = fabric.nic(Epid(1));
        let mut b = fabric.nic(Epid(2));
        let qa = a.create_qp(QpKind::Reliable).unwrap();
        let qb = b.create_qp(QpKind::Reliable).unwrap();
        a.connect_qp(qa, Epid(2), qb).unwrap();
        b.connect_qp(qb, Epid(1), qa).unwrap();
        b.post_recv(qb, 5).unwrap();
        let (_, src_mr) = region(&mut a, 16, AccessFlags::LOCAL_WRITE);
        let (dst, dst_mr) = region(&mut b, 16, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE);

        let wr = SendWr {
            wr_id: WrId::new(WrKind::RdmaWrite, 9),
            op: SendOp::RdmaWrite {
                data: b"abcd",
                lkey: src_mr.lkey,
                rkey: dst_mr.rkey,
                remote_offset: 4,
                imm: 0xBEEF,
            },
            signaled: true,
        };
        assert_eq!(a.post_send(qa, wr).unwrap(), PostStatus::Posted);
        assert_eq!(&dst.lock()[4..8], b"abcd");
        let got = b.poll_recv_cq(4);
        assert_eq!(got[0].opcode, WcOpcode::RecvRdmaWithImm);
        assert_eq!(got[0].imm, Some(0xBEEF));
        assert_eq!(a.poll_send_cq(4)[0].opcode, WcOpcode::RdmaWrite);
    }

    #[test]
    fn test_send_budget() {
        let fabric = SimFabric::new();
        let mut a = fabric.nic(Epid(1));
        let _b = fabric.nic(Epid(2));
        let qa = a.create_qp(QpKind::Datagram).unwrap();
        let (_, mr) = region(&mut a, 64, AccessFlags::LOCAL_WRITE);
        fabric.set_send_budget(Epid(1), Some(1));
        assert_eq!(
            a.post_send(qa, send(b"1", mr.lkey, Some(Epid(2)), false)).unwrap(),
            PostStatus::Posted
        );
        assert_eq!(
            a.post_send(qa, send(b"2", mr.lkey, Some(Epid(2)), false)).unwrap(),
            PostStatus::NoResources
        );
    }

    #[test]
    fn test_event_source_signals_on_receive() {
        let fabric = SimFabric::new();
        let mut a = fabric.nic(Epid(1));
        let mut b = fabric.nic(Epid(2));
        let events = b.event_source().unwrap();
        assert!(!events.wait(Duration::from_millis(1)));
        let qa = a.create_qp(QpKind::Datagram).unwrap();
        let qb = b.create_qp(QpKind::Datagram).unwrap();
        b.post_recv(qb, 1).unwrap();
        let (_, mr) = region(&mut a, 8, AccessFlags::LOCAL_WRITE);
        a.post_send(qa, send(b"x", mr.lkey, Some(Epid(2)), false)).unwrap();
        assert!(events.wait(Duration::from_millis(1)));
    }
}
