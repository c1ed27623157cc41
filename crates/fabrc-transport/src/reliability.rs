//! Acknowledgement, negative acknowledgement and retransmission.
//!
//! Receivers accept packets in PSN order. Packets ahead of the expected PSN
//! are held in a bounded reorder buffer instead of being dropped, so a single
//! loss costs a single retransmission. The receiver never guesses about a
//! gap: it reports one only when the sender asks with an ERR_CHK, or when
//! filling one gap reveals another.
//!
//! Senders release scbs on a cumulative ACK, queue exactly the missing scb
//! for retransmission on a NAK, and back off the ack timeout exponentially
//! each time an ERR_CHK goes unanswered.

use crate::flow::Flow;
use crate::psn::Psn;
use crate::scb::{Scb, ScbArena, ScbId};
use crate::wire::PacketHeader;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// A packet accepted off the wire.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum Arrival {
    /// In-order packet plus any buffered successors, in PSN order.
    Deliver(Vec<ReceivedPacket>),
    /// Already received; re-acknowledge.
    Duplicate,
    /// Ahead of a gap; held until the gap fills.
    Buffered,
    /// Ahead of a gap but outside the reorder window.
    Dropped,
}

/// Receive side of a flow.
#[derive(Debug)]
pub struct RecvState {
    expected: Psn,
    reorder: HashMap<u32, ReceivedPacket>,
    max_reorder: usize,
    /// Coalesced ACK owed at the end of the current receive batch.
    pub ack_pending: bool,
    /// A FECN-marked packet arrived in the current batch.
    pub becn_pending: bool,
}

/// Answer to an ERR_CHK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrChkReply {
    Ack { ack_psn: Psn },
    Nak { ack_psn: Psn, missing: Psn },
}

impl RecvState {
    pub fn new(max_reorder: usize) -> Self {
        Self {
            expected: Psn::new(0),
            reorder: HashMap::new(),
            max_reorder,
            ack_pending: false,
            becn_pending: false,
        }
    }

    pub fn expected(&self) -> Psn {
        self.expected
    }

    /// Last PSN received in order.
    pub fn last_received(&self) -> Psn {
        self.expected.prev()
    }

    pub fn has_gap(&self) -> bool {
        !self.reorder.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    pub fn accept(&mut self, packet: ReceivedPacket) -> Arrival {
        let distance = packet.header.psn.diff(self.expected);
        if distance < 0 {
            return Arrival::Duplicate;
        }
        if distance > 0 {
            let key = packet.header.psn.value();
            if self.reorder.contains_key(&key) {
                return Arrival::Duplicate;
            }
            if distance as usize > self.max_reorder || self.reorder.len() >= self.max_reorder {
                return Arrival::Dropped;
            }
            self.reorder.insert(key, packet);
            return Arrival::Buffered;
        }
        let mut ready = vec![packet];
        self.expected = self.expected.next();
        while let Some(next) = self.reorder.remove(&self.expected.value()) {
            ready.push(next);
            self.expected = self.expected.next();
        }
        Arrival::Deliver(ready)
    }

    /// Reply to an ERR_CHK carrying the sender's last posted PSN.
    pub fn err_chk_reply(&self, last_sent: Psn) -> ErrChkReply {
        if last_sent.diff(self.expected) < 0 {
            ErrChkReply::Ack {
                ack_psn: self.last_received(),
            }
        } else {
            ErrChkReply::Nak {
                ack_psn: self.last_received(),
                missing: self.expected,
            }
        }
    }

    /// Forgets all receive state, for a fresh connection.
    pub fn reset(&mut self) {
        self.expected = Psn::new(0);
        self.reorder.clear();
        self.ack_pending = false;
        self.becn_pending = false;
    }
}

/// Scbs released by an acknowledgement.
#[derive(Debug, Default)]
pub struct AckResult {
    pub released: Vec<Scb>,
    pub stale: bool,
}

/// Whether `ack_psn` acknowledges something we actually sent.
fn ack_in_window(flow: &Flow, ack_psn: Psn) -> bool {
    let oldest = flow.xmit_ack.prev();
    ack_psn.diff(oldest) >= 0 && ack_psn.diff(flow.xmit_seq) < 0
}

/// Releases every unacked scb whose last PSN is covered by `ack_psn`.
pub fn process_ack(flow: &mut Flow, scbs: &mut ScbArena, ack_psn: Psn) -> AckResult {
    let mut result = AckResult::default();
    if !ack_in_window(flow, ack_psn) {
        result.stale = true;
        return result;
    }
    while let Some(&id) = flow.unacked.front() {
        let Some(scb) = scbs.get(id) else {
            flow.unacked.pop_front();
            continue;
        };
        if scb.last_psn().is_after(ack_psn) {
            break;
        }
        flow.unacked.pop_front();
        flow.retransmit.retain(|r| *r != id);
        if let Some(scb) = scbs.remove(id) {
            flow.xmit_ack = scb.last_psn().next();
            flow.refund(scb.nfrag, scb.len());
            result.released.push(scb);
        }
    }
    result
}

/// Handles a NAK: acknowledges through `ack_psn` and queues the scb holding
/// `missing` for retransmission. Returns the queued scb, if any.
pub fn process_nak(
    flow: &mut Flow,
    scbs: &mut ScbArena,
    ack_psn: Psn,
    missing: Psn,
) -> (AckResult, Option<ScbId>) {
    let acked = if ack_psn == flow.xmit_ack.prev() {
        AckResult::default()
    } else {
        process_ack(flow, scbs, ack_psn)
    };
    if acked.stale {
        return (acked, None);
    }
    let target = flow.unacked.iter().copied().find(|id| {
        scbs.get(*id).is_some_and(|scb| {
            missing.diff(scb.psn) >= 0 && missing.diff(scb.last_psn()) <= 0
        })
    });
    let Some(id) = target else {
        return (acked, None);
    };
    if flow.retransmit.contains(&id) {
        return (acked, None);
    }
    if let Some(scb) = scbs.get_mut(id) {
        if !scb.is_fully_posted() {
            return (acked, None);
        }
        scb.frags_posted = 0;
        scb.retransmits += 1;
        debug!(flow = %flow.key, psn = %scb.psn, nfrag = scb.nfrag, "queued retransmit");
    }
    flow.retransmit.push_back(id);
    (acked, Some(id))
}

/// Queues every unacked scb for retransmission, oldest first. Used when
/// the transport they were posted on has failed and its contents are lost.
pub fn replay_unacked(flow: &mut Flow, scbs: &mut ScbArena) -> usize {
    let mut queued = 0;
    for id in flow.unacked.iter().copied() {
        if flow.retransmit.contains(&id) {
            continue;
        }
        let Some(scb) = scbs.get_mut(id) else {
            continue;
        };
        if !scb.is_fully_posted() {
            continue;
        }
        scb.frags_posted = 0;
        scb.retransmits += 1;
        flow.retransmit.push_back(id);
        queued += 1;
    }
    if queued > 0 {
        debug!(flow = %flow.key, queued, "replaying unacked packets");
    }
    queued
}

/// Next ack timeout after an unanswered ERR_CHK.
pub fn backoff(current: Duration, factor: u32, max: Duration) -> Duration {
    current.saturating_mul(factor.max(1)).min(max)
}

/// PSN an ERR_CHK advertises: the last packet posted on the flow.
pub fn err_chk_psn(flow: &Flow, scbs: &ScbArena) -> Psn {
    match flow.pending.front().and_then(|id| scbs.get(*id)) {
        Some(scb) => scb.psn.add(scb.frags_posted as u32).prev(),
        None => flow.xmit_seq.prev(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowCredits;
    use crate::flow::{CreditPolicy, FlowClass, FlowKey};
    use crate::scb::ScbKind;
    use crate::wire::{Epid, Opcode};

    fn packet(psn: u32) -> ReceivedPacket {
        let mut header = PacketHeader::new(Opcode::Data, Epid(1), 0);
        header.psn = Psn::new(psn);
        ReceivedPacket {
            header,
            payload: Bytes::new(),
        }
    }

    fn delivered_psns(arrival: Arrival) -> Vec<u32> {
        match arrival {
            Arrival::Deliver(pkts) => pkts.iter().map(|p| p.header.psn.value()).collect(),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let mut rs = RecvState::new(16);
        assert_eq!(delivered_psns(rs.accept(packet(0))), vec![0]);
        assert_eq!(delivered_psns(rs.accept(packet(1))), vec![1]);
        assert!(matches!(rs.accept(packet(0)), Arrival::Duplicate));
        assert_eq!(rs.last_received(), Psn::new(1));
    }

    #[test]
    fn test_gap_fill_releases_buffered() {
        let mut rs = RecvState::new(16);
        rs.accept(packet(0));
        assert!(matches!(rs.accept(packet(2)), Arrival::Buffered));
        assert!(matches!(rs.accept(packet(3)), Arrival::Buffered));
        assert!(matches!(rs.accept(packet(3)), Arrival::Duplicate));
        assert_eq!(
            rs.err_chk_reply(Psn::new(3)),
            ErrChkReply::Nak {
                ack_psn: Psn::new(0),
                missing: Psn::new(1)
            }
        );
        assert_eq!(delivered_psns(rs.accept(packet(1))), vec![1, 2, 3]);
        assert!(!rs.has_gap());
        assert_eq!(
            rs.err_chk_reply(Psn::new(3)),
            ErrChkReply::Ack { ack_psn: Psn::new(3) }
        );
    }

    #[test]
    fn test_reorder_window_bound() {
        let mut rs = RecvState::new(2);
        assert!(matches!(rs.accept(packet(5)), Arrival::Dropped));
        assert!(matches!(rs.accept(packet(1)), Arrival::Buffered));
        assert!(matches!(rs.accept(packet(2)), Arrival::Buffered));
        assert_eq!(rs.buffered(), 2);
    }

    fn sent_flow(n: usize, nfrag_len: usize) -> (Flow, ScbArena) {
        let policy = CreditPolicy {
            bounds: FlowCredits::fixed(64),
            inc_thresh: 8,
            jitter_mask: 0xF,
            start: 64,
            credit_bytes: None,
            ack_timeout: Duration::from_millis(1),
        };
        let key = FlowKey::new(Epid(2), FlowClass::Message);
        let mut flow = Flow::new(key, &policy, 64);
        let mut scbs = ScbArena::new();
        for _ in 0..n {
            let header = PacketHeader::new(Opcode::Data, Epid(1), 0);
            let id = scbs.insert(Scb::new(
                key,
                ScbKind::Message,
                header,
                Bytes::from(vec![0u8; nfrag_len]),
                8,
            ));
            flow.enqueue(&mut scbs, id);
        }
        while let Some(id) = flow.pending.pop_front() {
            let scb = scbs.get_mut(id).unwrap();
            scb.frags_posted = scb.nfrag;
            flow.credits -= scb.nfrag;
            flow.unacked.push_back(id);
        }
        (flow, scbs)
    }

    #[test]
    fn test_cumulative_ack() {
        let (mut flow, mut scbs) = sent_flow(5, 8);
        let res = process_ack(&mut flow, &mut scbs, Psn::new(2));
        assert_eq!(res.released.len(), 3);
        assert_eq!(flow.unacked.len(), 2);
        assert_eq!(flow.xmit_ack, Psn::new(3));
        assert_eq!(flow.credits_used(), 2);

        let res = process_ack(&mut flow, &mut scbs, Psn::new(2));
        assert!(res.released.is_empty());
        assert!(!res.stale);

        let res = process_ack(&mut flow, &mut scbs, Psn::new(40));
        assert!(res.stale);
    }

    #[test]
    fn test_ack_inside_multi_fragment_scb_holds_it() {
        let (mut flow, mut scbs) = sent_flow(2, 24);
        let res = process_ack(&mut flow, &mut scbs, Psn::new(4));
        assert_eq!(res.released.len(), 1);
        assert_eq!(flow.unacked.len(), 1);
    }

    #[test]
    fn test_nak_queues_only_missing_scb() {
        let (mut flow, mut scbs) = sent_flow(10, 8);
        let (acked, id) = process_nak(&mut flow, &mut scbs, Psn::new(1), Psn::new(2));
        assert_eq!(acked.released.len(), 2);
        let id = id.unwrap();
        assert_eq!(scbs.get(id).unwrap().psn, Psn::new(2));
        assert_eq!(scbs.get(id).unwrap().frags_posted, 0);
        assert_eq!(flow.retransmit.len(), 1);

        let (_, again) = process_nak(&mut flow, &mut scbs, Psn::new(1), Psn::new(2));
        assert!(again.is_none());
        assert_eq!(flow.retransmit.len(), 1);
    }

    #[test]
    fn test_replay_queues_all_unacked_once() {
        let (mut flow, mut scbs) = sent_flow(4, 8);
        process_nak(&mut flow, &mut scbs, Psn::new(0), Psn::new(1));
        assert_eq!(flow.retransmit.len(), 1);
        assert_eq!(replay_unacked(&mut flow, &mut scbs), 2);
        let psns: Vec<u32> = flow.retransmit.iter().map(|id| scbs.get(*id).unwrap().psn.value()).collect();
        assert_eq!(psns, vec![1, 2, 3]);
        assert_eq!(replay_unacked(&mut flow, &mut scbs), 0);
    }

    #[test]
    fn test_backoff_caps() {
        let max = Duration::from_millis(10);
        assert_eq!(backoff(Duration::from_millis(2), 2, max), Duration::from_millis(4));
        assert_eq!(backoff(Duration::from_millis(8), 2, max), max);
    }

    #[test]
    fn test_err_chk_psn_is_last_posted() {
        let (flow, scbs) = sent_flow(3, 8);
        assert_eq!(err_chk_psn(&flow, &scbs), Psn::new(2));
    }
}
