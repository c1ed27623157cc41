//! Flows and the credit-window flow controller.
//!
//! A flow is one sequenced channel to a peer for one priority class. The
//! sender assigns PSNs when work is enqueued, posts pending scbs while the
//! credit window allows, and keeps posted scbs on the unacked list until the
//! reliability layer releases them.
//!
//! # Credit window
//!
//! `credits` is the number of packets that may still be posted without an
//! acknowledgement; `max_credits - credits` are in use. With adaptive
//! credits the window grows by a jittered step when the flow stays starved
//! across `credits_inc_thresh` PSNs, and shrinks by `adjust` on an ack
//! timeout or congestion notification, always within `[min, max]` of the
//! configured [`FlowCredits`].

use crate::config::{FlowCredits, ProtoConfig};
use crate::error::Result;
use crate::psn::{between, Psn};
use crate::reliability::RecvState;
use crate::scb::{ScbArena, ScbId};
use crate::stats::ProtoStats;
use crate::verbs::PostStatus;
use crate::wire::Epid;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Priority class of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowClass {
    /// Eager messages and rendezvous control.
    Message = 0,
    /// Rendezvous long data.
    Bulk = 1,
}

pub const NUM_FLOW_CLASSES: usize = 2;

impl FlowClass {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(FlowClass::Message),
            1 => Some(FlowClass::Bulk),
            _ => None,
        }
    }
}

/// Identifies a flow: remote endpoint plus class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub peer: Epid,
    pub class: FlowClass,
}

impl FlowKey {
    pub fn new(peer: Epid, class: FlowClass) -> Self {
        Self { peer, class }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.peer, self.class)
    }
}

/// Credit parameters shared by every flow of an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct CreditPolicy {
    pub bounds: FlowCredits,
    pub inc_thresh: u32,
    pub jitter_mask: u32,
    pub start: u16,
    pub credit_bytes: Option<u64>,
    pub ack_timeout: Duration,
}

impl CreditPolicy {
    pub fn from_config(cfg: &ProtoConfig) -> Self {
        Self {
            bounds: cfg.flow_credits,
            inc_thresh: cfg.credits_inc_thresh,
            jitter_mask: cfg.credits_jitter_mask,
            start: cfg.starting_credits(),
            credit_bytes: cfg.flow_credit_bytes,
            ack_timeout: cfg.ack_timeout(),
        }
    }
}

#[derive(Debug)]
pub struct Flow {
    pub key: FlowKey,
    /// PSN the next enqueued packet receives.
    pub xmit_seq: Psn,
    /// Oldest PSN not yet acknowledged.
    pub xmit_ack: Psn,
    pub credits: u16,
    pub max_credits: u16,
    pub credit_bytes: Option<i64>,
    max_credit_bytes: Option<i64>,
    /// PSN at which the window last grew or shrank.
    pub credits_inc_psn: Psn,
    /// Consecutive flush attempts stopped by the credit window.
    pub cc_count: u32,
    pub pending: VecDeque<ScbId>,
    pub unacked: VecDeque<ScbId>,
    /// Unacked scbs picked for retransmission by a NAK.
    pub retransmit: VecDeque<ScbId>,
    pub recv: RecvState,
}

impl Flow {
    pub fn new(key: FlowKey, policy: &CreditPolicy, max_reorder: usize) -> Self {
        let credit_bytes = policy.credit_bytes.map(|b| b as i64);
        Self {
            key,
            xmit_seq: Psn::new(0),
            xmit_ack: Psn::new(0),
            credits: policy.start,
            max_credits: policy.start,
            credit_bytes,
            max_credit_bytes: credit_bytes,
            credits_inc_psn: Psn::new(0),
            cc_count: 0,
            pending: VecDeque::new(),
            unacked: VecDeque::new(),
            retransmit: VecDeque::new(),
            recv: RecvState::new(max_reorder),
        }
    }

    pub fn credits_used(&self) -> u16 {
        self.max_credits - self.credits
    }

    /// Assigns PSNs to `id` and appends it to the pending list.
    pub fn enqueue(&mut self, scbs: &mut ScbArena, id: ScbId) {
        if let Some(scb) = scbs.get_mut(id) {
            scb.psn = self.xmit_seq;
            self.xmit_seq = self.xmit_seq.add(scb.nfrag as u32);
            self.pending.push_back(id);
        }
    }

    pub fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.retransmit.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.unacked.is_empty() && self.retransmit.is_empty()
    }

    fn has_credit_for(&self, nfrag: u16) -> bool {
        self.credits > 0
            && self.credits >= nfrag.min(self.max_credits)
            && self.credit_bytes.map_or(true, |b| b > 0)
    }

    fn consume(&mut self, nfrag: u16, bytes: usize) {
        self.credits = self.credits.saturating_sub(nfrag);
        if let Some(b) = self.credit_bytes.as_mut() {
            *b -= bytes as i64;
        }
    }

    /// Returns credits for released packets, never beyond the window.
    pub fn refund(&mut self, nfrag: u16, bytes: usize) {
        self.credits = self.credits.saturating_add(nfrag).min(self.max_credits);
        if let (Some(b), Some(max)) = (self.credit_bytes.as_mut(), self.max_credit_bytes) {
            *b = (*b + bytes as i64).min(max);
        }
    }

    /// Grows the window if the flow has been starved for long enough.
    pub fn maybe_grow(&mut self, policy: &CreditPolicy) -> bool {
        let bounds = policy.bounds;
        if !bounds.is_adaptive() || self.credits > 0 || self.max_credits >= bounds.max {
            return false;
        }
        let threshold_end = self.credits_inc_psn.add(policy.inc_thresh);
        if between(self.credits_inc_psn, threshold_end, self.xmit_seq) {
            return false;
        }
        let jittered = bounds.adjust as u32 + self.xmit_seq.low_bits(policy.jitter_mask);
        let step = jittered.min((bounds.max - self.max_credits) as u32) as u16;
        self.max_credits += step;
        self.credits += step;
        self.credits_inc_psn = self.xmit_seq;
        debug!(flow = %self.key, max_credits = self.max_credits, step, "flow credits grown");
        true
    }

    /// Shrinks the window toward the configured minimum.
    pub fn shrink(&mut self, policy: &CreditPolicy) -> bool {
        let bounds = policy.bounds;
        if !bounds.is_adaptive() || self.max_credits <= bounds.min {
            return false;
        }
        let step = bounds.adjust.min(self.max_credits - bounds.min);
        self.max_credits -= step;
        self.credits = self.credits.saturating_sub(step).min(self.max_credits);
        debug!(flow = %self.key, max_credits = self.max_credits, "flow credits shrunk");
        true
    }

    /// Restarts the send side at PSN 0 for a new connection. Nothing may be
    /// on the wire; pending scbs are renumbered when next enqueued.
    pub fn reset_send(&mut self, policy: &CreditPolicy) {
        debug_assert!(self.unacked.is_empty() && self.retransmit.is_empty());
        self.xmit_seq = Psn::new(0);
        self.xmit_ack = Psn::new(0);
        self.credits = policy.start;
        self.max_credits = policy.start;
        self.credit_bytes = policy.credit_bytes.map(|b| b as i64);
        self.max_credit_bytes = self.credit_bytes;
        self.credits_inc_psn = Psn::new(0);
        self.cc_count = 0;
    }
}

/// Posts the packets of one scb. Implemented by the protocol engine over
/// the send pool and the active QP.
pub trait PacketSink {
    /// Posts every fragment from `frags_posted` on. Returns `Posted` when the
    /// whole scb is on the wire, `NoResources` if it stopped part way.
    /// `signal_last` asks for a send completion on the final fragment.
    fn post_scb(&mut self, id: ScbId, scbs: &mut ScbArena, signal_last: bool) -> Result<PostStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing left to post.
    Drained,
    /// Pending work waits for the credit window.
    NoCredits,
    /// The NIC or the send pool refused a post.
    NoResources,
}

#[derive(Debug)]
pub struct FlushReport {
    pub outcome: FlushOutcome,
    pub posted: usize,
    pub retransmitted: usize,
    /// Scbs completed by reliable delivery; the caller releases them.
    pub delivered: Vec<ScbId>,
    /// Earliest new ack deadline, if any scb went on the wire.
    pub ack_deadline: Option<Instant>,
}

/// Posts retransmissions, then pending scbs while credits last.
pub fn flush(
    flow: &mut Flow,
    scbs: &mut ScbArena,
    sink: &mut dyn PacketSink,
    policy: &CreditPolicy,
    stats: &ProtoStats,
    now: Instant,
) -> Result<FlushReport> {
    let mut report = FlushReport {
        outcome: FlushOutcome::Drained,
        posted: 0,
        retransmitted: 0,
        delivered: Vec::new(),
        ack_deadline: None,
    };

    while let Some(&id) = flow.retransmit.front() {
        match sink.post_scb(id, scbs, true)? {
            PostStatus::NoResources => {
                ProtoStats::inc(stats.send_no_resources());
                report.outcome = FlushOutcome::NoResources;
                return Ok(report);
            }
            PostStatus::Posted | PostStatus::Delivered => {
                flow.retransmit.pop_front();
                report.retransmitted += 1;
                if let Some(scb) = scbs.get_mut(id) {
                    let deadline = now + scb.ack_timeout;
                    scb.abs_timeout = Some(deadline);
                    report.ack_deadline = Some(report.ack_deadline.map_or(deadline, |d| d.min(deadline)));
                }
            }
        }
    }

    while let Some(&id) = flow.pending.front() {
        let Some(scb) = scbs.get(id) else {
            flow.pending.pop_front();
            continue;
        };
        let (nfrag, len) = (scb.nfrag, scb.len());
        if scb.frags_posted == 0 && !flow.has_credit_for(nfrag) {
            flow.cc_count += 1;
            ProtoStats::inc(stats.no_flow_credits());
            if flow.maybe_grow(policy) {
                ProtoStats::inc(stats.credit_grows());
            }
            report.outcome = FlushOutcome::NoCredits;
            return Ok(report);
        }
        if scb.frags_posted == 0 {
            flow.consume(nfrag, len);
        }
        let signal_last = flow.pending.len() == 1;
        match sink.post_scb(id, scbs, signal_last)? {
            PostStatus::NoResources => {
                ProtoStats::inc(stats.send_no_resources());
                report.outcome = FlushOutcome::NoResources;
                return Ok(report);
            }
            PostStatus::Delivered => {
                flow.pending.pop_front();
                flow.refund(nfrag, len);
                report.delivered.push(id);
                report.posted += 1;
            }
            PostStatus::Posted => {
                flow.pending.pop_front();
                flow.unacked.push_back(id);
                flow.cc_count = 0;
                report.posted += 1;
                if let Some(scb) = scbs.get_mut(id) {
                    scb.ack_timeout = policy.ack_timeout * nfrag as u32;
                    let deadline = now + scb.ack_timeout;
                    scb.abs_timeout = Some(deadline);
                    report.ack_deadline = Some(report.ack_deadline.map_or(deadline, |d| d.min(deadline)));
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scb::{Scb, ScbKind};
    use crate::wire::{Opcode, PacketHeader};
    use bytes::Bytes;

    struct CountingSink {
        posted: Vec<Psn>,
        refuse_after: Option<usize>,
        delivered: bool,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                posted: Vec::new(),
                refuse_after: None,
                delivered: false,
            }
        }
    }

    impl PacketSink for CountingSink {
        fn post_scb(&mut self, id: ScbId, scbs: &mut ScbArena, _signal_last: bool) -> Result<PostStatus> {
            let scb = scbs.get_mut(id).unwrap();
            while scb.frags_posted < scb.nfrag {
                if self.refuse_after == Some(self.posted.len()) {
                    return Ok(PostStatus::NoResources);
                }
                self.posted.push(scb.psn.add(scb.frags_posted as u32));
                scb.frags_posted += 1;
            }
            Ok(if self.delivered {
                PostStatus::Delivered
            } else {
                PostStatus::Posted
            })
        }
    }

    fn policy(bounds: FlowCredits, start: u16) -> CreditPolicy {
        CreditPolicy {
            bounds,
            inc_thresh: 8,
            jitter_mask: 0xF,
            start,
            credit_bytes: None,
            ack_timeout: Duration::from_millis(1),
        }
    }

    fn setup(n: usize, len: usize, policy: &CreditPolicy) -> (Flow, ScbArena) {
        let key = FlowKey::new(Epid(9), FlowClass::Message);
        let mut flow = Flow::new(key, policy, 64);
        let mut scbs = ScbArena::new();
        for _ in 0..n {
            let header = PacketHeader::new(Opcode::Data, Epid(1), 0);
            let id = scbs.insert(Scb::new(key, ScbKind::Message, header, Bytes::from(vec![0u8; len]), 16));
            flow.enqueue(&mut scbs, id);
        }
        (flow, scbs)
    }

    #[test]
    fn test_flush_stops_at_credit_window() {
        let p = policy(FlowCredits::fixed(4), 4);
        let (mut flow, mut scbs) = setup(10, 8, &p);
        let stats = ProtoStats::new();
        let mut sink = CountingSink::new();
        let report = flush(&mut flow, &mut scbs, &mut sink, &p, &stats, Instant::now()).unwrap();
        assert_eq!(report.outcome, FlushOutcome::NoCredits);
        assert_eq!(report.posted, 4);
        assert_eq!(flow.credits_used(), 4);
        assert_eq!(flow.unacked.len(), 4);
        assert_eq!(flow.pending.len(), 6);
        assert_eq!(stats.snapshot().no_flow_credits, 1);
        assert!(report.ack_deadline.is_some());
    }

    #[test]
    fn test_multi_fragment_scb_consumes_nfrag() {
        let p = policy(FlowCredits::fixed(4), 4);
        let (mut flow, mut scbs) = setup(3, 40, &p);
        let stats = ProtoStats::new();
        let mut sink = CountingSink::new();
        let report = flush(&mut flow, &mut scbs, &mut sink, &p, &stats, Instant::now()).unwrap();
        assert_eq!(report.posted, 1);
        assert_eq!(sink.posted, vec![Psn::new(0), Psn::new(1), Psn::new(2)]);
        assert_eq!(flow.credits, 1);
        assert_eq!(flow.xmit_seq, Psn::new(9));
    }

    #[test]
    fn test_no_resources_keeps_head_pending() {
        let p = policy(FlowCredits::fixed(8), 8);
        let (mut flow, mut scbs) = setup(2, 40, &p);
        let stats = ProtoStats::new();
        let mut sink = CountingSink::new();
        sink.refuse_after = Some(4);
        let report = flush(&mut flow, &mut scbs, &mut sink, &p, &stats, Instant::now()).unwrap();
        assert_eq!(report.outcome, FlushOutcome::NoResources);
        assert_eq!(flow.unacked.len(), 1);
        assert_eq!(flow.pending.len(), 1);
        let head = scbs.get(flow.pending[0]).unwrap();
        assert_eq!(head.frags_posted, 1);
        assert_eq!(flow.credits, 2);

        sink.refuse_after = None;
        let report = flush(&mut flow, &mut scbs, &mut sink, &p, &stats, Instant::now()).unwrap();
        assert_eq!(report.outcome, FlushOutcome::Drained);
        assert_eq!(flow.credits, 2);
        assert_eq!(sink.posted.len(), 6);
    }

    #[test]
    fn test_delivered_refunds_credits() {
        let p = policy(FlowCredits::fixed(2), 2);
        let (mut flow, mut scbs) = setup(5, 8, &p);
        let stats = ProtoStats::new();
        let mut sink = CountingSink::new();
        sink.delivered = true;
        let report = flush(&mut flow, &mut scbs, &mut sink, &p, &stats, Instant::now()).unwrap();
        assert_eq!(report.outcome, FlushOutcome::Drained);
        assert_eq!(report.delivered.len(), 5);
        assert_eq!(flow.credits, 2);
        assert!(flow.unacked.is_empty());
    }

    #[test]
    fn test_grow_requires_psn_progress() {
        let bounds = FlowCredits { min: 2, max: 64, adjust: 2 };
        let p = policy(bounds, 4);
        let (mut flow, mut scbs) = setup(4, 8, &p);
        let stats = ProtoStats::new();
        let mut sink = CountingSink::new();
        flush(&mut flow, &mut scbs, &mut sink, &p, &stats, Instant::now()).unwrap();
        assert_eq!(flow.credits, 0);
        assert!(!flow.maybe_grow(&p));

        flow.xmit_seq = Psn::new(20);
        assert!(flow.maybe_grow(&p));
        assert_eq!(flow.max_credits, 4 + 2 + 4);
        assert_eq!(flow.credits, 6);
        assert_eq!(flow.credits_inc_psn, Psn::new(20));
    }

    #[test]
    fn test_shrink_toward_min() {
        let bounds = FlowCredits { min: 4, max: 16, adjust: 3 };
        let p = policy(bounds, 8);
        let (mut flow, _) = setup(0, 8, &p);
        assert!(flow.shrink(&p));
        assert_eq!(flow.max_credits, 5);
        assert!(flow.shrink(&p));
        assert_eq!(flow.max_credits, 4);
        assert!(!flow.shrink(&p));
        assert!(flow.credits <= flow.max_credits);
    }

    #[test]
    fn test_byte_credits_gate_flush() {
        let mut p = policy(FlowCredits::fixed(16), 16);
        p.credit_bytes = Some(20);
        let (mut flow, mut scbs) = setup(4, 16, &p);
        let stats = ProtoStats::new();
        let mut sink = CountingSink::new();
        let report = flush(&mut flow, &mut scbs, &mut sink, &p, &stats, Instant::now()).unwrap();
        assert_eq!(report.posted, 2);
        assert_eq!(report.outcome, FlushOutcome::NoCredits);
        flow.refund(1, 16);
        assert_eq!(flow.credit_bytes, Some(4));
    }
}
