//! Property-Based Tests for the transport core

use crate::harness::{engine, init_tracing, Outcomes, RawPeer, A, B};
use bytes::Bytes;
use fabrc_transport::buffer::{SendAllocator, SendPool};
use fabrc_transport::flow::{flush, CreditPolicy, Flow, PacketSink};
use fabrc_transport::psn::{between, Psn, PSN_MASK};
use fabrc_transport::reliability::process_ack;
use fabrc_transport::scb::{Scb, ScbArena, ScbId, ScbKind};
use fabrc_transport::verbs::PostStatus;
use fabrc_transport::wire::{ConnectPayload, Opcode, PacketHeader};
use fabrc_transport::{ConnState, Epid, FlowClass, FlowCredits, FlowKey, ProtoConfig, ProtoStats, Result, SimFabric, TransportMode};
use proptest::prelude::*;
use std::time::{Duration, Instant};

/// Posts every fragment and reports `Posted`.
struct WireSink;

impl PacketSink for WireSink {
    fn post_scb(&mut self, id: ScbId, scbs: &mut ScbArena, _signal_last: bool) -> Result<PostStatus> {
        if let Some(scb) = scbs.get_mut(id) {
            scb.frags_posted = scb.nfrag;
        }
        Ok(PostStatus::Posted)
    }
}

#[derive(Debug, Clone)]
enum FlowOp {
    /// Queue a message of this many fragments.
    Send(u16),
    /// Acknowledge this many of the oldest unacked scbs.
    Ack(usize),
    Shrink,
    Flush,
}

fn flow_op() -> impl Strategy<Value = FlowOp> {
    prop_oneof![
        4 => (1u16..4).prop_map(FlowOp::Send),
        3 => (1usize..6).prop_map(FlowOp::Ack),
        1 => Just(FlowOp::Shrink),
        2 => Just(FlowOp::Flush),
    ]
}

fn credit_policy(bounds: FlowCredits, start: u16) -> CreditPolicy {
    CreditPolicy {
        bounds,
        inc_thresh: 4,
        jitter_mask: 0x3,
        start,
        credit_bytes: None,
        ack_timeout: Duration::from_millis(2),
    }
}

fn run_flow_ops(flow: &mut Flow, scbs: &mut ScbArena, policy: &CreditPolicy, ops: &[FlowOp]) -> Result<()> {
    let stats = ProtoStats::new();
    let now = Instant::now();
    let key = flow.key;
    for op in ops {
        match op {
            FlowOp::Send(nfrag) => {
                let header = PacketHeader::new(Opcode::Data, A, 0);
                let payload = Bytes::from(vec![0u8; *nfrag as usize * 16]);
                let id = scbs.insert(Scb::new(key, ScbKind::Message, header, payload, 16));
                flow.enqueue(scbs, id);
                flush(flow, scbs, &mut WireSink, policy, &stats, now)?;
            }
            FlowOp::Ack(n) => {
                let target = flow.unacked.iter().take(*n).last().copied();
                if let Some(last) = target.and_then(|id| scbs.get(id)).map(|scb| scb.last_psn()) {
                    process_ack(flow, scbs, last);
                }
            }
            FlowOp::Shrink => {
                flow.shrink(policy);
            }
            FlowOp::Flush => {
                flush(flow, scbs, &mut WireSink, policy, &stats, now)?;
            }
        }
    }
    Ok(())
}

fn unacked_frags(flow: &Flow, scbs: &ScbArena) -> u16 {
    flow.unacked.iter().filter_map(|id| scbs.get(*id)).map(|scb| scb.nfrag).sum()
}

fn reliable_cfg() -> ProtoConfig {
    ProtoConfig::default()
        .with_mode(TransportMode::Reliable)
        .with_send_buffers(128, 4, 0)
}

proptest! {
    #[test]
    fn prop_psn_add_sub_inverse(start in 0u32..=PSN_MASK, n in 0u32..(1 << 30)) {
        let a = Psn::new(start);
        prop_assert_eq!(a.add(n).sub(n), a);
        prop_assert_eq!(a.add(n).diff(a), n as i32);
    }

    #[test]
    fn prop_psn_ordering_survives_wrap(start in (PSN_MASK - 1000)..=PSN_MASK, n in 1u32..(1 << 29), k in 0u32..(1 << 29)) {
        let a = Psn::new(start);
        let b = a.add(n);
        prop_assert!(b.is_after(a));
        prop_assert!(a.is_before(b));
        prop_assert!(b.value() <= PSN_MASK);
        let k = k % (n + 1);
        prop_assert!(between(a, b, a.add(k)));
        prop_assert!(!between(a, b, b.next()));
    }

    #[test]
    fn prop_send_buffers_free_in_allocation_order(coalesce in 1u32..8, n in 1usize..48, cut in 0usize..48) {
        let mut pool = SendPool::new(64, 64, coalesce).unwrap();
        let mut alloc = SendAllocator::new(coalesce);
        let mut handles = Vec::new();
        for i in 0..n.min(pool.total()) {
            let (handle, _) = pool.alloc(&mut alloc).unwrap();
            pool.attach_scb(handle, ScbId::from_parts(i as u32, 0)).unwrap();
            handles.push(handle);
        }
        let cut = cut % handles.len();
        let released = pool.free(&mut alloc, handles[cut], cut + 1).unwrap();
        prop_assert_eq!(released.count, cut + 1);
        let expected: Vec<ScbId> = (0..=cut).map(|i| ScbId::from_parts(i as u32, 0)).collect();
        prop_assert_eq!(released.scbs, expected);
        prop_assert_eq!(alloc.outstanding(), handles.len() - cut - 1);
        prop_assert_eq!(pool.num_outstanding(), handles.len() - cut - 1);
    }

    #[test]
    fn prop_send_buffer_free_rejects_short_count(n in 2usize..32, cut in 1usize..32) {
        let mut pool = SendPool::new(64, 64, 1).unwrap();
        let mut alloc = SendAllocator::new(1);
        let handles: Vec<_> = (0..n).map(|_| pool.alloc(&mut alloc).unwrap().0).collect();
        let cut = 1 + cut % (n - 1);
        prop_assert!(pool.free(&mut alloc, handles[cut], cut).is_err());
    }

    #[test]
    fn prop_adaptive_credits_stay_in_bounds(min in 1u16..8, extra in 0u16..24, adjust in 1u16..6, ops in prop::collection::vec(flow_op(), 1..80)) {
        let bounds = FlowCredits { min, max: min + extra, adjust };
        let policy = credit_policy(bounds, min);
        let mut flow = Flow::new(FlowKey::new(B, FlowClass::Message), &policy, 64);
        let mut scbs = ScbArena::new();
        run_flow_ops(&mut flow, &mut scbs, &policy, &ops).unwrap();
        prop_assert!(flow.max_credits >= bounds.min);
        prop_assert!(flow.max_credits <= bounds.max);
        prop_assert!(flow.credits <= flow.max_credits);
    }

    #[test]
    fn prop_fixed_credits_match_unacked_fragments(window in 1u16..16, ops in prop::collection::vec(flow_op(), 1..80)) {
        let policy = credit_policy(FlowCredits::fixed(window), window);
        let mut flow = Flow::new(FlowKey::new(B, FlowClass::Message), &policy, 64);
        let mut scbs = ScbArena::new();
        run_flow_ops(&mut flow, &mut scbs, &policy, &ops).unwrap();
        prop_assert_eq!(flow.max_credits, window);
        prop_assert_eq!(flow.credits_used(), unacked_frags(&flow, &scbs).min(window));
        prop_assert!(flow.credits_used() <= window);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_disconnect_replies_every_request(requests in 1usize..8) {
        init_tracing();
        let fabric = SimFabric::new();
        let mut b = engine(&fabric, B, ProtoConfig::default()).unwrap();
        let mut raw = RawPeer::new(&fabric, Epid(3), 2 * requests + 4).unwrap();
        let now = Instant::now();
        let hello = ConnectPayload { epoch: 11, reconnect_count: 0, qp_num: 0 };
        raw.send_control(B, Opcode::ConnectRequest, hello).unwrap();
        b.poll_at(now).unwrap();
        for _ in 0..requests {
            raw.send_control(B, Opcode::DisconnectRequest, hello).unwrap();
        }
        b.poll_at(now).unwrap();

        let replies = raw.received();
        prop_assert_eq!(replies.iter().filter(|op| **op == Opcode::ConnectReply).count(), 1);
        prop_assert_eq!(replies.iter().filter(|op| **op == Opcode::DisconnectReply).count(), requests);
        let snap = b.stats().snapshot();
        prop_assert_eq!(snap.disconnect_requests_received, requests as u64);
        prop_assert_eq!(snap.disconnect_replies_sent, requests as u64);
        prop_assert_eq!(b.connection_state(Epid(3)), Some((ConnState::None, ConnState::None)));
    }

    #[test]
    fn prop_drain_completes_every_send(messages in 1usize..24, steps in 0usize..4) {
        init_tracing();
        let fabric = SimFabric::new();
        let mut a = engine(&fabric, A, reliable_cfg()).unwrap();
        let mut b = engine(&fabric, B, reliable_cfg()).unwrap();
        let now = Instant::now();
        a.connect(B, now).unwrap();
        for _ in 0..8 {
            a.poll_at(now).unwrap();
            b.poll_at(now).unwrap();
        }
        let sent: Outcomes<Result<usize>> = Outcomes::new();
        for i in 0..messages {
            a.send(B, Bytes::from(vec![i as u8; 32]), Some(sent.sink()), now).unwrap();
        }
        for _ in 0..steps {
            a.poll_at(now).unwrap();
            b.poll_at(now).unwrap();
        }
        a.drain_all_qps().unwrap();
        for _ in 0..8 {
            a.poll_at(now).unwrap();
            b.poll_at(now).unwrap();
        }
        a.close();
        for c in a.take_completed() {
            c.run();
        }
        prop_assert_eq!(sent.len(), messages);
        prop_assert_eq!(a.inflight().rc_qps, 0);
        prop_assert!(a.stats().snapshot().drain_markers_posted >= 1);
    }
}
