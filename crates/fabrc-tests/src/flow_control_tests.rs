//! Flow Control and Loss Recovery Tests
//!
//! Credit-limited delivery and ERR_CHK/NAK recovery between two engines.

#[cfg(test)]
mod tests {
    use crate::harness::{Outcomes, Pair, A, B};
    use bytes::Bytes;
    use fabrc_transport::wire::Opcode;
    use fabrc_transport::{FlowClass, FlowCredits, ProtoConfig, Received, Result};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn post_receives(pair: &mut Pair, n: usize) -> Outcomes<Result<Received>> {
        let got = Outcomes::new();
        let now = pair.now;
        for _ in 0..n {
            pair.b.receive(Some(A), 256, got.sink(), now).unwrap();
        }
        got
    }

    fn send_numbered(pair: &mut Pair, range: std::ops::Range<u8>) -> Outcomes<Result<usize>> {
        let sent = Outcomes::new();
        let now = pair.now;
        for i in range {
            pair.a.send(B, Bytes::from(vec![i; 16]), Some(sent.sink()), now).unwrap();
        }
        sent
    }

    fn payload_tags(got: Vec<Result<Received>>) -> Vec<u8> {
        got.into_iter().map(|r| r.unwrap().data[0]).collect()
    }

    #[test]
    fn test_credit_window_limits_packets_in_flight() {
        let cfg = ProtoConfig::default().with_flow_credits(FlowCredits::fixed(4));
        let mut pair = Pair::new(cfg).unwrap();
        assert!(pair.connect().unwrap());
        let got = post_receives(&mut pair, 10);

        let sent = send_numbered(&mut pair, 0..10);
        let flow = pair.a.connection(B).unwrap().flow(FlowClass::Message);
        assert_eq!(flow.credits_used(), 4);
        assert_eq!(flow.unacked.len(), 4);
        assert_eq!(flow.pending.len(), 6);

        assert!(pair.run_until(Duration::from_millis(1), 50, |_| sent.len() == 10).unwrap());
        assert_eq!(payload_tags(got.take()), (0..10).collect::<Vec<u8>>());
        let snap = pair.a.stats().snapshot();
        assert_eq!(snap.scbs_acked, 10);
        assert_eq!(snap.retransmits, 0);
        assert!(snap.no_flow_credits >= 1);
        assert_eq!(pair.a.connection(B).unwrap().flow(FlowClass::Message).credits_used(), 0);
        assert!(pair.a.flows_idle(B));
    }

    #[test]
    fn test_single_loss_recovered_by_one_retransmit() {
        let mut pair = Pair::new(ProtoConfig::default()).unwrap();
        assert!(pair.connect().unwrap());
        let got = post_receives(&mut pair, 10);

        let data_seen = Arc::new(AtomicUsize::new(0));
        let seen = data_seen.clone();
        pair.fabric.set_drop_filter(move |packet| {
            packet.first() == Some(&(Opcode::Data as u8)) && seen.fetch_add(1, Ordering::SeqCst) == 2
        });

        let sent = send_numbered(&mut pair, 0..10);
        pair.pump().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(pair.b.stats().snapshot().naks_sent, 0);

        assert!(pair.run_until(Duration::from_millis(1), 50, |_| sent.len() == 10).unwrap());
        assert_eq!(payload_tags(got.take()), (0..10).collect::<Vec<u8>>());
        assert_eq!(pair.fabric.stats().dropped, 1);
        let (a, b) = (pair.a.stats().snapshot(), pair.b.stats().snapshot());
        assert_eq!(a.err_chk_sent, 1);
        assert_eq!(b.naks_sent, 1);
        assert_eq!(a.retransmits, 1);
        assert_eq!(a.scbs_acked, 10);
        assert!(b.out_of_order_received >= 1);
    }

    #[test]
    fn test_lost_ack_answered_after_err_chk() {
        let mut pair = Pair::new(ProtoConfig::default()).unwrap();
        assert!(pair.connect().unwrap());
        let got = post_receives(&mut pair, 1);

        let acks_seen = Arc::new(AtomicUsize::new(0));
        let seen = acks_seen.clone();
        pair.fabric.set_drop_filter(move |packet| {
            packet.first() == Some(&(Opcode::Ack as u8)) && seen.fetch_add(1, Ordering::SeqCst) == 0
        });

        let sent = send_numbered(&mut pair, 7..8);
        pair.pump().unwrap();
        assert_eq!(got.len(), 1);
        assert!(sent.is_empty());

        assert!(pair.run_until(Duration::from_millis(1), 20, |_| sent.len() == 1).unwrap());
        assert_eq!(sent.take().pop().unwrap().unwrap(), 16);
        assert_eq!(pair.a.stats().snapshot().retransmits, 0);
        assert!(pair.a.stats().snapshot().err_chk_sent >= 1);
    }

    #[test]
    fn test_random_loss_delivers_everything_in_order() {
        let mut pair = Pair::new(ProtoConfig::default()).unwrap();
        assert!(pair.connect().unwrap());
        let got = post_receives(&mut pair, 100);
        pair.fabric.set_drop_rate(0.02);

        let mut rng = StdRng::seed_from_u64(17);
        let sent = Outcomes::new();
        let now = pair.now;
        for i in 0..100u8 {
            let len = rng.gen_range(1..=200);
            pair.a.send(B, Bytes::from(vec![i; len]), Some(sent.sink()), now).unwrap();
        }
        let done = pair
            .run_until(Duration::from_millis(1), 5000, |_| sent.len() == 100 && got.len() == 100)
            .unwrap();
        let snap = pair.a.stats().snapshot();
        assert!(done, "stalled: {}", serde_json::to_string(&snap).unwrap());
        assert_eq!(payload_tags(got.take()), (0..100).collect::<Vec<u8>>());
        assert!(sent.take().into_iter().all(|r| r.is_ok()));
        assert_eq!(snap.scbs_acked, 100);
    }
}
