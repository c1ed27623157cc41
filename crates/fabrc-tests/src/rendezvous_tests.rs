//! Rendezvous Tests
//!
//! Large transfers split into windows, over long data packets in datagram
//! mode and over RDMA writes on reliable QPs.

#[cfg(test)]
mod tests {
    use crate::harness::{Outcomes, Pair, A, B};
    use bytes::Bytes;
    use fabrc_transport::{ProtoConfig, Received, Result, TransportMode};
    use std::time::Duration;

    const MB: usize = 1 << 20;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Sends `len` bytes from A to B and returns the received data and the
    /// most windows B ever had outstanding at a check point.
    fn transfer(pair: &mut Pair, len: usize) -> (Vec<u8>, usize) {
        let got: Outcomes<Result<Received>> = Outcomes::new();
        let sent: Outcomes<Result<usize>> = Outcomes::new();
        let now = pair.now;
        pair.b.receive(Some(A), len, got.sink(), now).unwrap();
        pair.a.send(B, Bytes::from(pattern(len)), Some(sent.sink()), now).unwrap();

        let mut peak = 0;
        let done = pair
            .run_until(Duration::from_millis(1), 2000, |p| {
                let outstanding = p.b.rndv().recv_transfers().map(|t| t.windows.len()).max().unwrap_or(0);
                peak = peak.max(outstanding);
                got.len() == 1 && sent.len() == 1
            })
            .unwrap();
        assert!(done, "transfer did not finish");
        assert_eq!(sent.take().pop().unwrap().unwrap(), len);
        let received = got.take().pop().unwrap().unwrap();
        assert_eq!(received.src, A);
        (received.data, peak)
    }

    #[test]
    fn test_long_data_windows_without_prefetch() {
        let cfg = ProtoConfig::default().with_rendezvous(64 * 1024, MB, 0);
        let mut pair = Pair::new(cfg).unwrap();
        assert!(pair.connect().unwrap());
        let (data, peak) = transfer(&mut pair, 10 * MB);
        assert!(data == pattern(10 * MB));
        assert!(peak <= 1);
        let (a, b) = (pair.a.stats().snapshot(), pair.b.stats().snapshot());
        assert_eq!(a.rts_sent, 1);
        assert_eq!(b.cts_sent, 10);
        assert_eq!(b.long_data_windows, 10);
        assert_eq!(b.rdma_windows, 0);
        assert_eq!(pair.b.rndv().counts().recvs, 0);
        assert_eq!(pair.a.rndv().counts().sends, 0);
    }

    #[test]
    fn test_prefetch_bounds_outstanding_windows() {
        let cfg = ProtoConfig::default().with_rendezvous(64 * 1024, MB, 2);
        let mut pair = Pair::new(cfg).unwrap();
        assert!(pair.connect().unwrap());
        let (data, peak) = transfer(&mut pair, 10 * MB);
        assert!(data == pattern(10 * MB));
        assert!(peak <= 3);
        assert_eq!(pair.b.rndv().max_outstanding(), 3);
        assert_eq!(pair.b.stats().snapshot().cts_sent, 10);
    }

    #[test]
    fn test_rdma_windows_on_reliable_qps() {
        let cfg = ProtoConfig::default()
            .with_mode(TransportMode::Reliable)
            .with_rdma(true)
            .with_rendezvous(64 * 1024, MB, 1);
        let mut pair = Pair::new(cfg).unwrap();
        assert!(pair.connect().unwrap());
        let regions_before = pair.fabric.registered_regions(A);

        let (data, peak) = transfer(&mut pair, 4 * MB + 123);
        assert!(data == pattern(4 * MB + 123));
        assert!(peak <= 2);
        let (a, b) = (pair.a.stats().snapshot(), pair.b.stats().snapshot());
        assert_eq!(b.rdma_windows, 5);
        assert_eq!(b.long_data_windows, 0);
        assert_eq!(a.rdma_writes_posted, 5);
        assert_eq!(pair.fabric.registered_regions(A), regions_before);
        assert!(pair.fabric.stats().rdma_bytes >= (4 * MB + 123) as u64);
    }

    #[test]
    fn test_message_below_threshold_stays_eager() {
        let cfg = ProtoConfig::default().with_rendezvous(64 * 1024, MB, 0);
        let mut pair = Pair::new(cfg).unwrap();
        assert!(pair.connect().unwrap());
        let (data, _) = transfer(&mut pair, 32 * 1024);
        assert_eq!(data.len(), 32 * 1024);
        assert_eq!(pair.a.stats().snapshot().rts_sent, 0);
        assert_eq!(pair.b.stats().snapshot().cts_sent, 0);
    }
}
