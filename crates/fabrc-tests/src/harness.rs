//! Test Harness - two protocol engines over one simulated fabric

use bytes::Bytes;
use fabrc_transport::proto::Completed;
use fabrc_transport::wire::{self, ConnectPayload, Opcode, PacketHeader, HEADER_LEN};
use fabrc_transport::{
    verbs::{AccessFlags, MemHandle, QpKind, QpNum, SendOp, SendWr, SharedBuf, TransportStrategy, WrId, WrKind},
    ConnState, Epid, HostCopy, Proto, ProtoConfig, ProtoStats, Result, SimFabric, SimNic,
};
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

pub const A: Epid = Epid(1);
pub const B: Epid = Epid(2);

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber once per process. `RUST_LOG` selects
/// the level, warnings by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub fn engine(fabric: &SimFabric, epid: Epid, cfg: ProtoConfig) -> Result<Proto> {
    Proto::new(
        Box::new(fabric.nic(epid)),
        Box::new(HostCopy),
        cfg,
        Arc::new(ProtoStats::new()),
    )
}

/// Collects callback results in completion order.
pub struct Outcomes<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Outcomes<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: Send + 'static> Outcomes<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A callback that records its argument.
    pub fn sink(&self) -> Box<dyn FnOnce(T) + Send> {
        let items = self.items.clone();
        Box::new(move |v| items.lock().push(v))
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Default for Outcomes<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Two engines, A and B, driven by a shared virtual clock.
pub struct Pair {
    pub fabric: SimFabric,
    pub a: Proto,
    pub b: Proto,
    pub now: Instant,
}

impl Pair {
    pub fn new(cfg: ProtoConfig) -> Result<Self> {
        Self::with_configs(cfg.clone(), cfg)
    }

    pub fn with_configs(cfg_a: ProtoConfig, cfg_b: ProtoConfig) -> Result<Self> {
        init_tracing();
        let fabric = SimFabric::new();
        let a = engine(&fabric, A, cfg_a)?;
        let b = engine(&fabric, B, cfg_b)?;
        Ok(Self {
            fabric,
            a,
            b,
            now: Instant::now(),
        })
    }

    /// Polls both engines until neither makes progress, running every
    /// completed callback. Returns the total work done.
    pub fn pump(&mut self) -> Result<usize> {
        let mut total = 0;
        for _ in 0..64 {
            let n = self.a.poll_at(self.now)? + self.b.poll_at(self.now)?;
            let completed = self.run_completed();
            total += n + completed;
            if n == 0 && completed == 0 {
                break;
            }
        }
        Ok(total)
    }

    pub fn run_completed(&mut self) -> usize {
        let done: Vec<Completed> = self.a.take_completed().into_iter().chain(self.b.take_completed()).collect();
        let n = done.len();
        for c in done {
            c.run();
        }
        n
    }

    pub fn advance(&mut self, by: Duration) -> Result<usize> {
        self.now += by;
        self.pump()
    }

    /// Pumps, stepping the clock by `step` while idle, until `done` holds or
    /// `max_steps` clock steps have passed. Returns whether `done` held.
    pub fn run_until(&mut self, step: Duration, max_steps: usize, mut done: impl FnMut(&Pair) -> bool) -> Result<bool> {
        for _ in 0..max_steps {
            self.pump()?;
            if done(self) {
                return Ok(true);
            }
            self.now += step;
        }
        self.pump()?;
        Ok(done(self))
    }

    /// Connects A to B and waits for the outgoing side to come up.
    pub fn connect(&mut self) -> Result<bool> {
        let now = self.now;
        self.a.connect(B, now)?;
        self.run_until(Duration::from_millis(1), 100, |p| {
            p.a.connection_state(B).map(|(out, _)| out) == Some(ConnState::Connected)
        })
    }

    /// The active reliable QP of `epid` on the fabric, if any.
    pub fn live_rc_qp(&self, epid: Epid) -> Option<QpNum> {
        self.fabric
            .qps(epid)
            .into_iter()
            .filter(|(_, kind, state)| *kind == QpKind::Reliable && *state == fabrc_transport::sim::QpState::ReadyToSend)
            .map(|(qp, _, _)| qp)
            .last()
    }
}

/// A bare datagram port that speaks connection control by hand.
pub struct RawPeer {
    pub epid: Epid,
    nic: SimNic,
    qp: QpNum,
    mr: MemHandle,
    _buf: SharedBuf,
}

impl RawPeer {
    pub fn new(fabric: &SimFabric, epid: Epid, recv_slots: usize) -> Result<Self> {
        let mut nic = fabric.nic(epid);
        let qp = nic.create_qp(QpKind::Datagram)?;
        let buf: SharedBuf = Arc::new(Mutex::new(vec![0u8; 4096]));
        let mr = nic.register_memory(&buf, 0, 4096, AccessFlags::LOCAL_READ)?;
        for slot in 0..recv_slots {
            nic.post_recv(qp, slot as u64)?;
        }
        Ok(Self {
            epid,
            nic,
            qp,
            mr,
            _buf: buf,
        })
    }

    /// Sends a connection-control packet carrying `payload` to `dest`.
    pub fn send_control(&mut self, dest: Epid, opcode: Opcode, payload: ConnectPayload) -> Result<()> {
        let mut packet = vec![0u8; HEADER_LEN + ConnectPayload::LEN];
        wire::write_header(&mut packet, &PacketHeader::new(opcode, self.epid, 0))?;
        packet[HEADER_LEN..].copy_from_slice(&payload.encode());
        self.nic.post_send(
            self.qp,
            SendWr {
                wr_id: WrId::new(WrKind::Send, 0),
                op: SendOp::Send {
                    data: &packet,
                    lkey: self.mr.lkey,
                    dest: Some(dest),
                },
                signaled: false,
            },
        )?;
        Ok(())
    }

    /// Opcodes of every packet received so far.
    pub fn received(&mut self) -> Vec<Opcode> {
        self.nic
            .poll_recv_cq(1024)
            .into_iter()
            .filter_map(|wc| wc.data)
            .filter_map(|data: Bytes| wire::parse_packet(&data).ok().map(|(h, _)| h.opcode))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_connects() {
        let mut pair = Pair::new(ProtoConfig::default()).unwrap();
        assert!(pair.connect().unwrap());
        assert_eq!(pair.b.connection_state(A).map(|(_, inc)| inc), Some(ConnState::Connected));
    }

    #[test]
    fn test_outcomes_collects_in_order() {
        let outcomes: Outcomes<u32> = Outcomes::new();
        (outcomes.sink())(1);
        (outcomes.sink())(2);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes.take(), vec![1, 2]);
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_raw_peer_gets_connect_reply() {
        let mut pair = Pair::new(ProtoConfig::default()).unwrap();
        let mut raw = RawPeer::new(&pair.fabric, Epid(3), 8).unwrap();
        let payload = ConnectPayload {
            epoch: 7,
            reconnect_count: 0,
            qp_num: 0,
        };
        raw.send_control(B, Opcode::ConnectRequest, payload).unwrap();
        pair.pump().unwrap();
        assert_eq!(raw.received(), vec![Opcode::ConnectReply]);
        assert_eq!(
            pair.b.connection_state(Epid(3)).map(|(_, inc)| inc),
            Some(ConnState::Connected)
        );
    }
}
