//! Application-facing endpoint.
//!
//! An [`Endpoint`] wraps one [`Proto`] behind the progress lock. Each call
//! holds the lock for a whole state transition, collects the callbacks that
//! became ready and runs them after the lock is released, so a callback may
//! call back into the endpoint. Blocking calls spin on progress and give up
//! the CPU every `yield_spin_count` idle polls.
//!
//! The optional poll thread never touches protocol state. It waits on the
//! transport's event source and raises a flag; the next progress call
//! consumes it.

use crate::config::ProtoConfig;
use crate::connection::ConnState;
use crate::error::{Result, TransportError};
use crate::mq::{Received, RecvCallback};
use crate::proto::{Completed, InflightReport, Proto};
use crate::scb::SendCallback;
use crate::stats::ProtoStats;
use crate::verbs::{CopyStrategy, EventSource, TransportStrategy};
use crate::wire::Epid;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Default)]
struct PollSignal {
    ready: AtomicBool,
    stop: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl PollSignal {
    fn raise(&self) {
        self.ready.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn take(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }

    fn wait(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        if !self.ready.load(Ordering::Acquire) {
            self.cond.wait_for(&mut guard, timeout);
        }
    }
}

fn run_poll_thread(source: Arc<dyn EventSource>, signal: Arc<PollSignal>, interval: Duration) {
    while !signal.stop.load(Ordering::Acquire) {
        if source.wait(interval) {
            signal.raise();
        }
    }
}

struct Shared {
    epid: Epid,
    cfg: ProtoConfig,
    stats: Arc<ProtoStats>,
    proto: Mutex<Proto>,
    signal: Arc<PollSignal>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn stop_poller(&self) {
        self.signal.stop.store(true, Ordering::Release);
        if let Some(handle) = self.poller.lock().take() {
            if handle.join().is_err() {
                warn!(epid = %self.epid, "poll thread panicked");
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop_poller();
    }
}

/// Handle to an opened endpoint. Clones share the same engine.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("epid", &self.shared.epid).finish()
    }
}

impl Endpoint {
    /// Opens an endpoint on `transport`. A poll thread is started when the
    /// transport has an event source and `poll_thread_interval_us` is set.
    pub fn open(transport: Box<dyn TransportStrategy>, copy: Box<dyn CopyStrategy>, cfg: ProtoConfig) -> Result<Self> {
        let events = transport.event_source();
        let stats = Arc::new(ProtoStats::new());
        let proto = Proto::new(transport, copy, cfg.clone(), stats.clone())?;
        let epid = proto.epid();
        let signal = Arc::new(PollSignal::default());
        let poller = match events {
            Some(source) if cfg.poll_thread_interval_us > 0 => {
                let thread_signal = signal.clone();
                let interval = cfg.poll_thread_interval();
                let handle = std::thread::Builder::new()
                    .name(format!("fabrc-poll-{}", epid))
                    .spawn(move || run_poll_thread(source, thread_signal, interval))
                    .map_err(|e| TransportError::Verbs {
                        op: "spawn_poll_thread",
                        reason: e.to_string(),
                    })?;
                Some(handle)
            }
            _ => None,
        };
        info!(epid = %epid, poll_thread = poller.is_some(), "endpoint opened");
        Ok(Self {
            shared: Arc::new(Shared {
                epid,
                cfg,
                stats,
                proto: Mutex::new(proto),
                signal,
                poller: Mutex::new(poller),
            }),
        })
    }

    pub fn epid(&self) -> Epid {
        self.shared.epid
    }

    pub fn config(&self) -> &ProtoConfig {
        &self.shared.cfg
    }

    pub fn stats(&self) -> &Arc<ProtoStats> {
        &self.shared.stats
    }

    pub fn is_closed(&self) -> bool {
        self.shared.proto.lock().is_closed()
    }

    /// Whether the poll thread has seen receive activity since the last
    /// progress call.
    pub fn event_pending(&self) -> bool {
        self.shared.signal.ready.load(Ordering::Acquire)
    }

    /// Runs `op` under the progress lock, then the callbacks it readied.
    fn with_proto<T>(&self, op: impl FnOnce(&mut Proto) -> Result<T>) -> Result<T> {
        let (result, completed) = {
            let mut proto = self.shared.proto.lock();
            let result = op(&mut proto);
            (result, proto.take_completed())
        };
        run_completed(completed);
        result
    }

    /// One progress pass at the current time.
    pub fn make_progress(&self) -> Result<usize> {
        self.poll_at(Instant::now())
    }

    /// One progress pass at `now`. Tests drive time through this.
    pub fn poll_at(&self, now: Instant) -> Result<usize> {
        self.shared.signal.take();
        self.with_proto(|p| p.poll_at(now))
    }

    pub fn connect(&self, peer: Epid) -> Result<()> {
        self.with_proto(|p| p.connect(peer, Instant::now()))
    }

    /// Connects and waits until data can flow to `peer`.
    pub fn wait_connected(&self, peer: Epid, timeout: Duration) -> Result<()> {
        self.connect(peer)?;
        let connect_timeout_ms = self.shared.cfg.connect_timeout().as_millis() as u64;
        let deadline = Instant::now() + timeout;
        let outcome = self.spin(Some(deadline), || {
            let proto = self.shared.proto.lock();
            if let Some(reason) = proto.failed.get(&peer) {
                return Some(Err(TransportError::fatal(peer, reason.clone())));
            }
            match proto.connection(peer) {
                Some(c) if c.can_send() => Some(Ok(())),
                Some(c) if c.outgoing == ConnState::None => Some(Err(TransportError::ConnectionTimeout {
                    peer,
                    timeout_ms: connect_timeout_ms,
                })),
                _ => None,
            }
        })?;
        outcome.ok_or(TransportError::ConnectionTimeout {
            peer,
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    /// Queues a message. The callback runs once it is acknowledged.
    pub fn send(&self, peer: Epid, data: impl Into<Bytes>, callback: Option<SendCallback>) -> Result<()> {
        let data = data.into();
        self.with_proto(|p| p.send(peer, data, callback, Instant::now()))
    }

    /// Sends and waits for the acknowledgement. Returns the bytes sent.
    pub fn send_blocking(&self, peer: Epid, data: impl Into<Bytes>) -> Result<usize> {
        let slot: Arc<Mutex<Option<Result<usize>>>> = Arc::new(Mutex::new(None));
        let tx = slot.clone();
        self.send(peer, data, Some(Box::new(move |r| *tx.lock() = Some(r))))?;
        self.spin(None, || slot.lock().take())?
            .ok_or(TransportError::EndpointClosed)
    }

    /// Posts a receive for the next message from `src`, or from anyone.
    pub fn receive(&self, src: Option<Epid>, capacity: usize, callback: RecvCallback) -> Result<()> {
        self.with_proto(|p| p.receive(src, capacity, callback, Instant::now()))
    }

    pub fn receive_blocking(&self, src: Option<Epid>, capacity: usize) -> Result<Received> {
        let slot: Arc<Mutex<Option<Result<Received>>>> = Arc::new(Mutex::new(None));
        let tx = slot.clone();
        self.receive(src, capacity, Box::new(move |r| *tx.lock() = Some(r)))?;
        self.spin(None, || slot.lock().take())?
            .ok_or(TransportError::EndpointClosed)
    }

    /// Waits up to `timeout` for traffic to `peer` to be acknowledged, then
    /// closes the outgoing connection. Whatever is still queued fails with
    /// [`TransportError::NotConnected`].
    pub fn disconnect(&self, peer: Epid, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let idle = self.spin(Some(deadline), || self.shared.proto.lock().flows_idle(peer).then_some(Ok(())))?;
        if idle.is_none() {
            debug!(peer = %peer, "disconnecting with traffic in flight");
        }
        self.with_proto(|p| p.disconnect(peer, Instant::now()))?;
        let closing = |peer: Epid| {
            self.shared
                .proto
                .lock()
                .connection(peer)
                .is_some_and(|c| c.outgoing == ConnState::Disconnecting)
        };
        let limit = Instant::now() + self.shared.cfg.disconnect_timeout() + self.shared.cfg.disconnect_retry();
        self.spin(Some(limit), || (!closing(peer)).then_some(Ok(())))?;
        Ok(())
    }

    pub fn report_inflight(&self) -> InflightReport {
        self.shared.proto.lock().inflight()
    }

    pub fn connection_state(&self, peer: Epid) -> Option<(ConnState, ConnState)> {
        self.shared.proto.lock().connection_state(peer)
    }

    /// Closes the endpoint.
    ///
    /// Every outgoing connection is disconnected first. The endpoint then
    /// waits for peers to disconnect from it: for at most the grace period,
    /// and only while each grace interval brings a new inbound disconnect.
    /// Finally every reliable QP is drained and the engine torn down.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let start = Instant::now();
        let deadline = start + timeout;
        let peers = self.with_proto(|p| {
            let peers = p.peers();
            let now = Instant::now();
            for peer in &peers {
                p.disconnect(*peer, now)?;
            }
            Ok(peers)
        })?;
        let outgoing_closed = || {
            let proto = self.shared.proto.lock();
            peers
                .iter()
                .all(|peer| proto.connection(*peer).map_or(true, |c| c.outgoing == ConnState::None))
        };
        self.spin(Some(deadline), || outgoing_closed().then_some(Ok(())))?;

        let grace_end = start + self.shared.cfg.close_grace_period(timeout);
        let interval = self.shared.cfg.close_grace_interval(peers.len());
        let incoming_open = || {
            let proto = self.shared.proto.lock();
            peers
                .iter()
                .any(|peer| proto.connection(*peer).is_some_and(|c| c.incoming != ConnState::None))
        };
        while incoming_open() && Instant::now() < grace_end {
            let seen = self.shared.proto.lock().disconnects_received;
            let until = (Instant::now() + interval).min(grace_end);
            self.spin(Some(until), || (!incoming_open()).then_some(Ok(())))?;
            if self.shared.proto.lock().disconnects_received == seen {
                debug!(epid = %self.shared.epid, "no inbound disconnects during grace interval");
                break;
            }
        }

        let held = self.with_proto(|p| p.drain_all_qps())?;
        if held > 0 {
            let drain_deadline = Instant::now().max(deadline);
            self.spin(Some(drain_deadline), || {
                let remaining = self.shared.proto.lock().inflight().rc_qps;
                (remaining == 0).then_some(Ok(()))
            })?;
        }
        let report = self.report_inflight();
        self.with_proto(|p| {
            p.close();
            Ok(())
        })?;
        self.shared.stop_poller();
        info!(
            epid = %self.shared.epid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            rc_qps_left = report.rc_qps,
            scbs_left = report.scbs,
            "endpoint closed"
        );
        Ok(())
    }

    /// Polls until `done` yields a result or `deadline` passes. Returns
    /// `None` on deadline.
    fn spin<T>(&self, deadline: Option<Instant>, mut done: impl FnMut() -> Option<Result<T>>) -> Result<Option<T>> {
        let spins = self.shared.cfg.yield_spin_count.max(1);
        let has_poller = self.shared.poller.lock().is_some();
        let mut idle = 0u32;
        loop {
            if let Some(result) = done() {
                return result.map(Some);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            if self.make_progress()? > 0 {
                idle = 0;
                continue;
            }
            idle += 1;
            if idle >= spins {
                idle = 0;
                ProtoStats::inc(self.shared.stats.yields());
                if has_poller {
                    self.shared.signal.wait(self.shared.cfg.poll_thread_interval());
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }
}

fn run_completed(completed: Vec<Completed>) {
    for c in completed {
        c.run();
    }
}

/// The set of endpoints a process has open.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: Mutex<Vec<Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an endpoint and registers it.
    pub fn open(&self, transport: Box<dyn TransportStrategy>, copy: Box<dyn CopyStrategy>, cfg: ProtoConfig) -> Result<Endpoint> {
        let endpoint = Endpoint::open(transport, copy, cfg)?;
        self.endpoints.lock().push(endpoint.clone());
        Ok(endpoint)
    }

    pub fn get(&self, epid: Epid) -> Option<Endpoint> {
        self.endpoints.lock().iter().find(|e| e.epid() == epid).cloned()
    }

    pub fn epids(&self) -> Vec<Epid> {
        self.endpoints.lock().iter().map(|e| e.epid()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    /// Closes and unregisters one endpoint. Returns false if unknown.
    pub fn close(&self, epid: Epid, timeout: Duration) -> Result<bool> {
        let endpoint = {
            let mut endpoints = self.endpoints.lock();
            match endpoints.iter().position(|e| e.epid() == epid) {
                Some(pos) => endpoints.remove(pos),
                None => return Ok(false),
            }
        };
        endpoint.close(timeout)?;
        Ok(true)
    }

    /// Closes every endpoint, newest first. The first error is returned
    /// after all have been attempted.
    pub fn close_all(&self, timeout: Duration) -> Result<()> {
        let endpoints: Vec<Endpoint> = std::mem::take(&mut *self.endpoints.lock());
        let mut first_err = None;
        for endpoint in endpoints.into_iter().rev() {
            if let Err(e) = endpoint.close(timeout) {
                warn!(epid = %endpoint.epid(), error = %e, "endpoint close failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// One progress pass on every open endpoint.
    pub fn progress_all(&self) -> Result<usize> {
        let endpoints: Vec<Endpoint> = self.endpoints.lock().clone();
        let mut events = 0;
        for endpoint in endpoints.iter().filter(|e| !e.is_closed()) {
            events += endpoint.make_progress()?;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlowCredits, TransportMode};
    use crate::sim::SimFabric;
    use crate::verbs::HostCopy;

    fn cfg() -> ProtoConfig {
        ProtoConfig::default()
            .with_flow_credits(FlowCredits::fixed(16))
            .with_close_grace(Duration::from_millis(20), Duration::from_millis(5))
    }

    fn open(fabric: &SimFabric, epid: u64, cfg: ProtoConfig) -> Endpoint {
        Endpoint::open(Box::new(fabric.nic(Epid(epid))), Box::new(HostCopy), cfg).unwrap()
    }

    /// Runs `f` on another thread while the calling thread keeps `other`
    /// progressing.
    fn with_peer<T: Send + 'static>(other: &Endpoint, f: impl FnOnce() -> T + Send + 'static) -> T {
        let handle = std::thread::spawn(f);
        while !handle.is_finished() {
            other.make_progress().unwrap();
            std::thread::yield_now();
        }
        handle.join().unwrap()
    }

    #[test]
    fn test_blocking_send_and_receive() {
        let fabric = SimFabric::new();
        let a = open(&fabric, 1, cfg());
        let b = open(&fabric, 2, cfg());
        let sender = a.clone();
        let sent = with_peer(&b, move || sender.send_blocking(Epid(2), &b"ping"[..]));
        assert_eq!(sent.unwrap(), 4);
        let receiver = b.clone();
        let got = with_peer(&a, move || receiver.receive_blocking(Some(Epid(1)), 16)).unwrap();
        assert_eq!(got.data, b"ping");
        assert_eq!(a.stats().snapshot().messages_sent, 1);
    }

    #[test]
    fn test_wait_connected_in_reliable_mode() {
        let fabric = SimFabric::new();
        let reliable = cfg().with_mode(TransportMode::Reliable);
        let a = open(&fabric, 1, reliable.clone());
        let b = open(&fabric, 2, reliable);
        let client = a.clone();
        with_peer(&b, move || client.wait_connected(Epid(2), Duration::from_secs(5))).unwrap();
        let (outgoing, _) = a.connection_state(Epid(2)).unwrap();
        assert_eq!(outgoing, ConnState::Connected);
        assert_eq!(a.report_inflight().rc_qps, 1);
    }

    #[test]
    fn test_disconnect_waits_for_reply() {
        let fabric = SimFabric::new();
        let a = open(&fabric, 1, cfg());
        let b = open(&fabric, 2, cfg());
        let client = a.clone();
        with_peer(&b, move || client.send_blocking(Epid(2), &b"bye"[..])).unwrap();
        let client = a.clone();
        with_peer(&b, move || client.disconnect(Epid(2), Duration::from_secs(1))).unwrap();
        assert_eq!(a.connection_state(Epid(2)), Some((ConnState::None, ConnState::None)));
        assert_eq!(b.connection_state(Epid(1)), Some((ConnState::None, ConnState::None)));
        assert_eq!(b.stats().snapshot().disconnect_replies_sent, 1);
    }

    #[test]
    fn test_close_fails_pending_receive() {
        let fabric = SimFabric::new();
        let a = open(&fabric, 1, cfg());
        let slot = Arc::new(Mutex::new(None));
        let tx = slot.clone();
        a.receive(None, 8, Box::new(move |r| *tx.lock() = Some(r))).unwrap();
        a.close(Duration::from_millis(50)).unwrap();
        assert!(matches!(slot.lock().take(), Some(Err(TransportError::EndpointClosed))));
        assert!(matches!(a.make_progress(), Err(TransportError::EndpointClosed)));
        a.close(Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_callback_may_reenter_endpoint() {
        let fabric = SimFabric::new();
        let a = open(&fabric, 1, cfg());
        let b = open(&fabric, 2, cfg());
        let inner = b.clone();
        let echoed = Arc::new(AtomicBool::new(false));
        let flag = echoed.clone();
        b.receive(
            None,
            16,
            Box::new(move |r| {
                let msg = r.unwrap();
                inner.send(msg.src, msg.data, None).unwrap();
                flag.store(true, Ordering::SeqCst);
            }),
        )
        .unwrap();
        a.send(Epid(2), &b"echo"[..], None).unwrap();
        let receiver = a.clone();
        let got = with_peer(&b, move || receiver.receive_blocking(None, 16)).unwrap();
        assert!(echoed.load(Ordering::SeqCst));
        assert_eq!(got.src, Epid(2));
        assert_eq!(got.data, b"echo");
    }

    #[test]
    fn test_registry_progress_and_close_all() {
        let fabric = SimFabric::new();
        let registry = EndpointRegistry::new();
        let a = registry
            .open(Box::new(fabric.nic(Epid(1))), Box::new(HostCopy), cfg())
            .unwrap();
        registry
            .open(Box::new(fabric.nic(Epid(2))), Box::new(HostCopy), cfg())
            .unwrap();
        assert_eq!(registry.epids(), vec![Epid(1), Epid(2)]);
        a.send(Epid(2), &b"x"[..], None).unwrap();
        let mut events = 0;
        for _ in 0..10 {
            events += registry.progress_all().unwrap();
        }
        assert!(events > 0);
        assert!(registry.get(Epid(2)).unwrap().report_inflight().unexpected == 1);
        registry.close_all(Duration::from_millis(100)).unwrap();
        assert!(registry.is_empty());
        assert!(a.is_closed());
        assert!(!registry.close(Epid(1), Duration::ZERO).unwrap());
    }
}
