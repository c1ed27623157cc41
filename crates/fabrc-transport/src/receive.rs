//! Inbound packet dispatch.
//!
//! Sequenced packets pass the flow's receive state first and are delivered
//! strictly in PSN order. Acknowledgements are coalesced to one per flow per
//! receive batch unless the sender asked for one or a duplicate shows the
//! sender missed an earlier ack.

use crate::error::{Result, TransportError};
use crate::flow::{FlowClass, FlowKey};
use crate::mq::Unexpected;
use crate::proto::{Partial, Proto};
use crate::reliability::{process_ack, process_nak, Arrival, ErrChkReply, ReceivedPacket};
use crate::scb::Scb;
use crate::stats::ProtoStats;
use crate::wire::{self, ConnectPayload, CtsPayload, Opcode, PacketFlags, PacketHeader, HEADER_LEN};
use crate::connection::ConnState;
use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, trace};

impl Proto {
    pub(crate) fn handle_packet(&mut self, data: Bytes, now: Instant) -> Result<()> {
        let (header, body_len) = match wire::parse_packet(&data) {
            Ok((header, body)) => (header, body.len()),
            Err(TransportError::ChecksumMismatch { expected, computed }) => {
                ProtoStats::inc(self.stats.checksum_errors());
                debug!(expected, computed, "dropping packet with bad checksum");
                return Ok(());
            }
            Err(e) => {
                ProtoStats::inc(self.stats.invalid_packets());
                debug!(error = %e, len = data.len(), "dropping invalid packet");
                return Ok(());
            }
        };
        let payload = data.slice(HEADER_LEN..HEADER_LEN + body_len);
        ProtoStats::inc(self.stats.packets_received());
        ProtoStats::add(self.stats.bytes_received(), body_len as u64);
        let Some(class) = FlowClass::from_id(header.flow) else {
            ProtoStats::inc(self.stats.invalid_packets());
            debug!(flow = header.flow, opcode = ?header.opcode, "dropping packet for unknown flow");
            return Ok(());
        };
        let key = FlowKey::new(header.src, class);
        trace!(flow = %key, opcode = ?header.opcode, psn = %header.psn, len = body_len, "packet received");
        match header.opcode {
            Opcode::Data | Opcode::LongData | Opcode::Rts | Opcode::Cts => self.on_sequenced(key, header, payload, now),
            Opcode::Ack => self.on_ack(key, header, now),
            Opcode::Nak => self.on_nak(key, header, now),
            Opcode::Becn => {
                self.on_becn(key);
                Ok(())
            }
            Opcode::ErrChk => self.on_err_chk(key, header, now),
            Opcode::ConnectRequest => match ConnectPayload::decode(&payload) {
                Ok(p) => self.on_connect_request(header, p, now),
                Err(e) => self.drop_invalid(e),
            },
            Opcode::ConnectReply => match ConnectPayload::decode(&payload) {
                Ok(p) => self.on_connect_reply(header, p, now),
                Err(e) => self.drop_invalid(e),
            },
            Opcode::DisconnectRequest => match ConnectPayload::decode(&payload) {
                Ok(p) => self.on_disconnect_request(header, p, now),
                Err(e) => self.drop_invalid(e),
            },
            Opcode::DisconnectReply => match ConnectPayload::decode(&payload) {
                Ok(p) => self.on_disconnect_reply(header, p, now),
                Err(e) => self.drop_invalid(e),
            },
        }
    }

    fn drop_invalid(&self, err: TransportError) -> Result<()> {
        ProtoStats::inc(self.stats.invalid_packets());
        debug!(error = %err, "dropping malformed control packet");
        Ok(())
    }

    fn owe_ack(&mut self, key: FlowKey) {
        if !self.ack_owed.contains(&key) {
            self.ack_owed.push(key);
        }
    }

    fn on_sequenced(&mut self, key: FlowKey, header: PacketHeader, payload: Bytes, now: Instant) -> Result<()> {
        let coalesce = self.cfg.coalesce_acks;
        let Some(conn) = self.conns.get_mut(&key.peer).filter(|c| c.incoming == ConnState::Connected) else {
            debug!(flow = %key, psn = %header.psn, "sequenced packet without an incoming connection");
            return Ok(());
        };
        let recv = &mut conn.flow_mut(key.class).recv;
        if header.flags.contains(PacketFlags::FECN) {
            recv.becn_pending = true;
        }
        let had_gap = recv.has_gap();
        let arrival = recv.accept(ReceivedPacket { header, payload });
        let gap_remains = recv.has_gap();
        let (ack_psn, missing) = (recv.last_received(), recv.expected());
        let becn = recv.becn_pending;
        match arrival {
            Arrival::Deliver(packets) => {
                if had_gap && gap_remains {
                    self.send_nak(key, ack_psn, missing, now)?;
                } else if coalesce && !header.flags.contains(PacketFlags::ACK_REQ) {
                    if let Some(conn) = self.conns.get_mut(&key.peer) {
                        conn.flow_mut(key.class).recv.ack_pending = true;
                    }
                    self.owe_ack(key);
                } else {
                    self.send_ack(key, now)?;
                }
                for packet in packets {
                    self.deliver_packet(key, packet, now)?;
                }
            }
            Arrival::Duplicate => {
                ProtoStats::inc(self.stats.duplicates_received());
                self.send_ack(key, now)?;
            }
            Arrival::Buffered => ProtoStats::inc(self.stats.out_of_order_received()),
            Arrival::Dropped => {
                ProtoStats::inc(self.stats.reorder_overflow());
                debug!(flow = %key, psn = %header.psn, "packet beyond reorder window dropped");
            }
        }
        if becn {
            self.owe_ack(key);
        }
        Ok(())
    }

    fn deliver_packet(&mut self, key: FlowKey, packet: ReceivedPacket, now: Instant) -> Result<()> {
        let ReceivedPacket { header, payload } = packet;
        match header.opcode {
            Opcode::Data => {
                let total = header.msg_len as usize;
                if header.offset == 0 && payload.len() >= total {
                    self.partial.remove(&key);
                    return self.message_arrived(Unexpected::Eager {
                        src: key.peer,
                        data: payload,
                    }, now);
                }
                if header.offset == 0 {
                    self.partial.insert(
                        key,
                        Partial {
                            data: Vec::with_capacity(total),
                            len: total,
                        },
                    );
                }
                let Some(partial) = self.partial.get_mut(&key) else {
                    debug!(flow = %key, offset = header.offset, "fragment without message start");
                    return Ok(());
                };
                partial.data.extend_from_slice(&payload);
                if partial.data.len() < partial.len {
                    return Ok(());
                }
                if let Some(done) = self.partial.remove(&key) {
                    self.message_arrived(Unexpected::Eager {
                        src: key.peer,
                        data: Bytes::from(done.data),
                    }, now)?;
                }
                Ok(())
            }
            Opcode::Rts => self.message_arrived(
                Unexpected::Rts {
                    src: key.peer,
                    send_id: header.aux,
                    len: header.msg_len as usize,
                },
                now,
            ),
            Opcode::Cts => match CtsPayload::decode(&payload) {
                Ok(cts) => self.on_cts(key.peer, cts, now),
                Err(e) => self.drop_invalid(e),
            },
            Opcode::LongData => {
                let recv_id = header.aux;
                match self.rndv.on_long_data(recv_id, header.offset as usize, &payload, self.copy.as_ref()) {
                    Some(true) => self.rndv_progress(recv_id, now),
                    Some(false) => Ok(()),
                    None => {
                        debug!(recv_id, offset = header.offset, "long data for unknown window");
                        Ok(())
                    }
                }
            }
            other => {
                debug!(opcode = ?other, "unsequenced opcode on a flow");
                Ok(())
            }
        }
    }

    fn message_arrived(&mut self, msg: Unexpected, now: Instant) -> Result<()> {
        ProtoStats::inc(self.stats.messages_received());
        match self.mq.arrive(msg) {
            Some((recv, msg)) => self.complete_match(recv, msg, now),
            None => {
                ProtoStats::inc(self.stats.recv_no_match());
                Ok(())
            }
        }
    }

    /// Releases every scb an ACK covers.
    fn on_ack(&mut self, key: FlowKey, header: PacketHeader, now: Instant) -> Result<()> {
        ProtoStats::inc(self.stats.acks_received());
        let Some(conn) = self.conns.get_mut(&key.peer) else {
            return Ok(());
        };
        let flow = conn.flow_mut(key.class);
        let result = process_ack(flow, &mut self.scbs, header.ack_psn);
        if result.stale {
            ProtoStats::inc(self.stats.stale_acks());
            trace!(flow = %key, ack = %header.ack_psn, "stale ack");
            return Ok(());
        }
        let idle = flow.unacked.is_empty();
        self.release_acked(key, result.released, idle);
        self.flush_flow(key, now)
    }

    fn release_acked(&mut self, key: FlowKey, released: Vec<Scb>, idle: bool) {
        if idle {
            self.timers.cancel(crate::proto::TimerKey::Ack(key));
        }
        for scb in released {
            self.release_scb(scb, false);
        }
    }

    /// Acknowledges through the NAK's ack PSN and retransmits exactly the
    /// scb holding the missing PSN.
    fn on_nak(&mut self, key: FlowKey, header: PacketHeader, now: Instant) -> Result<()> {
        ProtoStats::inc(self.stats.naks_received());
        let Some(conn) = self.conns.get_mut(&key.peer) else {
            return Ok(());
        };
        let flow = conn.flow_mut(key.class);
        let (acked, queued) = process_nak(flow, &mut self.scbs, header.ack_psn, header.psn);
        if acked.stale {
            ProtoStats::inc(self.stats.stale_acks());
            return Ok(());
        }
        let idle = flow.unacked.is_empty();
        if queued.is_some() {
            debug!(flow = %key, missing = %header.psn, "nak queued retransmit");
        }
        self.release_acked(key, acked.released, idle);
        self.flush_flow(key, now)
    }

    fn on_becn(&mut self, key: FlowKey) {
        ProtoStats::inc(self.stats.becn_received());
        let policy = self.policy;
        if let Some(conn) = self.conns.get_mut(&key.peer) {
            let flow = conn.flow_mut(key.class);
            if flow.shrink(&policy) {
                ProtoStats::inc(self.stats.credit_shrinks());
            }
        }
    }

    /// Answers an ERR_CHK with the flow's actual receive state.
    fn on_err_chk(&mut self, key: FlowKey, header: PacketHeader, now: Instant) -> Result<()> {
        ProtoStats::inc(self.stats.err_chk_received());
        let Some(conn) = self.conns.get(&key.peer).filter(|c| c.incoming == ConnState::Connected) else {
            return Ok(());
        };
        match conn.flow(key.class).recv.err_chk_reply(header.psn) {
            ErrChkReply::Ack { .. } => self.send_ack(key, now),
            ErrChkReply::Nak { ack_psn, missing } => self.send_nak(key, ack_psn, missing, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{FlowCredits, ProtoConfig};
    use crate::flow::FlowClass;
    use crate::proto::Proto;
    use crate::sim::SimFabric;
    use crate::stats::ProtoStats;
    use crate::verbs::HostCopy;
    use crate::wire::{self, Epid, Opcode, PacketHeader, HEADER_LEN};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn engine(fabric: &SimFabric, epid: u64, cfg: ProtoConfig) -> Proto {
        Proto::new(
            Box::new(fabric.nic(Epid(epid))),
            Box::new(HostCopy),
            cfg,
            Arc::new(ProtoStats::new()),
        )
        .unwrap()
    }

    fn pump(a: &mut Proto, b: &mut Proto, now: Instant) {
        for _ in 0..32 {
            if a.poll_at(now).unwrap() + b.poll_at(now).unwrap() == 0 {
                break;
            }
        }
    }

    fn cfg() -> ProtoConfig {
        ProtoConfig::default()
            .with_flow_credits(FlowCredits::fixed(16))
            .with_send_buffers(64, 1, 0)
            .with_mtu(256)
    }

    #[test]
    fn test_multi_fragment_message_reassembled() {
        let fabric = SimFabric::new();
        let mut a = engine(&fabric, 1, cfg());
        let mut b = engine(&fabric, 2, cfg());
        let now = Instant::now();
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        a.send(Epid(2), Bytes::from(data.clone()), None, now).unwrap();
        pump(&mut a, &mut b, now);
        let got = Arc::new(parking_lot::Mutex::new(None));
        let slot = got.clone();
        b.receive(None, 4096, Box::new(move |r| *slot.lock() = Some(r)), now)
            .unwrap();
        for c in b.take_completed() {
            c.run();
        }
        assert_eq!(got.lock().take().unwrap().unwrap().data, data);
    }

    #[test]
    fn test_lost_packet_recovered_by_err_chk() {
        let fabric = SimFabric::new();
        let mut a = engine(&fabric, 1, cfg().with_checksum(true));
        let mut b = engine(&fabric, 2, cfg().with_checksum(true));
        let mut now = Instant::now();
        a.connect(Epid(2), now).unwrap();
        pump(&mut a, &mut b, now);

        let mut dropped = false;
        fabric.set_drop_filter(move |pkt| {
            let data = pkt.len() > HEADER_LEN && pkt[0] == Opcode::Data as u8;
            let first = data && !dropped;
            dropped |= first;
            first
        });
        a.send(Epid(2), Bytes::from_static(b"abcd"), None, now).unwrap();
        pump(&mut a, &mut b, now);
        assert_eq!(b.inflight().unexpected, 0);

        now += Duration::from_millis(50);
        pump(&mut a, &mut b, now);
        assert_eq!(b.inflight().unexpected, 1);
        let stats = a.stats().snapshot();
        assert_eq!(stats.err_chk_sent, 1);
        assert_eq!(stats.retransmits, 1);
    }

    #[test]
    fn test_congestion_mark_shrinks_sender_window() {
        let fabric = SimFabric::new();
        let credits = FlowCredits {
            min: 4,
            max: 16,
            adjust: 2,
        };
        let mut a = engine(&fabric, 1, cfg().with_flow_credits(credits));
        let mut b = engine(&fabric, 2, cfg().with_flow_credits(credits));
        let now = Instant::now();
        a.connect(Epid(2), now).unwrap();
        pump(&mut a, &mut b, now);
        let flow = |p: &Proto| p.connection(Epid(2)).unwrap().flow(FlowClass::Message).max_credits;
        let before = flow(&a);

        fabric.set_congestion_depth(Some(1));
        for _ in 0..4 {
            a.send(Epid(2), Bytes::from_static(b"load"), None, now).unwrap();
        }
        pump(&mut a, &mut b, now);

        assert!(fabric.stats().fecn_marked >= 1);
        assert!(b.stats().snapshot().becn_sent >= 1);
        let snap = a.stats().snapshot();
        assert!(snap.becn_received >= 1);
        assert!(snap.credit_shrinks >= 1);
        assert!(flow(&a) < before);
        assert!(flow(&a) >= credits.min);
    }

    #[test]
    fn test_bad_checksum_counted() {
        let fabric = SimFabric::new();
        let mut b = engine(&fabric, 2, cfg().with_checksum(true));
        let mut buf = vec![0u8; HEADER_LEN + 8 + wire::CHECKSUM_LEN];
        let header = PacketHeader::new(Opcode::Data, Epid(1), 0);
        wire::write_header(&mut buf, &header).unwrap();
        let mut flags = header.flags;
        flags.insert(wire::PacketFlags::CKSUM);
        buf[1] = flags.bits();
        let end = wire::seal_checksum(&mut buf, HEADER_LEN + 8).unwrap();
        buf[HEADER_LEN] ^= 0xFF;
        b.handle_packet(Bytes::from(buf[..end].to_vec()), Instant::now()).unwrap();
        assert_eq!(b.stats().snapshot().checksum_errors, 1);
    }
}
