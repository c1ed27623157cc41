//! Wire format.
//!
//! Every packet starts with a fixed 32-byte header in network byte order:
//!
//! ```text
//! 0      1      2      3      4          8          12                20     24      28     32
//! | op   | flags| flow | rc   | psn      | ack_psn  | src epid         | aux  | offset | len |
//! ```
//!
//! followed by the payload and, when the `CKSUM` flag is set, a CRC32 trailer
//! covering header and payload. Payloads of control messages are always a
//! multiple of 4 bytes.

use crate::error::{Result, TransportError};
use crate::psn::Psn;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header length in bytes.
pub const HEADER_LEN: usize = 32;
/// Checksum trailer length in bytes.
pub const CHECKSUM_LEN: usize = 4;

/// Endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Epid(pub u64);

impl fmt::Display for Epid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epid:{:#x}", self.0)
    }
}

/// Packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Data = 0x01,
    LongData = 0x02,
    Rts = 0x03,
    Cts = 0x04,
    Ack = 0x41,
    Nak = 0x42,
    Becn = 0x43,
    ErrChk = 0x44,
    ConnectRequest = 0x60,
    ConnectReply = 0x61,
    DisconnectRequest = 0x62,
    DisconnectReply = 0x63,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0x01 => Opcode::Data,
            0x02 => Opcode::LongData,
            0x03 => Opcode::Rts,
            0x04 => Opcode::Cts,
            0x41 => Opcode::Ack,
            0x42 => Opcode::Nak,
            0x43 => Opcode::Becn,
            0x44 => Opcode::ErrChk,
            0x60 => Opcode::ConnectRequest,
            0x61 => Opcode::ConnectReply,
            0x62 => Opcode::DisconnectRequest,
            0x63 => Opcode::DisconnectReply,
            other => return Err(TransportError::UnknownOpcode(other)),
        })
    }

    /// Sequenced opcodes travel on a flow and consume a PSN.
    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Opcode::Data | Opcode::LongData | Opcode::Rts | Opcode::Cts
        )
    }

    pub fn is_connection_control(self) -> bool {
        matches!(
            self,
            Opcode::ConnectRequest
                | Opcode::ConnectReply
                | Opcode::DisconnectRequest
                | Opcode::DisconnectReply
        )
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Receiver should acknowledge this packet.
    pub const ACK_REQ: Self = Self(0x01);
    /// Congestion experienced on the path.
    pub const FECN: Self = Self(0x02);
    /// A CRC32 trailer follows the payload.
    pub const CKSUM: Self = Self(0x04);
    /// Connection request is a reconnection under an existing connection.
    pub const RECONNECT: Self = Self(0x08);
    /// Last packet of a message.
    pub const EOM: Self = Self(0x10);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: Opcode,
    pub flags: PacketFlags,
    /// Flow class id the packet (or the ack) refers to.
    pub flow: u8,
    /// Reconnection epoch of the sender's transport resource.
    pub reconnect_count: u8,
    pub psn: Psn,
    pub ack_psn: Psn,
    pub src: Epid,
    /// Message sequence, transfer id or connection epoch depending on opcode.
    pub aux: u32,
    pub offset: u32,
    pub msg_len: u32,
}

impl PacketHeader {
    pub fn new(opcode: Opcode, src: Epid, flow: u8) -> Self {
        Self {
            opcode,
            flags: PacketFlags::empty(),
            flow,
            reconnect_count: 0,
            psn: Psn::new(0),
            ack_psn: Psn::new(0),
            src,
            aux: 0,
            offset: 0,
            msg_len: 0,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.opcode as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.flow);
        buf.put_u8(self.reconnect_count);
        buf.put_u32(self.psn.value());
        buf.put_u32(self.ack_psn.value());
        buf.put_u64(self.src.0);
        buf.put_u32(self.aux);
        buf.put_u32(self.offset);
        buf.put_u32(self.msg_len);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(TransportError::InvalidPacket {
                reason: format!("short header: {} bytes", buf.remaining()),
            });
        }
        let opcode = Opcode::from_u8(buf.get_u8())?;
        let flags = PacketFlags::from_bits(buf.get_u8());
        let flow = buf.get_u8();
        let reconnect_count = buf.get_u8();
        let psn = Psn::new(buf.get_u32());
        let ack_psn = Psn::new(buf.get_u32());
        let src = Epid(buf.get_u64());
        let aux = buf.get_u32();
        let offset = buf.get_u32();
        let msg_len = buf.get_u32();
        Ok(Self {
            opcode,
            flags,
            flow,
            reconnect_count,
            psn,
            ack_psn,
            src,
            aux,
            offset,
            msg_len,
        })
    }
}

/// Writes the header into the front of `dst`. The payload area starts at
/// [`HEADER_LEN`].
pub fn write_header(dst: &mut [u8], header: &PacketHeader) -> Result<()> {
    if dst.len() < HEADER_LEN {
        return Err(TransportError::PayloadTooLarge {
            size: HEADER_LEN,
            max_size: dst.len(),
        });
    }
    let mut out = &mut dst[..HEADER_LEN];
    header.encode(&mut out);
    Ok(())
}

/// Appends the CRC32 trailer over `dst[..len]` and returns the new length.
pub fn seal_checksum(dst: &mut [u8], len: usize) -> Result<usize> {
    if dst.len() < len + CHECKSUM_LEN {
        return Err(TransportError::PayloadTooLarge {
            size: len + CHECKSUM_LEN,
            max_size: dst.len(),
        });
    }
    let crc = crc32fast::hash(&dst[..len]);
    let mut out = &mut dst[len..len + CHECKSUM_LEN];
    out.put_u32(crc);
    Ok(len + CHECKSUM_LEN)
}

/// Parses a received packet, verifying the trailer when present.
pub fn parse_packet(data: &[u8]) -> Result<(PacketHeader, &[u8])> {
    let mut cursor = data;
    let header = PacketHeader::decode(&mut cursor)?;
    let mut body_end = data.len();
    if header.flags.contains(PacketFlags::CKSUM) {
        if data.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(TransportError::InvalidPacket {
                reason: "missing checksum trailer".into(),
            });
        }
        body_end -= CHECKSUM_LEN;
        let mut trailer = &data[body_end..];
        let expected = trailer.get_u32();
        let computed = crc32fast::hash(&data[..body_end]);
        if expected != computed {
            return Err(TransportError::ChecksumMismatch { expected, computed });
        }
    }
    if !header.opcode.is_sequenced() && (body_end - HEADER_LEN) % 4 != 0 {
        return Err(TransportError::InvalidPacket {
            reason: format!(
                "control payload of {} bytes is not 4-byte aligned",
                body_end - HEADER_LEN
            ),
        });
    }
    Ok((header, &data[HEADER_LEN..body_end]))
}

/// Sets the FECN bit of an encoded packet in place. Used by fabrics that
/// mark congestion.
pub fn mark_fecn(packet: &mut [u8]) {
    if packet.len() >= HEADER_LEN {
        packet[1] |= PacketFlags::FECN.bits();
    }
}

/// Payload of CONNECT_REQUEST and CONNECT_REPLY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPayload {
    /// Connection generation key chosen by the requester.
    pub epoch: u32,
    pub reconnect_count: u32,
    /// Reliable QP number offered by the sender, 0 in datagram mode.
    pub qp_num: u32,
}

impl ConnectPayload {
    pub const LEN: usize = 12;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        let mut buf = &mut out[..];
        buf.put_u32(self.epoch);
        buf.put_u32(self.reconnect_count);
        buf.put_u32(self.qp_num);
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(TransportError::InvalidPacket {
                reason: format!("connect payload of {} bytes", data.len()),
            });
        }
        Ok(Self {
            epoch: data.get_u32(),
            reconnect_count: data.get_u32(),
            qp_num: data.get_u32(),
        })
    }
}

/// Payload of a CTS: one window granted by the receiver of a rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtsPayload {
    pub send_id: u32,
    pub recv_id: u32,
    pub window: u32,
    pub offset: u32,
    pub length: u32,
    /// 0 = long data, 1 = RDMA write.
    pub strategy: u32,
    pub rkey: u32,
    /// Offset of the window inside the registered region.
    pub remote_offset: u32,
}

impl CtsPayload {
    pub const LEN: usize = 32;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        let mut buf = &mut out[..];
        buf.put_u32(self.send_id);
        buf.put_u32(self.recv_id);
        buf.put_u32(self.window);
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
        buf.put_u32(self.strategy);
        buf.put_u32(self.rkey);
        buf.put_u32(self.remote_offset);
        out
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(TransportError::InvalidPacket {
                reason: format!("cts payload of {} bytes", data.len()),
            });
        }
        Ok(Self {
            send_id: data.get_u32(),
            recv_id: data.get_u32(),
            window: data.get_u32(),
            offset: data.get_u32(),
            length: data.get_u32(),
            strategy: data.get_u32(),
            rkey: data.get_u32(),
            remote_offset: data.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PacketHeader {
        let mut h = PacketHeader::new(Opcode::Data, Epid(0xabc), 1);
        h.psn = Psn::new(0x7fff_fffe);
        h.ack_psn = Psn::new(17);
        h.aux = 3;
        h.offset = 4096;
        h.msg_len = 10_000;
        h.flags.insert(PacketFlags::ACK_REQ);
        h
    }

    #[test]
    fn test_header_encode_decode() {
        let h = sample_header();
        let mut buf = Vec::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = PacketHeader::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = 0xEE;
        assert!(matches!(
            PacketHeader::decode(&mut &buf[..]),
            Err(TransportError::UnknownOpcode(0xEE))
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut h = sample_header();
        h.flags.insert(PacketFlags::CKSUM);
        let mut packet = vec![0u8; HEADER_LEN + 8 + CHECKSUM_LEN];
        write_header(&mut packet, &h).unwrap();
        packet[HEADER_LEN..HEADER_LEN + 8].copy_from_slice(b"payload!");
        let len = seal_checksum(&mut packet, HEADER_LEN + 8).unwrap();
        assert_eq!(len, packet.len());

        let (parsed, payload) = parse_packet(&packet).unwrap();
        assert_eq!(parsed.psn, h.psn);
        assert_eq!(payload, b"payload!");

        packet[HEADER_LEN] ^= 0xFF;
        assert!(matches!(
            parse_packet(&packet),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_control_payload_must_be_aligned() {
        let h = PacketHeader::new(Opcode::Ack, Epid(1), 0);
        let mut packet = vec![0u8; HEADER_LEN + 3];
        write_header(&mut packet, &h).unwrap();
        assert!(matches!(
            parse_packet(&packet),
            Err(TransportError::InvalidPacket { .. })
        ));
    }

    #[test]
    fn test_mark_fecn() {
        let h = PacketHeader::new(Opcode::Data, Epid(1), 0);
        let mut packet = vec![0u8; HEADER_LEN];
        write_header(&mut packet, &h).unwrap();
        mark_fecn(&mut packet);
        let (parsed, _) = parse_packet(&packet).unwrap();
        assert!(parsed.flags.contains(PacketFlags::FECN));
    }

    #[test]
    fn test_cts_payload() {
        let cts = CtsPayload {
            send_id: 1,
            recv_id: 2,
            window: 3,
            offset: 3 << 20,
            length: 1 << 20,
            strategy: 1,
            rkey: 0x55,
            remote_offset: 0,
        };
        assert_eq!(CtsPayload::decode(&cts.encode()).unwrap(), cts);
        assert!(CtsPayload::decode(&[0u8; 8]).is_err());
    }
}
