//! Control message queue.
//!
//! ACK, NAK and BECN messages that cannot be posted immediately wait here.
//! Each flow may have at most one message of each opcode queued; a newer
//! ACK for a flow replaces the queued one in place, since only the latest
//! cumulative ack matters. When the ring is full the message is lost and
//! recovery falls back to the sender's ERR_CHK timeout.

use crate::flow::FlowKey;
use crate::wire::{Opcode, PacketHeader};
use std::collections::HashMap;

/// Ring capacity.
pub const CTRL_MSG_QUEUE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlMsg {
    pub flow: FlowKey,
    pub header: PacketHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlEnqueue {
    Queued,
    /// An ACK already queued for the flow was overwritten.
    Replaced,
    /// Same message type already queued for the flow.
    AlreadyQueued,
    Overflow,
}

#[derive(Debug, Default, Clone, Copy)]
struct FlowQueued {
    mask: u8,
    ack_index: Option<usize>,
}

#[derive(Debug)]
pub struct CtrlQueue {
    ring: Vec<Option<CtrlMsg>>,
    head: usize,
    tail: usize,
    len: usize,
    queued: HashMap<FlowKey, FlowQueued>,
    overflow: u64,
}

impl Default for CtrlQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn opcode_bit(opcode: Opcode) -> Option<u8> {
    match opcode {
        Opcode::Ack => Some(0x1),
        Opcode::Nak => Some(0x2),
        Opcode::Becn => Some(0x4),
        _ => None,
    }
}

impl CtrlQueue {
    pub fn new() -> Self {
        Self {
            ring: vec![None; CTRL_MSG_QUEUE_SIZE],
            head: 0,
            tail: 0,
            len: 0,
            queued: HashMap::new(),
            overflow: 0,
        }
    }

    /// Only ack-family messages are queued; connection control is retried
    /// by its own timers.
    pub fn is_queueable(opcode: Opcode) -> bool {
        opcode_bit(opcode).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    pub fn enqueue(&mut self, msg: CtrlMsg) -> CtrlEnqueue {
        let Some(bit) = opcode_bit(msg.header.opcode) else {
            return CtrlEnqueue::Overflow;
        };
        let entry = self.queued.entry(msg.flow).or_default();
        if entry.mask & bit != 0 {
            if msg.header.opcode == Opcode::Ack {
                if let Some(idx) = entry.ack_index {
                    self.ring[idx] = Some(msg);
                    return CtrlEnqueue::Replaced;
                }
            }
            return CtrlEnqueue::AlreadyQueued;
        }
        if self.len == CTRL_MSG_QUEUE_SIZE {
            self.overflow += 1;
            return CtrlEnqueue::Overflow;
        }
        let idx = self.tail;
        self.ring[idx] = Some(msg);
        self.tail = (self.tail + 1) % CTRL_MSG_QUEUE_SIZE;
        self.len += 1;
        entry.mask |= bit;
        if msg.header.opcode == Opcode::Ack {
            entry.ack_index = Some(idx);
        }
        CtrlEnqueue::Queued
    }

    pub fn front(&self) -> Option<&CtrlMsg> {
        if self.len == 0 {
            return None;
        }
        self.ring[self.head].as_ref()
    }

    pub fn pop_front(&mut self) -> Option<CtrlMsg> {
        if self.len == 0 {
            return None;
        }
        let msg = self.ring[self.head].take()?;
        self.head = (self.head + 1) % CTRL_MSG_QUEUE_SIZE;
        self.len -= 1;
        if let Some(entry) = self.queued.get_mut(&msg.flow) {
            if let Some(bit) = opcode_bit(msg.header.opcode) {
                entry.mask &= !bit;
            }
            if msg.header.opcode == Opcode::Ack {
                entry.ack_index = None;
            }
            if entry.mask == 0 {
                self.queued.remove(&msg.flow);
            }
        }
        Some(msg)
    }

    /// Whether a message of this opcode is queued for the flow.
    pub fn is_queued(&self, flow: FlowKey, opcode: Opcode) -> bool {
        match (self.queued.get(&flow), opcode_bit(opcode)) {
            (Some(entry), Some(bit)) => entry.mask & bit != 0,
            _ => false,
        }
    }

    /// Drops queued messages for a peer that went away.
    pub fn purge_peer(&mut self, peer: crate::wire::Epid) {
        let mut kept = Vec::with_capacity(self.len);
        while let Some(msg) = self.pop_front() {
            if msg.flow.peer != peer {
                kept.push(msg);
            }
        }
        for msg in kept {
            self.enqueue(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowClass;
    use crate::psn::Psn;
    use crate::wire::Epid;

    fn msg(peer: u64, opcode: Opcode, ack: u32) -> CtrlMsg {
        let mut header = PacketHeader::new(opcode, Epid(0), 0);
        header.ack_psn = Psn::new(ack);
        CtrlMsg {
            flow: FlowKey::new(Epid(peer), FlowClass::Message),
            header,
        }
    }

    #[test]
    fn test_ack_overwrites_in_place() {
        let mut q = CtrlQueue::new();
        assert_eq!(q.enqueue(msg(1, Opcode::Ack, 3)), CtrlEnqueue::Queued);
        assert_eq!(q.enqueue(msg(2, Opcode::Ack, 1)), CtrlEnqueue::Queued);
        assert_eq!(q.enqueue(msg(1, Opcode::Ack, 9)), CtrlEnqueue::Replaced);
        assert_eq!(q.len(), 2);
        let first = q.pop_front().unwrap();
        assert_eq!(first.flow.peer, Epid(1));
        assert_eq!(first.header.ack_psn, Psn::new(9));
        assert!(!q.is_queued(first.flow, Opcode::Ack));
    }

    #[test]
    fn test_nak_not_duplicated() {
        let mut q = CtrlQueue::new();
        assert_eq!(q.enqueue(msg(1, Opcode::Nak, 3)), CtrlEnqueue::Queued);
        assert_eq!(q.enqueue(msg(1, Opcode::Nak, 3)), CtrlEnqueue::AlreadyQueued);
        assert_eq!(q.enqueue(msg(1, Opcode::Ack, 3)), CtrlEnqueue::Queued);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_overflow_counts() {
        let mut q = CtrlQueue::new();
        for peer in 0..CTRL_MSG_QUEUE_SIZE as u64 {
            assert_eq!(q.enqueue(msg(peer, Opcode::Becn, 0)), CtrlEnqueue::Queued);
        }
        assert_eq!(q.enqueue(msg(999, Opcode::Nak, 0)), CtrlEnqueue::Overflow);
        assert_eq!(q.overflow(), 1);
        q.pop_front();
        assert_eq!(q.enqueue(msg(999, Opcode::Nak, 0)), CtrlEnqueue::Queued);
    }

    #[test]
    fn test_connection_control_not_queueable() {
        assert!(!CtrlQueue::is_queueable(Opcode::ConnectRequest));
        assert!(CtrlQueue::is_queueable(Opcode::Becn));
    }

    #[test]
    fn test_purge_peer() {
        let mut q = CtrlQueue::new();
        q.enqueue(msg(1, Opcode::Ack, 1));
        q.enqueue(msg(2, Opcode::Ack, 1));
        q.enqueue(msg(1, Opcode::Nak, 1));
        q.purge_peer(Epid(1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.front().unwrap().flow.peer, Epid(2));
    }
}
