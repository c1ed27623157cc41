//! Send control blocks.
//!
//! An scb is one sequenced unit of work on a flow: a run of `nfrag`
//! consecutive wire packets sharing one header template. Scbs live in an
//! arena and are referenced by generation-checked [`ScbId`]s from flow
//! queues and from the send buffers that carry their packets.

use crate::error::Result;
use crate::flow::FlowKey;
use crate::psn::Psn;
use crate::wire::PacketHeader;
use bytes::Bytes;
use std::fmt;
use std::time::{Duration, Instant};

/// Completion callback for an application send; receives the byte count.
pub type SendCallback = Box<dyn FnOnce(Result<usize>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScbId {
    index: u32,
    generation: u32,
}

impl ScbId {
    pub fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// What acknowledging an scb means to the layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScbKind {
    /// Eager message data or a rendezvous control packet.
    Message,
    /// Long data of window `window` of rendezvous transfer `send_id`,
    /// carrying `bytes`.
    LongData { send_id: u32, window: u32, bytes: usize },
}

pub struct Scb {
    pub flow: FlowKey,
    pub kind: ScbKind,
    /// PSN of the first fragment.
    pub psn: Psn,
    pub nfrag: u16,
    /// Fragments handed to the NIC so far on the current attempt.
    pub frags_posted: u16,
    pub header: PacketHeader,
    pub payload: Bytes,
    /// Payload bytes per fragment.
    pub frag_size: usize,
    pub ack_timeout: Duration,
    pub abs_timeout: Option<Instant>,
    /// Posted packets whose local send completion has not been reaped.
    pub local_outstanding: u32,
    pub retransmits: u32,
    pub callback: Option<SendCallback>,
}

impl Scb {
    pub fn new(flow: FlowKey, kind: ScbKind, header: PacketHeader, payload: Bytes, frag_size: usize) -> Self {
        let frag_size = frag_size.max(1);
        let nfrag = payload.len().div_ceil(frag_size).max(1) as u16;
        Self {
            flow,
            kind,
            psn: Psn::new(0),
            nfrag,
            frags_posted: 0,
            header,
            payload,
            frag_size,
            ack_timeout: Duration::ZERO,
            abs_timeout: None,
            local_outstanding: 0,
            retransmits: 0,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: SendCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn last_psn(&self) -> Psn {
        self.psn.add(self.nfrag as u32 - 1)
    }

    pub fn is_fully_posted(&self) -> bool {
        self.frags_posted >= self.nfrag
    }

    /// Payload of fragment `frag`.
    pub fn frag_payload(&self, frag: u16) -> Bytes {
        let start = (frag as usize * self.frag_size).min(self.payload.len());
        let end = (start + self.frag_size).min(self.payload.len());
        self.payload.slice(start..end)
    }

    /// Header of fragment `frag`, with its own PSN and offset.
    pub fn frag_header(&self, frag: u16) -> PacketHeader {
        let mut header = self.header;
        header.psn = self.psn.add(frag as u32);
        header.offset = self.header.offset + (frag as usize * self.frag_size) as u32;
        header
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Runs the callback, if any.
    pub fn complete(&mut self, result: Result<usize>) -> Option<(SendCallback, Result<usize>)> {
        self.callback.take().map(|cb| (cb, result))
    }
}

impl fmt::Debug for Scb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scb")
            .field("flow", &self.flow)
            .field("kind", &self.kind)
            .field("psn", &self.psn)
            .field("nfrag", &self.nfrag)
            .field("frags_posted", &self.frags_posted)
            .field("len", &self.payload.len())
            .field("local_outstanding", &self.local_outstanding)
            .field("retransmits", &self.retransmits)
            .finish()
    }
}

#[derive(Debug, Default)]
struct ScbSlot {
    generation: u32,
    scb: Option<Scb>,
}

#[derive(Debug, Default)]
pub struct ScbArena {
    slots: Vec<ScbSlot>,
    free: Vec<u32>,
    live: usize,
}

impl ScbArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scb: Scb) -> ScbId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.scb = Some(scb);
            return ScbId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(ScbSlot {
            generation: 0,
            scb: Some(scb),
        });
        ScbId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: ScbId) -> Option<&Scb> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.scb.as_ref())
    }

    pub fn get_mut(&mut self, id: ScbId) -> Option<&mut Scb> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.scb.as_mut())
    }

    pub fn remove(&mut self, id: ScbId) -> Option<Scb> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let scb = slot.scb.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(scb)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowClass;
    use crate::wire::{Epid, Opcode};

    fn scb(len: usize, frag: usize) -> Scb {
        let key = FlowKey::new(Epid(1), FlowClass::Message);
        let header = PacketHeader::new(Opcode::Data, Epid(2), 0);
        Scb::new(key, ScbKind::Message, header, Bytes::from(vec![7u8; len]), frag)
    }

    #[test]
    fn test_fragmentation() {
        let mut s = scb(10, 4);
        assert_eq!(s.nfrag, 3);
        s.psn = Psn::new(100);
        assert_eq!(s.last_psn(), Psn::new(102));
        assert_eq!(s.frag_payload(2).len(), 2);
        assert_eq!(s.frag_header(2).psn, Psn::new(102));
        assert_eq!(s.frag_header(1).offset, 4);
        assert_eq!(scb(0, 4).nfrag, 1);
    }

    #[test]
    fn test_arena_generation() {
        let mut arena = ScbArena::new();
        let a = arena.insert(scb(1, 4));
        assert!(arena.get(a).is_some());
        assert!(arena.remove(a).is_some());
        assert!(arena.get(a).is_none());
        let b = arena.insert(scb(1, 4));
        assert_ne!(a, b);
        assert!(arena.remove(a).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_complete_runs_callback_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut s = scb(4, 4).with_callback(Box::new(move |r| {
            tx.send(r.map_err(|e| e.to_string())).unwrap();
        }));
        if let Some((cb, res)) = s.complete(Ok(4)) {
            cb(res);
        }
        assert!(s.complete(Ok(4)).is_none());
        assert_eq!(rx.recv().unwrap(), Ok(4));
    }
}
