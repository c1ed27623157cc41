//! Send and receive buffer pools.
//!
//! Send buffers are fixed-size slots of one registered region. Each QP owns
//! a [`SendAllocator`] that remembers the order in which its slots were
//! posted; completions arrive in that order, so slots are released strictly
//! head-first. Only every `coalesce`-th send asks for a completion, and that
//! one completion releases the whole group.

use crate::error::{Result, TransportError};
use crate::scb::ScbId;
use crate::verbs::{AccessFlags, MemHandle, SharedBuf, TransportStrategy};
use std::collections::VecDeque;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Handle to one send slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SbufHandle {
    index: u32,
    generation: u32,
}

impl SbufHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Packs into a work request payload.
    pub fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            index: (v & 0xFFFF_FFFF) as u32,
            generation: ((v >> 32) & 0x3FFF_FFFF) as u32,
        }
    }
}

#[derive(Debug, Default)]
struct SendSlot {
    generation: u32,
    allocated: bool,
    len: usize,
    scb: Option<ScbId>,
}

/// Per-QP list of slots in post order.
#[derive(Debug)]
pub struct SendAllocator {
    outstanding: VecDeque<SbufHandle>,
    coalesce: u32,
    until_signal: u32,
}

impl SendAllocator {
    pub fn new(coalesce: u32) -> Self {
        let coalesce = coalesce.max(1);
        Self {
            outstanding: VecDeque::new(),
            coalesce,
            until_signal: coalesce,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn coalesce(&self) -> u32 {
        self.coalesce
    }

    /// Decides whether the next post requests a completion.
    pub fn next_signaled(&mut self) -> bool {
        self.until_signal -= 1;
        if self.until_signal == 0 {
            self.until_signal = self.coalesce;
            true
        } else {
            false
        }
    }

    /// Takes back a signal decision for a post that did not happen.
    pub fn undo_signaled(&mut self) {
        if self.until_signal == self.coalesce {
            self.until_signal = 1;
        } else {
            self.until_signal += 1;
        }
    }

    pub fn last(&self) -> Option<SbufHandle> {
        self.outstanding.back().copied()
    }
}

/// Released slots and the send control blocks they referenced.
#[derive(Debug, Default)]
pub struct Released {
    pub count: usize,
    pub scbs: Vec<ScbId>,
}

/// Arena of registered send slots.
#[derive(Debug)]
pub struct SendPool {
    storage: SharedBuf,
    buffer_size: usize,
    slots: Vec<SendSlot>,
    free: Vec<u32>,
    mr: Option<MemHandle>,
}

impl SendPool {
    /// The total is rounded down to a whole number of coalesce groups.
    pub fn new(total: usize, buffer_size: usize, coalesce: u32) -> Result<Self> {
        let coalesce = coalesce.max(1) as usize;
        let total = total - total % coalesce;
        if total == 0 || buffer_size == 0 {
            return Err(TransportError::InvalidConfig(format!(
                "send pool of {} x {} bytes",
                total, buffer_size
            )));
        }
        let mut slots = Vec::with_capacity(total);
        slots.resize_with(total, SendSlot::default);
        Ok(Self {
            storage: Arc::new(Mutex::new(vec![0u8; total * buffer_size])),
            buffer_size,
            slots,
            free: (0..total as u32).rev().collect(),
            mr: None,
        })
    }

    pub fn register(&mut self, transport: &mut dyn TransportStrategy) -> Result<()> {
        let len = self.slots.len() * self.buffer_size;
        let mr = transport.register_memory(&self.storage, 0, len, AccessFlags::LOCAL_WRITE)?;
        self.mr = Some(mr);
        Ok(())
    }

    pub fn deregister(&mut self, transport: &mut dyn TransportStrategy) {
        if let Some(mr) = self.mr.take() {
            transport.deregister_memory(mr);
        }
    }

    pub fn lkey(&self) -> u32 {
        self.mr.map(|mr| mr.lkey).unwrap_or(crate::verbs::INVALID_LKEY)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn num_outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Returns the new slot and the one allocated before it on the same
    /// allocator, or `None` when the pool is exhausted.
    pub fn alloc(&mut self, allocator: &mut SendAllocator) -> Option<(SbufHandle, Option<SbufHandle>)> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.allocated = true;
        slot.len = 0;
        slot.scb = None;
        let handle = SbufHandle {
            index,
            generation: slot.generation,
        };
        let prev = allocator.last();
        allocator.outstanding.push_back(handle);
        Some((handle, prev))
    }

    /// Undoes the most recent allocation after a failed post.
    pub fn unalloc(
        &mut self,
        allocator: &mut SendAllocator,
        handle: SbufHandle,
        prev: Option<SbufHandle>,
    ) -> Result<()> {
        if allocator.last() != Some(handle) {
            return Err(TransportError::BufferOrder {
                reason: format!("unalloc of slot {} which is not the last allocation", handle.index),
            });
        }
        allocator.outstanding.pop_back();
        if allocator.last() != prev {
            allocator.outstanding.push_back(handle);
            return Err(TransportError::BufferOrder {
                reason: format!("unalloc of slot {} with wrong predecessor", handle.index),
            });
        }
        self.release_slot(handle)?;
        Ok(())
    }

    /// Releases slots head-first until `handle` is released. Fails if the
    /// handle is not found within `count` releases.
    pub fn free(
        &mut self,
        allocator: &mut SendAllocator,
        handle: SbufHandle,
        count: usize,
    ) -> Result<Released> {
        let mut released = Released::default();
        for _ in 0..count {
            let head = allocator.outstanding.pop_front().ok_or_else(|| TransportError::BufferOrder {
                reason: format!(
                    "free of slot {} with empty outstanding list after {} releases",
                    handle.index, released.count
                ),
            })?;
            if let Some(scb) = self.release_slot(head)? {
                released.scbs.push(scb);
            }
            released.count += 1;
            if head == handle {
                return Ok(released);
            }
        }
        Err(TransportError::BufferOrder {
            reason: format!("slot {} not found within {} releases", handle.index, count),
        })
    }

    /// Releases everything still outstanding on `allocator`.
    pub fn release_all(&mut self, allocator: &mut SendAllocator) -> Result<Released> {
        let mut released = Released::default();
        while let Some(head) = allocator.outstanding.pop_front() {
            if let Some(scb) = self.release_slot(head)? {
                released.scbs.push(scb);
            }
            released.count += 1;
        }
        allocator.until_signal = allocator.coalesce;
        Ok(released)
    }

    fn check(&self, handle: SbufHandle) -> Result<&SendSlot> {
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.allocated && slot.generation == handle.generation => Ok(slot),
            _ => {
                debug_assert!(false, "stale send buffer handle {:?}", handle);
                Err(TransportError::StaleHandle {
                    index: handle.index,
                    generation: handle.generation,
                })
            }
        }
    }

    fn release_slot(&mut self, handle: SbufHandle) -> Result<Option<ScbId>> {
        self.check(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.allocated = false;
        slot.generation = slot.generation.wrapping_add(1) & 0x3FFF_FFFF;
        slot.len = 0;
        self.free.push(handle.index);
        Ok(slot.scb.take())
    }

    pub fn attach_scb(&mut self, handle: SbufHandle, scb: ScbId) -> Result<()> {
        self.check(handle)?;
        self.slots[handle.index as usize].scb = Some(scb);
        Ok(())
    }

    fn lock_storage(&self) -> MutexGuard<'_, Vec<u8>> {
        self.storage.lock()
    }

    /// Fills a slot. The closure returns the number of bytes written.
    pub fn write<F>(&mut self, handle: SbufHandle, fill: F) -> Result<usize>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        self.check(handle)?;
        let start = handle.index as usize * self.buffer_size;
        let len = {
            let mut storage = self.lock_storage();
            fill(&mut storage[start..start + self.buffer_size])?
        };
        self.slots[handle.index as usize].len = len;
        Ok(len)
    }

    /// Runs `f` over the written bytes of a slot.
    pub fn with_packet<R>(&self, handle: SbufHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let slot = self.check(handle)?;
        let start = handle.index as usize * self.buffer_size;
        let storage = self.lock_storage();
        Ok(f(&storage[start..start + slot.len]))
    }
}

/// Accounting for receive buffers posted to one QP.
#[derive(Debug)]
pub struct RecvPool {
    total: usize,
    posted: usize,
    next_wr: u64,
}

impl RecvPool {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            posted: 0,
            next_wr: 1,
        }
    }

    pub fn posted(&self) -> usize {
        self.posted
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Posts receives until the pool is full.
    pub fn replenish(&mut self, transport: &mut dyn TransportStrategy, qp: crate::verbs::QpNum) -> Result<usize> {
        let mut posted = 0;
        while self.posted < self.total {
            transport.post_recv(qp, self.next_wr)?;
            self.next_wr = self.next_wr.wrapping_add(1);
            self.posted += 1;
            posted += 1;
        }
        Ok(posted)
    }

    /// Accounts one receive completion, success or flush.
    pub fn completed(&mut self) {
        debug_assert!(self.posted > 0, "receive completion with none posted");
        self.posted = self.posted.saturating_sub(1);
    }
}
