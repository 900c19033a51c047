/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Receive buffer pool.
//!
//! Receive queues post page-sized chunks of DMA memory to the device. The pool
//! hands out chunks, tracks who currently owns each one and recycles them once
//! every holder has released its handle.
//!
//! # Chunk states
//!
//! - `Free`: in the pool, reusable.
//! - `PostedToDevice`: referenced by a receive queue slot. The device may
//!   write into it, software must not read it.
//! - `OwnedByConsumer`: handed to the receive path after a completion. The
//!   device no longer references it.
//!
//! # Allocation
//!
//! Free chunks are found with a linear scan over a [`FixedBitSet`] of in-use
//! chunks, lowest index first, so a recycled chunk is reused before the pool
//! grows. New DMA regions are allocated only when no chunk is free and the
//! optional chunk limit allows it.

use std::sync::Arc;

use fixedbitset::FixedBitSet;
use spin::Mutex;

use crate::access::{Bus, DmaRegion};
use crate::error::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkState {
    Free,
    PostedToDevice,
    OwnedByConsumer,
}

/// Exclusive handle to one reference on a pool chunk.
///
/// Handles are not `Clone`; a second holder obtains its own handle through
/// [`BufferPool::retain`].
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    index: usize,
    addr: u64,
    len: usize,
}

impl Chunk {
    /// Bus address of the chunk.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Chunk counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// DMA regions currently owned by the pool.
    pub allocated: usize,
    pub free: usize,
    pub posted: usize,
    pub consumer: usize,
}

#[derive(Debug)]
struct Slot {
    region: DmaRegion,
    state: ChunkState,
    refs: u32,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    in_use: FixedBitSet,
    /// Regions being allocated outside the lock.
    growing: usize,
}

pub struct BufferPool<B: Bus> {
    bus: Arc<B>,
    chunk_size: usize,
    max_chunks: Option<usize>,
    inner: Mutex<Inner>,
}

impl<B: Bus> BufferPool<B> {
    pub fn new(bus: Arc<B>, chunk_size: usize, max_chunks: Option<usize>) -> Self {
        Self {
            bus,
            chunk_size,
            max_chunks,
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                in_use: FixedBitSet::new(),
                growing: 0,
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Take a free chunk, growing the pool if none is free.
    ///
    /// The chunk comes back in `PostedToDevice` state with one reference.
    pub fn acquire(&self) -> Result<Chunk, QueueError> {
        {
            let mut inner = self.inner.lock();
            if let Some(index) = inner.in_use.zeroes().next() {
                return Ok(Self::take(&mut inner, index));
            }
            if let Some(max) = self.max_chunks
                && inner.slots.len() + inner.growing >= max
            {
                return Err(QueueError::Exhausted);
            }
            inner.growing += 1;
        }

        let region = self.bus.dma_alloc(self.chunk_size);

        let mut inner = self.inner.lock();
        inner.growing -= 1;
        let region = region.map_err(|err| {
            log::debug!("Receive buffer allocation failed: {err}");
            QueueError::OutOfMemory
        })?;

        let index = inner.slots.len();
        inner.slots.push(Slot {
            region,
            state: ChunkState::Free,
            refs: 0,
        });
        inner.in_use.grow(index + 1);
        Ok(Self::take(&mut inner, index))
    }

    fn take(inner: &mut Inner, index: usize) -> Chunk {
        inner.in_use.insert(index);
        let slot = &mut inner.slots[index];
        slot.state = ChunkState::PostedToDevice;
        slot.refs = 1;
        Chunk {
            index,
            addr: slot.region.addr,
            len: slot.region.len,
        }
    }

    fn slot_mut<'a>(inner: &'a mut Inner, chunk: &Chunk) -> Result<&'a mut Slot, QueueError> {
        match inner.slots.get_mut(chunk.index) {
            Some(slot) if slot.region.addr == chunk.addr && slot.state != ChunkState::Free => {
                Ok(slot)
            }
            _ => Err(QueueError::InvalidState),
        }
    }

    /// The device is done with the chunk, software may now read it.
    pub fn hand_to_consumer(&self, chunk: &Chunk) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let slot = Self::slot_mut(&mut inner, chunk)?;
        if slot.state != ChunkState::PostedToDevice {
            return Err(QueueError::InvalidState);
        }
        slot.state = ChunkState::OwnedByConsumer;
        Ok(())
    }

    /// Add a reference for another holder of a consumer-owned chunk.
    pub fn retain(&self, chunk: &Chunk) -> Result<Chunk, QueueError> {
        let mut inner = self.inner.lock();
        let slot = Self::slot_mut(&mut inner, chunk)?;
        if slot.state != ChunkState::OwnedByConsumer {
            return Err(QueueError::InvalidState);
        }
        slot.refs += 1;
        Ok(Chunk {
            index: chunk.index,
            addr: chunk.addr,
            len: chunk.len,
        })
    }

    /// Drop one reference. The chunk becomes free with the last one.
    pub fn release(&self, chunk: Chunk) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let slot = Self::slot_mut(&mut inner, &chunk)?;
        slot.refs -= 1;
        if slot.refs == 0 {
            slot.state = ChunkState::Free;
            inner.in_use.set(chunk.index, false);
        }
        Ok(())
    }

    /// Return a chunk that never reached the consumer.
    ///
    /// Used to unwind a batch of acquisitions when a later step fails.
    pub fn recycle_direct(&self, chunk: Chunk) {
        let mut inner = self.inner.lock();
        match Self::slot_mut(&mut inner, &chunk) {
            Ok(slot) if slot.state == ChunkState::PostedToDevice && slot.refs == 1 => {
                slot.refs = 0;
                slot.state = ChunkState::Free;
                inner.in_use.set(chunk.index, false);
            }
            _ => log::error!("Chunk {} cannot be recycled directly", chunk.index),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` out of a consumer-owned chunk.
    pub fn read(&self, chunk: &Chunk, offset: usize, dst: &mut [u8]) -> Result<(), QueueError> {
        if offset + dst.len() > chunk.len {
            return Err(QueueError::InvalidState);
        }
        if self.state(chunk) != Some(ChunkState::OwnedByConsumer) {
            return Err(QueueError::InvalidState);
        }
        self.bus
            .read(chunk.addr + offset as u64, dst)
            .map_err(|_| QueueError::MemError)?;
        Ok(())
    }

    pub fn state(&self, chunk: &Chunk) -> Option<ChunkState> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(chunk.index)
            .filter(|slot| slot.region.addr == chunk.addr)
            .map(|slot| slot.state)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = PoolStats {
            allocated: inner.slots.len(),
            ..PoolStats::default()
        };
        for slot in &inner.slots {
            match slot.state {
                ChunkState::Free => stats.free += 1,
                ChunkState::PostedToDevice => stats.posted += 1,
                ChunkState::OwnedByConsumer => stats.consumer += 1,
            }
        }
        stats
    }
}

impl<B: Bus> Drop for BufferPool<B> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let leaked = inner.in_use.count_ones(..);
        if leaked > 0 {
            log::warn!("Buffer pool dropped with {leaked} chunks in use");
        }
        for slot in inner.slots.drain(..) {
            self.bus.dma_free(slot.region);
        }
    }
}
