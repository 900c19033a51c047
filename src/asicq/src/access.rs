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

//! Bus Access Traits
//!
//! The queue engine never touches the device directly. Ring memory, packet
//! mappings and register accesses all go through the [`Bus`] trait so that
//! the rings can be driven by a PCI backend in production and by a simulated
//! device in tests.

use core::sync::atomic::{Ordering, fence};

use bytemuck::Pod;
use thiserror::Error;

/// Backend-provided access to DMA-coherent memory.
///
/// Addresses are bus addresses as returned by [`Bus::dma_alloc`] or
/// [`Bus::dma_map`]; they are what the device sees.
pub trait MemOps {
    type Error: core::fmt::Debug;

    /// Read bytes from DMA memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to DMA memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// Used for the owner-bearing flags word of completion and event elements.
    /// `addr` must be 2-byte aligned.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

/// A contiguous block of device-visible memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaRegion {
    /// Bus address of the first byte.
    pub addr: u64,
    /// Length in bytes.
    pub len: usize,
}

impl DmaRegion {
    /// Does the region contain `len` bytes starting at `addr`?
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr && addr + len as u64 <= self.addr + self.len as u64
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    #[error("Out of DMA memory")]
    OutOfMemory,
    #[error("Failed to map {0} bytes for device access")]
    MapFailed(usize),
}

/// Everything the queue engine needs from the transport.
///
/// Register offsets are relative to the device's BAR. Doorbell offsets are
/// computed by [`crate::regs`].
pub trait Bus: MemOps + Send + Sync {
    /// Read a 32-bit device register.
    fn read32(&self, reg: u32) -> u32;

    /// Write a 32-bit device register.
    fn write32(&self, reg: u32, val: u32);

    /// Allocate zeroed DMA-coherent memory.
    fn dma_alloc(&self, len: usize) -> Result<DmaRegion, DmaError>;

    /// Release memory obtained from [`Bus::dma_alloc`].
    fn dma_free(&self, region: DmaRegion);

    /// Map a packet fragment for device reads and return its bus address.
    fn dma_map(&self, buf: &[u8]) -> Result<u64, DmaError>;

    /// Undo a [`Bus::dma_map`].
    fn dma_unmap(&self, addr: u64, len: usize);
}

/// Order all prior memory writes before a following doorbell write.
#[inline]
pub(crate) fn wmb() {
    fence(Ordering::Release);
}

/// Order an owner-bit read before reads of the rest of the element.
#[inline]
pub(crate) fn rmb() {
    fence(Ordering::Acquire);
}
