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

//! Ring Storage
//!
//! A power-of-two array of fixed-size elements in DMA memory. Index
//! arithmetic and ownership live in [`QueueCore`](crate::QueueCore); this
//! type only knows where element `i` is.

use std::sync::Arc;

use bytemuck::Pod;

use crate::access::{Bus, DmaRegion};
use crate::error::QueueError;

pub struct RingStorage<B: Bus> {
    bus: Arc<B>,
    region: DmaRegion,
    count: u16,
    elem_size: usize,
}

impl<B: Bus> RingStorage<B> {
    /// Allocate `count * elem_size` bytes of zeroed DMA memory.
    pub fn new(bus: Arc<B>, count: u16, elem_size: usize) -> Result<Self, QueueError> {
        if !count.is_power_of_two() || elem_size == 0 {
            return Err(QueueError::InvalidState);
        }

        let region = bus.dma_alloc(count as usize * elem_size)?;
        Ok(Self {
            bus,
            region,
            count,
            elem_size,
        })
    }

    /// Bus address of element `index` or None if out of bounds.
    #[inline]
    pub fn element_at(&self, index: u16) -> Option<u64> {
        if index >= self.count {
            return None;
        }

        Some(self.region.addr + index as u64 * self.elem_size as u64)
    }

    pub fn read<T: Pod>(&self, index: u16) -> Result<T, QueueError> {
        debug_assert!(core::mem::size_of::<T>() <= self.elem_size);
        let addr = self.element_at(index).ok_or(QueueError::InvalidState)?;
        self.bus.read_val(addr).map_err(|_| QueueError::MemError)
    }

    pub fn write<T: Pod>(&self, index: u16, val: T) -> Result<(), QueueError> {
        debug_assert!(core::mem::size_of::<T>() <= self.elem_size);
        let addr = self.element_at(index).ok_or(QueueError::InvalidState)?;
        self.bus.write_val(addr, val).map_err(|_| QueueError::MemError)
    }

    /// Bus address of element 0, handed to the device at queue creation.
    pub fn addr(&self) -> u64 {
        self.region.addr
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B: Bus> Drop for RingStorage<B> {
    fn drop(&mut self) {
        self.bus.dma_free(self.region);
    }
}
