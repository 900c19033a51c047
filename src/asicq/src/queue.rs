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

//! Queue Core
//!
//! Producer and consumer counters shared by every queue kind. Counters are
//! free-running 16-bit values; the low `log2(count)` bits select the ring
//! index and the next bit is the epoch parity compared against element owner
//! bits.

use crate::access::{Bus, wmb};
use crate::desc::OwnedElement;
use crate::error::QueueError;
use crate::regs;
use crate::ring::RingStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Send,
    Receive,
    Completion,
    Event,
}

/// Identifies a queue by kind and device queue number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub kind: QueueKind,
    pub num: u16,
}

/// Is an element with this owner bit still owned by the device?
///
/// Pure function of the stamped bit and the consumer epoch parity.
#[inline]
pub const fn is_hw_owned(owner: bool, consumer: u16, count: u16) -> bool {
    owner != ((consumer & count) != 0)
}

#[derive(Debug)]
pub struct QueueCore {
    id: QueueId,
    count: u16,
    producer: u16,
    consumer: u16,
    doorbell_page: u32,
}

impl QueueCore {
    pub fn new(id: QueueId, count: u16, doorbell_page: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        Self {
            id,
            count,
            producer: 0,
            consumer: 0,
            doorbell_page,
        }
    }

    #[inline]
    fn mask(&self) -> u16 {
        self.count - 1
    }

    /// Ring index for the next posted element, or [`QueueError::Full`].
    #[inline]
    pub fn elem_for_producer(&self) -> Result<u16, QueueError> {
        if self.is_full() {
            return Err(QueueError::Full);
        }
        Ok(self.producer & self.mask())
    }

    /// Ring index of the next element to consume. Check ownership first.
    #[inline]
    pub fn elem_for_consumer(&self) -> u16 {
        self.consumer & self.mask()
    }

    #[inline]
    pub fn is_hw_owned(&self, owner: bool) -> bool {
        is_hw_owned(owner, self.consumer, self.count)
    }

    /// Elements posted but not yet consumed.
    #[inline]
    pub fn in_flight(&self) -> u16 {
        self.producer.wrapping_sub(self.consumer)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.in_flight() == self.count
    }

    #[inline]
    pub fn advance_producer(&mut self) {
        debug_assert!(!self.is_full());
        self.producer = self.producer.wrapping_add(1);
    }

    /// Advance the consumer counter, returning its previous value.
    #[inline]
    pub fn advance_consumer(&mut self) -> u16 {
        let old = self.consumer;
        self.consumer = self.consumer.wrapping_add(1);
        old
    }

    /// Forget everything posted, as after the device has released the queue.
    pub fn reset(&mut self) {
        self.producer = 0;
        self.consumer = 0;
    }

    pub fn ring_doorbell_producer<B: Bus>(&self, bus: &B) {
        wmb();
        bus.write32(self.doorbell_reg(), self.producer as u32);
    }

    pub fn ring_doorbell_consumer<B: Bus>(&self, bus: &B) {
        wmb();
        bus.write32(
            self.doorbell_reg(),
            self.consumer.wrapping_add(self.count) as u32,
        );
    }

    pub fn ring_doorbell_arm<B: Bus>(&self, bus: &B) {
        let Some(reg) = regs::arm_doorbell(self.doorbell_page, self.id.kind, self.id.num) else {
            debug_assert!(false, "{:?} queues have no arm doorbell", self.id.kind);
            return;
        };
        wmb();
        bus.write32(reg, self.consumer as u32);
    }

    fn doorbell_reg(&self) -> u32 {
        regs::doorbell(self.doorbell_page, self.id.kind, self.id.num)
    }

    fn consumer_addr<B: Bus>(&self, ring: &RingStorage<B>) -> Result<u64, QueueError> {
        ring.element_at(self.elem_for_consumer())
            .ok_or(QueueError::InvalidState)
    }

    /// Has the device handed the next element to software?
    pub fn is_sw_ready<T: OwnedElement, B: Bus>(
        &self,
        ring: &RingStorage<B>,
    ) -> Result<bool, QueueError> {
        let addr = self.consumer_addr(ring)?;
        let owner = T::load_owner(ring.bus(), addr).map_err(|_| QueueError::MemError)?;
        Ok(!self.is_hw_owned(owner))
    }

    /// Take the next element if the device has handed it to software.
    pub fn pop_sw_owned<T: OwnedElement, B: Bus>(
        &mut self,
        ring: &RingStorage<B>,
    ) -> Result<Option<T>, QueueError> {
        if !self.is_sw_ready::<T, B>(ring)? {
            return Ok(None);
        }
        let addr = self.consumer_addr(ring)?;
        let elem = T::read_after_owner(ring.bus(), addr).map_err(|_| QueueError::MemError)?;
        self.advance_consumer();
        Ok(Some(elem))
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn producer(&self) -> u16 {
        self.producer
    }

    pub fn consumer(&self) -> u16 {
        self.consumer
    }
}
