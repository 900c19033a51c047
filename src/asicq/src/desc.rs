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

//! Ring Element Layouts
//!
//! Byte layouts of the three element kinds exchanged with the device:
//! work queue elements posted on send/receive queues, completion queue
//! elements and event queue elements. Completion and event elements carry an
//! owner bit in their flags word which the device flips every ring epoch.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::access::{MemOps, rmb};
use crate::packet::Timestamp;

/// Scatter/gather entries per work queue element.
pub const WQE_SG_ENTRIES: usize = 3;

bitflags! {
    /// Work queue element control flags.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct WqeFlags: u16 {
        /// Control (EMAD) packet, consumed by the device itself.
        const EMAD = 1 << 0;
        /// Request IP checksum offload.
        const IPCS = 1 << 1;
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct CqeFlags: u16 {
        /// Ownership bit, flipped by the device every ring epoch.
        const OWNER  = 1 << 0;
        /// Completion for a send queue (otherwise a receive queue).
        const SEND   = 1 << 1;
        /// `source` is a LAG id and `lag_port_index` is valid.
        const LAG    = 1 << 2;
        /// The device reported an error for this element.
        const ERROR  = 1 << 3;
        /// `mirror_reason` is valid.
        const MIRROR = 1 << 4;
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct EqeFlags: u16 {
        const OWNER = 1 << 0;
    }
}

/// Completion element format revision supported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum CqeVersion {
    V0 = 0,
    V1 = 1,
    #[default]
    V2 = 2,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct SgEntry {
    /// Bus address of the fragment.
    pub address: u64,
    /// Fragment length. Zero marks an unused entry.
    pub byte_count: u32,
    pub _rsvd: u32,
}

impl SgEntry {
    pub fn new(address: u64, byte_count: u32) -> Self {
        Self {
            address,
            byte_count,
            _rsvd: 0,
        }
    }
}

/// Work queue element, posted on send and receive descriptor queues.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Wqe {
    pub flags: u16,
    pub _rsvd0: u16,
    pub _rsvd1: u32,
    pub sg: [SgEntry; WQE_SG_ENTRIES],
    pub _rsvd2: u64,
}

const _: () = assert!(core::mem::size_of::<SgEntry>() == 16);
const _: () = assert!(core::mem::size_of::<Wqe>() == 64);
const _: () = assert!(Wqe::SG_OFFSET == 8);

impl Wqe {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const SG_OFFSET: usize = core::mem::offset_of!(Self, sg);

    #[inline]
    pub fn flags(&self) -> WqeFlags {
        WqeFlags::from_bits_truncate(self.flags)
    }

    /// Total bytes described by the scatter/gather list.
    pub fn total_len(&self) -> usize {
        self.sg.iter().map(|e| e.byte_count as usize).sum()
    }
}

/// Completion queue element.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Cqe {
    /// Received bytes. Unused for send completions.
    pub byte_count: u16,
    /// Counter of the work element this completes.
    pub wqe_counter: u16,
    /// Send or receive queue number.
    pub dqn: u16,
    pub trap_id: u16,
    /// Ingress system port, or LAG id when [`CqeFlags::LAG`] is set.
    pub source: u16,
    pub lag_port_index: u16,
    pub flags: u16,
    pub mirror_reason: u8,
    pub _rsvd0: u8,
    pub ts_sec: u32,
    pub ts_nsec: u32,
    pub cookie_index: u32,
    pub _rsvd1: u32,
}

const _: () = assert!(core::mem::size_of::<Cqe>() == 32);
const _: () = assert!(Cqe::FLAGS_OFFSET == 12);
const _: () = assert!(Cqe::FLAGS_OFFSET % 2 == 0);

impl Cqe {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    #[inline]
    pub fn flags(&self) -> CqeFlags {
        CqeFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_send(&self) -> bool {
        self.flags().contains(CqeFlags::SEND)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.flags().contains(CqeFlags::ERROR)
    }

    /// Mirror reason, reported from V1 onwards.
    pub fn mirror_reason(&self, version: CqeVersion) -> Option<u8> {
        (version >= CqeVersion::V1 && self.flags().contains(CqeFlags::MIRROR))
            .then_some(self.mirror_reason)
    }

    /// ACL cookie index, reported from V1 onwards.
    pub fn cookie_index(&self, version: CqeVersion) -> Option<u32> {
        (version >= CqeVersion::V1).then_some(self.cookie_index)
    }

    /// Hardware timestamp, only present in V2 elements.
    pub fn timestamp(&self, version: CqeVersion) -> Option<Timestamp> {
        (version >= CqeVersion::V2).then_some(Timestamp {
            sec: self.ts_sec,
            nsec: self.ts_nsec,
        })
    }
}

/// Event queue element.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Eqe {
    /// Completion queue that has new elements.
    pub cqn: u16,
    pub flags: u16,
    pub event_type: u16,
    pub _rsvd0: u16,
    pub _rsvd1: u64,
}

const _: () = assert!(core::mem::size_of::<Eqe>() == 16);
const _: () = assert!(Eqe::FLAGS_OFFSET == 2);

impl Eqe {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    /// Completion event. Other event types are acknowledged and skipped.
    pub const EVENT_COMPLETION: u16 = 0;

    #[inline]
    pub fn flags(&self) -> EqeFlags {
        EqeFlags::from_bits_truncate(self.flags)
    }
}

/// An element the device hands to software by flipping an owner bit.
pub trait OwnedElement: Pod {
    /// Offset of the 16-bit flags word holding the owner bit.
    const FLAGS_OFFSET: usize;
    /// Owner bit within the flags word.
    const OWNER: u16;

    fn flags_mut(&mut self) -> &mut u16;

    /// Stamp the owner bit.
    fn set_owner(&mut self, owner: bool) {
        let flags = self.flags_mut();
        if owner {
            *flags |= Self::OWNER;
        } else {
            *flags &= !Self::OWNER;
        }
    }

    /// Load the owner bit with acquire semantics.
    fn load_owner<M: MemOps>(mem: &M, addr: u64) -> Result<bool, M::Error> {
        let flags = mem.load_acquire(addr + Self::FLAGS_OFFSET as u64)?;
        Ok(flags & Self::OWNER != 0)
    }

    /// Read the whole element once its owner bit has been checked.
    ///
    /// The barrier keeps the body reads from being satisfied before the
    /// owner bit read that handed the element to software.
    fn read_after_owner<M: MemOps>(mem: &M, addr: u64) -> Result<Self, M::Error> {
        rmb();
        mem.read_val(addr)
    }
}

impl OwnedElement for Cqe {
    const FLAGS_OFFSET: usize = Cqe::FLAGS_OFFSET;
    const OWNER: u16 = CqeFlags::OWNER.bits();

    fn flags_mut(&mut self) -> &mut u16 {
        &mut self.flags
    }
}

impl OwnedElement for Eqe {
    const FLAGS_OFFSET: usize = Eqe::FLAGS_OFFSET;
    const OWNER: u16 = EqeFlags::OWNER.bits();

    fn flags_mut(&mut self) -> &mut u16 {
        &mut self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_owner_keeps_other_flags() {
        let mut cqe = Cqe::zeroed();
        cqe.flags = (CqeFlags::SEND | CqeFlags::LAG).bits();
        cqe.set_owner(true);
        assert!(cqe.flags().contains(CqeFlags::OWNER));
        assert!(cqe.flags().contains(CqeFlags::SEND | CqeFlags::LAG));
        cqe.set_owner(false);
        assert!(!cqe.flags().contains(CqeFlags::OWNER));
        assert!(cqe.is_send());
    }

    #[test]
    fn eqe_owner_is_bit_zero_of_flags() {
        let mut eqe = Eqe::zeroed();
        eqe.set_owner(true);
        assert_eq!(eqe.flags, 1);
        let bytes = bytemuck::bytes_of(&eqe);
        assert_eq!(bytes[Eqe::FLAGS_OFFSET], 1);
    }

    #[test]
    fn v0_hides_mirror_cookie_and_timestamp() {
        let cqe = Cqe {
            flags: CqeFlags::MIRROR.bits(),
            mirror_reason: 7,
            cookie_index: 42,
            ts_sec: 1,
            ts_nsec: 2,
            ..Cqe::zeroed()
        };
        assert_eq!(cqe.mirror_reason(CqeVersion::V0), None);
        assert_eq!(cqe.cookie_index(CqeVersion::V0), None);
        assert_eq!(cqe.timestamp(CqeVersion::V0), None);

        assert_eq!(cqe.mirror_reason(CqeVersion::V1), Some(7));
        assert_eq!(cqe.cookie_index(CqeVersion::V1), Some(42));
        assert_eq!(cqe.timestamp(CqeVersion::V1), None);

        assert_eq!(
            cqe.timestamp(CqeVersion::V2),
            Some(Timestamp { sec: 1, nsec: 2 })
        );
    }

    #[test]
    fn mirror_reason_requires_flag() {
        let cqe = Cqe {
            mirror_reason: 3,
            ..Cqe::zeroed()
        };
        assert_eq!(cqe.mirror_reason(CqeVersion::V2), None);
    }

    #[test]
    fn wqe_total_len_sums_entries() {
        let mut wqe = Wqe::zeroed();
        wqe.sg[0] = SgEntry::new(0x1000, 100);
        wqe.sg[2] = SgEntry::new(0x3000, 28);
        assert_eq!(wqe.total_len(), 128);
    }
}
