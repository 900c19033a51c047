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

//! Device register map.
//!
//! Offsets are relative to the start of the device BAR as seen through
//! [`Bus::read32`](crate::Bus::read32) / [`Bus::write32`](crate::Bus::write32).

use crate::queue::QueueKind;

pub const CIR_IN_PARAM_HI: u32 = 0x71000;
pub const CIR_IN_PARAM_LO: u32 = 0x71004;
pub const CIR_IN_MODIFIER: u32 = 0x71008;
pub const CIR_OUT_PARAM_HI: u32 = 0x7100C;
pub const CIR_OUT_PARAM_LO: u32 = 0x71010;
pub const CIR_TOKEN: u32 = 0x71014;
pub const CIR_CTRL: u32 = 0x71018;

/// Set by software to start a command, cleared by the device when done.
pub const CIR_CTRL_GO_BIT: u32 = 1 << 23;
/// Requests a completion event instead of polling. Never set by this driver.
pub const CIR_CTRL_EVREQ_BIT: u32 = 1 << 22;
pub const CIR_CTRL_OPCODE_MOD_SHIFT: u32 = 12;
pub const CIR_CTRL_STATUS_SHIFT: u32 = 24;

pub const DOORBELL_SDQ_OFFSET: u32 = 0x000;
pub const DOORBELL_ARM_CQ_OFFSET: u32 = 0x100;
pub const DOORBELL_RDQ_OFFSET: u32 = 0x200;
pub const DOORBELL_ARM_EQ_OFFSET: u32 = 0x300;
pub const DOORBELL_CQ_OFFSET: u32 = 0x400;
pub const DOORBELL_EQ_OFFSET: u32 = 0x600;

/// Each doorbell bank holds one 32-bit register per queue.
pub const DOORBELL_BANK_QUEUES: u16 = 64;

const fn doorbell_offset(kind: QueueKind) -> u32 {
    match kind {
        QueueKind::Send => DOORBELL_SDQ_OFFSET,
        QueueKind::Receive => DOORBELL_RDQ_OFFSET,
        QueueKind::Completion => DOORBELL_CQ_OFFSET,
        QueueKind::Event => DOORBELL_EQ_OFFSET,
    }
}

const fn arm_offset(kind: QueueKind) -> Option<u32> {
    match kind {
        QueueKind::Completion => Some(DOORBELL_ARM_CQ_OFFSET),
        QueueKind::Event => Some(DOORBELL_ARM_EQ_OFFSET),
        QueueKind::Send | QueueKind::Receive => None,
    }
}

/// Producer/consumer doorbell register for queue `num` of `kind`.
pub const fn doorbell(page: u32, kind: QueueKind, num: u16) -> u32 {
    page + doorbell_offset(kind) + 4 * num as u32
}

/// Arm doorbell register, only completion and event queues have one.
pub const fn arm_doorbell(page: u32, kind: QueueKind, num: u16) -> Option<u32> {
    match arm_offset(kind) {
        Some(offset) => Some(page + offset + 4 * num as u32),
        None => None,
    }
}
