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

//! Command Interface
//!
//! Synchronous request/response channel to the device firmware. A command is
//! issued by writing mailbox addresses and the opcode into the command
//! interface registers and setting the go bit; the device clears the go bit
//! and reports a status when it is done. Only one command can be outstanding
//! per device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use spin::{Mutex, MutexGuard};
use tracing::{Span, instrument};

use crate::access::{Bus, DmaRegion, wmb};
use crate::error::CmdError;
use crate::regs;

/// Size of each of the two mailboxes.
pub const MBOX_SIZE: usize = 4096;
/// Bytes available through the direct output registers.
pub const DIRECT_OUT_SIZE: usize = 8;

/// Firmware command opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u16);

impl Opcode {
    pub const QUERY_FW: Self = Self(0x004);
    pub const SW2HW_EQ: Self = Self(0x013);
    pub const HW2SW_EQ: Self = Self(0x014);
    pub const SW2HW_CQ: Self = Self(0x01A);
    pub const HW2SW_CQ: Self = Self(0x01B);
    pub const ACCESS_REG: Self = Self(0x040);
    pub const SW2HW_DQ: Self = Self(0x201);
    pub const HW2SW_DQ: Self = Self(0x202);
}

/// Opcode modifier selecting the data queue direction.
pub const DQ_MOD_SEND: u8 = 0;
pub const DQ_MOD_RECEIVE: u8 = 1;

/// Nonzero completion status reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdStatus {
    InternalErr,
    BadOp,
    BadParam,
    BadSysState,
    BadResource,
    ResourceBusy,
    ExceedLim,
    BadResState,
    BadIndex,
    BadNvmem,
    RunningReset,
    BadPkt,
    Unknown(u8),
}

impl CmdStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::InternalErr,
            0x02 => Self::BadOp,
            0x03 => Self::BadParam,
            0x04 => Self::BadSysState,
            0x05 => Self::BadResource,
            0x06 => Self::ResourceBusy,
            0x08 => Self::ExceedLim,
            0x09 => Self::BadResState,
            0x0A => Self::BadIndex,
            0x0B => Self::BadNvmem,
            0x26 => Self::RunningReset,
            0x30 => Self::BadPkt,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::InternalErr => 0x01,
            Self::BadOp => 0x02,
            Self::BadParam => 0x03,
            Self::BadSysState => 0x04,
            Self::BadResource => 0x05,
            Self::ResourceBusy => 0x06,
            Self::ExceedLim => 0x08,
            Self::BadResState => 0x09,
            Self::BadIndex => 0x0A,
            Self::BadNvmem => 0x0B,
            Self::RunningReset => 0x26,
            Self::BadPkt => 0x30,
            Self::Unknown(code) => *code,
        }
    }
}

impl core::fmt::Display for CmdStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?} ({:#04x})", self.code())
    }
}

/// Queue creation mailbox passed with the SW2HW commands.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct QueueMbox {
    /// Bus address of the ring.
    pub ring_addr: u64,
    /// log2 of the element count.
    pub log_size: u16,
    /// Completion queue of a data queue, event queue of a completion queue.
    pub bound_queue: u16,
    /// Completion element version, completion queues only.
    pub version: u16,
    pub flags: u16,
}

const _: () = assert!(core::mem::size_of::<QueueMbox>() == 16);

impl QueueMbox {
    pub fn new(ring_addr: u64, count: u16, bound_queue: u16) -> Self {
        Self {
            ring_addr,
            log_size: count.trailing_zeros() as u16,
            bound_queue,
            ..Self::default()
        }
    }

    pub fn count(&self) -> u16 {
        1 << self.log_size
    }
}

/// Cancels a command that is still waiting for the mailbox lock.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A single command invocation.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    pub opcode: Opcode,
    pub opcode_mod: u8,
    pub in_mod: u32,
    pub input: Option<&'a [u8]>,
    /// Read output from the out-param registers instead of the mailbox.
    pub direct_out: bool,
    /// None uses the channel default.
    pub timeout: Option<Duration>,
}

impl<'a> Command<'a> {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            opcode_mod: 0,
            in_mod: 0,
            input: None,
            direct_out: false,
            timeout: None,
        }
    }

    pub fn modifier(mut self, opcode_mod: u8, in_mod: u32) -> Self {
        self.opcode_mod = opcode_mod;
        self.in_mod = in_mod;
        self
    }

    pub fn input(mut self, input: &'a [u8]) -> Self {
        self.input = Some(input);
        self
    }

    pub fn direct_out(mut self) -> Self {
        self.direct_out = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct CommandChannel<B: Bus> {
    bus: Arc<B>,
    in_mbox: DmaRegion,
    out_mbox: DmaRegion,
    lock: Mutex<()>,
    default_timeout: Duration,
}

impl<B: Bus> CommandChannel<B> {
    pub fn new(bus: Arc<B>, default_timeout: Duration) -> Result<Self, CmdError> {
        let in_mbox = bus.dma_alloc(MBOX_SIZE)?;
        let out_mbox = match bus.dma_alloc(MBOX_SIZE) {
            Ok(region) => region,
            Err(err) => {
                bus.dma_free(in_mbox);
                return Err(err.into());
            }
        };

        Ok(Self {
            bus,
            in_mbox,
            out_mbox,
            lock: Mutex::new(()),
            default_timeout,
        })
    }

    fn lock(&self, cancel: Option<&CancelToken>) -> Result<MutexGuard<'_, ()>, CmdError> {
        loop {
            if let Some(guard) = self.lock.try_lock() {
                return Ok(guard);
            }
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(CmdError::Interrupted);
            }
            std::thread::yield_now();
        }
    }

    /// Run a command and wait for its completion.
    ///
    /// On success, `output` (if any) is filled from the out mailbox, or from
    /// the out-param registers for direct-output commands. On timeout the
    /// output buffer is left untouched.
    #[instrument(err(Debug), skip_all, parent = Span::current(), fields(opcode = cmd.opcode.0), level = "Trace")]
    pub fn execute(
        &self,
        cmd: &Command<'_>,
        output: Option<&mut [u8]>,
        cancel: Option<&CancelToken>,
    ) -> Result<(), CmdError> {
        let in_len = cmd.input.map_or(0, <[u8]>::len);
        if in_len > MBOX_SIZE {
            return Err(CmdError::MailboxTooLarge(in_len));
        }
        let out_len = output.as_ref().map_or(0, |out| out.len());
        let out_max = if cmd.direct_out {
            DIRECT_OUT_SIZE
        } else {
            MBOX_SIZE
        };
        if out_len > out_max {
            return Err(CmdError::MailboxTooLarge(out_len));
        }

        let _guard = self.lock(cancel)?;

        let in_addr = match cmd.input {
            Some(input) => {
                let mut mbox = vec![0u8; MBOX_SIZE];
                mbox[..input.len()].copy_from_slice(input);
                self.bus
                    .write(self.in_mbox.addr, &mbox)
                    .map_err(|_| CmdError::MemError)?;
                self.in_mbox.addr
            }
            None => 0,
        };
        let out_addr = if output.is_some() && !cmd.direct_out {
            self.out_mbox.addr
        } else {
            0
        };

        self.bus
            .write32(regs::CIR_IN_PARAM_HI, (in_addr >> 32) as u32);
        self.bus.write32(regs::CIR_IN_PARAM_LO, in_addr as u32);
        self.bus.write32(regs::CIR_IN_MODIFIER, cmd.in_mod);
        self.bus
            .write32(regs::CIR_OUT_PARAM_HI, (out_addr >> 32) as u32);
        self.bus.write32(regs::CIR_OUT_PARAM_LO, out_addr as u32);
        self.bus.write32(regs::CIR_TOKEN, 0);

        wmb();

        self.bus.write32(
            regs::CIR_CTRL,
            regs::CIR_CTRL_GO_BIT
                | ((cmd.opcode_mod as u32) << regs::CIR_CTRL_OPCODE_MOD_SHIFT)
                | cmd.opcode.0 as u32,
        );

        let timeout = cmd.timeout.unwrap_or(self.default_timeout);
        // a timeout past the end of the clock waits forever
        let deadline = Instant::now().checked_add(timeout);
        let status = loop {
            let ctrl = self.bus.read32(regs::CIR_CTRL);
            if ctrl & regs::CIR_CTRL_GO_BIT == 0 {
                break (ctrl >> regs::CIR_CTRL_STATUS_SHIFT) as u8;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                log::warn!(
                    "Command {:#05x} timed out after {}ms",
                    cmd.opcode.0,
                    timeout.as_millis()
                );
                return Err(CmdError::Timeout);
            }
            std::thread::yield_now();
        };

        if status != 0 {
            let status = CmdStatus::from_code(status);
            log::error!("Command {:#05x} failed: {status}", cmd.opcode.0);
            return Err(CmdError::Device(status));
        }

        if let Some(out) = output {
            if cmd.direct_out {
                let mut direct = [0u8; DIRECT_OUT_SIZE];
                direct[..4].copy_from_slice(&self.bus.read32(regs::CIR_OUT_PARAM_HI).to_be_bytes());
                direct[4..].copy_from_slice(&self.bus.read32(regs::CIR_OUT_PARAM_LO).to_be_bytes());
                out.copy_from_slice(&direct[..out.len()]);
            } else {
                self.bus
                    .read(self.out_mbox.addr, out)
                    .map_err(|_| CmdError::MemError)?;
            }
        }

        Ok(())
    }

    fn run(&self, cmd: Command<'_>) -> Result<(), CmdError> {
        self.execute(&cmd, None, None)
    }

    pub fn sw2hw_eq(&self, num: u16, mbox: &QueueMbox) -> Result<(), CmdError> {
        self.run(
            Command::new(Opcode::SW2HW_EQ)
                .modifier(0, num as u32)
                .input(bytemuck::bytes_of(mbox)),
        )
    }

    pub fn hw2sw_eq(&self, num: u16) -> Result<(), CmdError> {
        self.run(Command::new(Opcode::HW2SW_EQ).modifier(0, num as u32))
    }

    pub fn sw2hw_cq(&self, num: u16, mbox: &QueueMbox) -> Result<(), CmdError> {
        self.run(
            Command::new(Opcode::SW2HW_CQ)
                .modifier(0, num as u32)
                .input(bytemuck::bytes_of(mbox)),
        )
    }

    pub fn hw2sw_cq(&self, num: u16) -> Result<(), CmdError> {
        self.run(Command::new(Opcode::HW2SW_CQ).modifier(0, num as u32))
    }

    pub fn sw2hw_dq(&self, dq_mod: u8, num: u16, mbox: &QueueMbox) -> Result<(), CmdError> {
        self.run(
            Command::new(Opcode::SW2HW_DQ)
                .modifier(dq_mod, num as u32)
                .input(bytemuck::bytes_of(mbox)),
        )
    }

    pub fn hw2sw_dq(&self, dq_mod: u8, num: u16) -> Result<(), CmdError> {
        self.run(Command::new(Opcode::HW2SW_DQ).modifier(dq_mod, num as u32))
    }
}

impl<B: Bus> Drop for CommandChannel<B> {
    fn drop(&mut self) {
        self.bus.dma_free(self.in_mbox);
        self.bus.dma_free(self.out_mbox);
    }
}
