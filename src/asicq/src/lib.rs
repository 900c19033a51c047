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

//! Queue engine for a PCI-attached switch ASIC.
//!
//! The driver talks to the device through four kinds of DMA rings and a
//! register-level command interface:
//!
//! - **Send descriptor queues** ([`SendQueue`]): packets handed to the device
//!   for transmission.
//! - **Receive descriptor queues** ([`ReceiveQueue`]): pre-posted buffers the
//!   device fills with incoming packets.
//! - **Completion queues** ([`CompletionQueue`]): one per data queue, reporting
//!   finished work.
//! - **Event queue** ([`EventQueue`]): names the completion queues that need
//!   servicing after an interrupt.
//!
//! Everything is driven through a [`Device`], which owns the queue groups, the
//! [`CommandChannel`] and the receive [`BufferPool`]. Hardware access goes
//! through the [`Bus`] trait so the same engine can run against a real PCI
//! backend or a simulated one.
//!
//! # Quick Start
//!
//! ```ignore
//! let config = DeviceConfig::default();
//! let (scheduler, work) = ChannelScheduler::for_config(&config);
//! let device = Arc::new(Device::new(bus, config, handler, Box::new(scheduler))?);
//! device.bring_up()?;
//! let workers = WorkerPool::spawn(device.clone(), work, device.config().get_worker_threads())?;
//!
//! let meta = TxMeta { local_port: 12, ..TxMeta::default() };
//! if let Err(rejected) = device.transmit(TxQueue::Pick, TxPacket::new(frame), meta) {
//!     // rejected.packet is still ours, retry after completions
//! }
//!
//! // from the interrupt handler
//! device.interrupt();
//! ```

#[macro_use]
mod ratelimit;

pub mod access;
pub mod cmd;
pub mod config;
pub mod cq;
pub mod desc;
pub mod device;
pub mod eq;
pub mod error;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod rdq;
pub mod regs;
pub mod ring;
pub mod sdq;
pub mod work;

#[cfg(test)]
pub(crate) mod sim;

pub use access::{Bus, DmaError, DmaRegion, MemOps};
pub use cmd::{CancelToken, CmdStatus, Command, CommandChannel, Opcode, QueueMbox};
pub use config::DeviceConfig;
pub use cq::{CompletionQueue, CompletionSink, CqBinding, CqState, Poll};
pub use desc::{Cqe, CqeFlags, CqeVersion, Eqe, EqeFlags, SgEntry, Wqe, WqeFlags};
pub use device::Device;
pub use eq::EventQueue;
pub use error::{CmdError, ConfigError, DeviceError, QueueError, TxError};
pub use packet::{
    Ingress, PacketHandler, RxMeta, RxPacket, Timestamp, TxDone, TxMeta, TxPacket, TxQueue,
    TxRejected,
};
pub use pool::{BufferPool, Chunk, ChunkState, PoolStats};
pub use queue::{QueueCore, QueueId, QueueKind};
pub use rdq::{ReceiveQueue, RxLayout};
pub use ring::RingStorage;
pub use sdq::SendQueue;
pub use work::{ChannelScheduler, Schedule, Work, WorkerPool};
