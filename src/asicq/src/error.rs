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

use thiserror::Error;

use crate::access::DmaError;
use crate::cmd::CmdStatus;
use crate::queue::QueueKind;

/// Errors raised by ring and queue operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No free producer slot. Normal backpressure, retry after completions.
    #[error("Queue is full")]
    Full,
    /// The buffer pool cannot hand out another chunk, or every receive slot
    /// is already posted.
    #[error("No buffer available")]
    Exhausted,
    /// DMA memory for a ring or chunk could not be allocated.
    #[error("Out of DMA memory")]
    OutOfMemory,
    /// The bus failed a ring memory access.
    #[error("Backend memory error")]
    MemError,
    /// Internal bookkeeping does not match the requested transition.
    #[error("Invalid state")]
    InvalidState,
    /// The queue group has not been created.
    #[error("{0:?} queue group has not been created")]
    NotCreated(QueueKind),
    /// The queue group already exists.
    #[error("{0:?} queue group already exists")]
    AlreadyCreated(QueueKind),
    /// Lifecycle ordering violated: the first group needs the second.
    #[error("{0:?} queue group requires the {1:?} group")]
    Ordering(QueueKind, QueueKind),
    /// The group cannot be destroyed while the second one exists.
    #[error("{0:?} queue group is still used by the {1:?} group")]
    InUse(QueueKind, QueueKind),
    /// Requested group size does not match the device configuration.
    #[error("{0:?} queue group cannot hold {1} queues")]
    BadCount(QueueKind, usize),
}

impl From<DmaError> for QueueError {
    fn from(err: DmaError) -> Self {
        match err {
            DmaError::OutOfMemory => QueueError::OutOfMemory,
            DmaError::MapFailed(_) => QueueError::MemError,
        }
    }
}

/// Errors returned by the command channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdError {
    /// The device did not clear the go bit in time. No output was read.
    #[error("Command timed out")]
    Timeout,
    /// The device completed the command with a nonzero status.
    #[error("Command failed with status {0}")]
    Device(CmdStatus),
    /// Waiting for the mailbox lock was cancelled.
    #[error("Command was interrupted")]
    Interrupted,
    /// Input or output does not fit in a mailbox.
    #[error("Command payload of {0} bytes exceeds the mailbox")]
    MailboxTooLarge(usize),
    /// Mailbox memory could not be accessed.
    #[error("Mailbox memory error")]
    MemError,
    #[error("Mailbox allocation failed: {0}")]
    Dma(#[from] DmaError),
}

/// Rejected device configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be a power of two, got {1}")]
    NotPowerOfTwo(&'static str, usize),
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
    #[error("Completion queue depth {cq} is smaller than data queue depth {dq}")]
    CqTooShallow { cq: usize, dq: usize },
    #[error("A receive buffer would need {0} fragments")]
    TooManyFragments(usize),
    #[error("Page size {page} cannot hold the {overhead} byte receive overhead")]
    PageTooSmall { page: usize, overhead: usize },
    #[error("{0} does not fit in usize")]
    Overflow(&'static str),
}

/// Reasons a transmit was refused. The packet is handed back in
/// [`TxRejected`](crate::TxRejected).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The send queue is full. Retry after completions.
    #[error("Send queue is busy")]
    Busy,
    /// A fragment could not be mapped for the device.
    #[error("Failed to map packet: {0}")]
    Map(DmaError),
    /// No send queue with that number exists.
    #[error("Send queue {0} does not exist")]
    NoQueue(u16),
    /// The descriptor could not be written.
    #[error("Queue error: {0}")]
    Queue(QueueError),
}

/// Top-level errors from [`Device`](crate::Device) operations.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Command error: {0}")]
    Cmd(#[from] CmdError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("DMA error: {0}")]
    Dma(#[from] DmaError),
    /// Creating a queue group failed. Everything created before the failure
    /// has already been destroyed.
    #[error("Failed to create {kind:?} queue group: {source}")]
    Lifecycle {
        kind: QueueKind,
        #[source]
        source: Box<DeviceError>,
    },
}

impl DeviceError {
    /// The innermost error, looking through [`DeviceError::Lifecycle`].
    pub fn root(&self) -> &DeviceError {
        match self {
            DeviceError::Lifecycle { source, .. } => source.root(),
            other => other,
        }
    }
}
