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

//! Packets exchanged with the packet stack.

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::desc::WQE_SG_ENTRIES;
use crate::error::TxError;

/// An outgoing packet as a list of fragments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxPacket {
    frags: SmallVec<[Bytes; WQE_SG_ENTRIES]>,
}

impl TxPacket {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let mut frags = SmallVec::new();
        frags.push(data.into());
        Self { frags }
    }

    pub fn from_fragments(frags: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            frags: frags.into_iter().collect(),
        }
    }

    pub fn fragments(&self) -> &[Bytes] {
        &self.frags
    }

    /// Total length across all fragments.
    pub fn len(&self) -> usize {
        self.frags.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coalesce trailing fragments so at most `max` remain.
    pub(crate) fn linearize(&mut self, max: usize) {
        if self.frags.len() <= max || max == 0 {
            return;
        }

        let tail = self.frags.drain(max - 1..).collect::<SmallVec<[Bytes; 8]>>();
        let mut merged = BytesMut::with_capacity(tail.iter().map(Bytes::len).sum());
        for frag in &tail {
            merged.extend_from_slice(frag);
        }
        self.frags.push(merged.freeze());
    }
}

impl From<Bytes> for TxPacket {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

/// Caller metadata carried with a packet until its completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TxMeta {
    pub local_port: u16,
    /// Control (EMAD) packet consumed by the device.
    pub is_control: bool,
    pub timestamp_requested: bool,
    /// Let the device fill in the IP checksum.
    pub checksum_offload: bool,
}

/// Which send queue to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TxQueue {
    Index(u16),
    /// Control packets on queue 0, data packets spread by local port.
    #[default]
    Pick,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

/// A finished transmit, handed back to the packet stack.
#[derive(Debug)]
pub enum TxDone {
    Released {
        packet: TxPacket,
        meta: TxMeta,
    },
    Timestamped {
        packet: TxPacket,
        meta: TxMeta,
        timestamp: Timestamp,
    },
}

impl TxDone {
    pub fn packet(&self) -> &TxPacket {
        match self {
            TxDone::Released { packet, .. } | TxDone::Timestamped { packet, .. } => packet,
        }
    }

    pub fn meta(&self) -> &TxMeta {
        match self {
            TxDone::Released { meta, .. } | TxDone::Timestamped { meta, .. } => meta,
        }
    }
}

/// A refused transmit. The caller keeps the packet.
#[derive(Debug)]
pub struct TxRejected {
    pub reason: TxError,
    pub packet: TxPacket,
}

impl core::fmt::Display for TxRejected {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "transmit of {} bytes rejected: {}", self.packet.len(), self.reason)
    }
}

impl std::error::Error for TxRejected {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ingress {
    Port(u16),
    Lag { lag_id: u16, port_index: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxMeta {
    pub ingress: Ingress,
    pub trap_id: u16,
    pub mirror_reason: Option<u8>,
    pub cookie_index: Option<u32>,
    pub timestamp: Option<Timestamp>,
}

/// A received packet, one [`Bytes`] per buffer it spanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    frags: SmallVec<[Bytes; WQE_SG_ENTRIES]>,
    pub meta: RxMeta,
}

impl RxPacket {
    pub(crate) fn new(frags: SmallVec<[Bytes; WQE_SG_ENTRIES]>, meta: RxMeta) -> Self {
        Self { frags, meta }
    }

    pub fn fragments(&self) -> &[Bytes] {
        &self.frags
    }

    pub fn len(&self) -> usize {
        self.frags.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contiguous copy of the packet.
    pub fn to_bytes(&self) -> Bytes {
        match self.frags.as_slice() {
            [single] => single.clone(),
            frags => {
                let mut out = BytesMut::with_capacity(self.len());
                for frag in frags {
                    out.extend_from_slice(frag);
                }
                out.freeze()
            }
        }
    }
}

/// The packet stack on top of the queues.
///
/// Called from completion processing, so implementations must not block.
pub trait PacketHandler: Send + Sync {
    fn receive(&self, packet: RxPacket);
    fn transmitted(&self, done: TxDone);
}
