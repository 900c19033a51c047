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

//! Receive descriptor queue.
//!
//! Every slot of a receive queue holds enough pool chunks for the largest
//! packet. When a completion arrives, replacement chunks are acquired first;
//! only then is the packet built from the filled chunks and the slot handed
//! back to the device with the replacements. If no replacements can be had,
//! the packet is dropped and the slot is reposted with its old chunks so the
//! ring never loses a buffer.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use spin::Mutex;

use crate::access::Bus;
use crate::cmd::QueueMbox;
use crate::config::DeviceConfig;
use crate::desc::{Cqe, CqeFlags, CqeVersion, SgEntry, WQE_SG_ENTRIES, Wqe};
use crate::error::{ConfigError, QueueError};
use crate::packet::{Ingress, RxMeta, RxPacket};
use crate::pool::{BufferPool, Chunk};
use crate::queue::{QueueCore, QueueId, QueueKind};
use crate::ring::RingStorage;

pub const TRAP_ID_DISCARD_INGRESS_ACL: u16 = 0x1C3;
pub const TRAP_ID_DISCARD_EGRESS_ACL: u16 = 0x1C4;
pub const TRAP_ID_MIRROR_SESSION0: u16 = 0x220;
pub const MIRROR_SESSIONS: u16 = 8;

type Chunks = SmallVec<[Chunk; WQE_SG_ENTRIES]>;

/// Placement of packet data inside receive buffers.
///
/// The first buffer of a packet starts `headroom` bytes in and leaves
/// `tail_reserve` bytes at its end. Later buffers are used whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxLayout {
    pub page_size: usize,
    pub headroom: usize,
    pub tail_reserve: usize,
    pub frags_per_elem: usize,
}

impl RxLayout {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            page_size: config.get_page_size(),
            headroom: config.get_rx_headroom(),
            tail_reserve: config.get_rx_tail_reserve(),
            frags_per_elem: config.rx_frags_per_elem()?,
        })
    }

    pub fn overhead(&self) -> usize {
        self.headroom + self.tail_reserve
    }

    /// Buffers spanned by a packet of `byte_count` bytes.
    pub fn num_frags(&self, byte_count: usize) -> usize {
        (byte_count + self.overhead()).div_ceil(self.page_size)
    }

    /// Offset and capacity of fragment `i` within its chunk.
    pub fn frag_window(&self, i: usize) -> (usize, usize) {
        if i == 0 {
            (self.headroom, self.page_size - self.overhead())
        } else {
            (0, self.page_size)
        }
    }

    fn wqe<'a>(&self, chunks: impl IntoIterator<Item = &'a Chunk>) -> Wqe {
        let mut wqe = Wqe::default();
        for (i, (entry, chunk)) in wqe.sg.iter_mut().zip(chunks).enumerate() {
            let (offset, len) = self.frag_window(i);
            *entry = SgEntry::new(chunk.addr() + offset as u64, len as u32);
        }
        wqe
    }
}

/// Packet metadata from a receive completion.
pub(crate) fn rx_meta(cqe: &Cqe, version: CqeVersion) -> RxMeta {
    let ingress = if cqe.flags().contains(CqeFlags::LAG) {
        Ingress::Lag {
            lag_id: cqe.source,
            port_index: cqe.lag_port_index,
        }
    } else {
        Ingress::Port(cqe.source)
    };

    let mut trap_id = cqe.trap_id;
    let mut mirror_reason = None;
    let mut cookie_index = None;
    match trap_id {
        TRAP_ID_DISCARD_INGRESS_ACL | TRAP_ID_DISCARD_EGRESS_ACL => {
            cookie_index = cqe.cookie_index(version);
        }
        id if (TRAP_ID_MIRROR_SESSION0..TRAP_ID_MIRROR_SESSION0 + MIRROR_SESSIONS).contains(&id) => {
            if let Some(reason) = cqe.mirror_reason(version) {
                mirror_reason = Some(reason);
                trap_id = TRAP_ID_MIRROR_SESSION0;
            }
        }
        _ => {}
    }

    RxMeta {
        ingress,
        trap_id,
        mirror_reason,
        cookie_index,
        timestamp: cqe.timestamp(version),
    }
}

struct State<B: Bus> {
    core: QueueCore,
    ring: RingStorage<B>,
    slots: Vec<Chunks>,
}

pub struct ReceiveQueue<B: Bus> {
    num: u16,
    cq_num: u16,
    bus: Arc<B>,
    pool: Arc<BufferPool<B>>,
    layout: RxLayout,
    state: Mutex<State<B>>,
}

impl<B: Bus> ReceiveQueue<B> {
    pub(crate) fn new(
        bus: Arc<B>,
        pool: Arc<BufferPool<B>>,
        num: u16,
        cq_num: u16,
        count: u16,
        layout: RxLayout,
        doorbell_page: u32,
    ) -> Result<Self, QueueError> {
        let ring = RingStorage::new(bus.clone(), count, Wqe::SIZE)?;
        let core = QueueCore::new(
            QueueId {
                kind: QueueKind::Receive,
                num,
            },
            count,
            doorbell_page,
        );

        Ok(Self {
            num,
            cq_num,
            bus,
            pool,
            layout,
            state: Mutex::new(State {
                core,
                ring,
                slots: (0..count).map(|_| Chunks::new()).collect(),
            }),
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn cq_num(&self) -> u16 {
        self.cq_num
    }

    pub fn layout(&self) -> &RxLayout {
        &self.layout
    }

    pub(crate) fn mbox(&self) -> QueueMbox {
        let state = self.state.lock();
        QueueMbox::new(state.ring.addr(), state.core.count(), self.cq_num)
    }

    /// Slots currently posted to the device.
    pub fn posted(&self) -> u16 {
        self.state.lock().core.in_flight()
    }

    /// Acquire `n` chunks, returning none of them on failure.
    fn acquire_chunks(&self, n: usize) -> Result<Chunks, QueueError> {
        let mut chunks = Chunks::new();
        for _ in 0..n {
            match self.pool.acquire() {
                Ok(chunk) => chunks.push(chunk),
                Err(err) => {
                    for chunk in chunks {
                        self.pool.recycle_direct(chunk);
                    }
                    return Err(err);
                }
            }
        }
        Ok(chunks)
    }

    fn post_one(&self, state: &mut State<B>) -> Result<(), QueueError> {
        let index = state
            .core
            .elem_for_producer()
            .map_err(|_| QueueError::Exhausted)?;
        let chunks = self.acquire_chunks(self.layout.frags_per_elem)?;

        if let Err(err) = state.ring.write(index, self.layout.wqe(&chunks)) {
            for chunk in chunks {
                self.pool.recycle_direct(chunk);
            }
            return Err(err);
        }

        let stale = core::mem::replace(&mut state.slots[index as usize], chunks);
        debug_assert!(stale.is_empty());
        for chunk in stale {
            self.pool.recycle_direct(chunk);
        }
        state.core.advance_producer();
        Ok(())
    }

    /// Post buffers into the next free slot and ring the doorbell.
    ///
    /// Fails with [`QueueError::Exhausted`] once every slot is posted or the
    /// pool runs dry.
    pub fn post_buffers(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        self.post_one(&mut state)?;
        state.core.ring_doorbell_producer(&*self.bus);
        Ok(())
    }

    /// Post every slot. On failure all chunks posted so far go back to the
    /// pool.
    pub(crate) fn fill(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        while !state.core.is_full() {
            if let Err(err) = self.post_one(&mut state) {
                let released = self.release_all(&mut state);
                log::debug!(
                    "Receive queue {}: initial posting failed, released {released} chunks: {err}",
                    self.num
                );
                return Err(err);
            }
        }
        state.core.ring_doorbell_producer(&*self.bus);
        Ok(())
    }

    fn release_all(&self, state: &mut State<B>) -> usize {
        let mut released = 0;
        for slot in state.slots.iter_mut() {
            for chunk in slot.drain(..) {
                self.pool.recycle_direct(chunk);
                released += 1;
            }
        }
        state.core.reset();
        released
    }

    /// Tell the device about slots reposted since the last doorbell.
    pub(crate) fn ring_producer_doorbell(&self) {
        let state = self.state.lock();
        state.core.ring_doorbell_producer(&*self.bus);
    }

    /// Consume the oldest posted slot for a receive completion.
    ///
    /// The slot is always reposted. Returns the packet unless it had to be
    /// dropped.
    pub(crate) fn reconstruct(&self, cqe: &Cqe, version: CqeVersion) -> Option<RxPacket> {
        let mut state = self.state.lock();
        if state.core.in_flight() == 0 {
            log_ratelimited!(
                log::Level::Warn,
                "Completion on empty receive queue {}",
                self.num
            );
            return None;
        }

        let index = state.core.elem_for_consumer();
        let consumer = state.core.advance_consumer();
        if consumer != cqe.wqe_counter {
            log_ratelimited!(
                log::Level::Debug,
                "Receive queue {}: consumer counter {consumer} does not match completion counter {}",
                self.num,
                cqe.wqe_counter
            );
        }

        let packet = self.take_packet(&mut state, index, cqe, version);
        state.core.advance_producer();
        packet
    }

    fn take_packet(
        &self,
        state: &mut State<B>,
        index: u16,
        cqe: &Cqe,
        version: CqeVersion,
    ) -> Option<RxPacket> {
        if cqe.is_error() {
            log_ratelimited!(
                log::Level::Debug,
                "Receive queue {}: device reported an error, dropping packet",
                self.num
            );
            return None;
        }

        let byte_count = cqe.byte_count as usize;
        let nfrags = self.layout.num_frags(byte_count);
        if nfrags > self.layout.frags_per_elem {
            log_ratelimited!(
                log::Level::Warn,
                "Receive queue {}: {byte_count} byte packet spans {nfrags} buffers, at most {} posted",
                self.num,
                self.layout.frags_per_elem
            );
            return None;
        }

        let fresh = match self.acquire_chunks(nfrags) {
            Ok(fresh) => fresh,
            Err(err) => {
                log_ratelimited!(
                    log::Level::Debug,
                    "Receive queue {}: no replacement buffers ({err}), dropping packet",
                    self.num
                );
                return None;
            }
        };

        let slot = &state.slots[index as usize];
        let wqe = self
            .layout
            .wqe(fresh.iter().chain(slot.iter().skip(nfrags)));
        if let Err(err) = state.ring.write(index, wqe) {
            log::error!("Receive queue {}: failed to repost slot {index}: {err}", self.num);
            for chunk in fresh {
                self.pool.recycle_direct(chunk);
            }
            return None;
        }

        let slot = &mut state.slots[index as usize];
        let mut consumed = Chunks::new();
        for (i, chunk) in fresh.into_iter().enumerate() {
            consumed.push(core::mem::replace(&mut slot[i], chunk));
        }

        let mut frags = SmallVec::new();
        let mut remaining = byte_count;
        let mut failed = false;
        for (i, chunk) in consumed.into_iter().enumerate() {
            let (offset, cap) = self.layout.frag_window(i);
            let len = remaining.min(cap);
            remaining -= len;
            if !failed {
                match self.copy_out(&chunk, offset, len) {
                    Ok(frag) => frags.push(frag),
                    Err(err) => {
                        log::error!("Receive queue {}: failed to read buffer: {err}", self.num);
                        failed = true;
                    }
                }
            }
            if let Err(err) = self.pool.release(chunk) {
                log::error!("Receive queue {}: failed to release buffer: {err}", self.num);
            }
        }

        if failed {
            return None;
        }
        Some(RxPacket::new(frags, rx_meta(cqe, version)))
    }

    fn copy_out(&self, chunk: &Chunk, offset: usize, len: usize) -> Result<Bytes, QueueError> {
        self.pool.hand_to_consumer(chunk)?;
        let mut buf = BytesMut::zeroed(len);
        self.pool.read(chunk, offset, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl<B: Bus> Drop for ReceiveQueue<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let mut released = 0;
        for slot in state.slots.iter_mut() {
            for chunk in slot.drain(..) {
                self.pool.recycle_direct(chunk);
                released += 1;
            }
        }
        if released > 0 {
            log::debug!("Receive queue {}: released {released} buffers", self.num);
        }
    }
}
