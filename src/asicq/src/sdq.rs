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

//! Send descriptor queue.
//!
//! `submit` maps the fragments of a packet, writes one work element and rings
//! the producer doorbell. The packet is parked against its ring slot until the
//! matching completion arrives, at which point the fragments are unmapped and
//! the packet is handed back.

use std::sync::Arc;

use smallvec::SmallVec;
use spin::Mutex;

use crate::access::Bus;
use crate::cmd::QueueMbox;
use crate::desc::{SgEntry, WQE_SG_ENTRIES, Wqe, WqeFlags};
use crate::error::{QueueError, TxError};
use crate::packet::{TxMeta, TxPacket, TxRejected};
use crate::queue::{QueueCore, QueueId, QueueKind};
use crate::ring::RingStorage;

type Mappings = SmallVec<[(u64, usize); WQE_SG_ENTRIES]>;

struct InFlight {
    packet: TxPacket,
    meta: TxMeta,
    mapped: Mappings,
}

struct State<B: Bus> {
    core: QueueCore,
    ring: RingStorage<B>,
    inflight: Vec<Option<InFlight>>,
}

pub struct SendQueue<B: Bus> {
    num: u16,
    cq_num: u16,
    bus: Arc<B>,
    state: Mutex<State<B>>,
}

impl<B: Bus> SendQueue<B> {
    pub(crate) fn new(
        bus: Arc<B>,
        num: u16,
        cq_num: u16,
        count: u16,
        doorbell_page: u32,
    ) -> Result<Self, QueueError> {
        let ring = RingStorage::new(bus.clone(), count, Wqe::SIZE)?;
        let core = QueueCore::new(
            QueueId {
                kind: QueueKind::Send,
                num,
            },
            count,
            doorbell_page,
        );

        Ok(Self {
            num,
            cq_num,
            bus,
            state: Mutex::new(State {
                core,
                ring,
                inflight: (0..count).map(|_| None).collect(),
            }),
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn cq_num(&self) -> u16 {
        self.cq_num
    }

    pub(crate) fn mbox(&self) -> QueueMbox {
        let state = self.state.lock();
        QueueMbox::new(state.ring.addr(), state.core.count(), self.cq_num)
    }

    /// Would a submit right now be refused for lack of space?
    pub fn is_busy(&self) -> bool {
        self.state.lock().core.is_full()
    }

    /// Elements submitted and not yet completed.
    pub fn in_flight(&self) -> u16 {
        self.state.lock().core.in_flight()
    }

    fn unmap(&self, mapped: &Mappings) {
        for &(addr, len) in mapped {
            self.bus.dma_unmap(addr, len);
        }
    }

    /// Queue a packet for transmission.
    ///
    /// On failure nothing stays mapped and the packet comes back inside the
    /// error.
    pub fn submit(&self, mut packet: TxPacket, meta: TxMeta) -> Result<(), TxRejected> {
        let mut state = self.state.lock();
        let index = match state.core.elem_for_producer() {
            Ok(index) => index,
            Err(_) => {
                return Err(TxRejected {
                    reason: TxError::Busy,
                    packet,
                });
            }
        };

        packet.linearize(WQE_SG_ENTRIES);

        let mut flags = WqeFlags::empty();
        flags.set(WqeFlags::EMAD, meta.is_control);
        flags.set(WqeFlags::IPCS, meta.checksum_offload);
        let mut wqe = Wqe {
            flags: flags.bits(),
            ..Wqe::default()
        };

        let mut mapped = Mappings::new();
        let mut map_err = None;
        for frag in packet.fragments() {
            match self.bus.dma_map(frag) {
                Ok(addr) => mapped.push((addr, frag.len())),
                Err(err) => {
                    map_err = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = map_err {
            self.unmap(&mapped);
            return Err(TxRejected {
                reason: TxError::Map(err),
                packet,
            });
        }

        // unused entries keep a zero byte count
        for (entry, &(addr, len)) in wqe.sg.iter_mut().zip(&mapped) {
            *entry = SgEntry::new(addr, len as u32);
        }

        if let Err(err) = state.ring.write(index, wqe) {
            self.unmap(&mapped);
            return Err(TxRejected {
                reason: TxError::Queue(err),
                packet,
            });
        }

        state.inflight[index as usize] = Some(InFlight {
            packet,
            meta,
            mapped,
        });
        state.core.advance_producer();
        state.core.ring_doorbell_producer(&*self.bus);
        Ok(())
    }

    /// Finish the oldest outstanding element.
    ///
    /// Returns the packet and its metadata, or None if nothing was
    /// outstanding.
    pub(crate) fn complete(&self, wqe_counter: u16) -> Option<(TxPacket, TxMeta)> {
        let mut state = self.state.lock();
        if state.core.in_flight() == 0 {
            log_ratelimited!(
                log::Level::Warn,
                "Completion on idle send queue {} (counter {wqe_counter})",
                self.num
            );
            return None;
        }

        let index = state.core.elem_for_consumer();
        let consumer = state.core.advance_consumer();
        if consumer != wqe_counter {
            log_ratelimited!(
                log::Level::Debug,
                "Send queue {}: consumer counter {consumer} does not match completion counter {wqe_counter}",
                self.num
            );
        }

        let done = state.inflight[index as usize].take()?;
        self.unmap(&done.mapped);
        Some((done.packet, done.meta))
    }

    /// Unmap and drop everything still in flight.
    ///
    /// Only valid once the device no longer owns the queue.
    pub(crate) fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        for slot in state.inflight.iter_mut() {
            if let Some(done) = slot.take() {
                self.unmap(&done.mapped);
                dropped += 1;
            }
        }
        state.core.reset();
        if dropped > 0 {
            log::debug!("Send queue {}: dropped {dropped} in-flight packets", self.num);
        }
        dropped
    }
}

impl<B: Bus> Drop for SendQueue<B> {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use asicq_testing::simplelogger::{LOGGER, SimpleLogger};
    use bytes::Bytes;

    use super::*;
    use crate::access::DmaError;
    use crate::sim::SimBus;

    fn sdq(bus: &Arc<SimBus>, count: u16) -> SendQueue<SimBus> {
        SendQueue::new(bus.clone(), 1, 1, count, 0).unwrap()
    }

    fn packet(len: usize) -> TxPacket {
        TxPacket::new(Bytes::from(vec![0x5A; len]))
    }

    #[test]
    fn full_queue_rejects_then_accepts_after_completion() {
        let bus = SimBus::new();
        let q = sdq(&bus, 8);
        for _ in 0..8 {
            q.submit(packet(60), TxMeta::default()).unwrap();
        }
        assert!(q.is_busy());

        let rejected = q.submit(packet(61), TxMeta::default()).unwrap_err();
        assert_eq!(rejected.reason, TxError::Busy);
        assert_eq!(rejected.packet.len(), 61);

        let (done, _) = q.complete(0).unwrap();
        assert_eq!(done.len(), 60);
        assert!(!q.is_busy());
        q.submit(rejected.packet, TxMeta::default()).unwrap();
        assert!(q.is_busy());
    }

    #[test]
    fn submit_writes_element_and_rings_doorbell() {
        let bus = SimBus::new();
        let q = sdq(&bus, 4);
        let pkt = TxPacket::from_fragments([Bytes::from_static(b"head"), Bytes::from(vec![1; 100])]);
        q.submit(
            pkt,
            TxMeta {
                is_control: true,
                ..TxMeta::default()
            },
        )
        .unwrap();

        let wqe: Wqe = q.state.lock().ring.read(0).unwrap();
        assert!(wqe.flags().contains(WqeFlags::EMAD));
        assert_eq!(wqe.sg[0].byte_count, 4);
        assert_eq!(wqe.sg[1].byte_count, 100);
        assert_eq!(wqe.sg[2].byte_count, 0);
        assert_eq!(bus.read_mapped(wqe.sg[0].address, 4), b"head");
        assert_eq!(bus.doorbells(), vec![(0x004, 1)]);
    }

    #[test]
    fn busy_packet_keeps_its_fragments() {
        let bus = SimBus::new();
        let q = sdq(&bus, 2);
        q.submit(packet(10), TxMeta::default()).unwrap();
        q.submit(packet(10), TxMeta::default()).unwrap();

        let frags: Vec<Bytes> = (1..=5).map(|n| Bytes::from(vec![n as u8; n])).collect();
        let rejected = q
            .submit(TxPacket::from_fragments(frags.clone()), TxMeta::default())
            .unwrap_err();
        assert_eq!(rejected.reason, TxError::Busy);
        assert_eq!(rejected.packet.fragments(), &frags[..]);
    }

    #[test]
    fn checksum_offload_sets_flag() {
        let bus = SimBus::new();
        let q = sdq(&bus, 4);
        q.submit(
            packet(60),
            TxMeta {
                checksum_offload: true,
                ..TxMeta::default()
            },
        )
        .unwrap();
        q.submit(packet(60), TxMeta::default()).unwrap();

        let first: Wqe = q.state.lock().ring.read(0).unwrap();
        assert_eq!(first.flags(), WqeFlags::IPCS);
        let second: Wqe = q.state.lock().ring.read(1).unwrap();
        assert!(second.flags().is_empty());
    }

    #[test]
    fn mapped_bytes_match_packet_and_unmap_once() {
        let bus = SimBus::new();
        let q = sdq(&bus, 8);
        let frags: Vec<Bytes> = (1..=5).map(|n| Bytes::from(vec![n as u8; n * 10])).collect();
        let pkt = TxPacket::from_fragments(frags);
        let total = pkt.len();
        q.submit(pkt, TxMeta::default()).unwrap();

        let wqe: Wqe = q.state.lock().ring.read(0).unwrap();
        assert_eq!(wqe.total_len(), total);
        assert_eq!(bus.mapped_count(), 3);

        q.complete(0).unwrap();
        assert_eq!(bus.mapped_count(), 0);
        assert_eq!(bus.unmap_calls(), 3);
        assert_eq!(bus.bad_unmaps(), 0);
    }

    #[test]
    fn map_failure_unmaps_partial_work() {
        let bus = SimBus::new();
        let q = sdq(&bus, 8);
        bus.fail_dma_map_after(1);
        let pkt = TxPacket::from_fragments([Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        let rejected = q.submit(pkt, TxMeta::default()).unwrap_err();
        assert_eq!(rejected.reason, TxError::Map(DmaError::MapFailed(1)));
        assert_eq!(rejected.packet.fragments().len(), 2);
        assert_eq!(bus.mapped_count(), 0);
        assert_eq!(q.in_flight(), 0);
        assert!(bus.doorbells().is_empty());
    }

    #[test]
    fn counter_mismatch_still_completes() {
        let bus = SimBus::new();
        let q = sdq(&bus, 4);
        q.submit(packet(10), TxMeta::default()).unwrap();
        let (pkt, _) = q.complete(7).unwrap();
        assert_eq!(pkt.len(), 10);
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn completion_on_idle_queue_is_ignored() {
        let bus = SimBus::new();
        let q = sdq(&bus, 4);
        assert!(q.complete(0).is_none());
        assert_eq!(q.in_flight(), 0);
    }

    #[test]
    fn drop_unmaps_in_flight() {
        SimpleLogger::initialize_test_logger();
        LOGGER.clear_log_calls();
        let bus = SimBus::new();
        let q = sdq(&bus, 4);
        q.submit(packet(10), TxMeta::default()).unwrap();
        q.submit(packet(20), TxMeta::default()).unwrap();
        assert_eq!(bus.mapped_count(), 2);
        drop(q);
        assert_eq!(bus.mapped_count(), 0);
        assert_eq!(bus.live_regions(), 0);
        assert!(LOGGER.contains(log::Level::Debug, "dropped 2 in-flight packets"));
    }
}
