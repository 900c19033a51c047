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

//! Simulated device for tests.
//!
//! Implements [`Bus`] over plain byte vectors at synthetic bus addresses. The
//! command interface is backed by a small device model that decodes queue
//! creation mailboxes, so tests can post completions and events against the
//! rings the driver registered, with correct owner bits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytemuck::Pod;

use crate::access::{Bus, DmaError, DmaRegion, MemOps};
use crate::cmd::{DQ_MOD_SEND, MBOX_SIZE, Opcode, QueueMbox};
use crate::config::DeviceConfig;
use crate::desc::{Cqe, CqeFlags, Eqe, OwnedElement, Wqe};
use crate::device::Device;
use crate::packet::{PacketHandler, RxPacket, TxDone};
use crate::regs;
use crate::work::{Schedule, Work};

const IOVA_BASE: u64 = 0x1000_0000;
const IOVA_ALIGN: u64 = 0x1000;

#[derive(Debug)]
pub(crate) struct SimFault(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CmdCall {
    pub opcode: u16,
    pub opcode_mod: u8,
    pub in_mod: u32,
    pub in_addr: u64,
    pub out_addr: u64,
    pub input: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CmdReply {
    status: u8,
    complete: bool,
    output: Option<Vec<u8>>,
    direct: Option<(u32, u32)>,
}

impl CmdReply {
    pub fn ok() -> Self {
        Self::status(0)
    }

    pub fn status(status: u8) -> Self {
        Self {
            status,
            complete: true,
            output: None,
            direct: None,
        }
    }

    /// Leave the go bit set forever.
    pub fn hang() -> Self {
        Self {
            complete: false,
            ..Self::ok()
        }
    }

    pub fn with_output(mut self, output: Vec<u8>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_direct(mut self, hi: u32, lo: u32) -> Self {
        self.direct = Some((hi, lo));
        self
    }
}

type Responder = Box<dyn FnMut(&CmdCall) -> Option<CmdReply> + Send>;

#[derive(Debug, Clone, Copy)]
struct SimRing {
    addr: u64,
    count: u16,
    /// Produced elements for completion/event rings, consumed for data rings.
    counter: u16,
    /// Completion queue of a data queue.
    cqn: u16,
}

impl SimRing {
    fn from_mbox(mbox: &QueueMbox) -> Self {
        Self {
            addr: mbox.ring_addr,
            count: mbox.count(),
            counter: 0,
            cqn: mbox.bound_queue,
        }
    }

    fn next(&mut self, elem_size: usize) -> (u64, u16, bool) {
        let counter = self.counter;
        let index = counter & (self.count - 1);
        self.counter = counter.wrapping_add(1);
        (
            self.addr + index as u64 * elem_size as u64,
            counter,
            counter & self.count != 0,
        )
    }
}

#[derive(Default)]
struct Queues {
    eq: Option<SimRing>,
    cqs: HashMap<u16, SimRing>,
    sdqs: HashMap<u16, SimRing>,
    rdqs: HashMap<u16, SimRing>,
}

#[derive(Default)]
struct Memory {
    next: u64,
    regions: BTreeMap<u64, Vec<u8>>,
    mapped: BTreeMap<u64, Vec<u8>>,
    alloc_budget: Option<usize>,
    map_budget: Option<usize>,
    unmap_calls: usize,
    bad_unmaps: usize,
}

impl Memory {
    fn reserve(&mut self, len: usize) -> u64 {
        if self.next == 0 {
            self.next = IOVA_BASE;
        }
        let addr = self.next;
        // leave a gap so overruns never land in a neighbour
        self.next += (len as u64).div_ceil(IOVA_ALIGN) * IOVA_ALIGN + IOVA_ALIGN;
        addr
    }

    fn locate(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        for map in [&mut self.regions, &mut self.mapped] {
            if let Some((base, buf)) = map.range_mut(..=addr).next_back() {
                let start = (addr - base) as usize;
                if start + len <= buf.len() {
                    return Some(&mut buf[start..start + len]);
                }
            }
        }
        None
    }
}

pub(crate) struct SimBus {
    mem: Mutex<Memory>,
    regs: Mutex<HashMap<u32, u32>>,
    doorbells: Mutex<Vec<(u32, u32)>>,
    calls: Mutex<Vec<CmdCall>>,
    responder: Mutex<Option<Responder>>,
    queues: Mutex<Queues>,
}

impl SimBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mem: Mutex::new(Memory::default()),
            regs: Mutex::new(HashMap::new()),
            doorbells: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            queues: Mutex::new(Queues::default()),
        })
    }

    /// Allow `n` more DMA allocations, then fail.
    pub fn fail_dma_alloc_after(&self, n: usize) {
        self.mem.lock().unwrap().alloc_budget = Some(n);
    }

    /// Allow `n` more fragment mappings, then fail.
    pub fn fail_dma_map_after(&self, n: usize) {
        self.mem.lock().unwrap().map_budget = Some(n);
    }

    pub fn live_regions(&self) -> usize {
        self.mem.lock().unwrap().regions.len()
    }

    pub fn mapped_count(&self) -> usize {
        self.mem.lock().unwrap().mapped.len()
    }

    pub fn unmap_calls(&self) -> usize {
        self.mem.lock().unwrap().unmap_calls
    }

    pub fn bad_unmaps(&self) -> usize {
        self.mem.lock().unwrap().bad_unmaps
    }

    pub fn read_mapped(&self, addr: u64, len: usize) -> Vec<u8> {
        let mem = self.mem.lock().unwrap();
        let buf = mem.mapped.get(&addr).expect("address is not mapped");
        buf[..len].to_vec()
    }

    pub fn doorbells(&self) -> Vec<(u32, u32)> {
        self.doorbells.lock().unwrap().clone()
    }

    pub fn clear_doorbells(&self) {
        self.doorbells.lock().unwrap().clear();
    }

    pub fn reg(&self, reg: u32) -> u32 {
        self.regs.lock().unwrap().get(&reg).copied().unwrap_or(0)
    }

    /// Override command handling. Returning None falls back to the model.
    pub fn respond_with<F>(&self, f: F)
    where
        F: FnMut(&CmdCall) -> Option<CmdReply> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(f));
    }

    pub fn commands(&self) -> Vec<CmdCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_command(&self) -> Option<CmdCall> {
        self.calls.lock().unwrap().last().cloned()
    }

    fn put<T: Pod>(&self, addr: u64, val: T) {
        self.write_val(addr, val).expect("simulated write out of bounds");
    }

    fn get<T: Pod>(&self, addr: u64) -> T {
        self.read_val(addr).expect("simulated read out of bounds")
    }

    pub fn attach_eq(&self, addr: u64, count: u16) {
        let mbox = QueueMbox::new(addr, count, 0);
        self.queues.lock().unwrap().eq = Some(SimRing::from_mbox(&mbox));
    }

    pub fn attach_cq(&self, cqn: u16, addr: u64, count: u16) {
        let mbox = QueueMbox::new(addr, count, 0);
        self.queues
            .lock()
            .unwrap()
            .cqs
            .insert(cqn, SimRing::from_mbox(&mbox));
    }

    /// Write a completion as the device would, stamping the owner bit.
    pub fn post_cqe(&self, cqn: u16, mut cqe: Cqe) {
        let (addr, _, owner) = self
            .queues
            .lock()
            .unwrap()
            .cqs
            .get_mut(&cqn)
            .expect("completion queue not attached")
            .next(Cqe::SIZE);
        cqe.set_owner(owner);
        self.put(addr, cqe);
    }

    pub fn post_eqe(&self, cqn: u16) {
        self.post_event(cqn, Eqe::EVENT_COMPLETION);
    }

    pub fn post_event(&self, cqn: u16, event_type: u16) {
        let (addr, _, owner) = self
            .queues
            .lock()
            .unwrap()
            .eq
            .as_mut()
            .expect("event queue not attached")
            .next(Eqe::SIZE);
        let mut eqe = Eqe {
            cqn,
            event_type,
            ..Eqe::default()
        };
        eqe.set_owner(owner);
        self.put(addr, eqe);
    }

    /// Fill the buffers of a receive element with `payload`, in order.
    pub fn scatter(&self, wqe: &Wqe, payload: &[u8]) {
        let mut rest = payload;
        for entry in &wqe.sg {
            if rest.is_empty() {
                break;
            }
            let n = rest.len().min(entry.byte_count as usize);
            self.write(entry.address, &rest[..n])
                .expect("receive buffer out of bounds");
            rest = &rest[n..];
        }
        assert!(rest.is_empty(), "payload larger than posted buffers");
    }

    /// Transmit the next element of send queue `sdqn` and report it.
    pub fn complete_send(&self, sdqn: u16) -> Wqe {
        self.complete_send_with(sdqn, Cqe::default())
    }

    pub fn complete_send_with(&self, sdqn: u16, template: Cqe) -> Wqe {
        let (ring, (addr, counter, _)) = {
            let mut queues = self.queues.lock().unwrap();
            let ring = queues.sdqs.get_mut(&sdqn).expect("send queue not attached");
            (*ring, ring.next(Wqe::SIZE))
        };
        let wqe: Wqe = self.get(addr);
        let cqe = Cqe {
            flags: template.flags | CqeFlags::SEND.bits(),
            dqn: sdqn,
            wqe_counter: counter,
            ..template
        };
        self.post_cqe(ring.cqn, cqe);
        self.post_eqe(ring.cqn);
        wqe
    }

    /// Receive `payload` into the next element of receive queue `rdqn`.
    pub fn complete_recv(&self, rdqn: u16, payload: &[u8]) {
        self.complete_recv_with(rdqn, payload, Cqe::default());
    }

    pub fn complete_recv_with(&self, rdqn: u16, payload: &[u8], template: Cqe) {
        let (ring, (addr, counter, _)) = {
            let mut queues = self.queues.lock().unwrap();
            let ring = queues.rdqs.get_mut(&rdqn).expect("receive queue not attached");
            (*ring, ring.next(Wqe::SIZE))
        };
        let wqe: Wqe = self.get(addr);
        if !template.is_error() {
            self.scatter(&wqe, payload);
        }
        let cqe = Cqe {
            byte_count: payload.len() as u16,
            dqn: rdqn,
            wqe_counter: counter,
            ..template
        };
        self.post_cqe(ring.cqn, cqe);
        self.post_eqe(ring.cqn);
    }

    pub fn attached(&self) -> (bool, usize, usize, usize) {
        let queues = self.queues.lock().unwrap();
        (
            queues.eq.is_some(),
            queues.cqs.len(),
            queues.sdqs.len(),
            queues.rdqs.len(),
        )
    }

    fn run_command(&self, ctrl: u32) {
        let (in_addr, in_mod, out_addr) = {
            let file = self.regs.lock().unwrap();
            let get = |r: u32| file.get(&r).copied().unwrap_or(0) as u64;
            (
                get(regs::CIR_IN_PARAM_HI) << 32 | get(regs::CIR_IN_PARAM_LO),
                get(regs::CIR_IN_MODIFIER) as u32,
                get(regs::CIR_OUT_PARAM_HI) << 32 | get(regs::CIR_OUT_PARAM_LO),
            )
        };
        let input = (in_addr != 0).then(|| {
            let mut buf = vec![0u8; MBOX_SIZE];
            self.read(in_addr, &mut buf).expect("bad input mailbox");
            buf
        });
        let call = CmdCall {
            opcode: (ctrl & 0xFFF) as u16,
            opcode_mod: ((ctrl >> regs::CIR_CTRL_OPCODE_MOD_SHIFT) & 0xF) as u8,
            in_mod,
            in_addr,
            out_addr,
            input,
        };
        self.calls.lock().unwrap().push(call.clone());

        let scripted = self
            .responder
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|respond| respond(&call));
        let reply = scripted.unwrap_or_else(|| self.model(&call));

        if let Some(output) = &reply.output
            && out_addr != 0
        {
            self.write(out_addr, output).expect("bad output mailbox");
        }
        let mut file = self.regs.lock().unwrap();
        if let Some((hi, lo)) = reply.direct {
            file.insert(regs::CIR_OUT_PARAM_HI, hi);
            file.insert(regs::CIR_OUT_PARAM_LO, lo);
        }
        if reply.complete {
            file.insert(
                regs::CIR_CTRL,
                (reply.status as u32) << regs::CIR_CTRL_STATUS_SHIFT,
            );
        }
    }

    /// Default device behaviour: accept every command, track queue creation.
    fn model(&self, call: &CmdCall) -> CmdReply {
        let mbox = call
            .input
            .as_deref()
            .map(|buf| bytemuck::pod_read_unaligned::<QueueMbox>(&buf[..16]));
        let num = call.in_mod as u16;
        let mut queues = self.queues.lock().unwrap();
        match (Opcode(call.opcode), mbox) {
            (Opcode::SW2HW_EQ, Some(mbox)) => queues.eq = Some(SimRing::from_mbox(&mbox)),
            (Opcode::SW2HW_CQ, Some(mbox)) => {
                queues.cqs.insert(num, SimRing::from_mbox(&mbox));
            }
            (Opcode::SW2HW_DQ, Some(mbox)) => {
                let ring = SimRing::from_mbox(&mbox);
                if call.opcode_mod == DQ_MOD_SEND {
                    queues.sdqs.insert(num, ring);
                } else {
                    queues.rdqs.insert(num, ring);
                }
            }
            (Opcode::SW2HW_EQ | Opcode::SW2HW_CQ | Opcode::SW2HW_DQ, None) => {
                return CmdReply::status(0x03);
            }
            (Opcode::HW2SW_EQ, _) => queues.eq = None,
            (Opcode::HW2SW_CQ, _) => {
                queues.cqs.remove(&num);
            }
            (Opcode::HW2SW_DQ, _) => {
                if call.opcode_mod == DQ_MOD_SEND {
                    queues.sdqs.remove(&num);
                } else {
                    queues.rdqs.remove(&num);
                }
            }
            _ => {}
        }
        CmdReply::ok()
    }
}

impl MemOps for SimBus {
    type Error = SimFault;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let mut mem = self.mem.lock().unwrap();
        let src = mem.locate(addr, dst.len()).ok_or(SimFault(addr))?;
        dst.copy_from_slice(src);
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let mut mem = self.mem.lock().unwrap();
        let dst = mem.locate(addr, src.len()).ok_or(SimFault(addr))?;
        dst.copy_from_slice(src);
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        self.read_val(addr)
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        self.write_val(addr, val)
    }
}

impl Bus for SimBus {
    fn read32(&self, reg: u32) -> u32 {
        self.reg(reg)
    }

    fn write32(&self, reg: u32, val: u32) {
        self.regs.lock().unwrap().insert(reg, val);
        if reg < regs::CIR_IN_PARAM_HI {
            self.doorbells.lock().unwrap().push((reg, val));
        } else if reg == regs::CIR_CTRL && val & regs::CIR_CTRL_GO_BIT != 0 {
            self.run_command(val);
        }
    }

    fn dma_alloc(&self, len: usize) -> Result<DmaRegion, DmaError> {
        let mut mem = self.mem.lock().unwrap();
        if let Some(budget) = mem.alloc_budget.as_mut() {
            if *budget == 0 {
                return Err(DmaError::OutOfMemory);
            }
            *budget -= 1;
        }
        let addr = mem.reserve(len);
        mem.regions.insert(addr, vec![0; len]);
        Ok(DmaRegion { addr, len })
    }

    fn dma_free(&self, region: DmaRegion) {
        let removed = self.mem.lock().unwrap().regions.remove(&region.addr);
        assert!(removed.is_some_and(|buf| buf.len() == region.len), "bad free {region:?}");
    }

    fn dma_map(&self, buf: &[u8]) -> Result<u64, DmaError> {
        let mut mem = self.mem.lock().unwrap();
        if let Some(budget) = mem.map_budget.as_mut() {
            if *budget == 0 {
                return Err(DmaError::MapFailed(buf.len()));
            }
            *budget -= 1;
        }
        let addr = mem.reserve(buf.len());
        mem.mapped.insert(addr, buf.to_vec());
        Ok(addr)
    }

    fn dma_unmap(&self, addr: u64, len: usize) {
        let mut mem = self.mem.lock().unwrap();
        mem.unmap_calls += 1;
        match mem.mapped.remove(&addr) {
            Some(buf) if buf.len() == len => {}
            _ => mem.bad_unmaps += 1,
        }
    }
}

/// Packet stack double that records everything it is handed.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub rx: Mutex<Vec<RxPacket>>,
    pub tx: Mutex<Vec<TxDone>>,
}

impl PacketHandler for RecordingHandler {
    fn receive(&self, packet: RxPacket) {
        self.rx.lock().unwrap().push(packet);
    }

    fn transmitted(&self, done: TxDone) {
        self.tx.lock().unwrap().push(done);
    }
}

/// Scheduler double that queues work for the test to run.
#[derive(Default)]
pub(crate) struct RecordingScheduler {
    pub queued: Mutex<Vec<Work>>,
}

impl RecordingScheduler {
    pub fn take(&self) -> Vec<Work> {
        std::mem::take(&mut *self.queued.lock().unwrap())
    }
}

impl Schedule for RecordingScheduler {
    fn schedule(&self, work: Work) {
        self.queued.lock().unwrap().push(work);
    }
}

/// A small device: 2 send queues, 2 receive queues, 8-deep rings.
pub(crate) fn small_config() -> DeviceConfig {
    let mut cfg = DeviceConfig::default();
    cfg.set_num_sdqs(2);
    cfg.set_num_rdqs(2);
    cfg.set_sdq_depth(8);
    cfg.set_rdq_depth(8);
    cfg.set_cq_depth(8);
    cfg.set_eq_depth(8);
    cfg.set_max_packet_size(1500);
    cfg
}

pub(crate) struct TestDevice {
    pub bus: Arc<SimBus>,
    pub dev: Arc<Device<SimBus>>,
    pub handler: Arc<RecordingHandler>,
    pub sched: Arc<RecordingScheduler>,
}

impl TestDevice {
    pub fn new(config: DeviceConfig) -> Self {
        let bus = SimBus::new();
        let handler = Arc::new(RecordingHandler::default());
        let sched = Arc::new(RecordingScheduler::default());
        let dev = Device::new(
            bus.clone(),
            config,
            handler.clone(),
            Box::new(sched.clone()),
        )
        .unwrap();
        Self {
            bus,
            dev: Arc::new(dev),
            handler,
            sched,
        }
    }

    /// Run scheduled work until nothing is left. Returns the units run.
    pub fn run_scheduled(&self) -> Vec<Work> {
        let mut ran = Vec::new();
        loop {
            let batch = self.sched.take();
            if batch.is_empty() {
                return ran;
            }
            for work in batch {
                self.dev.run_work(work);
                ran.push(work);
            }
        }
    }
}
