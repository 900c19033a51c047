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

//! The device: queue groups, lifecycle and deferred work.
//!
//! Groups are created in the order event, completion, send, receive and
//! destroyed in reverse. A failure while creating a group destroys the
//! queues of that group already created before returning. [`Device::bring_up`]
//! additionally unwinds the groups created before the failing one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fixedbitset::FixedBitSet;
use spin::{Mutex, RwLock};
use tracing::{Span, instrument};

use crate::access::Bus;
use crate::cmd::{CancelToken, Command, CommandChannel, DQ_MOD_RECEIVE, DQ_MOD_SEND};
use crate::config::DeviceConfig;
use crate::cq::{CompletionQueue, CompletionSink, CqBinding, Poll};
use crate::desc::{Cqe, CqeVersion};
use crate::eq::EventQueue;
use crate::error::{CmdError, DeviceError, QueueError, TxError};
use crate::packet::{PacketHandler, TxDone, TxMeta, TxPacket, TxQueue, TxRejected};
use crate::pool::{BufferPool, PoolStats};
use crate::queue::QueueKind;
use crate::rdq::{ReceiveQueue, RxLayout};
use crate::sdq::SendQueue;
use crate::work::{Schedule, Work};

/// Number of the single event queue.
const EQ_NUM: u16 = 0;

const LIFECYCLE: [QueueKind; 4] = [
    QueueKind::Event,
    QueueKind::Completion,
    QueueKind::Send,
    QueueKind::Receive,
];

const fn slot(kind: QueueKind) -> usize {
    match kind {
        QueueKind::Event => 0,
        QueueKind::Completion => 1,
        QueueKind::Send => 2,
        QueueKind::Receive => 3,
    }
}

/// The group that must exist before `kind` is created.
const fn requires(kind: QueueKind) -> Option<QueueKind> {
    match kind {
        QueueKind::Event => None,
        QueueKind::Completion => Some(QueueKind::Event),
        QueueKind::Send => Some(QueueKind::Completion),
        QueueKind::Receive => Some(QueueKind::Send),
    }
}

/// The group that must be gone before `kind` is destroyed.
const fn required_by(kind: QueueKind) -> Option<QueueKind> {
    match kind {
        QueueKind::Event => Some(QueueKind::Completion),
        QueueKind::Completion => Some(QueueKind::Send),
        QueueKind::Send => Some(QueueKind::Receive),
        QueueKind::Receive => None,
    }
}

struct Groups<B: Bus> {
    eq: Option<Arc<EventQueue<B>>>,
    cqs: Vec<Arc<CompletionQueue<B>>>,
    sdqs: Vec<Arc<SendQueue<B>>>,
    rdqs: Vec<Arc<ReceiveQueue<B>>>,
    created: [bool; 4],
}

impl<B: Bus> Groups<B> {
    fn new() -> Self {
        Self {
            eq: None,
            cqs: Vec::new(),
            sdqs: Vec::new(),
            rdqs: Vec::new(),
            created: [false; 4],
        }
    }

    fn is_created(&self, kind: QueueKind) -> bool {
        self.created[slot(kind)]
    }

    /// Unpublish every queue of `kind`, newest first.
    fn take(&mut self, kind: QueueKind) -> Vec<Retired<B>> {
        self.created[slot(kind)] = false;
        let mut taken: Vec<Retired<B>> = match kind {
            QueueKind::Event => self.eq.take().map(Retired::Event).into_iter().collect(),
            QueueKind::Completion => self.cqs.drain(..).map(Retired::Completion).collect(),
            QueueKind::Send => self.sdqs.drain(..).map(Retired::Send).collect(),
            QueueKind::Receive => self.rdqs.drain(..).map(Retired::Receive).collect(),
        };
        taken.reverse();
        taken
    }
}

/// A queue on its way out. Its memory is released when the last reference
/// drops, after the device has given it back.
enum Retired<B: Bus> {
    Event(Arc<EventQueue<B>>),
    Completion(Arc<CompletionQueue<B>>),
    Send(Arc<SendQueue<B>>),
    Receive(Arc<ReceiveQueue<B>>),
}

impl<B: Bus> Retired<B> {
    fn describe(&self) -> (QueueKind, u16) {
        match self {
            Retired::Event(q) => (QueueKind::Event, q.num()),
            Retired::Completion(q) => (QueueKind::Completion, q.num()),
            Retired::Send(q) => (QueueKind::Send, q.num()),
            Retired::Receive(q) => (QueueKind::Receive, q.num()),
        }
    }
}

/// A switch ASIC's queue engine.
///
/// Shared between the packet stack (transmit), the interrupt handler
/// ([`Device::interrupt`]) and the workers running deferred [`Work`].
pub struct Device<B: Bus> {
    bus: Arc<B>,
    config: DeviceConfig,
    layout: RxLayout,
    cmd: CommandChannel<B>,
    pool: Arc<BufferPool<B>>,
    handler: Arc<dyn PacketHandler>,
    scheduler: Box<dyn Schedule>,
    groups: RwLock<Groups<B>>,
    /// Serializes group creation and destruction.
    lifecycle: Mutex<()>,
    events_pending: AtomicBool,
    cq_pending: Box<[AtomicBool]>,
}

impl<B: Bus> Device<B> {
    /// Validate `config` and set up the command channel and buffer pool.
    /// No queue exists until [`Device::bring_up`] or
    /// [`Device::create_queue_group`].
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn new(
        bus: Arc<B>,
        config: DeviceConfig,
        handler: Arc<dyn PacketHandler>,
        scheduler: Box<dyn Schedule>,
    ) -> Result<Self, DeviceError> {
        let layout = RxLayout::from_config(&config)?;
        let cmd = CommandChannel::new(bus.clone(), config.get_cmd_timeout())?;
        let pool = Arc::new(BufferPool::new(
            bus.clone(),
            config.get_page_size(),
            config.get_pool_max_chunks(),
        ));
        let cq_pending = (0..config.get_num_cqs())
            .map(|_| AtomicBool::new(false))
            .collect();

        Ok(Self {
            layout,
            bus,
            config,
            cmd,
            pool,
            handler,
            scheduler,
            groups: RwLock::new(Groups::new()),
            lifecycle: Mutex::new(()),
            events_pending: AtomicBool::new(false),
            cq_pending,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_created(&self, kind: QueueKind) -> bool {
        self.groups.read().is_created(kind)
    }

    fn group_size(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::Event => 1,
            QueueKind::Completion => self.config.get_num_cqs() as usize,
            QueueKind::Send => self.config.get_num_sdqs() as usize,
            QueueKind::Receive => self.config.get_num_rdqs() as usize,
        }
    }

    /// Create every queue group in order. On failure the groups already
    /// created are destroyed again.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn bring_up(&self) -> Result<(), DeviceError> {
        for (i, &kind) in LIFECYCLE.iter().enumerate() {
            if let Err(err) = self.create_queue_group(kind, self.group_size(kind)) {
                for &prev in LIFECYCLE[..i].iter().rev() {
                    if let Err(undo) = self.destroy_queue_group(prev) {
                        log::warn!("Failed to destroy {prev:?} queue group during rollback: {undo}");
                    }
                }
                return Err(err);
            }
        }

        log::info!(
            "Queues up: {} send, {} receive, {} completion",
            self.config.get_num_sdqs(),
            self.config.get_num_rdqs(),
            self.config.get_num_cqs()
        );
        Ok(())
    }

    /// Destroy every existing queue group, receive first.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn tear_down(&self) {
        for &kind in LIFECYCLE.iter().rev() {
            match self.destroy_queue_group(kind) {
                Ok(()) | Err(DeviceError::Queue(QueueError::NotCreated(_))) => {}
                Err(err) => log::warn!("Failed to destroy {kind:?} queue group: {err}"),
            }
        }
    }

    /// Create the `count` queues of one group and hand them to the device.
    ///
    /// `count` must match the configuration, and the group the new one
    /// depends on must already exist.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn create_queue_group(&self, kind: QueueKind, count: usize) -> Result<(), DeviceError> {
        let _lifecycle = self.lifecycle.lock();
        {
            let groups = self.groups.read();
            if groups.is_created(kind) {
                return Err(QueueError::AlreadyCreated(kind).into());
            }
            if let Some(dep) = requires(kind)
                && !groups.is_created(dep)
            {
                return Err(QueueError::Ordering(kind, dep).into());
            }
        }
        if count != self.group_size(kind) {
            return Err(QueueError::BadCount(kind, count).into());
        }

        let created = match kind {
            QueueKind::Event => self.create_eq(),
            QueueKind::Completion => (0..count as u16).try_for_each(|n| self.create_cq(n)),
            QueueKind::Send => (0..count as u16).try_for_each(|n| self.create_sdq(n)),
            QueueKind::Receive => (0..count as u16).try_for_each(|n| self.create_rdq(n)),
        };

        match created {
            Ok(()) => {
                self.groups.write().created[slot(kind)] = true;
                log::debug!("Created {kind:?} queue group of {count}");
                Ok(())
            }
            Err(err) => {
                log::error!("Failed to create {kind:?} queue group: {err}");
                let retired = self.groups.write().take(kind);
                if let Err(undo) = self.retire(retired) {
                    log::warn!("Rollback of {kind:?} queue group incomplete: {undo}");
                }
                Err(DeviceError::Lifecycle {
                    kind,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Take a group back from the device and free it.
    ///
    /// Every queue is handed back even if one command fails. The first
    /// failure is returned.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn destroy_queue_group(&self, kind: QueueKind) -> Result<(), DeviceError> {
        let _lifecycle = self.lifecycle.lock();
        let retired = {
            let mut groups = self.groups.write();
            if !groups.is_created(kind) {
                return Err(QueueError::NotCreated(kind).into());
            }
            if let Some(dep) = required_by(kind)
                && groups.is_created(dep)
            {
                return Err(QueueError::InUse(kind, dep).into());
            }
            groups.take(kind)
        };

        self.retire(retired)?;
        log::debug!("Destroyed {kind:?} queue group");
        Ok(())
    }

    fn retire(&self, retired: Vec<Retired<B>>) -> Result<(), CmdError> {
        let mut result = Ok(());
        for queue in retired {
            let (kind, num) = queue.describe();
            let status = match &queue {
                Retired::Event(_) => self.cmd.hw2sw_eq(num),
                Retired::Completion(cq) => {
                    let status = self.cmd.hw2sw_cq(num);
                    cq.destroy();
                    status
                }
                Retired::Send(_) => self.cmd.hw2sw_dq(DQ_MOD_SEND, num),
                Retired::Receive(_) => self.cmd.hw2sw_dq(DQ_MOD_RECEIVE, num),
            };
            if let Err(err) = status {
                log::error!("Failed to return {kind:?} queue {num} to software: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn create_eq(&self) -> Result<(), DeviceError> {
        let eq = EventQueue::new(
            self.bus.clone(),
            EQ_NUM,
            self.config.get_eq_depth(),
            self.config.get_doorbell_page(),
        )?;
        self.cmd.sw2hw_eq(EQ_NUM, &eq.mbox())?;

        let eq = Arc::new(eq);
        self.groups.write().eq = Some(eq.clone());
        eq.arm();
        Ok(())
    }

    fn create_cq(&self, cqn: u16) -> Result<(), DeviceError> {
        let cq = CompletionQueue::new(
            self.bus.clone(),
            cqn,
            CqBinding::for_cq(cqn, self.config.get_num_sdqs()),
            self.config.get_cq_depth(),
            self.config.get_cqe_version(),
            self.config.get_doorbell_page(),
        )?;
        self.cmd.sw2hw_cq(cqn, &cq.mbox(EQ_NUM))?;

        let cq = Arc::new(cq);
        self.groups.write().cqs.push(cq.clone());
        cq.arm();
        Ok(())
    }

    fn create_sdq(&self, num: u16) -> Result<(), DeviceError> {
        let sdq = SendQueue::new(
            self.bus.clone(),
            num,
            num,
            self.config.get_sdq_depth(),
            self.config.get_doorbell_page(),
        )?;
        self.cmd.sw2hw_dq(DQ_MOD_SEND, num, &sdq.mbox())?;
        self.groups.write().sdqs.push(Arc::new(sdq));
        Ok(())
    }

    fn create_rdq(&self, num: u16) -> Result<(), DeviceError> {
        let rdq = ReceiveQueue::new(
            self.bus.clone(),
            self.pool.clone(),
            num,
            self.config.get_num_sdqs() + num,
            self.config.get_rdq_depth(),
            self.layout,
            self.config.get_doorbell_page(),
        )?;
        self.cmd.sw2hw_dq(DQ_MOD_RECEIVE, num, &rdq.mbox())?;

        // published first so the rollback hands it back to software
        let rdq = Arc::new(rdq);
        self.groups.write().rdqs.push(rdq.clone());
        rdq.fill()?;
        Ok(())
    }

    /// Default send queue for a packet: control traffic on queue 0, data
    /// spread over the remaining queues by local port.
    pub fn select_tx_queue(&self, meta: &TxMeta) -> u16 {
        let num = self.config.get_num_sdqs();
        if meta.is_control || num == 1 {
            0
        } else {
            1 + meta.local_port % (num - 1)
        }
    }

    fn send_queue(&self, queue: TxQueue, meta: &TxMeta) -> (u16, Option<Arc<SendQueue<B>>>) {
        let num = match queue {
            TxQueue::Index(num) => num,
            TxQueue::Pick => self.select_tx_queue(meta),
        };
        (num, self.groups.read().sdqs.get(num as usize).cloned())
    }

    /// Hand a packet to the device.
    ///
    /// A full queue is normal backpressure: the packet comes back with
    /// [`TxError::Busy`] and can be retried once
    /// completions have been processed.
    pub fn transmit(
        &self,
        queue: TxQueue,
        packet: TxPacket,
        meta: TxMeta,
    ) -> Result<(), TxRejected> {
        match self.send_queue(queue, &meta) {
            (_, Some(sdq)) => sdq.submit(packet, meta),
            (num, None) => Err(TxRejected {
                reason: TxError::NoQueue(num),
                packet,
            }),
        }
    }

    /// Would a transmit on `queue` be refused right now? A missing queue
    /// counts as busy.
    pub fn is_transmit_busy(&self, queue: TxQueue, meta: &TxMeta) -> bool {
        self.send_queue(queue, meta)
            .1
            .is_none_or(|sdq| sdq.is_busy())
    }

    /// Run a device command, waiting for the command interface as long as
    /// needed.
    pub fn command(&self, cmd: &Command<'_>, output: Option<&mut [u8]>) -> Result<(), CmdError> {
        self.cmd.execute(cmd, output, None)
    }

    /// Like [`Device::command`], but gives up waiting for the command
    /// interface once `cancel` fires.
    pub fn command_cancellable(
        &self,
        cmd: &Command<'_>,
        output: Option<&mut [u8]>,
        cancel: &CancelToken,
    ) -> Result<(), CmdError> {
        self.cmd.execute(cmd, output, Some(cancel))
    }

    /// Interrupt entry point. Only schedules the event queue drain.
    pub fn interrupt(&self) {
        if !self.events_pending.swap(true, Ordering::AcqRel) {
            self.scheduler.schedule(Work::Events);
        }
    }

    fn schedule_completions(&self, cqn: u16) {
        match self.cq_pending.get(cqn as usize) {
            Some(pending) => {
                if !pending.swap(true, Ordering::AcqRel) {
                    self.scheduler.schedule(Work::Completions(cqn));
                }
            }
            None => log_ratelimited!(
                log::Level::Warn,
                "Event for unknown completion queue {cqn}"
            ),
        }
    }

    /// Run one unit of deferred work.
    pub fn run_work(&self, work: Work) {
        match work {
            Work::Events => {
                self.events_pending.store(false, Ordering::Release);
                self.process_events();
            }
            Work::Completions(cqn) => {
                if let Some(pending) = self.cq_pending.get(cqn as usize) {
                    pending.store(false, Ordering::Release);
                }
                let poll = self.poll_completion_queue(cqn, self.config.get_poll_budget());
                if poll.more_pending {
                    self.schedule_completions(cqn);
                }
            }
        }
    }

    /// Drain the event queue and schedule every signalled completion queue
    /// once. Returns the number of events consumed.
    pub fn process_events(&self) -> usize {
        let Some(eq) = self.groups.read().eq.clone() else {
            return 0;
        };

        let mut active = FixedBitSet::with_capacity(self.cq_pending.len());
        let items = eq.drain(&mut active);
        for cqn in active.ones() {
            self.schedule_completions(cqn as u16);
        }
        items
    }

    /// Poll completion queue `cqn`, delivering to its data queue.
    pub fn poll_completion_queue(&self, cqn: u16, budget: usize) -> Poll {
        let Some(cq) = self.groups.read().cqs.get(cqn as usize).cloned() else {
            return Poll::idle(budget);
        };
        let version = cq.version();

        match cq.binding() {
            CqBinding::Send(num) => {
                let Some(sdq) = self.groups.read().sdqs.get(num as usize).cloned() else {
                    return Poll::idle(budget);
                };
                cq.poll(
                    budget,
                    &SendSink {
                        sdq: &sdq,
                        handler: &*self.handler,
                        version,
                    },
                )
            }
            CqBinding::Receive(num) => {
                let Some(rdq) = self.groups.read().rdqs.get(num as usize).cloned() else {
                    return Poll::idle(budget);
                };
                cq.poll(
                    budget,
                    &ReceiveSink {
                        rdq: &rdq,
                        handler: &*self.handler,
                        version,
                    },
                )
            }
        }
    }
}

impl<B: Bus> Drop for Device<B> {
    fn drop(&mut self) {
        self.tear_down();
    }
}

struct SendSink<'a, B: Bus> {
    sdq: &'a SendQueue<B>,
    handler: &'a dyn PacketHandler,
    version: CqeVersion,
}

impl<B: Bus> CompletionSink for SendSink<'_, B> {
    fn handle(&self, cqe: &Cqe) {
        if !cqe.is_send() || cqe.dqn != self.sdq.num() {
            log_ratelimited!(
                log::Level::Warn,
                "Send completion queue {}: stray completion for {} queue {}",
                self.sdq.cq_num(),
                if cqe.is_send() { "send" } else { "receive" },
                cqe.dqn
            );
            return;
        }

        let Some((packet, meta)) = self.sdq.complete(cqe.wqe_counter) else {
            return;
        };
        let done = match cqe.timestamp(self.version) {
            Some(timestamp) if meta.timestamp_requested && !meta.is_control => {
                TxDone::Timestamped {
                    packet,
                    meta,
                    timestamp,
                }
            }
            _ => TxDone::Released { packet, meta },
        };
        self.handler.transmitted(done);
    }
}

struct ReceiveSink<'a, B: Bus> {
    rdq: &'a ReceiveQueue<B>,
    handler: &'a dyn PacketHandler,
    version: CqeVersion,
}

impl<B: Bus> CompletionSink for ReceiveSink<'_, B> {
    fn handle(&self, cqe: &Cqe) {
        if cqe.is_send() || cqe.dqn != self.rdq.num() {
            log_ratelimited!(
                log::Level::Warn,
                "Receive completion queue {}: stray completion for {} queue {}",
                self.rdq.cq_num(),
                if cqe.is_send() { "send" } else { "receive" },
                cqe.dqn
            );
            return;
        }

        if let Some(packet) = self.rdq.reconstruct(cqe, self.version) {
            self.handler.receive(packet);
        }
    }

    fn flush(&self) {
        self.rdq.ring_producer_doorbell();
    }
}
