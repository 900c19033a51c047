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

//! Completion queues.
//!
//! Each completion queue is bound to exactly one send or receive queue at
//! creation. Polling consumes software-owned elements up to a budget and
//! dispatches them to a [`CompletionSink`], then acknowledges them to the
//! device. The queue is re-armed only once it has been drained, so an
//! exhausted budget never loses an event.

use std::sync::Arc;

use spin::Mutex;

use crate::access::Bus;
use crate::cmd::QueueMbox;
use crate::desc::{Cqe, CqeVersion, OwnedElement};
use crate::error::QueueError;
use crate::queue::{QueueCore, QueueId, QueueKind};
use crate::ring::RingStorage;

/// The data queue served by a completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CqBinding {
    Send(u16),
    Receive(u16),
}

impl CqBinding {
    /// Completion queue `cqn` serves send queue `cqn` for the first
    /// `num_sdqs` queues and receive queue `cqn - num_sdqs` after that.
    pub fn for_cq(cqn: u16, num_sdqs: u16) -> Self {
        if cqn < num_sdqs {
            CqBinding::Send(cqn)
        } else {
            CqBinding::Receive(cqn - num_sdqs)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CqState {
    /// The device raises an event on the next completion.
    Armed,
    /// Being polled, or left unarmed because the budget ran out.
    Polling,
    /// Handed back to software at teardown. Polls do nothing.
    Destroyed,
}

/// Where polled completions go.
pub trait CompletionSink {
    fn handle(&self, cqe: &Cqe);

    /// Called once per poll after the consumed elements are acknowledged.
    fn flush(&self) {}
}

/// Result of one [`CompletionQueue::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Poll {
    pub work_done: usize,
    pub budget: usize,
    /// The budget ran out with completions still waiting. The queue was not
    /// re-armed and must be polled again.
    pub more_pending: bool,
}

impl Poll {
    pub(crate) fn idle(budget: usize) -> Self {
        Self {
            work_done: 0,
            budget,
            more_pending: false,
        }
    }

    /// Single-value form of the outcome.
    ///
    /// Returns `budget` only when more work remains. A poll that used the
    /// whole budget and drained the queue reports `budget - 1` instead.
    pub fn sentinel(&self) -> usize {
        if self.more_pending {
            self.budget
        } else if self.budget > 0 && self.work_done == self.budget {
            self.budget - 1
        } else {
            self.work_done
        }
    }
}

struct Inner<B: Bus> {
    core: QueueCore,
    ring: RingStorage<B>,
    state: CqState,
}

pub struct CompletionQueue<B: Bus> {
    num: u16,
    binding: CqBinding,
    version: CqeVersion,
    inner: Mutex<Inner<B>>,
}

impl<B: Bus> CompletionQueue<B> {
    /// Allocate the ring with every element stamped device-owned.
    pub(crate) fn new(
        bus: Arc<B>,
        num: u16,
        binding: CqBinding,
        count: u16,
        version: CqeVersion,
        doorbell_page: u32,
    ) -> Result<Self, QueueError> {
        let ring = RingStorage::new(bus, count, Cqe::SIZE)?;
        let mut cqe = Cqe::default();
        cqe.set_owner(true);
        for index in 0..count {
            ring.write(index, cqe)?;
        }

        let core = QueueCore::new(
            QueueId {
                kind: QueueKind::Completion,
                num,
            },
            count,
            doorbell_page,
        );

        Ok(Self {
            num,
            binding,
            version,
            inner: Mutex::new(Inner {
                core,
                ring,
                state: CqState::Polling,
            }),
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn binding(&self) -> CqBinding {
        self.binding
    }

    pub fn version(&self) -> CqeVersion {
        self.version
    }

    pub fn state(&self) -> CqState {
        self.inner.lock().state
    }

    pub(crate) fn mbox(&self, eq_num: u16) -> QueueMbox {
        let inner = self.inner.lock();
        QueueMbox {
            version: self.version as u16,
            ..QueueMbox::new(inner.ring.addr(), inner.core.count(), eq_num)
        }
    }

    /// Acknowledge nothing and arm, once the device owns the queue.
    pub(crate) fn arm(&self) {
        let mut inner = self.inner.lock();
        let bus = inner.ring.bus();
        inner.core.ring_doorbell_consumer(bus);
        inner.core.ring_doorbell_arm(bus);
        inner.state = CqState::Armed;
    }

    /// Stop servicing the queue once the device no longer owns it.
    pub(crate) fn destroy(&self) {
        self.inner.lock().state = CqState::Destroyed;
    }

    /// Process up to `budget` completions.
    pub fn poll(&self, budget: usize, sink: &dyn CompletionSink) -> Poll {
        if budget == 0 {
            return Poll::idle(0);
        }

        let mut inner = self.inner.lock();
        if inner.state == CqState::Destroyed {
            return Poll::idle(budget);
        }
        inner.state = CqState::Polling;

        let mut work_done = 0;
        while work_done < budget {
            let Inner { core, ring, .. } = &mut *inner;
            match core.pop_sw_owned::<Cqe, B>(ring) {
                Ok(Some(cqe)) => {
                    sink.handle(&cqe);
                    work_done += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    log_ratelimited!(
                        log::Level::Error,
                        "Completion queue {}: failed to read element: {err}",
                        self.num
                    );
                    break;
                }
            }
        }

        let Inner { core, ring, state } = &mut *inner;
        let bus = ring.bus();
        core.ring_doorbell_consumer(bus);
        sink.flush();

        let more_pending = work_done == budget
            && core.is_sw_ready::<Cqe, B>(ring).unwrap_or(false);
        if !more_pending {
            core.ring_doorbell_arm(bus);
            *state = CqState::Armed;
        }

        Poll {
            work_done,
            budget,
            more_pending,
        }
    }

    /// Consumer counter, for diagnostics.
    pub fn consumer(&self) -> u16 {
        self.inner.lock().core.consumer()
    }

    /// Owner bit of element `index` as currently stored in the ring.
    pub fn owner_at(&self, index: u16) -> Option<bool> {
        let inner = self.inner.lock();
        let addr = inner.ring.element_at(index)?;
        let flags: u16 = inner
            .ring
            .bus()
            .read_val(addr + Cqe::FLAGS_OFFSET as u64)
            .ok()?;
        Some(flags & <Cqe as OwnedElement>::OWNER != 0)
    }
}
