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

//! The event queue.
//!
//! One event queue takes the device interrupt. Draining it yields the set of
//! completion queues with new work; the caller schedules a poll for each.

use std::sync::Arc;

use fixedbitset::FixedBitSet;
use spin::Mutex;

use crate::access::Bus;
use crate::cmd::QueueMbox;
use crate::desc::{Eqe, OwnedElement};
use crate::error::QueueError;
use crate::queue::{QueueCore, QueueId, QueueKind};
use crate::ring::RingStorage;

struct Inner<B: Bus> {
    core: QueueCore,
    ring: RingStorage<B>,
}

pub struct EventQueue<B: Bus> {
    num: u16,
    inner: Mutex<Inner<B>>,
}

impl<B: Bus> EventQueue<B> {
    pub(crate) fn new(
        bus: Arc<B>,
        num: u16,
        count: u16,
        doorbell_page: u32,
    ) -> Result<Self, QueueError> {
        let ring = RingStorage::new(bus, count, Eqe::SIZE)?;
        let mut eqe = Eqe::default();
        eqe.set_owner(true);
        for index in 0..count {
            ring.write(index, eqe)?;
        }

        Ok(Self {
            num,
            inner: Mutex::new(Inner {
                core: QueueCore::new(
                    QueueId {
                        kind: QueueKind::Event,
                        num,
                    },
                    count,
                    doorbell_page,
                ),
                ring,
            }),
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub(crate) fn mbox(&self) -> QueueMbox {
        let inner = self.inner.lock();
        QueueMbox::new(inner.ring.addr(), inner.core.count(), 0)
    }

    pub(crate) fn arm(&self) {
        let inner = self.inner.lock();
        let bus = inner.ring.bus();
        inner.core.ring_doorbell_consumer(bus);
        inner.core.ring_doorbell_arm(bus);
    }

    /// Elements consumed per drain, half the ring.
    pub fn credits(&self) -> usize {
        (self.inner.lock().core.count() as usize / 2).max(1)
    }

    /// Consume pending events, marking each signalled completion queue in
    /// `active`. Returns the number of events consumed.
    ///
    /// When nothing was pending no doorbell is written.
    pub fn drain(&self, active: &mut FixedBitSet) -> usize {
        let credits = self.credits();
        let mut inner = self.inner.lock();
        let Inner { core, ring } = &mut *inner;

        let mut items = 0;
        while items < credits {
            match core.pop_sw_owned::<Eqe, B>(ring) {
                Ok(Some(eqe)) => {
                    items += 1;
                    let cqn = eqe.cqn as usize;
                    if eqe.event_type != Eqe::EVENT_COMPLETION {
                        log_ratelimited!(
                            log::Level::Warn,
                            "Event queue {}: ignoring event type {:#x}",
                            self.num,
                            eqe.event_type
                        );
                    } else if cqn < active.len() {
                        active.insert(cqn);
                    } else {
                        log_ratelimited!(
                            log::Level::Warn,
                            "Event for unknown completion queue {cqn}"
                        );
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log_ratelimited!(
                        log::Level::Error,
                        "Event queue {}: failed to read element: {err}",
                        self.num
                    );
                    break;
                }
            }
        }

        if items == 0 {
            return 0;
        }

        let bus = ring.bus();
        core.ring_doorbell_consumer(bus);
        core.ring_doorbell_arm(bus);
        items
    }
}
