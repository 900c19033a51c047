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

//! Deferred work.
//!
//! The interrupt handler only schedules work; draining the event queue and
//! polling completion queues happens later on worker threads. A [`Device`]
//! never schedules the same unit twice while it is still pending.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, select};

use crate::access::Bus;
use crate::config::DeviceConfig;
use crate::device::Device;

/// A unit of deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Work {
    /// Drain the event queue.
    Events,
    /// Poll one completion queue.
    Completions(u16),
}

/// Runs [`Work`] outside the interrupt context.
///
/// Implementations hand the unit to something that will eventually call
/// [`Device::run_work`] with it. They must not run it inline.
pub trait Schedule: Send + Sync {
    fn schedule(&self, work: Work);
}

impl<S: Schedule + ?Sized> Schedule for Arc<S> {
    fn schedule(&self, work: Work) {
        (**self).schedule(work)
    }
}

/// Schedules work onto a bounded channel drained by a [`WorkerPool`].
pub struct ChannelScheduler {
    tx: Sender<Work>,
}

impl ChannelScheduler {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Work>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    /// A channel with room for every schedulable unit of `config`.
    ///
    /// Pending units are coalesced, so at most one entry per unit is queued.
    pub fn for_config(config: &DeviceConfig) -> (Self, Receiver<Work>) {
        Self::bounded(config.get_num_cqs() as usize + 1)
    }
}

impl Schedule for ChannelScheduler {
    fn schedule(&self, work: Work) {
        if self.tx.send(work).is_err() {
            log::debug!("Dropping {work:?}, no workers left");
        }
    }
}

/// Worker threads calling [`Device::run_work`].
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Sender<()>,
}

impl WorkerPool {
    pub fn spawn<B: Bus + 'static>(
        device: Arc<Device<B>>,
        rx: Receiver<Work>,
        threads: usize,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let mut pool = Self {
            handles: Vec::with_capacity(threads),
            stop,
        };

        for i in 0..threads {
            let device = device.clone();
            let rx = rx.clone();
            let stopped = stopped.clone();
            let handle = thread::Builder::new()
                .name(format!("asicq-work-{i}"))
                .spawn(move || {
                    loop {
                        select! {
                            recv(rx) -> work => match work {
                                Ok(work) => device.run_work(work),
                                Err(_) => break,
                            },
                            recv(stopped) -> _ => break,
                        }
                    }
                    log::trace!("Worker {i} exiting");
                });

            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    log::error!("Failed to spawn worker {i}: {err}");
                    pool.join();
                    return Err(err);
                }
            }
        }

        log::info!("Started {threads} queue workers");
        Ok(pool)
    }

    /// Stop the workers and wait for them. Work still queued is not run.
    pub fn join(self) {
        drop(self.stop);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("Queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::sim::{RecordingHandler, SimBus, small_config};

    #[test]
    fn channel_scheduler_delivers_in_order() {
        let (sched, rx) = ChannelScheduler::bounded(4);
        sched.schedule(Work::Events);
        sched.schedule(Work::Completions(3));
        assert_eq!(rx.try_recv(), Ok(Work::Events));
        assert_eq!(rx.try_recv(), Ok(Work::Completions(3)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn schedule_after_workers_exit_is_harmless() {
        let (sched, rx) = ChannelScheduler::bounded(1);
        drop(rx);
        sched.schedule(Work::Events);
    }

    #[test]
    fn workers_deliver_received_packets() {
        let bus = SimBus::new();
        let config = small_config();
        let (sched, rx) = ChannelScheduler::for_config(&config);
        let handler = Arc::new(RecordingHandler::default());
        let device = Arc::new(
            Device::new(bus.clone(), config, handler.clone(), Box::new(sched)).unwrap(),
        );
        device.bring_up().unwrap();
        let workers = WorkerPool::spawn(device.clone(), rx, 2).unwrap();

        bus.complete_recv(1, b"over the wire");
        device.interrupt();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.rx.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "packet never delivered");
            thread::sleep(Duration::from_millis(1));
        }
        workers.join();

        let rx = handler.rx.lock().unwrap();
        assert_eq!(rx.len(), 1);
        assert_eq!(&rx[0].to_bytes()[..], b"over the wire");
    }
}
