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

use std::cmp::{max, min};
use std::time::Duration;

use tracing::{Span, instrument};

use crate::desc::{CqeVersion, WQE_SG_ENTRIES};
use crate::error::ConfigError;
use crate::regs::DOORBELL_BANK_QUEUES;

/// Queue geometry and driver tunables for a [`Device`](crate::Device).
///
/// Capability values such as queue counts would normally be queried from
/// firmware; here they are supplied by the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceConfig {
    num_sdqs: u16,
    num_rdqs: u16,
    sdq_depth: u16,
    rdq_depth: u16,
    cq_depth: u16,
    eq_depth: u16,
    /// Size of each receive buffer chunk.
    page_size: usize,
    max_packet_size: usize,
    /// Software bytes reserved in front of received data.
    rx_headroom: usize,
    /// Software bytes reserved behind received data.
    rx_tail_reserve: usize,
    cqe_version: CqeVersion,
    /// Command timeout in milliseconds.
    cmd_timeout: u16,
    poll_budget: usize,
    pool_max_chunks: Option<usize>,
    doorbell_page: u32,
    worker_threads: usize,
}

impl DeviceConfig {
    pub const DEFAULT_NUM_SDQS: u16 = 4;
    pub const DEFAULT_NUM_RDQS: u16 = 4;
    pub const MIN_NUM_DQS: u16 = 1;
    /// Completion queues for both directions share one doorbell bank.
    pub const MAX_NUM_DQS: u16 = DOORBELL_BANK_QUEUES / 2;
    pub const DEFAULT_SDQ_DEPTH: u16 = 128;
    pub const DEFAULT_RDQ_DEPTH: u16 = 128;
    pub const DEFAULT_CQ_DEPTH: u16 = 128;
    pub const DEFAULT_EQ_DEPTH: u16 = 256;
    pub const MIN_DEPTH: u16 = 2;
    pub const MAX_DEPTH: u16 = 32768;
    pub const DEFAULT_PAGE_SIZE: usize = 4096;
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 10000;
    pub const DEFAULT_RX_HEADROOM: usize = 64;
    pub const DEFAULT_RX_TAIL_RESERVE: usize = 320;
    /// The default command timeout (in milliseconds)
    pub const DEFAULT_CMD_TIMEOUT: u16 = 1000;
    pub const MIN_CMD_TIMEOUT: u16 = 1;
    pub const MAX_CMD_TIMEOUT: u16 = u16::MAX;
    pub const DEFAULT_POLL_BUDGET: usize = 64;
    pub const MIN_POLL_BUDGET: usize = 1;
    pub const MAX_POLL_BUDGET: usize = 1024;
    pub const DEFAULT_WORKER_THREADS: usize = 2;
    pub const MIN_WORKER_THREADS: usize = 1;
    pub const MAX_WORKER_THREADS: usize = 64;

    fn clamp_dqs(num: u16) -> u16 {
        min(Self::MAX_NUM_DQS, max(num, Self::MIN_NUM_DQS))
    }

    pub fn set_num_sdqs(&mut self, num: u16) {
        self.num_sdqs = Self::clamp_dqs(num);
    }

    pub fn set_num_rdqs(&mut self, num: u16) {
        self.num_rdqs = Self::clamp_dqs(num);
    }

    /// Depths must be powers of two within `[MIN_DEPTH, MAX_DEPTH]`, checked by
    /// [`validate`](Self::validate).
    pub fn set_sdq_depth(&mut self, depth: u16) {
        self.sdq_depth = depth;
    }

    pub fn set_rdq_depth(&mut self, depth: u16) {
        self.rdq_depth = depth;
    }

    pub fn set_cq_depth(&mut self, depth: u16) {
        self.cq_depth = depth;
    }

    pub fn set_eq_depth(&mut self, depth: u16) {
        self.eq_depth = depth;
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.page_size = page_size;
    }

    pub fn set_max_packet_size(&mut self, max_packet_size: usize) {
        self.max_packet_size = max_packet_size;
    }

    pub fn set_rx_reserve(&mut self, headroom: usize, tail_reserve: usize) {
        self.rx_headroom = headroom;
        self.rx_tail_reserve = tail_reserve;
    }

    pub fn set_cqe_version(&mut self, version: CqeVersion) {
        self.cqe_version = version;
    }

    /// Set the command timeout. If set to 0, the timeout will be set to the
    /// default value of `DEFAULT_CMD_TIMEOUT`.
    #[instrument(skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_cmd_timeout(&mut self, timeout: Duration) {
        match timeout.as_millis() {
            0 => self.cmd_timeout = Self::DEFAULT_CMD_TIMEOUT,
            1.. => {
                self.cmd_timeout = min(
                    Self::MAX_CMD_TIMEOUT.into(),
                    max(timeout.as_millis(), Self::MIN_CMD_TIMEOUT.into()),
                ) as u16
            }
        }
    }

    pub fn set_poll_budget(&mut self, budget: usize) {
        self.poll_budget = min(Self::MAX_POLL_BUDGET, max(budget, Self::MIN_POLL_BUDGET));
    }

    /// Cap the number of receive chunks. None lets the pool grow freely.
    pub fn set_pool_max_chunks(&mut self, limit: Option<usize>) {
        self.pool_max_chunks = limit;
    }

    pub fn set_doorbell_page(&mut self, page: u32) {
        self.doorbell_page = page;
    }

    pub fn set_worker_threads(&mut self, threads: usize) {
        self.worker_threads = min(
            Self::MAX_WORKER_THREADS,
            max(threads, Self::MIN_WORKER_THREADS),
        );
    }

    pub(crate) fn get_num_sdqs(&self) -> u16 {
        self.num_sdqs
    }

    pub(crate) fn get_num_rdqs(&self) -> u16 {
        self.num_rdqs
    }

    pub(crate) fn get_num_cqs(&self) -> u16 {
        self.num_sdqs + self.num_rdqs
    }

    pub(crate) fn get_sdq_depth(&self) -> u16 {
        self.sdq_depth
    }

    pub(crate) fn get_rdq_depth(&self) -> u16 {
        self.rdq_depth
    }

    pub(crate) fn get_cq_depth(&self) -> u16 {
        self.cq_depth
    }

    pub(crate) fn get_eq_depth(&self) -> u16 {
        self.eq_depth
    }

    pub(crate) fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn get_rx_headroom(&self) -> usize {
        self.rx_headroom
    }

    pub(crate) fn get_rx_tail_reserve(&self) -> usize {
        self.rx_tail_reserve
    }

    pub(crate) fn get_cqe_version(&self) -> CqeVersion {
        self.cqe_version
    }

    pub(crate) fn get_cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.cmd_timeout as u64)
    }

    pub(crate) fn get_poll_budget(&self) -> usize {
        self.poll_budget
    }

    pub(crate) fn get_pool_max_chunks(&self) -> Option<usize> {
        self.pool_max_chunks
    }

    pub(crate) fn get_doorbell_page(&self) -> u32 {
        self.doorbell_page
    }

    pub fn get_worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Software bytes reserved around received data in every buffer.
    pub(crate) fn rx_overhead(&self) -> Result<usize, ConfigError> {
        self.rx_headroom
            .checked_add(self.rx_tail_reserve)
            .ok_or(ConfigError::Overflow("rx_headroom + rx_tail_reserve"))
    }

    /// Buffers needed to hold the largest packet.
    pub(crate) fn rx_frags_per_elem(&self) -> Result<usize, ConfigError> {
        let span = self
            .max_packet_size
            .checked_add(self.rx_overhead()?)
            .ok_or(ConfigError::Overflow("max_packet_size + rx overhead"))?;
        Ok(span.div_ceil(self.page_size.max(1)))
    }

    /// Check the configuration before any queue is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, depth) in [
            ("sdq_depth", self.sdq_depth),
            ("rdq_depth", self.rdq_depth),
            ("cq_depth", self.cq_depth),
            ("eq_depth", self.eq_depth),
        ] {
            if !(Self::MIN_DEPTH..=Self::MAX_DEPTH).contains(&depth) {
                return Err(ConfigError::OutOfRange {
                    name,
                    value: depth as usize,
                    min: Self::MIN_DEPTH as usize,
                    max: Self::MAX_DEPTH as usize,
                });
            }
            if !depth.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo(name, depth as usize));
            }
        }

        let dq = max(self.sdq_depth, self.rdq_depth);
        if self.cq_depth < dq {
            return Err(ConfigError::CqTooShallow {
                cq: self.cq_depth as usize,
                dq: dq as usize,
            });
        }

        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo("page_size", self.page_size));
        }
        let overhead = self.rx_overhead()?;
        if self.page_size <= overhead {
            return Err(ConfigError::PageTooSmall {
                page: self.page_size,
                overhead,
            });
        }

        let frags = self.rx_frags_per_elem()?;
        if frags > WQE_SG_ENTRIES {
            return Err(ConfigError::TooManyFragments(frags));
        }

        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            num_sdqs: Self::DEFAULT_NUM_SDQS,
            num_rdqs: Self::DEFAULT_NUM_RDQS,
            sdq_depth: Self::DEFAULT_SDQ_DEPTH,
            rdq_depth: Self::DEFAULT_RDQ_DEPTH,
            cq_depth: Self::DEFAULT_CQ_DEPTH,
            eq_depth: Self::DEFAULT_EQ_DEPTH,
            page_size: Self::DEFAULT_PAGE_SIZE,
            max_packet_size: Self::DEFAULT_MAX_PACKET_SIZE,
            rx_headroom: Self::DEFAULT_RX_HEADROOM,
            rx_tail_reserve: Self::DEFAULT_RX_TAIL_RESERVE,
            cqe_version: CqeVersion::default(),
            cmd_timeout: Self::DEFAULT_CMD_TIMEOUT,
            poll_budget: Self::DEFAULT_POLL_BUDGET,
            pool_max_chunks: None,
            doorbell_page: 0,
            worker_threads: Self::DEFAULT_WORKER_THREADS,
        }
    }
}
