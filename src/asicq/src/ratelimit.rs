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

//! Rate limiting for data path diagnostics.
//!
//! A misbehaving device can produce the same complaint for every element, so
//! data path warnings go through [`log_ratelimited!`] which allows a burst of
//! messages per interval at each call site.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_BURST: u32 = 10;

fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

pub(crate) struct RateLimit {
    interval_ms: u64,
    burst: u32,
    window_start: AtomicU64,
    printed: AtomicU32,
    missed: AtomicU32,
}

impl RateLimit {
    pub(crate) const fn new() -> Self {
        Self::with(DEFAULT_INTERVAL, DEFAULT_BURST)
    }

    pub(crate) const fn with(interval: Duration, burst: u32) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            burst,
            window_start: AtomicU64::new(0),
            printed: AtomicU32::new(0),
            missed: AtomicU32::new(0),
        }
    }

    /// May the caller emit a message now?
    pub(crate) fn allow(&self) -> bool {
        self.allow_at(now_ms())
    }

    fn allow_at(&self, now: u64) -> bool {
        let start = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(start) >= self.interval_ms
            && self
                .window_start
                .compare_exchange(start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            let missed = self.missed.swap(0, Ordering::Relaxed);
            if missed > 0 {
                log::warn!("{missed} messages suppressed");
            }
            self.printed.store(0, Ordering::Relaxed);
        }

        if self.printed.fetch_add(1, Ordering::Relaxed) < self.burst {
            true
        } else {
            self.missed.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

/// `log::log!` with a per-call-site [`RateLimit`].
macro_rules! log_ratelimited {
    ($lvl:expr, $($arg:tt)+) => {{
        static LIMIT: $crate::ratelimit::RateLimit = $crate::ratelimit::RateLimit::new();
        if log::log_enabled!($lvl) && LIMIT.allow() {
            log::log!($lvl, $($arg)+);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_suppress_then_reset() {
        let limit = RateLimit::with(Duration::from_millis(100), 3);
        assert!(limit.allow_at(1000));
        assert!(limit.allow_at(1001));
        assert!(limit.allow_at(1002));
        assert!(!limit.allow_at(1003));
        assert!(!limit.allow_at(1050));
        assert_eq!(limit.missed.load(Ordering::Relaxed), 2);

        assert!(limit.allow_at(1100));
        assert_eq!(limit.missed.load(Ordering::Relaxed), 0);
        assert!(limit.allow_at(1101));
    }
}
