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

use std::sync::{Mutex, Once};
use std::thread::{ThreadId, current};

use log::{Level, Log, Metadata, Record, set_logger, set_max_level};

pub static LOGGER: SimpleLogger = SimpleLogger {};
static INITLOGGER: Once = Once::new();

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
    pub module_path: Option<String>,
    pub thread: ThreadId,
}

static LOGCALLS: Mutex<Vec<LogCall>> = Mutex::new(Vec::new());

/// Records every asicq log line. Tests run in parallel, so lookups only see
/// records made on the calling thread.
pub struct SimpleLogger {}

impl SimpleLogger {
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            if set_logger(&LOGGER).is_ok() {
                set_max_level(log::LevelFilter::Trace);
            }
        });
    }

    /// Records made by the current thread so far.
    pub fn calls(&self) -> Vec<LogCall> {
        let me = current().id();
        LOGCALLS
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.thread == me)
            .cloned()
            .collect()
    }

    /// Does any record of the current thread at `level` contain `needle`?
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.calls()
            .iter()
            .any(|call| call.level == level && call.args.contains(needle))
    }

    pub fn clear_log_calls(&self) {
        let me = current().id();
        LOGCALLS.lock().unwrap().retain(|call| call.thread != me);
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with("asicq") && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        LOGCALLS.lock().unwrap().push(LogCall {
            level: record.level(),
            args: format!("{}", record.args()),
            target: record.target().to_string(),
            module_path: record.module_path().map(|path| path.to_string()),
            thread: current().id(),
        });
    }

    fn flush(&self) {}
}
