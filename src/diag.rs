//! Ring-buffer log sink.
//!
//! Injection has no terminal and must never write into the host's own
//! output, so every `log` record lands in a bounded in-memory ring. The
//! host-registered diagnostics command dumps the ring on demand; success
//! leaves it unread.

use log::{Level, LevelFilter, Log, Metadata, Record};

use std::collections::VecDeque;
use std::sync::Mutex;

/// Lines kept before the oldest are dropped.
pub const RING_CAPACITY: usize = 512;

static LINES: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());

struct RingLogger;

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        push_line(format!("[{}] {}", record.level(), record.args()));
    }

    fn flush(&self) {}
}

fn push_line(line: String) {
    let mut lines = LINES.lock().unwrap();
    if lines.len() == RING_CAPACITY {
        lines.pop_front();
    }
    lines.push_back(line);
}

/// Install the ring as the process logger.
///
/// Returns false when some other logger won the race; records then flow to
/// that logger instead and the dump command shows an empty ring.
pub fn init() -> bool {
    static LOGGER: RingLogger = RingLogger;

    if log::set_logger(&LOGGER).is_err() {
        return false;
    }
    log::set_max_level(LevelFilter::Debug);
    true
}

/// Current ring contents, oldest first.
pub fn snapshot() -> Vec<String> {
    LINES.lock().unwrap().iter().cloned().collect()
}
