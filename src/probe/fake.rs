//! Recording fakes for the probe traits, shared by the unit tests.

use super::{DescriptorProbe, HeapProbe, MutexControl, SymbolInfo, SymbolLookup, ThreadControl};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Chronological event log shared between fakes so tests can assert
/// cross-trait ordering (mutex before suspension, resume before unlock).
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeLookup {
    pub exports: HashMap<String, usize>,
    pub infos: HashMap<usize, SymbolInfo>,
    pub main_exe: Option<String>,
}

impl FakeLookup {
    pub fn export(mut self, name: &str, addr: usize) -> Self {
        self.exports.insert(name.to_string(), addr);
        self
    }

    /// Register a reverse-lookup result for `addr`.
    pub fn info(
        mut self,
        addr: usize,
        image_path: &str,
        image_base: usize,
        symbol_name: &str,
        symbol_addr: usize,
    ) -> Self {
        self.infos.insert(
            addr,
            SymbolInfo {
                image_path: image_path.to_string(),
                image_base,
                symbol_name: symbol_name.to_string(),
                symbol_addr,
            },
        );
        self
    }

    pub fn main_exe(mut self, path: &str) -> Self {
        self.main_exe = Some(path.to_string());
        self
    }
}

impl SymbolLookup for FakeLookup {
    fn exported(&self, name: &str) -> Option<usize> {
        self.exports.get(name).copied()
    }

    fn info_for(&self, addr: usize) -> Option<SymbolInfo> {
        self.infos.get(&addr).cloned()
    }

    fn main_executable(&self) -> Option<String> {
        self.main_exe.clone()
    }
}

#[derive(Default)]
pub struct FakeHeap {
    /// block base -> block byte length
    pub blocks: HashMap<usize, usize>,
}

impl FakeHeap {
    pub fn block(mut self, base: usize, len: usize) -> Self {
        self.blocks.insert(base, len);
        self
    }
}

impl HeapProbe for FakeHeap {
    fn block_len(&self, addr: usize) -> Option<usize> {
        self.blocks.get(&addr).copied()
    }
}

#[derive(Default)]
pub struct FakeDescriptors {
    pub sockets: Vec<i32>,
}

impl DescriptorProbe for FakeDescriptors {
    fn is_socket(&self, fd: i32) -> bool {
        self.sockets.contains(&fd)
    }
}

pub struct FakeThreads {
    pub main: Option<u64>,
    pub log: EventLog,
}

impl FakeThreads {
    pub fn new(log: EventLog) -> Self {
        Self { main: Some(1), log }
    }
}

impl ThreadControl for FakeThreads {
    fn main_thread(&self) -> Option<u64> {
        self.main
    }

    fn suspend(&self, thread: u64) -> bool {
        self.log.push(format!("suspend {}", thread));
        true
    }

    fn resume(&self, thread: u64) -> bool {
        self.log.push(format!("resume {}", thread));
        true
    }

    fn dislodge(&self, thread: u64) {
        self.log.push(format!("dislodge {}", thread));
    }
}

pub struct FakeMutexes {
    pub log: EventLog,
}

impl MutexControl for FakeMutexes {
    fn lock(&self, addr: usize) {
        self.log.push(format!("lock {:#x}", addr));
    }

    fn unlock(&self, addr: usize) {
        self.log.push(format!("unlock {:#x}", addr));
    }
}
