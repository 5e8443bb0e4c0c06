//! Shared byte queue between the reader thread and the relay.

use super::GuiDriver;

use std::sync::{Arc, Mutex};

/// Chunk size for the blocking read loop.
const READ_CHUNK: usize = 1024;

/// Unbounded byte queue with whole-queue drains.
///
/// Single producer (the reader thread), single consumer (the intercepted
/// read entry); the one mutex is the only ordering between them.
pub struct SharedBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new(Vec::new()),
        }
    }

    pub fn append(&self, data: &[u8]) {
        self.bytes.lock().unwrap().extend_from_slice(data);
    }

    /// Swap out everything produced so far. Never blocks on production;
    /// an empty queue drains to an empty vector.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.bytes.lock().unwrap())
    }
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Take over reading of the raw channel.
///
/// The host's original code path must never read this descriptor again
/// once the thread is running. Zero-length reads are "try again" (the
/// host's own read semantics, not POSIX EOF); a read error is fatal to
/// the process, since the channel is the debugger's lifeline.
#[cfg(unix)]
pub fn spawn_reader(
    fd: i32,
    buffer: Arc<SharedBuffer>,
    gui: Arc<dyn GuiDriver>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("graft-reader".to_string())
        .spawn(move || {
            let mut chunk = [0u8; READ_CHUNK];

            loop {
                let n = unsafe {
                    libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, READ_CHUNK)
                };

                if n == 0 {
                    continue;
                }
                if n < 0 {
                    log::error!(
                        "channel read failed: {}",
                        std::io::Error::last_os_error()
                    );
                    std::process::abort();
                }

                buffer.append(&chunk[..n as usize]);
                gui.interrupt();
            }
        })?;

    Ok(())
}
