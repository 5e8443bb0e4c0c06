//! Relay module - the substituted dispatch entries.
//!
//! Once the patched table is live, the host's polling loop calls into this
//! module instead of its own connection code. The relay keeps up the
//! illusion of an ordinary connected socket while redirecting the blocking
//! read into a loop that pumps the embedded GUI on the host's own thread,
//! returning to the host only when real channel data has arrived.

pub mod buffer;
#[cfg(unix)]
pub mod shim;

use crate::inject::memory::I32Slot;
use crate::probe::SymbolLookup;
use buffer::SharedBuffer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Surface produced to the embedded GUI subsystem.
///
/// `idle` runs one blocking event-processing iteration; `interrupt` wakes
/// that wait early and is the only method called from another thread.
pub trait GuiDriver: Send + Sync {
    /// Ask the GUI subsystem to enter active mode
    fn request_active(&self);

    /// Run one blocking GUI event-processing iteration
    fn idle(&self);

    /// Wake a concurrent `idle` before its own timeout
    fn interrupt(&self);
}

/// State behind the two substituted methods.
///
/// Starts never-activated; the first hijacked read flips it to active for
/// the rest of the process. There is no dedicated relay thread: every
/// method here runs on whichever host thread called through the patched
/// table.
pub struct Relay {
    buffer: Arc<SharedBuffer>,
    gui: Arc<dyn GuiDriver>,
    lookup: Arc<dyn SymbolLookup>,
    read_spellings: Vec<String>,
    fd: i32,
    fd_slot: I32Slot,
    original_read: usize,
    activated: AtomicBool,
}

impl Relay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        buffer: Arc<SharedBuffer>,
        gui: Arc<dyn GuiDriver>,
        lookup: Arc<dyn SymbolLookup>,
        read_spellings: Vec<String>,
        fd: i32,
        fd_slot: I32Slot,
        original_read: usize,
    ) -> Self {
        log::info!(
            "relay over fd {} (displaced read implementation at {:#x})",
            fd,
            original_read
        );
        Self {
            buffer,
            gui,
            lookup,
            read_spellings,
            fd,
            fd_slot,
            original_read,
            activated: AtomicBool::new(false),
        }
    }

    pub fn activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Address of the read implementation this relay displaced.
    pub fn original_read(&self) -> usize {
        self.original_read
    }

    /// Stand-in for the host's is-connected method.
    ///
    /// While never-activated, the answer depends on who is asking: the
    /// original read implementation (identified by reverse-resolving the
    /// caller's return address) is told the connection is gone, so the
    /// host's own code stops competing for the descriptor. Everyone else
    /// is told it is fine. Once active, always connected.
    pub fn is_connected(&self, caller: usize) -> bool {
        if self.activated.load(Ordering::SeqCst) {
            return true;
        }

        let from_original_read = match self.lookup.info_for(caller) {
            Some(info) => self
                .read_spellings
                .iter()
                .any(|spelling| *spelling == info.symbol_name),
            None => {
                log::warn!("is-connected caller {:#x} does not reverse-resolve", caller);
                false
            }
        };

        if from_original_read {
            // Park the host-visible descriptor: the original read path
            // treats a negative slot as a closed channel
            self.fd_slot.set(-1);
            false
        } else {
            self.fd_slot.set(self.fd);
            true
        }
    }

    /// Stand-in for the host's read method.
    ///
    /// Blocks, from the host's point of view, until channel data arrives;
    /// in reality each empty drain pumps one GUI event iteration on this
    /// very thread. The returned bytes are everything produced so far.
    pub fn read(&self) -> Vec<u8> {
        if !self.activated.swap(true, Ordering::SeqCst) {
            log::info!("hijacked read entered for the first time");
            self.gui.request_active();
        }

        loop {
            let data = self.buffer.drain();
            if !data.is_empty() {
                return data;
            }
            self.gui.idle();
        }
    }
}

static INSTALLED: OnceLock<Relay> = OnceLock::new();

/// Install the process-wide relay.
///
/// The dispatch shims have no other channel to reach it, so this is one of
/// the two deliberate process-global slots in the crate. Write-once;
/// installing twice is a logic error.
pub fn install(relay: Relay) -> Option<&'static Relay> {
    let mut stored = false;
    let installed = INSTALLED.get_or_init(|| {
        stored = true;
        relay
    });

    if !stored {
        debug_assert!(false, "relay installed twice");
        log::error!("relay already installed, dropping the new one");
        return None;
    }
    Some(installed)
}

pub fn installed() -> Option<&'static Relay> {
    INSTALLED.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::FakeLookup;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const ORIGINAL_READ: usize = 0x2000;
    const OTHER_CALLER: usize = 0x5000;
    const FD: i32 = 42;

    /// GUI double whose idle() can feed the buffer after a number of
    /// iterations, standing in for "data arrives while the GUI pumps".
    struct ScriptedGui {
        active_requests: AtomicUsize,
        idles: AtomicUsize,
        feed_on_idle: Mutex<Option<(usize, Vec<u8>, Arc<SharedBuffer>)>>,
    }

    impl ScriptedGui {
        fn new() -> Self {
            Self {
                active_requests: AtomicUsize::new(0),
                idles: AtomicUsize::new(0),
                feed_on_idle: Mutex::new(None),
            }
        }
    }

    impl GuiDriver for ScriptedGui {
        fn request_active(&self) {
            self.active_requests.fetch_add(1, Ordering::SeqCst);
        }

        fn idle(&self) {
            let idles = self.idles.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, data, buffer)) = &*self.feed_on_idle.lock().unwrap() {
                if idles == *after {
                    buffer.append(data);
                }
            }
        }

        fn interrupt(&self) {}
    }

    fn slot_value(addr: usize) -> i32 {
        unsafe { I32Slot::new(addr) }.get()
    }

    fn relay_with(gui: Arc<ScriptedGui>, buffer: Arc<SharedBuffer>) -> (Relay, usize) {
        let fd_addr = Box::leak(Box::new(FD)) as *mut i32 as usize;
        let fd_slot = unsafe { I32Slot::new(fd_addr) };

        let lookup = FakeLookup::default()
            .info(ORIGINAL_READ, "/host", 0x1, "socketRead", ORIGINAL_READ)
            .info(OTHER_CALLER, "/host", 0x1, "pollConnections", OTHER_CALLER);

        let relay = Relay::new(
            buffer,
            gui,
            Arc::new(lookup),
            vec!["socketRead".to_string(), "socketReadV2".to_string()],
            FD,
            fd_slot,
            ORIGINAL_READ,
        );
        (relay, fd_addr)
    }

    #[test]
    fn masks_connectivity_only_for_the_original_read_path() {
        let gui = Arc::new(ScriptedGui::new());
        let buffer = Arc::new(SharedBuffer::new());
        let (relay, fd_addr) = relay_with(gui, buffer);

        // Original read probing: play dead, park the descriptor slot
        assert!(!relay.is_connected(ORIGINAL_READ));
        assert_eq!(slot_value(fd_addr), -1);
        assert!(!relay.activated());

        // Masking is per-call, not sticky
        assert!(!relay.is_connected(ORIGINAL_READ));
        assert!(!relay.activated());

        // Any other caller: connected, slot restored
        assert!(relay.is_connected(OTHER_CALLER));
        assert_eq!(slot_value(fd_addr), FD);
    }

    #[test]
    fn unresolvable_caller_is_treated_as_any_other_caller() {
        let gui = Arc::new(ScriptedGui::new());
        let buffer = Arc::new(SharedBuffer::new());
        let (relay, _) = relay_with(gui, buffer);

        assert!(relay.is_connected(0xdead_0000));
    }

    #[test]
    fn read_pumps_gui_until_data_arrives() {
        let gui = Arc::new(ScriptedGui::new());
        let buffer = Arc::new(SharedBuffer::new());
        *gui.feed_on_idle.lock().unwrap() = Some((3, b"hello".to_vec(), Arc::clone(&buffer)));

        let (relay, _) = relay_with(Arc::clone(&gui), buffer);

        // Empty buffer: must not return until data exists
        assert_eq!(relay.read(), b"hello");
        assert_eq!(gui.idles.load(Ordering::SeqCst), 3);
        assert_eq!(gui.active_requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_returns_produced_bytes_without_idling_when_data_is_ready() {
        let gui = Arc::new(ScriptedGui::new());
        let buffer = Arc::new(SharedBuffer::new());
        buffer.append(b"ready");

        let (relay, _) = relay_with(Arc::clone(&gui), Arc::clone(&buffer));

        assert_eq!(relay.read(), b"ready");
        assert_eq!(gui.idles.load(Ordering::SeqCst), 0);

        // Second call: 5 bytes appended by the producer side
        buffer.append(&[1, 2, 3, 4, 5]);
        assert_eq!(relay.read(), [1, 2, 3, 4, 5]);

        // Active mode was requested exactly once
        assert_eq!(gui.active_requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn activation_makes_connectivity_unconditional() {
        let gui = Arc::new(ScriptedGui::new());
        let buffer = Arc::new(SharedBuffer::new());
        buffer.append(b"x");

        let (relay, fd_addr) = relay_with(gui, buffer);
        relay.read();
        assert!(relay.activated());

        // Even the original read path is now told "connected", and the
        // descriptor slot is left alone
        assert!(relay.is_connected(ORIGINAL_READ));
        assert_eq!(slot_value(fd_addr), FD);
    }
}
