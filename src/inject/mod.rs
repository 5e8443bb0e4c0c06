//! Inject module - the takeover sequence.
//!
//! Order matters everywhere here: the registry mutex is taken before the
//! host is frozen (a frozen thread already holding it would deadlock us),
//! the reader thread and the relay exist before the table swap makes them
//! reachable, and the host is dislodged and resumed before anything that
//! could block. Every step below the activation swap returns a failure
//! value instead of panicking; once the swap lands there is no way back.

pub mod locator;
pub mod memory;
pub mod suspend;
pub mod symbols;
pub mod vtable;

use crate::probe::{DescriptorProbe, HeapProbe, MutexControl, SymbolLookup, ThreadControl};
use crate::relay::{self, buffer::SharedBuffer, GuiDriver, Relay};

use locator::RegistryLock;
use memory::{I32Slot, WordSlot};
use suspend::SuspensionGuard;
use symbols::{SymbolResolver, SymbolSource};
use vtable::{MethodTable, Substitution};

use std::sync::Arc;
use thiserror::Error;

/// Why an injection attempt was abandoned.
///
/// All of these abort the attempt and leave the host exactly as it was;
/// none of them may crash or hang it.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("resolution of `{symbol}` failed: {reason}")]
    Resolution { symbol: String, reason: String },

    #[error("failed to parse image `{path}`: {detail}")]
    ImageParse { path: String, detail: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("dispatch table walk failed: {0}")]
    TableWalk(String),
}

/// Identifiers of the host being taken over, in one place.
pub struct HostProfile {
    /// Suffix of the main executable's image path
    pub host_binary: &'static str,
    /// Exported anchor used to compute the image slide
    pub anchor_symbol: &'static str,
    /// Private global: registry of live connection handles
    pub registry_symbol: &'static str,
    /// Private global: mutex guarding the registry
    pub registry_mutex_symbol: &'static str,
    /// Dispatch table of the connection type
    pub table_symbol: &'static str,
    /// Spellings of the is-connected method
    pub is_connected_symbols: &'static [&'static str],
    /// Spellings of the read method across host versions
    pub read_symbols: &'static [&'static str],
}

impl HostProfile {
    /// The RPC debug server this plugin ships against.
    pub fn rpc_debug_server() -> Self {
        Self {
            host_binary: "lldb-rpc-server",
            anchor_symbol: "_ZN4lldb10SBDebugger6CreateEb",
            registry_symbol: "g_connections",
            registry_mutex_symbol: "g_connections_mutex_ptr",
            table_symbol: "_ZTVN10rpc_common19RPCConnectionSocketE",
            is_connected_symbols: &["_ZNK10rpc_common19RPCConnectionSocket11IsConnectedEv"],
            read_symbols: &[
                "_ZN10rpc_common19RPCConnectionSocket4ReadERNSt3__112basic_stringIhNS1_11char_traitsIhEENS1_9allocatorIhEEEEb",
                "_ZN10rpc_common19RPCConnectionSocket4ReadERNSt3__16vectorIhNS1_9allocatorIhEEEEb",
            ],
        }
    }
}

/// Everything the takeover needs, owned in one place and constructed once
/// at activation.
pub struct InjectionContext {
    pub profile: HostProfile,
    pub lookup: Arc<dyn SymbolLookup>,
    pub images: Box<dyn SymbolSource>,
    pub heap: Box<dyn HeapProbe>,
    pub descriptors: Box<dyn DescriptorProbe>,
    pub threads: Box<dyn ThreadControl>,
    pub mutexes: Box<dyn MutexControl>,
}

#[cfg(target_os = "macos")]
impl InjectionContext {
    /// Context over the real host process.
    pub fn for_host() -> Self {
        Self {
            profile: HostProfile::rpc_debug_server(),
            lookup: Arc::new(crate::probe::DyldLookup),
            images: Box::new(symbols::DiskImages),
            heap: Box::new(crate::probe::MallocProbe),
            descriptors: Box::new(crate::probe::FstatProbe),
            threads: Box::new(crate::probe::MachThreads),
            mutexes: Box::new(crate::probe::PthreadMutexes),
        }
    }
}

/// Run the takeover.
///
/// On success the patched table is live, the reader thread owns the
/// descriptor and the relay is installed; there is no rollback. On failure
/// the host is untouched apart from log lines in the ring.
#[cfg(unix)]
pub fn run(ctx: &InjectionContext, gui: Arc<dyn GuiDriver>) -> Result<(), InjectError> {
    use crate::relay::shim;

    let profile = &ctx.profile;

    // Refuse to touch a process that is not the expected host
    let main_exe = ctx
        .lookup
        .main_executable()
        .ok_or_else(|| InjectError::Precondition("cannot identify the main executable".into()))?;
    if !main_exe.ends_with(profile.host_binary) {
        return Err(InjectError::Precondition(format!(
            "this process is `{}`, not `{}`",
            main_exe, profile.host_binary
        )));
    }

    let resolver =
        SymbolResolver::with_anchor(ctx.lookup.as_ref(), ctx.images.as_ref(), profile.anchor_symbol)?;

    let registry = locator::registry_global(&resolver, ctx.heap.as_ref(), profile.registry_symbol)?;
    let mutex =
        locator::mutex_global(&resolver, ctx.heap.as_ref(), profile.registry_mutex_symbol)?;

    // Lock before freezing, lest we deadlock against a host thread that
    // already holds the registry
    let _registry_lock = RegistryLock::acquire(ctx.mutexes.as_ref(), mutex);

    let main_thread = ctx
        .threads
        .main_thread()
        .ok_or_else(|| InjectError::Precondition("cannot enumerate host threads".into()))?;
    let suspension = SuspensionGuard::freeze(ctx.threads.as_ref(), main_thread)?;

    let target = locator::locate(
        registry,
        ctx.heap.as_ref(),
        ctx.lookup.as_ref(),
        profile.table_symbol,
    )?;

    let dispatch_word = unsafe { WordSlot::new(target.base) };
    let original_table = dispatch_word.get();

    let table = unsafe { MethodTable::capture(original_table, ctx.lookup.as_ref()) };
    let patched = table.substitute(&[
        Substitution {
            label: "read",
            spellings: profile.read_symbols,
            replacement: shim::hijacked_read as usize,
        },
        Substitution {
            label: "is_connected",
            spellings: profile.is_connected_symbols,
            replacement: shim::hijacked_is_connected as usize,
        },
    ])?;
    let original_read = patched.original("read").unwrap_or_default();

    let channel = locator::find_descriptor(target, ctx.descriptors.as_ref())?;

    // From here the host's own code path must never read the descriptor
    // again; the reader thread takes it over for good
    let buffer = Arc::new(SharedBuffer::new());
    let relay = Relay::new(
        Arc::clone(&buffer),
        Arc::clone(&gui),
        Arc::clone(&ctx.lookup),
        profile.read_symbols.iter().map(|s| s.to_string()).collect(),
        channel.fd,
        unsafe { I32Slot::new(channel.slot_addr) },
        original_read,
    );
    if relay::install(relay).is_none() {
        return Err(InjectError::Precondition("relay already installed".into()));
    }

    relay::buffer::spawn_reader(channel.fd, buffer, gui).map_err(|err| {
        InjectError::Precondition(format!("cannot spawn the reader thread: {}", err))
    })?;

    log::info!("activating patched dispatch table");
    let installed = patched.install(&dispatch_word);
    log::debug!("dispatch word {:#x} -> {:#x}", original_table, installed);

    // Knock the frozen thread out of its blocking read so it re-polls
    // through the patched table once resumed
    suspension.dislodge();
    drop(suspension);

    log::info!("injection complete");
    Ok(())
}
