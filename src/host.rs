//! Host module - activation ABI and collaborator seams.
//!
//! The host calls one fixed entry point at plugin load time; everything
//! else it offers (its command interpreter) or we owe it (the embedded GUI
//! subsystem) is consumed through the narrow traits here. The UI layer of
//! the plugin registers its collaborators before the host loads us.

use crate::diag;
use crate::inject::InjectionContext;
use crate::relay::GuiDriver;

use std::sync::{Arc, OnceLock};

/// Name under which the failure log dump is reachable from the host's
/// command interpreter.
pub const DIAGNOSTICS_COMMAND: &str = "graft-injection-logs";

/// A registered command's implementation: returns the lines to print.
pub type CommandHandler = Box<dyn Fn() -> Vec<String> + Send + Sync>;

/// Narrow surface of the host's command interpreter.
pub trait HostConsole: Send + Sync {
    /// Returns false when the name is already taken
    fn register_command(&self, name: &str, help: &str, handler: CommandHandler) -> bool;

    fn run_command(&self, name: &str);
}

static GUI: OnceLock<Arc<dyn GuiDriver>> = OnceLock::new();
static CONSOLE: OnceLock<Box<dyn HostConsole>> = OnceLock::new();

/// Provide the embedded GUI subsystem. Must happen before the host calls
/// the entry point; returns false if a driver is already registered.
pub fn register_gui(gui: Arc<dyn GuiDriver>) -> bool {
    GUI.set(gui).is_ok()
}

/// Provide the host console binding. Same contract as [`register_gui`].
pub fn register_console(console: Box<dyn HostConsole>) -> bool {
    CONSOLE.set(console).is_ok()
}

/// Activation: run the takeover once per process and record the outcome.
///
/// Subsequent calls observe the recorded outcome without doing new work.
/// On failure, the diagnostics command is registered and invoked once so
/// the ring is visible without user action, and `false` tells the host to
/// fall back to its own default behavior.
#[cfg(unix)]
pub fn plugin_main(
    ctx: &InjectionContext,
    console: &dyn HostConsole,
    gui: Arc<dyn GuiDriver>,
) -> bool {
    static OUTCOME: OnceLock<bool> = OnceLock::new();

    let outcome = *OUTCOME.get_or_init(|| {
        diag::init();

        match crate::inject::run(ctx, Arc::clone(&gui)) {
            Ok(()) => true,
            Err(err) => {
                log::error!("injection failed: {}", err);
                false
            }
        }
    });

    if outcome {
        gui.request_active();
        return true;
    }

    static REGISTERED: OnceLock<()> = OnceLock::new();
    REGISTERED.get_or_init(|| {
        let ok = console.register_command(
            DIAGNOSTICS_COMMAND,
            "Displays the injection log of graft",
            Box::new(diag::snapshot),
        );
        if !ok {
            log::warn!("`{}` is already registered", DIAGNOSTICS_COMMAND);
        }
    });
    console.run_command(DIAGNOSTICS_COMMAND);

    false
}

/// The fixed-signature entry the host resolves at plugin load time. The
/// debugger handle arrives by pointer per the host ABI; the takeover works
/// entirely through resolved symbols, so the handle itself stays unused.
#[cfg(target_os = "macos")]
#[export_name = "_ZN4lldb16PluginInitializeENS_10SBDebuggerE"]
pub extern "C" fn plugin_initialize(_debugger: *mut std::ffi::c_void) -> bool {
    let (Some(gui), Some(console)) = (GUI.get(), CONSOLE.get()) else {
        // Fail closed: without collaborators there is nothing to activate
        return false;
    };

    let ctx = InjectionContext::for_host();
    plugin_main(&ctx, console.as_ref(), Arc::clone(gui))
}
