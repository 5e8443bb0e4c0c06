//! macOS backends for the probe traits.
//!
//! Thin wrappers over dyld, the malloc zone allocator, mach task/thread
//! control and pthread. These are the only call sites in the crate that
//! talk to the host platform directly.

use super::{DescriptorProbe, HeapProbe, MutexControl, SymbolInfo, SymbolLookup, ThreadControl};

use std::ffi::{c_char, c_int, c_void, CStr, CString};

use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_array_t;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::task::task_threads;
use mach2::thread_act::{thread_resume, thread_suspend};
use mach2::traps::mach_task_self;

extern "C" {
    fn _dyld_get_image_name(index: u32) -> *const c_char;
    fn malloc_zone_from_ptr(ptr: *const c_void) -> *mut c_void;
    fn malloc_size(ptr: *const c_void) -> usize;
    fn pthread_from_mach_thread_np(thread: mach_port_t) -> libc::pthread_t;
}

/// Symbol lookup through dyld.
pub struct DyldLookup;

impl SymbolLookup for DyldLookup {
    fn exported(&self, name: &str) -> Option<usize> {
        let name = CString::new(name).ok()?;

        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
        if addr.is_null() {
            return None;
        }
        Some(addr as usize)
    }

    fn info_for(&self, addr: usize) -> Option<SymbolInfo> {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };

        if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 {
            return None;
        }
        if info.dli_sname.is_null() || info.dli_fname.is_null() {
            return None;
        }

        Some(SymbolInfo {
            image_path: unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .into_owned(),
            image_base: info.dli_fbase as usize,
            symbol_name: unsafe { CStr::from_ptr(info.dli_sname) }
                .to_string_lossy()
                .into_owned(),
            symbol_addr: info.dli_saddr as usize,
        })
    }

    fn main_executable(&self) -> Option<String> {
        // Image 0 is always the main executable
        let name = unsafe { _dyld_get_image_name(0) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }
}

/// Heap probing through the malloc zone allocator.
pub struct MallocProbe;

impl HeapProbe for MallocProbe {
    fn block_len(&self, addr: usize) -> Option<usize> {
        let ptr = addr as *const c_void;

        if unsafe { malloc_zone_from_ptr(ptr) }.is_null() {
            return None;
        }

        // malloc_size is 0 for interior pointers; only block bases count
        match unsafe { malloc_size(ptr) } {
            0 => None,
            len => Some(len),
        }
    }
}

/// Descriptor probing through fstat.
pub struct FstatProbe;

impl DescriptorProbe for FstatProbe {
    fn is_socket(&self, fd: i32) -> bool {
        match nix::sys::stat::fstat(fd) {
            Ok(stat) => (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK,
            Err(_) => false,
        }
    }
}

/// Host thread control through the mach task APIs.
pub struct MachThreads;

impl ThreadControl for MachThreads {
    fn main_thread(&self) -> Option<u64> {
        let mut threads: thread_act_array_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;

        let kr = unsafe { task_threads(mach_task_self(), &mut threads, &mut count) };
        if kr != KERN_SUCCESS || count == 0 {
            return None;
        }

        Some(unsafe { *threads } as u64)
    }

    fn suspend(&self, thread: u64) -> bool {
        unsafe { thread_suspend(thread as mach_port_t) == KERN_SUCCESS }
    }

    fn resume(&self, thread: u64) -> bool {
        unsafe { thread_resume(thread as mach_port_t) == KERN_SUCCESS }
    }

    fn dislodge(&self, thread: u64) {
        // Handler must stay async-signal-safe: arrive, reset, do nothing
        extern "C" fn on_interrupt(_sig: c_int) {}

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = libc::SA_RESETHAND;
            action.sa_sigaction = on_interrupt as usize;

            if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
                log::warn!("failed to install SIGINT handler, skipping dislodge");
                return;
            }

            let pthread = pthread_from_mach_thread_np(thread as mach_port_t);
            let err = libc::pthread_kill(pthread, libc::SIGINT);
            if err != 0 {
                log::warn!("failed to interrupt host main thread: {}", err);
            }
        }
    }
}

/// Foreign mutex control over pthread mutex storage.
///
/// The host's guarding mutex is a plain pthread mutex at a known address;
/// locking it from here is exactly what the host's own code does.
pub struct PthreadMutexes;

impl MutexControl for PthreadMutexes {
    fn lock(&self, addr: usize) {
        unsafe { libc::pthread_mutex_lock(addr as *mut libc::pthread_mutex_t) };
    }

    fn unlock(&self, addr: usize) {
        unsafe { libc::pthread_mutex_unlock(addr as *mut libc::pthread_mutex_t) };
    }
}
