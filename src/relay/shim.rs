//! ABI glue planted into the patched dispatch table.
//!
//! These are the raw `extern "C"` functions the host actually calls. They
//! capture caller identity, translate between the host's out-buffer layout
//! and plain byte slices, and hand everything else to the installed relay.

use std::ffi::c_void;
use std::ptr;

/// The host's contiguous byte-vector header: {begin, end, capacity end}.
#[repr(C)]
pub struct RawByteVec {
    pub begin: *mut u8,
    pub end: *mut u8,
    pub cap: *mut u8,
}

/// Write `data` into a host byte vector, clearing it first unless `append`
/// is requested.
///
/// Grown storage comes from the process allocator, which the host's own
/// vector growth uses as well.
///
/// # Safety
///
/// `vec` must point at a live, correctly laid out host byte vector that no
/// other thread is touching.
pub unsafe fn vec_write(vec: *mut RawByteVec, data: &[u8], append: bool) {
    let v = &mut *vec;

    if !append {
        v.end = v.begin;
    }

    let len = v.end.offset_from(v.begin) as usize;
    let cap = v.cap.offset_from(v.begin) as usize;
    let needed = len + data.len();

    if needed > cap {
        let new_cap = needed.next_power_of_two();
        let storage = libc::malloc(new_cap) as *mut u8;
        if storage.is_null() {
            log::error!("cannot grow host read buffer to {} bytes", new_cap);
            std::process::abort();
        }

        ptr::copy_nonoverlapping(v.begin, storage, len);
        if !v.begin.is_null() {
            libc::free(v.begin as *mut c_void);
        }

        v.begin = storage;
        v.end = storage.add(len);
        v.cap = storage.add(new_cap);
    }

    ptr::copy_nonoverlapping(data.as_ptr(), v.end, data.len());
    v.end = v.end.add(data.len());
}

/// Return address of the function that called our caller.
#[inline(never)]
fn caller_return_address() -> usize {
    // Frames: 0 = this helper, 1 = the shim, 2 = whoever called the shim
    let mut depth = 0;
    let mut addr = 0usize;

    backtrace::trace(|frame| {
        depth += 1;
        if depth == 3 {
            addr = frame.ip() as usize;
            false
        } else {
            true
        }
    });

    addr
}

/// Replacement for the host's is-connected method.
pub extern "C" fn hijacked_is_connected(_this: *const c_void) -> bool {
    match super::installed() {
        Some(relay) => relay.is_connected(caller_return_address()),
        // The table is never installed without a relay; keep the host calm
        None => true,
    }
}

/// Replacement for the host's read method.
pub extern "C" fn hijacked_read(_this: *const c_void, buffer: *mut RawByteVec, append: bool) -> usize {
    let Some(relay) = super::installed() else {
        return 0;
    };

    let data = relay.read();
    unsafe { vec_write(buffer, &data, append) };
    data.len()
}
