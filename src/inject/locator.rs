//! Locating the live connection object on the host's heap.
//!
//! Two private globals name a registry of live connection handles and the
//! mutex guarding it. The registry must hold exactly one live entry; that
//! entry's heap block is scanned word-by-word for a pointer whose first
//! word reverse-resolves to the known dispatch-table symbol. The match is
//! the object whose table gets rewritten.

use super::memory::ForeignView;
use super::symbols::SymbolResolver;
use super::InjectError;
use crate::probe::{DescriptorProbe, HeapProbe, MutexControl, SymbolLookup};

use std::mem;

/// Host registry layout: a contiguous vector header of {begin, end, cap}.
const REGISTRY_LAYOUT_BYTES: usize = 3 * mem::size_of::<usize>();

/// Each registry entry is a two-word shared handle {object, control block}.
const HANDLE_BYTES: usize = 2 * mem::size_of::<usize>();

/// Storage size of the host's registry mutex.
const HOST_MUTEX_BYTES: usize = 64;

/// The connection object selected for interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetObject {
    pub base: usize,
    pub len: usize,
}

/// The descriptor the host was reading, and where the host keeps it.
#[derive(Debug, Clone, Copy)]
pub struct SocketChannel {
    pub fd: i32,
    pub slot_addr: usize,
}

/// Scoped hold of the host's registry mutex.
///
/// Must be acquired before any host thread is suspended; a suspended thread
/// already holding this mutex would deadlock the injection.
pub struct RegistryLock<'a> {
    mutexes: &'a dyn MutexControl,
    addr: usize,
}

impl<'a> RegistryLock<'a> {
    pub fn acquire(mutexes: &'a dyn MutexControl, addr: usize) -> Self {
        mutexes.lock(addr);
        log::debug!("registry mutex {:#x} held", addr);
        Self { mutexes, addr }
    }
}

impl Drop for RegistryLock<'_> {
    fn drop(&mut self) {
        self.mutexes.unlock(self.addr);
    }
}

/// Resolve a private global holding a pointer, and validate what it points
/// at: a live heap block no smaller than the expected layout and no larger
/// than 1.5x it.
pub fn validated_global(
    resolver: &SymbolResolver<'_>,
    heap: &dyn HeapProbe,
    name: &str,
    expected_len: usize,
) -> Result<usize, InjectError> {
    let fail = |reason: String| InjectError::Resolution {
        symbol: name.to_string(),
        reason,
    };

    let global_addr = resolver.resolve(name)?;

    let view = unsafe { ForeignView::new(global_addr, mem::size_of::<usize>()) };
    let value = view.word(0).expect("view holds one word");

    let len = heap
        .block_len(value)
        .ok_or_else(|| fail(format!("{:#x} is not a live heap block", value)))?;

    let max_len = expected_len + expected_len / 2;
    if len < expected_len {
        return Err(fail(format!(
            "heap block is {} bytes, expected at least {}",
            len, expected_len
        )));
    }
    if len > max_len {
        return Err(fail(format!(
            "heap block is {} bytes, expected at most {}",
            len, max_len
        )));
    }

    log::info!("`{}` -> {:#x} ({} bytes)", name, value, len);
    Ok(value)
}

pub fn registry_global(
    resolver: &SymbolResolver<'_>,
    heap: &dyn HeapProbe,
    name: &str,
) -> Result<usize, InjectError> {
    validated_global(resolver, heap, name, REGISTRY_LAYOUT_BYTES)
}

pub fn mutex_global(
    resolver: &SymbolResolver<'_>,
    heap: &dyn HeapProbe,
    name: &str,
) -> Result<usize, InjectError> {
    validated_global(resolver, heap, name, HOST_MUTEX_BYTES)
}

/// Object pointers of the registry's live entries.
fn registry_entries(registry_base: usize) -> Result<Vec<usize>, InjectError> {
    let header = unsafe { ForeignView::new(registry_base, REGISTRY_LAYOUT_BYTES) };
    let begin = header.word(0).expect("registry header");
    let end = header.word(1).expect("registry header");

    if end < begin || (end - begin) % HANDLE_BYTES != 0 {
        return Err(InjectError::Precondition(format!(
            "registry storage is malformed ({:#x}..{:#x})",
            begin, end
        )));
    }

    let storage = unsafe { ForeignView::new(begin, end - begin) };
    let count = storage.len() / HANDLE_BYTES;

    // First word of each handle is the object pointer
    Ok((0..count)
        .map(|i| storage.word(i * 2).expect("handle storage"))
        .collect())
}

/// Find the connection object by dispatch-table fingerprint.
///
/// Requires the registry mutex to be held and the host frozen.
pub fn locate(
    registry_base: usize,
    heap: &dyn HeapProbe,
    lookup: &dyn SymbolLookup,
    table_symbol: &str,
) -> Result<TargetObject, InjectError> {
    let entries = registry_entries(registry_base)?;

    // Single-connection hosts only: any other count fails loudly instead of
    // guessing which connection to take over
    if entries.len() != 1 {
        return Err(InjectError::Precondition(format!(
            "unexpected count of live connections: {}",
            entries.len()
        )));
    }

    let connection = entries[0];
    let connection_len = heap.block_len(connection).ok_or_else(|| {
        InjectError::Precondition(format!("connection {:#x} is not heap allocated", connection))
    })?;

    log::info!(
        "scanning connection {:#x} ({} bytes) for the socket object",
        connection,
        connection_len
    );
    let view = unsafe { ForeignView::new(connection, connection_len) };

    for index in 0..view.word_count() {
        let candidate = view.word(index).expect("scan in bounds");

        let Some(len) = heap.block_len(candidate) else {
            log::debug!("- {:#x}: not a heap block", candidate);
            continue;
        };
        if len < mem::size_of::<usize>() + mem::size_of::<i32>() {
            log::debug!("- {:#x}: too small ({} bytes)", candidate, len);
            continue;
        }

        let first_word = unsafe { ForeignView::new(candidate, mem::size_of::<usize>()) }
            .word(0)
            .expect("candidate first word");

        let Some(info) = lookup.info_for(first_word) else {
            log::debug!(
                "- {:#x}: first word {} is no known table",
                candidate,
                hex::encode(first_word.to_ne_bytes())
            );
            continue;
        };
        if info.symbol_name != table_symbol {
            log::debug!(
                "- {:#x}: wrong dispatch table (`{}`)",
                candidate,
                info.symbol_name
            );
            continue;
        }

        log::info!("- {:#x}: socket object found ({} bytes)", candidate, len);
        return Ok(TargetObject {
            base: candidate,
            len,
        });
    }

    Err(InjectError::Precondition(
        "no object with the expected dispatch table".to_string(),
    ))
}

/// Find the socket descriptor inside the located object.
///
/// Best-effort and order-dependent: the object is read as 4-byte integers
/// and the first value that fstats as an open socket wins. A stray integer
/// that happens to alias a live socket would be picked up instead.
pub fn find_descriptor(
    object: TargetObject,
    descriptors: &dyn DescriptorProbe,
) -> Result<SocketChannel, InjectError> {
    let view = unsafe { ForeignView::new(object.base, object.len) };

    for index in 0..view.u32_count() {
        let value = view.u32(index).expect("scan in bounds") as i32;

        if !descriptors.is_socket(value) {
            log::debug!("- {} is not an open socket", value);
            continue;
        }

        log::info!("- {} is the socket descriptor", value);
        return Ok(SocketChannel {
            fd: value,
            slot_addr: view.u32_addr(index).expect("scan in bounds"),
        });
    }

    Err(InjectError::Precondition(
        "no socket descriptor inside the connection object".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::{FakeDescriptors, FakeHeap, FakeLookup};

    const TABLE_SYMBOL: &str = "vtable_for_SocketConnection";

    #[repr(C)]
    struct RegistryHeader {
        begin: usize,
        end: usize,
        cap: usize,
    }

    fn header_for(handles: &[[usize; 2]]) -> RegistryHeader {
        let begin = handles.as_ptr() as usize;
        let end = begin + std::mem::size_of_val(handles);
        RegistryHeader {
            begin,
            end,
            cap: end,
        }
    }

    #[test]
    fn locate_finds_object_by_fingerprint_at_offset() {
        // Socket object: [vtable ptr][fd slot], embedded pointer sits at
        // word 2 of the connection block
        let socket_obj: [usize; 2] = [0x7000, 23];
        let connection: [usize; 4] = [0, 0xbad, socket_obj.as_ptr() as usize, 0];
        let handles = [[connection.as_ptr() as usize, 0xcccc]];
        let header = header_for(&handles);

        let heap = FakeHeap::default()
            .block(connection.as_ptr() as usize, std::mem::size_of_val(&connection))
            .block(socket_obj.as_ptr() as usize, std::mem::size_of_val(&socket_obj));
        let lookup = FakeLookup::default().info(0x7000, "/host", 0x1, TABLE_SYMBOL, 0x7000);

        let target = locate(
            &header as *const _ as usize,
            &heap,
            &lookup,
            TABLE_SYMBOL,
        )
        .unwrap();
        assert_eq!(target.base, socket_obj.as_ptr() as usize);
        assert_eq!(target.len, std::mem::size_of_val(&socket_obj));
    }

    #[test]
    fn locate_rejects_object_without_known_table() {
        let socket_obj: [usize; 2] = [0x7000, 23];
        let connection: [usize; 1] = [socket_obj.as_ptr() as usize];
        let handles = [[connection.as_ptr() as usize, 0xcccc]];
        let header = header_for(&handles);

        let heap = FakeHeap::default()
            .block(connection.as_ptr() as usize, std::mem::size_of_val(&connection))
            .block(socket_obj.as_ptr() as usize, std::mem::size_of_val(&socket_obj));
        // 0x7000 is not registered with the lookup: fingerprint never matches
        let lookup = FakeLookup::default();

        let result = locate(&header as *const _ as usize, &heap, &lookup, TABLE_SYMBOL);
        assert!(matches!(result, Err(InjectError::Precondition(_))));
    }

    #[test]
    fn locate_requires_exactly_one_connection() {
        let connection: [usize; 1] = [0];
        let handles = [
            [connection.as_ptr() as usize, 0],
            [connection.as_ptr() as usize, 0],
        ];
        let header = header_for(&handles);

        let heap = FakeHeap::default();
        let lookup = FakeLookup::default();

        let result = locate(&header as *const _ as usize, &heap, &lookup, TABLE_SYMBOL);
        assert!(matches!(result, Err(InjectError::Precondition(_))));
    }

    #[test]
    fn validated_global_enforces_block_size_window() {
        let target: [usize; 3] = [1, 2, 3];
        let global = Box::leak(Box::new(target.as_ptr() as usize));
        let global_addr = global as *mut usize as usize;

        let lookup = FakeLookup::default()
            .export("Anchor", 0x9000)
            .info(0x9000, "/host", 0x1, "Anchor", 0x9000)
            .info(global_addr, "/host", 0x1, "g_registry", global_addr);

        struct Fixed(usize);
        impl super::super::symbols::SymbolSource for Fixed {
            fn load(
                &self,
                _: &str,
            ) -> Result<super::super::symbols::ImageSymbols, InjectError> {
                // Slide is zero: static offsets equal runtime addresses
                Ok(super::super::symbols::ImageSymbols::from_entries([
                    ("g_registry".to_string(), self.0 as u64),
                    ("Anchor".to_string(), 0x9000),
                ]))
            }
        }
        let source = Fixed(global_addr);
        let resolver = SymbolResolver::with_anchor(&lookup, &source, "Anchor").unwrap();

        let exact = FakeHeap::default().block(target.as_ptr() as usize, 24);
        assert!(validated_global(&resolver, &exact, "g_registry", 24).is_ok());

        let small = FakeHeap::default().block(target.as_ptr() as usize, 16);
        assert!(validated_global(&resolver, &small, "g_registry", 24).is_err());

        let oversized = FakeHeap::default().block(target.as_ptr() as usize, 64);
        assert!(validated_global(&resolver, &oversized, "g_registry", 24).is_err());

        let unmapped = FakeHeap::default();
        assert!(validated_global(&resolver, &unmapped, "g_registry", 24).is_err());
    }

    #[test]
    fn find_descriptor_takes_first_socket_match() {
        let object: [u32; 4] = [99, 7, 23, 23];
        let target = TargetObject {
            base: object.as_ptr() as usize,
            len: std::mem::size_of_val(&object),
        };

        let descriptors = FakeDescriptors { sockets: vec![23] };
        let channel = find_descriptor(target, &descriptors).unwrap();
        assert_eq!(channel.fd, 23);
        assert_eq!(channel.slot_addr, object.as_ptr() as usize + 8);
    }

    #[test]
    fn find_descriptor_fails_with_no_socket_in_object() {
        let object: [u32; 2] = [99, 7];
        let target = TargetObject {
            base: object.as_ptr() as usize,
            len: std::mem::size_of_val(&object),
        };

        let descriptors = FakeDescriptors::default();
        assert!(find_descriptor(target, &descriptors).is_err());
    }
}
