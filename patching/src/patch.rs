//! Raw edits of the host process's memory.
//!
//! Writes go through a protection guard: every page touched is switched to
//! read-write-execute for the copy and put back to exactly the protection it
//! had before.

use std::mem::size_of;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, error, trace};

use crate::error::{PatchError, Result};
use crate::mem::{DefaultMemoryController, MemoryController, MemoryError, MemoryProtection};

/// Encoding of a one byte `nop`.
pub const NOP: u8 = 0x90;

static MEMORY: DefaultMemoryController = DefaultMemoryController::new();

// Two writers sharing a page would otherwise restore each other's protection.
static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Overwrites `bytes.len()` bytes at `address`.
///
/// # Safety
/// Nothing may be executing or reading the range while it is rewritten in a
/// way that would observe a torn state.
pub unsafe fn write_bytes(address: usize, bytes: &[u8]) -> Result<()> {
    unsafe { write_bytes_with(&MEMORY, address, bytes) }
}

/// [`write_bytes`] against an explicit memory controller.
///
/// # Safety
/// See [`write_bytes`].
pub unsafe fn write_bytes_with<M: MemoryController>(
    mem: &M,
    address: usize,
    bytes: &[u8],
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    let _lock = WRITE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let protection_failed = |source: MemoryError| {
        error!(
            address = format_args!("{:#x}", address),
            len = bytes.len(),
            "failed to write bytes: {}", source
        );
        PatchError::ProtectionChangeFailed { address, source }
    };

    let guard = mem
        .protection_guard(address, bytes.len(), MemoryProtection::ReadWriteExecute)
        .map_err(protection_failed)?;

    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }

    guard.restore().map_err(protection_failed)?;
    unsafe {
        mem.flush_instruction_cache(address, bytes.len());
    }

    debug!(
        address = format_args!("{:#x}", address),
        len = bytes.len(),
        "wrote bytes"
    );
    Ok(())
}

/// Writes the in-memory representation of `value` at `address`.
///
/// # Safety
/// See [`write_bytes`].
pub unsafe fn write_value<T: Copy>(address: usize, value: T) -> Result<()> {
    let bytes =
        unsafe { std::slice::from_raw_parts(&value as *const T as *const u8, size_of::<T>()) };
    unsafe { write_bytes(address, bytes) }
}

/// Replaces `len` bytes at `address` with `nop`s.
///
/// # Safety
/// `[address, address + len)` must hold whole instructions.
pub unsafe fn nop(address: usize, len: usize) -> Result<()> {
    unsafe { write_bytes(address, &vec![NOP; len]) }
}

/// # Safety
/// `address` must be readable for `size_of::<T>()` bytes holding a valid `T`.
pub unsafe fn read_value<T: Copy>(address: usize) -> T {
    unsafe { std::ptr::read_unaligned(address as *const T) }
}

/// # Safety
/// `address` must be readable for `len` bytes.
pub unsafe fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(address as *const u8, len).to_vec() }
}

/// Plain unaligned store for memory that is already writable, such as game
/// objects reached from a callback's registers. No protection change.
///
/// # Safety
/// `address` must be writable for `size_of::<T>()` bytes.
pub unsafe fn store_value<T: Copy>(address: usize, value: T) {
    trace!(address = format_args!("{:#x}", address), "store");
    unsafe { std::ptr::write_unaligned(address as *mut T, value) }
}

/// A byte inside a foreign object used to remember that the object was
/// already processed.
///
/// Callbacks that scale or move an element once, no matter how often the host
/// reaches them for it, set the byte at `base + offset` to `value` the first
/// time and skip elements where it is already set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementMarker {
    pub offset: usize,
    pub value: u8,
}

impl ElementMarker {
    pub const fn new(offset: usize, value: u8) -> Self {
        Self { offset, value }
    }

    unsafe fn byte<'a>(&self, base: usize) -> &'a AtomicU8 {
        unsafe { AtomicU8::from_ptr((base + self.offset) as *mut u8) }
    }

    /// # Safety
    /// `base + offset` must be a live, writable byte of the element.
    pub unsafe fn is_marked(&self, base: usize) -> bool {
        unsafe { self.byte(base) }.load(Ordering::Acquire) == self.value
    }

    /// Marks the element and returns whether this call was the one that did
    /// it. Of any number of threads racing on one element exactly one sees
    /// `true`.
    ///
    /// # Safety
    /// See [`is_marked`](Self::is_marked).
    pub unsafe fn try_mark(&self, base: usize) -> bool {
        unsafe { self.byte(base) }.swap(self.value, Ordering::AcqRel) != self.value
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    struct Mapping {
        address: usize,
        size: usize,
    }

    impl Mapping {
        fn new(pages: usize, prot: i32) -> Self {
            let size = pages * MEMORY.page_size();
            let address = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            assert_ne!(address, libc::MAP_FAILED);
            assert_eq!(unsafe { libc::mprotect(address, size, prot) }, 0);
            Self {
                address: address as usize,
                size,
            }
        }

        fn fill(&self, bytes: &[u8]) {
            unsafe { write_bytes(self.address, bytes).unwrap() };
        }

        fn protection(&self) -> Vec<MemoryProtection> {
            unsafe { MEMORY.query_protection(self.address, self.size).unwrap() }
                .into_iter()
                .map(|region| region.protection)
                .collect()
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.address as *mut libc::c_void, self.size);
            }
        }
    }

    #[test]
    fn test_write_then_read_back() {
        let mapping = Mapping::new(1, libc::PROT_READ | libc::PROT_WRITE);
        mapping.fill(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);

        unsafe { write_bytes(mapping.address + 2, &[0xFF]).unwrap() };

        let bytes = unsafe { read_bytes(mapping.address, 5) };
        assert_eq!(bytes, [0xAA, 0xBB, 0xFF, 0xDD, 0xEE]);
        assert_eq!(mapping.protection(), [MemoryProtection::ReadWrite]);
    }

    #[test]
    fn test_read_only_page_keeps_protection() {
        let mapping = Mapping::new(1, libc::PROT_READ);
        unsafe { write_value(mapping.address + 8, 0x1234_5678u32).unwrap() };

        assert_eq!(unsafe { read_value::<u32>(mapping.address + 8) }, 0x1234_5678);
        assert_eq!(mapping.protection(), [MemoryProtection::ReadOnly]);
    }

    #[test]
    fn test_write_across_pages_restores_each() {
        let mapping = Mapping::new(2, libc::PROT_READ | libc::PROT_EXEC);
        let page = MEMORY.page_size();
        unsafe {
            libc::mprotect(
                (mapping.address + page) as *mut libc::c_void,
                page,
                libc::PROT_READ,
            );
        }

        let boundary = mapping.address + page - 2;
        unsafe { nop(boundary, 4).unwrap() };

        assert_eq!(unsafe { read_bytes(boundary, 4) }, [NOP; 4]);
        assert_eq!(
            mapping.protection(),
            [MemoryProtection::ReadExecute, MemoryProtection::ReadOnly]
        );
    }

    #[test]
    fn test_unmapped_write_fails() {
        // below mmap_min_addr, never mapped
        let address = MEMORY.page_size();
        let err = unsafe { write_bytes(address, &[0x90]).unwrap_err() };
        assert!(matches!(err, PatchError::ProtectionChangeFailed { .. }));
    }

    #[test]
    fn test_failed_write_is_logged() {
        use std::io;
        use std::sync::Arc;

        #[derive(Clone, Default)]
        struct Captured(Arc<Mutex<Vec<u8>>>);

        impl io::Write for Captured {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer({
                let captured = captured.clone();
                move || captured.clone()
            })
            .finish();

        let address = MEMORY.page_size();
        tracing::subscriber::with_default(subscriber, || {
            assert!(unsafe { write_bytes(address, &[0x90]) }.is_err());
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("ERROR"));
        assert!(output.contains("failed to write bytes"));
        assert!(output.contains(&format!("{:#x}", address)));
        assert!(!output.contains("wrote bytes"));
    }

    #[test]
    fn test_empty_write_is_noop() {
        unsafe { write_bytes(0, &[]).unwrap() };
    }

    #[test]
    fn test_store_value_unaligned() {
        let mut buffer = [0u8; 16];
        let base = buffer.as_mut_ptr() as usize;
        unsafe { store_value(base + 3, 1.5f32) };
        assert_eq!(unsafe { read_value::<f32>(base + 3) }, 1.5);
    }

    #[test]
    fn test_marker_claims_once() {
        let mut element = [0u8; 0x40];
        let base = element.as_mut_ptr() as usize;
        let marker = ElementMarker::new(0x2C, 0x01);

        unsafe {
            assert!(!marker.is_marked(base));
            assert!(marker.try_mark(base));
            assert!(marker.is_marked(base));
            assert!(!marker.try_mark(base));
        }
        assert_eq!(element[0x2C], 0x01);
    }

    #[test]
    fn test_marker_single_winner_across_threads() {
        let element = Box::leak(Box::new([0u8; 8]));
        let base = element.as_mut_ptr() as usize;
        let marker = ElementMarker::new(5, 0xFF);

        let winners: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || unsafe { marker.try_mark(base) as usize }))
                .collect();
            workers.into_iter().map(|worker| worker.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }
}
