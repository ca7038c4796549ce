use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error};

use crate::mem::{DefaultMemoryController, MemoryProtection, within_distance};

use super::MemoryController;
use super::{MemoryError, Result};

/// One executable allocation that stubs are appended to.
#[derive(Debug)]
struct Chunk {
    start: usize,
    size: usize,
    written: usize,
}

impl Chunk {
    fn remaining(&self) -> usize {
        self.size - self.written
    }

    fn write_address(&self) -> usize {
        self.start + self.written
    }
}

#[derive(Debug, Default)]
pub struct HeapState {
    chunks: Vec<Chunk>,
}

impl HeapState {
    pub const fn empty() -> Self {
        Self { chunks: Vec::new() }
    }

    fn find_near(&self, target: usize, size: usize, max_distance: usize) -> Option<usize> {
        self.chunks.iter().position(|chunk| {
            chunk.remaining() >= size
                && within_distance(target, chunk.write_address(), size, max_distance)
        })
    }
}

/// Append-only executable memory for trampolines.
///
/// Stubs are never freed: a thread may still be running inside one long after
/// its interception was removed.
pub struct HookHeap<C: MemoryController> {
    pub mem: C,
    state: Mutex<HeapState>,
}

impl HookHeap<DefaultMemoryController> {
    pub const fn new() -> Self {
        Self::with_memory_controller(DefaultMemoryController::new())
    }
}

impl Default for HookHeap<DefaultMemoryController> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: MemoryController> HookHeap<C> {
    pub const fn with_memory_controller(controller: C) -> Self {
        Self {
            mem: controller,
            state: Mutex::new(HeapState::empty()),
        }
    }

    fn state<'a>(&'a self) -> Result<MutexGuard<'a, HeapState>> {
        self.state.lock().map_err(|_| MemoryError::BadTableState)
    }

    pub fn get_handle<'a>(&'a self) -> Result<MemoryHeapHandle<'a, C>> {
        Ok(MemoryHeapHandle {
            state: self.state()?,
            mem: &self.mem,
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.state().map(|state| state.chunks.len()).unwrap_or(0)
    }
}

pub struct MemoryHeapHandle<'a, C: MemoryController> {
    state: MutexGuard<'a, HeapState>,
    mem: &'a C,
}

impl<'a, C: MemoryController> MemoryHeapHandle<'a, C> {
    /// Opens a write over a chunk with at least `size` free bytes, all within
    /// `max_distance` of `target`. A new chunk is allocated when none fits.
    pub unsafe fn begin_write_near(
        &mut self,
        target: usize,
        size: usize,
        max_distance: usize,
    ) -> Result<MemoryWriteHandle<'a, '_, C>> {
        let index = match self.state.find_near(target, size, max_distance) {
            Some(index) => index,
            None => {
                let chunk_size = size.max(self.mem.page_size());
                let allocation = unsafe { self.mem.allocate_near(target, chunk_size, max_distance)? };
                debug!(
                    target = format_args!("{:#x}", target),
                    chunk = format_args!("{:#x}", allocation.start),
                    size = allocation.size,
                    "allocated trampoline chunk"
                );
                self.state.chunks.push(Chunk {
                    start: allocation.start,
                    size: allocation.size,
                    written: 0,
                });
                self.state.chunks.len() - 1
            }
        };

        MemoryWriteHandle::new_from(self, index)
    }

    unsafe fn set_chunk_protection(&self, index: usize, protection: MemoryProtection) -> Result<()> {
        let chunk = &self.state.chunks[index];
        unsafe { self.mem.set_page_protection(chunk.start, chunk.size, protection) }
    }
}

/// Write access to one chunk. The chunk stays executable throughout because
/// other threads may be running earlier stubs from it; it drops back to
/// read-execute when the handle goes away.
pub struct MemoryWriteHandle<'a, 'b, C: MemoryController> {
    heap: &'b mut MemoryHeapHandle<'a, C>,
    index: usize,
}

impl<'a, 'b, C: MemoryController> MemoryWriteHandle<'a, 'b, C> {
    fn new_from(heap: &'b mut MemoryHeapHandle<'a, C>, index: usize) -> Result<Self> {
        unsafe {
            heap.set_chunk_protection(index, MemoryProtection::ReadWriteExecute)?;
        }

        Ok(Self { heap, index })
    }

    fn chunk(&self) -> &Chunk {
        &self.heap.state.chunks[self.index]
    }

    pub fn write_address(&self) -> usize {
        self.chunk().write_address()
    }

    pub fn remaining(&self) -> usize {
        self.chunk().remaining()
    }

    /// Appends `buffer` and returns the address it was written to.
    pub unsafe fn write_bytes(&mut self, buffer: &[u8]) -> Result<usize> {
        let chunk = &mut self.heap.state.chunks[self.index];
        if buffer.len() > chunk.remaining() {
            return Err(MemoryError::NoMemory {
                needs: chunk.written + buffer.len(),
                has: chunk.size,
            });
        }

        let write_address = chunk.write_address();
        unsafe {
            std::ptr::copy_nonoverlapping(
                buffer.as_ptr(),
                write_address as *mut u8,
                buffer.len(),
            );
        }
        chunk.written += buffer.len();

        unsafe {
            self.heap
                .mem
                .flush_instruction_cache(write_address, buffer.len());
        }

        Ok(write_address)
    }
}

impl<'a, 'b, C: MemoryController> Drop for MemoryWriteHandle<'a, 'b, C> {
    fn drop(&mut self) {
        let result = unsafe {
            self.heap
                .set_chunk_protection(self.index, MemoryProtection::ReadExecute)
        };
        if let Err(err) = result {
            error!("Failed to make trampoline chunk executable: {}", err);
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    const MAX_DISTANCE: usize = 0x4000_0000;

    #[test]
    fn test_writes_share_chunk_near_target() {
        let heap = HookHeap::new();
        let target = test_writes_share_chunk_near_target as usize;

        let first = {
            let mut handle = heap.get_handle().unwrap();
            let mut writer = unsafe { handle.begin_write_near(target, 64, MAX_DISTANCE).unwrap() };
            let expected = writer.write_address();
            let written = unsafe { writer.write_bytes(&[0xC3; 16]).unwrap() };
            assert_eq!(written, expected);
            written
        };

        let second = {
            let mut handle = heap.get_handle().unwrap();
            let mut writer = unsafe { handle.begin_write_near(target, 64, MAX_DISTANCE).unwrap() };
            unsafe { writer.write_bytes(&[0xCC; 8]).unwrap() }
        };

        assert_eq!(second, first + 16);
        assert_eq!(heap.chunk_count(), 1);
        assert!(within_distance(target, first, 24, MAX_DISTANCE));

        let bytes = unsafe { std::slice::from_raw_parts(first as *const u8, 24) };
        assert_eq!(&bytes[..16], &[0xC3; 16]);
        assert_eq!(&bytes[16..], &[0xCC; 8]);
    }

    #[test]
    fn test_write_larger_than_chunk_fails() {
        let heap = HookHeap::new();
        let target = test_write_larger_than_chunk_fails as usize;
        let page_size = heap.mem.page_size();

        let mut handle = heap.get_handle().unwrap();
        let mut writer = unsafe { handle.begin_write_near(target, 16, MAX_DISTANCE).unwrap() };
        let oversized = vec![0x90; page_size + 1];
        let err = unsafe { writer.write_bytes(&oversized).unwrap_err() };
        assert!(matches!(err, MemoryError::NoMemory { .. }));
    }
}
