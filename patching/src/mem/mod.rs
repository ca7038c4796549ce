#[cfg(target_os = "windows")]
pub mod inner {
    pub mod windows;
    pub use windows::*;

    pub use windows::WindowsMemoryController as MemoryController;
}

#[cfg(target_os = "linux")]
pub mod inner {
    pub mod linux;
    pub use linux::*;

    pub use linux::LinuxMemoryController as MemoryController;
}

pub mod error;
pub mod page;
pub mod table;

use std::path::PathBuf;

pub use error::{MemoryError, Result};
pub use page::MemoryProtectionGuard;
pub use table::{HookHeap, MemoryHeapHandle, MemoryWriteHandle};

pub type DefaultMemoryController = inner::MemoryController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryProtection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
    /// Native flags with no portable equivalent, kept verbatim so they can be
    /// restored exactly.
    Other(u32),
}

/// A page-aligned run of memory sharing one protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedRegion {
    pub start: usize,
    pub size: usize,
    pub protection: MemoryProtection,
}

impl ProtectedRegion {
    pub fn end(&self) -> usize {
        self.start + self.size
    }
}

/// A fresh allocation from [`MemoryController::allocate_near`].
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub start: usize,
    pub size: usize,
}

/// Loader metadata of the process's executable module.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub base: usize,
    pub size: usize,
    pub name: String,
    pub path: PathBuf,
    pub timestamp: Option<u64>,
}

pub trait MemoryController {
    fn page_size(&self) -> usize;

    /// Protections of every page touched by `[address, address + size)`.
    ///
    /// The returned regions are contiguous, page aligned and cover the whole
    /// range; any unmapped page is an error.
    unsafe fn query_protection(&self, address: usize, size: usize) -> Result<Vec<ProtectedRegion>>;

    unsafe fn set_page_protection(
        &self,
        address: usize,
        size: usize,
        protection: MemoryProtection,
    ) -> Result<()>;

    /// Allocates read-write memory whose every byte lies within
    /// `max_distance` of `target`.
    unsafe fn allocate_near(
        &self,
        target: usize,
        size: usize,
        max_distance: usize,
    ) -> Result<Allocation>;

    unsafe fn flush_instruction_cache(&self, address: usize, size: usize);

    fn current_module(&self) -> Result<ModuleInfo>;

    fn protection_guard<'a>(
        &'a self,
        address: usize,
        size: usize,
        on_enter: MemoryProtection,
    ) -> Result<MemoryProtectionGuard<'a, Self>>
    where
        Self: Sized,
    {
        MemoryProtectionGuard::guard(self, address, size, on_enter)
    }
}

pub(crate) fn align_down(page_size: usize, address: usize) -> usize {
    address & !(page_size - 1)
}

pub(crate) fn align_up(page_size: usize, address: usize) -> usize {
    (address + page_size - 1) & !(page_size - 1)
}

/// Whether `[start, start + size)` lies entirely within `max_distance` of `target`.
pub(crate) fn within_distance(target: usize, start: usize, size: usize, max_distance: usize) -> bool {
    let end = start + size;
    let lo = start.min(target);
    let hi = end.max(target);
    hi - lo <= max_distance
}
