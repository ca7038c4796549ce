use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::{PatchError, Result};
use crate::mem::{DefaultMemoryController, MemoryController, ModuleInfo};

/// A contiguous, mapped and readable module image.
///
/// Every read the engine performs through the image is checked against
/// `[base, base + size)` first. The lifetime ties images built from a borrowed
/// buffer to that buffer; the host module lives for `'static`.
#[derive(Clone)]
pub struct ModuleImage<'a> {
    base: usize,
    size: usize,
    name: String,
    path: Option<PathBuf>,
    timestamp: Option<u64>,
    _bytes: PhantomData<&'a [u8]>,
}

impl ModuleImage<'static> {
    /// The executable module of the current process.
    pub fn current() -> Result<Self> {
        let info = DefaultMemoryController::new().current_module()?;
        Ok(Self::from_module_info(info))
    }

    // `info` must describe a mapping that stays readable for the process lifetime.
    pub(crate) fn from_module_info(info: ModuleInfo) -> Self {
        Self {
            base: info.base,
            size: info.size,
            name: info.name,
            path: Some(info.path),
            timestamp: info.timestamp,
            _bytes: PhantomData,
        }
    }
}

impl<'a> ModuleImage<'a> {
    /// Treats a borrowed buffer as a module image, based at the buffer's address.
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self::from_named_slice("<buffer>", bytes)
    }

    pub fn from_named_slice(name: &str, bytes: &'a [u8]) -> Self {
        Self {
            base: bytes.as_ptr() as usize,
            size: bytes.len(),
            name: name.to_string(),
            path: None,
            timestamp: None,
            _bytes: PhantomData,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Link/modification timestamp of the module file, for diagnosing
    /// version mismatches. Never used for control flow.
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }

    /// Offset of `address` from the module base, if it lies inside the image.
    pub fn offset_of(&self, address: usize) -> Option<usize> {
        self.contains(address).then(|| address - self.base)
    }

    pub fn checked_range(&self, address: usize, len: usize) -> Result<()> {
        let in_bounds = address >= self.base
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.end());
        if in_bounds {
            Ok(())
        } else {
            Err(PatchError::OutOfBounds { address, len })
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        // `from_slice` borrows a live buffer and `current` only describes
        // readable mappings of the loaded executable.
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) }
    }

    /// Bounds-checked view of `len` bytes at absolute `address`.
    pub fn bytes_at(&self, address: usize, len: usize) -> Result<&'a [u8]> {
        self.checked_range(address, len)?;
        let start = address - self.base;
        Ok(&self.as_bytes()[start..start + len])
    }

    /// `name+offset` rendering used in diagnostics.
    pub fn describe(&self, address: usize) -> String {
        match self.offset_of(address) {
            Some(offset) => format!("{}+{:x}", self.name, offset),
            None => format!("{:#x}", address),
        }
    }
}

impl fmt::Debug for ModuleImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleImage")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
