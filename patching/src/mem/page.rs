use tracing::error;

use super::Result;
use crate::mem::{MemoryController, MemoryProtection, ProtectedRegion};

/// Switches a range to a temporary protection and puts every page back to
/// the protection it had before, either through [`restore`] or on drop.
///
/// [`restore`]: MemoryProtectionGuard::restore
pub struct MemoryProtectionGuard<'a, M: MemoryController> {
    mem: &'a M,
    original: Vec<ProtectedRegion>,
    restored: bool,
}

impl<'a, M: MemoryController> MemoryProtectionGuard<'a, M> {
    pub fn guard(
        mem: &'a M,
        address: usize,
        size: usize,
        on_enter: MemoryProtection,
    ) -> Result<Self> {
        let original = unsafe { mem.query_protection(address, size)? };

        let (start, end) = match (original.first(), original.last()) {
            (Some(first), Some(last)) => (first.start, last.end()),
            _ => return Err(super::MemoryError::Unmapped(address)),
        };

        unsafe {
            mem.set_page_protection(start, end - start, on_enter)?;
        }

        Ok(Self {
            mem,
            original,
            restored: false,
        })
    }

    pub fn original_protection(&self) -> &[ProtectedRegion] {
        &self.original
    }

    pub fn restore(mut self) -> Result<()> {
        self.restore_original()
    }

    fn restore_original(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;

        for region in &self.original {
            unsafe {
                self.mem
                    .set_page_protection(region.start, region.size, region.protection)?;
            }
        }
        Ok(())
    }
}

impl<'a, M: MemoryController> Drop for MemoryProtectionGuard<'a, M> {
    fn drop(&mut self) {
        if let Err(err) = self.restore_original() {
            error!("Failed to restore memory protection: {}", err);
        }
    }
}
