//! Instruction-pointer-relative address decoding.
//!
//! x86_64 encodes most code and data references as a signed 32-bit
//! displacement from the first byte after the displacement field, e.g.
//! `E8 <rel32>` or `48 8B 05 <rel32>`.

use tracing::{debug, info};

use crate::error::Result;
use crate::module::ModuleImage;

/// Width of the displacement field.
pub const DISPLACEMENT_SIZE: usize = 4;

/// A displacement field inside a module image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeReference {
    /// Address of the first displacement byte.
    pub field: usize,
    pub displacement: i32,
}

impl RelativeReference {
    /// Address the displacement is relative to.
    pub fn next_instruction(&self) -> usize {
        self.field + DISPLACEMENT_SIZE
    }

    pub fn target(&self) -> usize {
        relative_target(self.field, self.displacement)
    }
}

/// `field + 4 + displacement`, wrapping like the CPU does.
pub fn relative_target(field: usize, displacement: i32) -> usize {
    field
        .wrapping_add(DISPLACEMENT_SIZE)
        .wrapping_add_signed(displacement as isize)
}

/// The displacement that makes a field at `field` point at `target`, or `None`
/// if `target` is out of rel32 range.
pub fn encode_relative(field: usize, target: usize) -> Option<i32> {
    let next = field.checked_add(DISPLACEMENT_SIZE)?;
    let delta = (target as i128) - (next as i128);
    i32::try_from(delta).ok()
}

/// Reads the displacement at `site + displacement_offset`.
///
/// Only the four displacement bytes are checked against the image; the
/// resulting target may legitimately lie in another mapping.
pub fn read_relative(
    image: &ModuleImage<'_>,
    site: usize,
    displacement_offset: usize,
) -> Result<RelativeReference> {
    let field = site.wrapping_add(displacement_offset);
    let bytes = image.bytes_at(field, DISPLACEMENT_SIZE)?;
    let displacement = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok(RelativeReference {
        field,
        displacement,
    })
}

/// Absolute address referenced by the rel32 at `site + displacement_offset`.
pub fn resolve_relative(
    image: &ModuleImage<'_>,
    site: usize,
    displacement_offset: usize,
) -> Result<usize> {
    let reference = read_relative(image, site, displacement_offset)?;
    let target = reference.target();
    debug!(
        field = %image.describe(reference.field),
        displacement = reference.displacement,
        target = format_args!("{:#x}", target),
        "resolved relative reference"
    );
    Ok(target)
}

impl ModuleImage<'_> {
    /// [`resolve_relative`] with a named diagnostic line.
    pub fn resolve(&self, name: &str, site: usize, displacement_offset: usize) -> Result<usize> {
        match resolve_relative(self, site, displacement_offset) {
            Ok(target) => {
                info!("{}: Resolved address is {}", name, self.describe(target));
                Ok(target)
            }
            Err(err) => {
                tracing::error!("{}: Failed to resolve relative address: {}", name, err);
                Err(err)
            }
        }
    }
}
