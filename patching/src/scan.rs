//! Signature scanning over module images.
//!
//! The first (lowest address) match wins. Signatures are expected to be
//! unique; a signature that also matches earlier, unrelated code silently
//! selects the wrong site, and disambiguating it is the signature author's job.

use tracing::{debug, error, info};

use crate::error::{PatchError, Result};
use crate::module::ModuleImage;
use crate::signature::ByteSignature;

/// A signature match inside a module image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    pub address: usize,
    /// Distance from the module base.
    pub offset: usize,
}

pub type ScanResult = Option<ScanHit>;

impl ScanHit {
    /// A site `delta` bytes after this hit, e.g. the instruction an
    /// interception is placed on.
    pub fn displaced(self, delta: usize) -> Self {
        Self {
            address: self.address + delta,
            offset: self.offset + delta,
        }
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.address as *mut u8
    }
}

/// Finds the first offset in `haystack` where `signature` matches.
///
/// Candidates are located with `memchr` on the signature's first fixed byte,
/// so the full comparison only runs where that byte is present.
pub fn scan_bytes(haystack: &[u8], signature: &ByteSignature) -> Option<usize> {
    let len = signature.len();
    if haystack.len() < len {
        return None;
    }

    let (anchor_pos, anchor_byte) = signature.anchor();
    let last_start = haystack.len() - len;
    let candidates = &haystack[anchor_pos..=last_start + anchor_pos];

    memchr::memchr_iter(anchor_byte, candidates)
        .find(|&start| signature.matches(&haystack[start..start + len]))
}

impl ModuleImage<'_> {
    pub fn scan(&self, signature: &ByteSignature) -> ScanResult {
        let hit = scan_bytes(self.as_bytes(), signature).map(|offset| ScanHit {
            address: self.base() + offset,
            offset,
        });

        match hit {
            Some(hit) => debug!(
                module = %self.name(),
                offset = format_args!("{:#x}", hit.offset),
                signature = %signature,
                "signature matched"
            ),
            None => debug!(module = %self.name(), signature = %signature, "signature not found"),
        }

        hit
    }

    /// Scans for a named site and reports the outcome the way every patch
    /// routine does: `name: Address is module+offset`, or a scan failure.
    pub fn find(&self, name: &str, signature: &ByteSignature) -> Result<ScanHit> {
        match self.scan(signature) {
            Some(hit) => {
                info!("{}: Address is {}+{:x}", name, self.name(), hit.offset);
                Ok(hit)
            }
            None => {
                error!("{}: Pattern scan failed.", name);
                Err(PatchError::SignatureNotFound(name.to_string()))
            }
        }
    }

    /// Parses `pattern` and forwards to [`ModuleImage::find`].
    pub fn find_pattern(&self, name: &str, pattern: &str) -> Result<ScanHit> {
        let signature = ByteSignature::parse(pattern)?;
        self.find(name, &signature)
    }
}
