//! Wildcard byte signatures.
//!
//! A signature is written by hand as whitespace separated hex tokens, where
//! `??` (or `?`) matches any byte:
//!
//! ```
//! use patching::ByteSignature;
//!
//! let sig: ByteSignature = "80 ?? ?? ?? ?? ?? 00 74 ??".parse().unwrap();
//! assert_eq!(sig.len(), 9);
//! assert!(sig.matches(&[0x80, 1, 2, 3, 4, 5, 0x00, 0x74, 0xAA]));
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{PatchError, Result};

/// An immutable, partially wildcarded byte pattern with at least one fixed byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ByteSignature {
    nodes: Box<[Option<u8>]>,
    anchor: usize,
}

impl ByteSignature {
    pub fn new(nodes: &[Option<u8>]) -> Result<Self> {
        if nodes.is_empty() {
            return Err(PatchError::InvalidSignature(
                "Signature pattern is empty".to_string(),
            ));
        }

        // An all-wildcard pattern matches at every offset.
        let anchor = nodes.iter().position(Option::is_some).ok_or_else(|| {
            PatchError::InvalidSignature("Signature has no fixed bytes".to_string())
        })?;

        Ok(Self {
            nodes: nodes.into(),
            anchor,
        })
    }

    /// Parses the textual form, e.g. `"F3 0F ?? ?? ?? ?? ?? ?? F3 0F"`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut nodes = Vec::new();
        for token in pattern.split_whitespace() {
            if token == "??" || token == "?" {
                nodes.push(None);
                continue;
            }

            if token.len() != 2 {
                return Err(PatchError::InvalidSignature(format!(
                    "Invalid signature token '{}': expected two hex digits",
                    token
                )));
            }

            let value = u8::from_str_radix(token, 16).map_err(|e| {
                PatchError::InvalidSignature(format!("Invalid signature token '{}': {}", token, e))
            })?;
            nodes.push(Some(value));
        }

        Self::new(&nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Option<u8>] {
        &self.nodes
    }

    /// Position and value of the first fixed byte.
    pub fn anchor(&self) -> (usize, u8) {
        // `new` guarantees the anchor node is fixed.
        (self.anchor, self.nodes[self.anchor].unwrap_or_default())
    }

    /// Positional comparison of `window` against this signature.
    ///
    /// Only the first `len()` bytes of `window` are inspected; shorter windows
    /// never match.
    #[inline]
    pub fn matches(&self, window: &[u8]) -> bool {
        if window.len() < self.nodes.len() {
            return false;
        }

        self.nodes
            .iter()
            .zip(window)
            .all(|(node, byte)| node.is_none_or(|expected| expected == *byte))
    }
}

impl FromStr for ByteSignature {
    type Err = PatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&[Option<u8>]> for ByteSignature {
    type Error = PatchError;

    fn try_from(nodes: &[Option<u8>]) -> Result<Self> {
        Self::new(nodes)
    }
}

impl fmt::Display for ByteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match node {
                Some(value) => write!(f, "{:02X}", value)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}
