use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Signature not found: {0}")]
    SignatureNotFound(String),

    #[error("Range {address:#x} (len {len:#x}) lies outside module image")]
    OutOfBounds { address: usize, len: usize },

    #[error("Failed to change memory protection at {address:#x}")]
    ProtectionChangeFailed {
        address: usize,
        #[source]
        source: crate::mem::MemoryError,
    },

    #[error("Failed to install interception at {address:#x}")]
    InterceptionInstallFailed {
        address: usize,
        #[source]
        source: InstallError,
    },

    #[error("Patch routine {0:?} panicked")]
    RoutinePanicked(String),

    #[error("Memory error")]
    MemoryError(#[from] crate::mem::MemoryError),

    #[error("Assembly error")]
    AssemblyError(#[from] crate::asm::AssemblyError),
}

/// Reason an interception could not be placed.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Provided interception address was null")]
    NullAddress,

    #[error("Address overlaps the live interception at {0:#x}")]
    AlreadyInstalled(usize),

    #[error("Assembly error")]
    Assembly(#[from] crate::asm::AssemblyError),

    #[error("Memory error")]
    Memory(#[from] crate::mem::MemoryError),

    #[error("Failed to write redirection")]
    Write(#[source] Box<PatchError>),
}

impl PatchError {
    /// A missing signature is an expected outcome (wrong build of the host
    /// binary), not a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PatchError::SignatureNotFound(_))
    }
}
