use thiserror::Error;

pub type Result<T> = std::result::Result<T, AssemblyError>;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Error during assembly/disassembly")]
    AssemblyError(#[from] super::inner::InnerError),

    #[error("Could not decode enough instructions while trying to relocate")]
    RelocationError,

    #[error("Invalid instruction at {0:#x}")]
    InvalidInstruction(usize),

    #[error("Jump from {from:#x} to {target:#x} does not fit in rel32")]
    OutOfRange { from: usize, target: usize },
}
