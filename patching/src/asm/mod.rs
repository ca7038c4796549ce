pub mod inner {
    pub mod x86_64;
    pub use x86_64::*;

    pub use x86_64::HookAssemblerx86_64 as HookAssemblerImpl;
}

pub mod error;
pub use error::{AssemblyError, Result};
pub use inner::{DisplacedInstructions, MAX_INSTRUCTION_SIZE};

pub type DefaultHookAssembler = inner::HookAssemblerImpl;

/// Addresses baked into an interception stub.
#[derive(Debug, Clone, Copy)]
pub struct StubFrame {
    /// `extern "C" fn(*mut RegisterContext, *const SiteRecord)`.
    pub dispatch: usize,
    /// Passed through to `dispatch` as its second argument.
    pub site: usize,
}

pub trait HookAssembler {
    /// Decodes whole instructions from `code`, the bytes found at `address`,
    /// until at least `min_size` bytes are covered. Running out of `code`
    /// first is an error.
    fn decode_displaced(
        &self,
        address: usize,
        code: &[u8],
        min_size: usize,
    ) -> Result<DisplacedInstructions>;

    /// Builds the stub placed at `ip`: save registers, call `frame.dispatch`,
    /// restore registers, run the relocated `displaced` instructions and jump
    /// back to the first byte after them.
    fn assemble_stub(
        &self,
        ip: usize,
        frame: &StubFrame,
        displaced: &DisplacedInstructions,
    ) -> Result<Vec<u8>>;

    /// A `jmp rel32` from `ip` to `destination`, padded with `nop` up to `len`.
    fn assemble_patch(&self, ip: usize, destination: usize, len: usize) -> Result<Vec<u8>>;
}
