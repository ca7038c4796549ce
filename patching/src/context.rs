//! The register snapshot handed to interception callbacks.

use std::fmt;
use std::mem::size_of;

use crate::asm::inner::RED_ZONE;

/// One 128-bit SSE register.
///
/// Stored as raw bytes so that a context placed at any 8-byte aligned stack
/// address is valid.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Xmm {
    pub bytes: [u8; 16],
}

macro_rules! lane_accessors {
    ($($get:ident, $set:ident: $ty:ty;)*) => {
        $(
            pub fn $get(&self, lane: usize) -> $ty {
                const WIDTH: usize = size_of::<$ty>();
                let start = lane * WIDTH;
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(&self.bytes[start..start + WIDTH]);
                <$ty>::from_le_bytes(raw)
            }

            pub fn $set(&mut self, lane: usize, value: $ty) {
                const WIDTH: usize = size_of::<$ty>();
                let start = lane * WIDTH;
                self.bytes[start..start + WIDTH].copy_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

impl Xmm {
    lane_accessors! {
        f32, set_f32: f32;
        f64, set_f64: f64;
        u32, set_u32: u32;
        u64, set_u64: u64;
    }
}

impl fmt::Debug for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xmm({:#034x})", u128::from_le_bytes(self.bytes))
    }
}

/// Registers as they were at the interception site, in the order the stub
/// leaves them on the stack. Writes are applied when the callback returns.
///
/// `rsp` and `rip` are not part of the snapshot; see
/// [`stack_pointer`](RegisterContext::stack_pointer).
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct RegisterContext {
    pub xmm0: Xmm,
    pub xmm1: Xmm,
    pub xmm2: Xmm,
    pub xmm3: Xmm,
    pub xmm4: Xmm,
    pub xmm5: Xmm,
    pub xmm6: Xmm,
    pub xmm7: Xmm,
    pub xmm8: Xmm,
    pub xmm9: Xmm,
    pub xmm10: Xmm,
    pub xmm11: Xmm,
    pub xmm12: Xmm,
    pub xmm13: Xmm,
    pub xmm14: Xmm,
    pub xmm15: Xmm,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub rflags: u64,
}

impl RegisterContext {
    /// The value rsp had at the interception site.
    ///
    /// Only meaningful for a context that lives in an interception stub's
    /// frame, which is the only kind callbacks receive.
    pub fn stack_pointer(&self) -> usize {
        self as *const Self as usize + size_of::<Self>() + RED_ZONE
    }

    pub fn xmm(&self, index: usize) -> &Xmm {
        &self.xmm_registers()[index]
    }

    pub fn xmm_mut(&mut self, index: usize) -> &mut Xmm {
        &mut self.xmm_registers_mut()[index]
    }

    fn xmm_registers(&self) -> &[Xmm; 16] {
        // xmm0..xmm15 are the first 16 fields, packed, with alignment 1
        unsafe { &*(self as *const Self as *const [Xmm; 16]) }
    }

    fn xmm_registers_mut(&mut self) -> &mut [Xmm; 16] {
        unsafe { &mut *(self as *mut Self as *mut [Xmm; 16]) }
    }
}
