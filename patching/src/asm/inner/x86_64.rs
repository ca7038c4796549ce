use iced_x86::{
    BlockEncoder, BlockEncoderOptions, BlockEncoderResult, Code, Decoder, DecoderError,
    DecoderOptions, Encoder, Instruction, InstructionBlock, MemoryOperand, Register,
};

use super::super::*;
use crate::resolve::encode_relative;

pub type InnerError = iced_x86::IcedError;

/// Longest legal x86 instruction.
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Bytes below rsp that leaf code may use without adjusting rsp (SysV only).
#[cfg(not(windows))]
pub const RED_ZONE: usize = 0x80;
#[cfg(windows)]
pub const RED_ZONE: usize = 0;

/// Home space the Windows ABI makes callers reserve for four register args.
#[cfg(not(windows))]
const SHADOW_SPACE: i32 = 0;
#[cfg(windows)]
const SHADOW_SPACE: i32 = 0x20;

#[cfg(not(windows))]
const ARG_REGISTERS: [Register; 2] = [Register::RDI, Register::RSI];
#[cfg(windows)]
const ARG_REGISTERS: [Register; 2] = [Register::RCX, Register::RDX];

/// Push order. `RegisterContext` lists them reversed.
pub const SAVED_GPRS: [Register; 15] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

pub const XMM_REGISTERS: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

const XMM_SIZE: usize = 16;
const XMM_AREA: i32 = (XMM_REGISTERS.len() * XMM_SIZE) as i32;

/// Whole instructions lifted from an interception site.
#[derive(Debug, Clone)]
pub struct DisplacedInstructions {
    pub address: usize,
    /// Total encoded length; at least the requested minimum.
    pub len: usize,
    pub original: Vec<u8>,
    pub instructions: Vec<Instruction>,
}

pub struct HookAssemblerx86_64;

impl HookAssemblerx86_64 {
    pub const fn new() -> Self {
        Self
    }

    fn bitness(&self) -> u32 {
        64
    }

    fn assemble_instruction_block(
        &self,
        ip: usize,
        instructions: &[Instruction],
    ) -> Result<BlockEncoderResult> {
        let block = InstructionBlock::new(instructions, ip as u64);
        let result = BlockEncoder::encode(self.bitness(), block, BlockEncoderOptions::NONE)?;
        Ok(result)
    }

    fn rsp_offset(displacement: i64) -> MemoryOperand {
        MemoryOperand::with_base_displ(Register::RSP, displacement)
    }

    fn save_state(&self, instructions: &mut Vec<Instruction>) -> Result<()> {
        if RED_ZONE != 0 {
            instructions.push(Instruction::with2(
                Code::Lea_r64_m,
                Register::RSP,
                Self::rsp_offset(-(RED_ZONE as i64)),
            )?);
        }
        instructions.push(Instruction::with(Code::Pushfq));
        instructions.push(Instruction::with(Code::Cld));
        for register in SAVED_GPRS {
            instructions.push(Instruction::with1(Code::Push_r64, register)?);
        }

        instructions.push(Instruction::with2(Code::Sub_rm64_imm32, Register::RSP, XMM_AREA)?);
        for (i, register) in XMM_REGISTERS.into_iter().enumerate() {
            instructions.push(Instruction::with2(
                Code::Movdqu_xmmm128_xmm,
                Self::rsp_offset((i * XMM_SIZE) as i64),
                register,
            )?);
        }
        Ok(())
    }

    fn restore_state(&self, instructions: &mut Vec<Instruction>) -> Result<()> {
        for (i, register) in XMM_REGISTERS.into_iter().enumerate() {
            instructions.push(Instruction::with2(
                Code::Movdqu_xmm_xmmm128,
                register,
                Self::rsp_offset((i * XMM_SIZE) as i64),
            )?);
        }
        instructions.push(Instruction::with2(Code::Add_rm64_imm32, Register::RSP, XMM_AREA)?);

        for register in SAVED_GPRS.into_iter().rev() {
            instructions.push(Instruction::with1(Code::Pop_r64, register)?);
        }
        instructions.push(Instruction::with(Code::Popfq));
        if RED_ZONE != 0 {
            instructions.push(Instruction::with2(
                Code::Lea_r64_m,
                Register::RSP,
                Self::rsp_offset(RED_ZONE as i64),
            )?);
        }
        Ok(())
    }

    fn call_dispatch(&self, instructions: &mut Vec<Instruction>, frame: &StubFrame) -> Result<()> {
        let [context_arg, site_arg] = ARG_REGISTERS;
        instructions.push(Instruction::with2(Code::Mov_r64_rm64, context_arg, Register::RSP)?);
        instructions.push(Instruction::with2(
            Code::Mov_r64_imm64,
            site_arg,
            frame.site as u64,
        )?);

        // rbx is callee saved, so it carries the frame pointer across the call
        instructions.push(Instruction::with2(Code::Mov_r64_rm64, Register::RBX, Register::RSP)?);
        instructions.push(Instruction::with2(Code::And_rm64_imm8, Register::RSP, -16)?);
        if SHADOW_SPACE != 0 {
            instructions.push(Instruction::with2(
                Code::Sub_rm64_imm8,
                Register::RSP,
                SHADOW_SPACE,
            )?);
        }
        instructions.push(Instruction::with2(
            Code::Mov_r64_imm64,
            Register::RAX,
            frame.dispatch as u64,
        )?);
        instructions.push(Instruction::with1(Code::Call_rm64, Register::RAX)?);
        instructions.push(Instruction::with2(Code::Mov_r64_rm64, Register::RSP, Register::RBX)?);
        Ok(())
    }
}

impl HookAssembler for HookAssemblerx86_64 {
    fn decode_displaced(
        &self,
        address: usize,
        code: &[u8],
        min_size: usize,
    ) -> Result<DisplacedInstructions> {
        let code = &code[..code.len().min(min_size + MAX_INSTRUCTION_SIZE)];

        let mut decoder =
            Decoder::with_ip(self.bitness(), code, address as u64, DecoderOptions::NONE);
        let mut instructions = Vec::new();
        let mut len = 0;

        while len < min_size {
            if !decoder.can_decode() {
                return Err(AssemblyError::RelocationError);
            }
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                return Err(match decoder.last_error() {
                    DecoderError::NoMoreBytes => AssemblyError::RelocationError,
                    _ => AssemblyError::InvalidInstruction(address + len),
                });
            }
            len += instruction.len();
            instructions.push(instruction);
        }

        Ok(DisplacedInstructions {
            address,
            len,
            original: code[..len].to_vec(),
            instructions,
        })
    }

    fn assemble_stub(
        &self,
        ip: usize,
        frame: &StubFrame,
        displaced: &DisplacedInstructions,
    ) -> Result<Vec<u8>> {
        let resume = displaced.address + displaced.len;
        let mut instructions = Vec::with_capacity(96 + displaced.instructions.len());

        self.save_state(&mut instructions)?;
        self.call_dispatch(&mut instructions, frame)?;
        self.restore_state(&mut instructions)?;

        instructions.extend_from_slice(&displaced.instructions);
        instructions.push(Instruction::with_branch(Code::Jmp_rel32_64, resume as u64)?);

        let assembled = self.assemble_instruction_block(ip, &instructions)?;
        Ok(assembled.code_buffer)
    }

    fn assemble_patch(&self, ip: usize, destination: usize, len: usize) -> Result<Vec<u8>> {
        if encode_relative(ip + 1, destination).is_none() {
            return Err(AssemblyError::OutOfRange {
                from: ip,
                target: destination,
            });
        }

        // Encoder keeps the rel32 form; the site length was sized for it.
        let jump = Instruction::with_branch(Code::Jmp_rel32_64, destination as u64)?;
        let mut encoder = Encoder::new(self.bitness());
        encoder.encode(&jump, ip as u64)?;

        let mut buffer = encoder.take_buffer();
        if buffer.len() > len {
            return Err(AssemblyError::RelocationError);
        }
        buffer.resize(len, 0x90);
        Ok(buffer)
    }
}
