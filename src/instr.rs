//! Instruction model.
//!
//! [`Instr`] wraps one decoded x86-64 instruction and exposes just what the
//! explorer and the clamp matcher look at: address, length, mnemonic, operand
//! kinds/registers, a coarse flow class and the literal branch target.
//! Decoding goes through [`InstrStream`], which walks an [`ImageView`]
//! sequentially and reports invalid or truncated encodings as [`DecodeError`].

use crate::memory::ImageView;

use iced_x86::{
    Decoder, DecoderError, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register,
};
use thiserror::Error;

/// Coarse control-flow class of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Falls through to the next instruction.
    Sequential,
    /// `jcc`, `loop`, `jrcxz`, `xbegin`.
    ConditionalBranch,
    /// `jmp`, direct or indirect.
    UnconditionalBranch,
    /// `call`, direct or indirect.
    Call,
    /// `ret`, `iret`.
    Return,
    /// `int`, `syscall`, `ud2` and friends.
    Interrupt,
}

impl From<FlowControl> for Flow {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::Next => Flow::Sequential,
            FlowControl::ConditionalBranch | FlowControl::XbeginXabortXend => {
                Flow::ConditionalBranch
            }
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch => {
                Flow::UnconditionalBranch
            }
            FlowControl::Call | FlowControl::IndirectCall => Flow::Call,
            FlowControl::Return => Flow::Return,
            // interrupt, exception, and anything newer than this match
            _ => Flow::Interrupt,
        }
    }
}

/// One operand, reduced to what pattern matching needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Memory,
    Immediate,
    NearBranch(u64),
    Other,
}

/// Why decoding stopped.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("address 0x{0:X} is outside the readable window")]
    OutOfRange(u64),

    #[error("instruction at 0x{0:X} runs past the end of the readable window")]
    Truncated(u64),

    #[error("invalid instruction at 0x{0:X}")]
    Invalid(u64),
}

/// A decoded instruction. Immutable once decoded.
#[derive(Clone, Copy, Debug)]
pub struct Instr {
    inner: Instruction,
}

impl Instr {
    pub fn new(inner: Instruction) -> Self {
        Self { inner }
    }

    /// The underlying iced instruction.
    #[inline]
    pub fn inner(&self) -> &Instruction {
        &self.inner
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.inner.ip()
    }

    /// Address of the byte following this instruction.
    #[inline]
    pub fn next_address(&self) -> u64 {
        self.inner.next_ip()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn mnemonic(&self) -> Mnemonic {
        self.inner.mnemonic()
    }

    #[inline]
    pub fn flow(&self) -> Flow {
        self.inner.flow_control().into()
    }

    /// True if control always continues with the next instruction.
    #[inline]
    pub fn is_sequential(&self) -> bool {
        self.flow() == Flow::Sequential
    }

    pub fn operand(&self, index: u32) -> Operand {
        if index >= self.inner.op_count() {
            return Operand::Other;
        }
        match self.inner.op_kind(index) {
            OpKind::Register => Operand::Register(self.inner.op_register(index)),
            OpKind::Memory => Operand::Memory,
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Operand::NearBranch(self.inner.near_branch_target())
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Operand::Immediate,
            _ => Operand::Other,
        }
    }

    /// Register of operand `index`, or `Register::None` if it is not a register operand.
    #[inline]
    pub fn op_register(&self, index: u32) -> Register {
        match self.operand(index) {
            Operand::Register(reg) => reg,
            _ => Register::None,
        }
    }

    /// True if both leading operands are registers.
    pub fn is_reg_reg(&self) -> bool {
        matches!(
            (self.operand(0), self.operand(1)),
            (Operand::Register(_), Operand::Register(_))
        )
    }

    /// Literal target of a near branch or call. Indirect and far transfers have none.
    pub fn branch_target(&self) -> Option<u64> {
        match self.operand(0) {
            Operand::NearBranch(target) => Some(target),
            _ => None,
        }
    }

    /// True if operand 0 is a 64-bit near branch (`rel8`/`rel32` in long mode).
    #[inline]
    pub fn is_near_branch64(&self) -> bool {
        self.inner.op0_kind() == OpKind::NearBranch64
    }

    /// Absolute address referenced by a RIP-relative memory operand.
    pub fn ip_rel_target(&self) -> Option<u64> {
        self.inner
            .is_ip_rel_memory_operand()
            .then(|| self.inner.ip_rel_memory_address())
    }
}

/// Sequential decoder over an [`ImageView`].
pub struct InstrStream<'a> {
    decoder: Decoder<'a>,
}

impl<'a> InstrStream<'a> {
    /// Start decoding at `va`.
    pub fn at(image: &ImageView<'a>, va: u64) -> Result<Self, DecodeError> {
        let bytes = image.tail(va).ok_or(DecodeError::OutOfRange(va))?;
        Ok(Self {
            decoder: Decoder::with_ip(64, bytes, va, DecoderOptions::NONE),
        })
    }

    /// Decode the next instruction.
    pub fn next_instr(&mut self) -> Result<Instr, DecodeError> {
        let ip = self.decoder.ip();
        if !self.decoder.can_decode() {
            return Err(DecodeError::Truncated(ip));
        }

        let instr = self.decoder.decode();
        if instr.is_invalid() {
            return Err(match self.decoder.last_error() {
                DecoderError::NoMoreBytes => DecodeError::Truncated(ip),
                _ => DecodeError::Invalid(ip),
            });
        }

        Ok(Instr::new(instr))
    }
}
