//! 32-bit instruction packing.
//!
//! Layout, bit positions counted from the least significant bit:
//!
//! ```text
//! non-branch:  [ 0..5 opcode ][ 5..18 arg0 ][ 18..32 arg1 ]
//! CALL:        [ 0..5 opcode ][ 5..32 signed delta ]
//! JMP:         [ 0..5 opcode ][ 5..8 cond ][ 8..32 signed delta ]
//! ```

use core::fmt;

use crate::{Arg, BranchCond, InvalidOpcode, Opcode, RegId};

/// A raw, undecoded instruction word.
pub type RawInstruction = u32;

/// Smallest pc-relative delta a `CALL` can encode.
pub const CALL_DELTA_MIN: i32 = -(1 << 26);
/// Largest pc-relative delta a `CALL` can encode.
pub const CALL_DELTA_MAX: i32 = (1 << 26) - 1;
/// Smallest pc-relative delta a `JMP` can encode.
pub const JMP_DELTA_MIN: i32 = -(1 << 23);
/// Largest pc-relative delta a `JMP` can encode.
pub const JMP_DELTA_MAX: i32 = (1 << 23) - 1;

const OP_BITS: u32 = 5;
const ARG0_BITS: u32 = 13;
const COND_BITS: u32 = 3;

/// A packed 32-bit VM instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction(u32);

impl Instruction {
    /// Size of an instruction in bytes.
    pub const LEN: usize = 4;

    /// Pack a two-argument instruction.
    ///
    /// # Panics
    ///
    /// Panics if `op` uses the branch layout, or if `a`'s encoding
    /// does not fit the 13-bit first argument field.
    pub fn new(op: Opcode, a: Arg, b: Arg) -> Self {
        assert!(!op.is_branch());
        let a = a.encode() as u32;
        let b = b.encode() as u32;
        assert!(a < (1 << ARG0_BITS), "first argument does not fit");
        Instruction((op as u32) | (a << OP_BITS) | (b << (OP_BITS + ARG0_BITS)))
    }

    /// Pack a `JMP` with condition and signed pc-relative delta.
    ///
    /// # Panics
    ///
    /// Panics when the delta is outside the encodable range; the
    /// encoder range-checks before packing.
    pub fn jmp(cond: BranchCond, delta: i32) -> Self {
        assert!((JMP_DELTA_MIN..=JMP_DELTA_MAX).contains(&delta));
        let raw = (delta as u32) & ((1 << (32 - OP_BITS - COND_BITS)) - 1);
        Instruction(
            (Opcode::Jmp as u32)
                | ((cond as u32) << OP_BITS)
                | (raw << (OP_BITS + COND_BITS)),
        )
    }

    /// Pack a `CALL` with a signed pc-relative delta.
    ///
    /// # Panics
    ///
    /// Panics when the delta is outside the encodable range.
    pub fn call(delta: i32) -> Self {
        assert!((CALL_DELTA_MIN..=CALL_DELTA_MAX).contains(&delta));
        let raw = (delta as u32) & ((1 << (32 - OP_BITS)) - 1);
        Instruction((Opcode::Call as u32) | (raw << OP_BITS))
    }

    /// Opcode of this instruction.
    pub fn op(self) -> Result<Opcode, InvalidOpcode> {
        Opcode::try_from((self.0 & ((1 << OP_BITS) - 1)) as u8)
    }

    /// First argument (two-argument layout).
    pub fn arg0(self) -> Arg {
        Arg::decode(((self.0 >> OP_BITS) & ((1 << ARG0_BITS) - 1)) as u16)
    }

    /// Second argument (two-argument layout).
    pub fn arg1(self) -> Arg {
        Arg::decode((self.0 >> (OP_BITS + ARG0_BITS)) as u16)
    }

    /// Branch condition (`JMP` layout).
    pub fn jmp_cond(self) -> Result<BranchCond, InvalidOpcode> {
        BranchCond::try_from(((self.0 >> OP_BITS) & ((1 << COND_BITS) - 1)) as u8)
    }

    /// Signed pc-relative delta (`JMP` layout).
    pub fn jmp_delta(self) -> i32 {
        (self.0 as i32) >> (OP_BITS + COND_BITS)
    }

    /// Signed pc-relative delta (`CALL` layout).
    pub fn call_delta(self) -> i32 {
        (self.0 as i32) >> OP_BITS
    }

    /// Raw instruction word.
    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Little-endian byte representation.
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for Instruction {
    fn from(raw: u32) -> Self {
        Instruction(raw)
    }
}

impl From<Instruction> for u32 {
    fn from(instr: Instruction) -> u32 {
        instr.0
    }
}

impl From<[u8; Instruction::LEN]> for Instruction {
    fn from(bytes: [u8; Instruction::LEN]) -> Self {
        Instruction(u32::from_le_bytes(bytes))
    }
}

// Constructors for every opcode, in the shape the assembler emits them.
impl Instruction {
    /// `NOP`
    pub fn nop() -> Self {
        Self::new(Opcode::Nop, Arg::None, Arg::None)
    }

    /// `PROC n` — frame entry reserving `n` slots.
    pub fn proc(nslots: i16) -> Self {
        Self::new(Opcode::Proc, Arg::Lit(nslots), Arg::None)
    }

    /// `ICMP a, b`
    pub fn icmp(a: Arg, b: Arg) -> Self {
        Self::new(Opcode::Icmp, a, b)
    }

    /// `FCMP a, b`
    pub fn fcmp(a: Arg, b: Arg) -> Self {
        Self::new(Opcode::Fcmp, a, b)
    }

    /// `FINT a` or `FINT a, divisor`
    pub fn fint(a: Arg, divisor: Arg) -> Self {
        Self::new(Opcode::Fint, a, divisor)
    }

    /// `SPLIT sd, reg`
    pub fn split(descriptor: i16, dst: RegId) -> Self {
        Self::new(Opcode::Split, Arg::Lit(descriptor), Arg::Reg(dst))
    }

    /// `SPLITV sd, slot`
    pub fn splitv(descriptor: i16, slot: u16) -> Self {
        Self::new(Opcode::Splitv, Arg::Lit(descriptor), Arg::Slot(slot))
    }

    /// `TOKEN`
    pub fn token() -> Self {
        Self::new(Opcode::Token, Arg::None, Arg::None)
    }

    /// `CONSUME`
    pub fn consume() -> Self {
        Self::new(Opcode::Consume, Arg::None, Arg::None)
    }

    /// `MATCH dfa`
    pub fn match_dfa(dfa: i16) -> Self {
        Self::new(Opcode::Match, Arg::Lit(dfa), Arg::None)
    }

    /// `FLOAD dst, src`
    pub fn fload(dst: RegId, src: Arg) -> Self {
        Self::new(Opcode::Fload, Arg::Reg(dst), src)
    }

    /// `ILOAD dst, src`
    pub fn iload(dst: RegId, src: Arg) -> Self {
        Self::new(Opcode::Iload, Arg::Reg(dst), src)
    }

    /// `MOVE dst, src`
    pub fn mov(dst: Arg, src: Arg) -> Self {
        Self::new(Opcode::Move, dst, src)
    }

    /// `INCR slot, k`
    pub fn incr(slot: u16, k: Arg) -> Self {
        Self::new(Opcode::Incr, Arg::Slot(slot), k)
    }

    /// `BSET slot, bit`
    pub fn bset(slot: u16, bit: i16) -> Self {
        Self::new(Opcode::Bset, Arg::Slot(slot), Arg::Lit(bit))
    }

    /// `BAND dst, k`
    pub fn band(dst: Arg, k: Arg) -> Self {
        Self::new(Opcode::Band, dst, k)
    }

    /// `UNIQUE`
    pub fn unique() -> Self {
        Self::new(Opcode::Unique, Arg::None, Arg::None)
    }

    /// `RETURN code` — zero for VALID.
    pub fn ret(code: i16) -> Self {
        Self::new(Opcode::Return, Arg::Lit(code), Arg::None)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Err(bad) => write!(f, "?? ({bad})"),
            Ok(Opcode::Jmp) => {
                let cond = self
                    .jmp_cond()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|_| "?".into());
                write!(f, "JMP\t{cond}, {:+}", self.jmp_delta())
            }
            Ok(Opcode::Call) => write!(f, "CALL\t{:+}", self.call_delta()),
            Ok(op) => {
                write!(f, "{op}")?;
                match (self.arg0(), self.arg1()) {
                    (Arg::None, Arg::None) => Ok(()),
                    (a, Arg::None) => write!(f, "\t{a}"),
                    (a, b) => write!(f, "\t{a}, {b}"),
                }
            }
        }
    }
}
