//! VM opcodes, branch conditions and register ids.

use core::fmt;

/// Opcode of a 32-bit VM instruction.
///
/// Opcodes live in the low five bits of an instruction, so at most 32
/// are representable. `JMP` and `CALL` use the branch layout (a signed
/// pc-relative delta instead of two argument fields); everything else
/// uses the two-argument layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Opcode {
    /// No-op.
    Nop = 0x00,
    /// Frame entry; reserves `arg0` zeroed 64-bit slots on the stack.
    Proc = 0x01,
    /// Integer compare of `arg0` vs `arg1`; sets the comparison flag.
    Icmp = 0x02,
    /// Float compare of `arg0` vs `arg1`; sets the comparison flag.
    Fcmp = 0x03,
    /// Integrality test. With one argument, flag := `arg0` is an
    /// integer; with two, flag := `arg0 / arg1` is an integer.
    Fint = 0x04,
    /// Conditional pc-relative branch on the comparison flag.
    Jmp = 0x05,
    /// Call the proc at the pc-relative target; continues on VALID.
    Call = 0x06,
    /// Run the procs of split descriptor `arg0` in lock-step; write
    /// the count of VALID procs into register `arg1`.
    Split = 0x07,
    /// As `Split`, but write a validity bitvector into slot `arg1`.
    Splitv = 0x08,
    /// Fetch the next token into the token registers.
    Token = 0x09,
    /// Skip the next value, including whole objects and arrays.
    Consume = 0x0a,
    /// Feed the current string token to DFA `arg0`; write the matched
    /// case index (0 for none) into register `M`.
    Match = 0x0b,
    /// Load a float into `arg0` from a pool entry or register.
    Fload = 0x0c,
    /// Load an integer into `arg0` from a pool entry, slot or literal.
    Iload = 0x0d,
    /// Copy `arg1` into `arg0`.
    Move = 0x0e,
    /// `slot[arg0] += arg1`.
    Incr = 0x0f,
    /// Set bit `arg1` of `slot[arg0]`.
    Bset = 0x10,
    /// `arg0 &= arg1`.
    Band = 0x11,
    /// Arm the uniqueness tracker for the array being read.
    Unique = 0x12,
    /// Leave the frame: VALID when `arg0` is zero, otherwise INVALID
    /// with `arg0` as the error code.
    Return = 0x13,
}

/// Number of defined opcodes.
pub const OPCODE_COUNT: usize = 0x14;

impl Opcode {
    /// Whether this opcode uses the branch instruction layout.
    pub const fn is_branch(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Call)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcode;

    fn try_from(b: u8) -> Result<Self, InvalidOpcode> {
        use Opcode::*;
        match b {
            0x00 => Ok(Nop),
            0x01 => Ok(Proc),
            0x02 => Ok(Icmp),
            0x03 => Ok(Fcmp),
            0x04 => Ok(Fint),
            0x05 => Ok(Jmp),
            0x06 => Ok(Call),
            0x07 => Ok(Split),
            0x08 => Ok(Splitv),
            0x09 => Ok(Token),
            0x0a => Ok(Consume),
            0x0b => Ok(Match),
            0x0c => Ok(Fload),
            0x0d => Ok(Iload),
            0x0e => Ok(Move),
            0x0f => Ok(Incr),
            0x10 => Ok(Bset),
            0x11 => Ok(Band),
            0x12 => Ok(Unique),
            0x13 => Ok(Return),
            _ => Err(InvalidOpcode(b)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Nop => "NOP",
            Opcode::Proc => "PROC",
            Opcode::Icmp => "ICMP",
            Opcode::Fcmp => "FCMP",
            Opcode::Fint => "FINT",
            Opcode::Jmp => "JMP",
            Opcode::Call => "CALL",
            Opcode::Split => "SPLIT",
            Opcode::Splitv => "SPLITV",
            Opcode::Token => "TOKEN",
            Opcode::Consume => "CONSUME",
            Opcode::Match => "MATCH",
            Opcode::Fload => "FLOAD",
            Opcode::Iload => "ILOAD",
            Opcode::Move => "MOVE",
            Opcode::Incr => "INCR",
            Opcode::Bset => "BSET",
            Opcode::Band => "BAND",
            Opcode::Unique => "UNIQUE",
            Opcode::Return => "RETURN",
        };
        f.write_str(name)
    }
}

/// The byte can't be mapped to any [`Opcode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidOpcode(pub u8);

impl fmt::Display for InvalidOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid opcode byte 0x{:02x}", self.0)
    }
}

impl std::error::Error for InvalidOpcode {}

/// Branch condition of a `JMP` instruction, against the comparison flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum BranchCond {
    /// Unconditional.
    Always = 0x00,
    /// Flag is "equal".
    Eq = 0x01,
    /// Flag is not "equal".
    Ne = 0x02,
    /// Flag is "less".
    Lt = 0x03,
    /// Flag is "less" or "equal".
    Le = 0x04,
    /// Flag is "greater".
    Gt = 0x05,
    /// Flag is "greater" or "equal".
    Ge = 0x06,
}

impl BranchCond {
    /// Condition that branches exactly when `self` does not.
    pub const fn negate(self) -> Self {
        match self {
            BranchCond::Always => BranchCond::Always,
            BranchCond::Eq => BranchCond::Ne,
            BranchCond::Ne => BranchCond::Eq,
            BranchCond::Lt => BranchCond::Ge,
            BranchCond::Le => BranchCond::Gt,
            BranchCond::Gt => BranchCond::Le,
            BranchCond::Ge => BranchCond::Lt,
        }
    }
}

impl TryFrom<u8> for BranchCond {
    type Error = InvalidOpcode;

    fn try_from(b: u8) -> Result<Self, InvalidOpcode> {
        use BranchCond::*;
        match b {
            0x00 => Ok(Always),
            0x01 => Ok(Eq),
            0x02 => Ok(Ne),
            0x03 => Ok(Lt),
            0x04 => Ok(Le),
            0x05 => Ok(Gt),
            0x06 => Ok(Ge),
            _ => Err(InvalidOpcode(b)),
        }
    }
}

impl fmt::Display for BranchCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchCond::Always => "always",
            BranchCond::Eq => "eq",
            BranchCond::Ne => "ne",
            BranchCond::Lt => "lt",
            BranchCond::Le => "le",
            BranchCond::Gt => "gt",
            BranchCond::Ge => "ge",
        };
        f.write_str(name)
    }
}

/// Id of a VM register, in the five-bit register space.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegId(u8);

impl RegId {
    /// Empty/omitted register argument.
    pub const NONE: RegId = RegId(0x00);
    /// Type of the current token (read-only).
    pub const TT: RegId = RegId(0x01);
    /// Number value of the current token (read-only).
    pub const TNUM: RegId = RegId(0x02);
    /// Length of the current token (read-only).
    pub const TLEN: RegId = RegId(0x03);
    /// Match case register, written by `MATCH`.
    pub const M: RegId = RegId(0x04);

    const ITMP_BASE: u8 = 0x05;
    const FTMP_BASE: u8 = 0x0d;
    /// Number of integer (and of float) temporaries.
    pub const TEMP_COUNT: u8 = 8;

    /// Integer temporary `n` (0..8).
    pub const fn itmp(n: u8) -> RegId {
        assert!(n < Self::TEMP_COUNT);
        RegId(Self::ITMP_BASE + n)
    }

    /// Float temporary `n` (0..8).
    pub const fn ftmp(n: u8) -> RegId {
        assert!(n < Self::TEMP_COUNT);
        RegId(Self::FTMP_BASE + n)
    }

    /// Construct from the raw five-bit id.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not fit in five bits.
    pub const fn new(id: u8) -> Self {
        assert!(id < 0x20);
        RegId(id)
    }

    /// Raw five-bit id.
    pub const fn to_u8(self) -> u8 {
        self.0
    }

    /// Index of an integer temporary, if this is one.
    pub const fn itmp_index(self) -> Option<u8> {
        if self.0 >= Self::ITMP_BASE && self.0 < Self::ITMP_BASE + Self::TEMP_COUNT {
            Some(self.0 - Self::ITMP_BASE)
        } else {
            None
        }
    }

    /// Index of a float temporary, if this is one.
    pub const fn ftmp_index(self) -> Option<u8> {
        if self.0 >= Self::FTMP_BASE && self.0 < Self::FTMP_BASE + Self::TEMP_COUNT {
            Some(self.0 - Self::FTMP_BASE)
        } else {
            None
        }
    }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RegId::NONE => f.write_str("%NONE"),
            RegId::TT => f.write_str("%TT"),
            RegId::TNUM => f.write_str("%TNUM"),
            RegId::TLEN => f.write_str("%TLEN"),
            RegId::M => f.write_str("%M"),
            r => {
                if let Some(i) = r.itmp_index() {
                    write!(f, "%I{i}")
                } else if let Some(i) = r.ftmp_index() {
                    write!(f, "%F{i}")
                } else {
                    write!(f, "%R{}", r.to_u8())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_byte_round_trip() {
        for op in Opcode::iter() {
            assert_eq!(Opcode::try_from(op as u8), Ok(op));
        }
        assert_eq!(Opcode::iter().count(), OPCODE_COUNT);
        for b in OPCODE_COUNT as u8..=0x1f {
            assert!(Opcode::try_from(b).is_err());
        }
    }

    #[test]
    fn branch_cond_negation_is_involutive() {
        for cond in BranchCond::iter() {
            assert_eq!(cond.negate().negate(), cond);
        }
    }

    #[test]
    fn temp_register_indices() {
        for n in 0..RegId::TEMP_COUNT {
            assert_eq!(RegId::itmp(n).itmp_index(), Some(n));
            assert_eq!(RegId::ftmp(n).ftmp_index(), Some(n));
            assert_eq!(RegId::itmp(n).ftmp_index(), None);
        }
    }
}
