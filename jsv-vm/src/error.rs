//! Fatal runtime errors.
//!
//! Validation failures are ordinary [`crate::Status::Invalid`]
//! results; a [`VmError`] means the program cannot continue at all.

use jsv_asm::{InvalidOpcode, RawInstruction};

/// Fatal interpreter error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    /// An instruction byte decoded to no known opcode.
    #[error("undecodable instruction {raw:#010x} at pc {pc}: {source}")]
    BadInstruction {
        /// Code offset.
        pc: usize,
        /// The raw word.
        raw: RawInstruction,
        /// Decode failure.
        source: InvalidOpcode,
    },
    /// The program counter left the code array.
    #[error("program counter {0} out of bounds")]
    PcOutOfBounds(usize),
    /// An instruction addressed a slot outside its frame.
    #[error("slot {slot} out of bounds at pc {pc}")]
    SlotOutOfBounds {
        /// The offending slot.
        slot: usize,
        /// Code offset.
        pc: usize,
    },
    /// An argument kind does not fit the instruction's operand types.
    #[error("bad operand at pc {pc}: {what}")]
    BadOperand {
        /// Code offset.
        pc: usize,
        /// Description.
        what: &'static str,
    },
    /// The token source reported a syntax error.
    #[error("malformed input: {0}")]
    MalformedStream(&'static str),
    /// The input ended inside a value.
    #[error("input ended inside a value")]
    TruncatedInput,
    /// An internal invariant was violated.
    #[error("internal vm error: {0}")]
    Internal(&'static str),
}
