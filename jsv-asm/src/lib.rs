//! Byte-code definitions for the `jsv` streaming JSON-Schema
//! validator: token events, opcodes, instruction packing, validation
//! error codes, property-name DFAs, and the compiled program
//! container.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod args;
mod dfa;
mod error_code;
mod event;
mod instruction;
mod opcode;
mod program;

pub use args::{Arg, LIT_MAX, LIT_MIN, POOL_MAX, SLOT_MAX};
pub use dfa::{DfaCursor, DfaError, MatchPattern, MatchSet, PropertyDfa};
pub use error_code::ErrorCode;
pub use event::{Event, EventKind, InvalidEventKind, SWITCH_KINDS};
pub use instruction::{
    Instruction, RawInstruction, CALL_DELTA_MAX, CALL_DELTA_MIN, JMP_DELTA_MAX, JMP_DELTA_MIN,
};
pub use opcode::{BranchCond, InvalidOpcode, Opcode, RegId, OPCODE_COUNT};
pub use program::{ProgramReadError, VmProgram, FORMAT_VERSION, MAGIC};

#[cfg(test)]
mod encoding_tests;
