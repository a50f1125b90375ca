//! Op assembly.
//!
//! The last symbolic representation before byte-code: per-frame procs
//! with labeled instructions and symbolic arguments, plus the constant
//! pools. The assembler produces it from linear IR; the encoder
//! resolves labels and packs it into a [`jsv_asm::VmProgram`].

mod assemble;
mod encode;

pub use assemble::assemble;
pub use encode::encode;

use std::fmt;

use jsv_asm::{BranchCond, EventKind, Opcode, PropertyDfa, RegId};

/// Symbolic instruction argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpArg {
    /// Empty/omitted.
    None,
    /// A register.
    Reg(RegId),
    /// A stack slot of the current proc.
    Slot(u16),
    /// A constant pool index; which pool depends on the opcode.
    Pool(u16),
    /// A small literal.
    Lit(i64),
    /// A token-type literal.
    TokType(EventKind),
    /// A branch condition (`JMP` only).
    Cond(BranchCond),
    /// A proc-local instruction label (`JMP` only).
    Label(u32),
    /// A proc reference (`CALL` only).
    Proc(usize),
}

impl fmt::Display for OpArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpArg::None => f.write_str("_"),
            OpArg::Reg(r) => write!(f, "{r}"),
            OpArg::Slot(s) => write!(f, "[{s}]"),
            OpArg::Pool(p) => write!(f, "pool({p})"),
            OpArg::Lit(v) => write!(f, "${v}"),
            OpArg::TokType(t) => write!(f, "{t}"),
            OpArg::Cond(c) => write!(f, "{c}"),
            OpArg::Label(l) => write!(f, "L{l}"),
            OpArg::Proc(p) => write!(f, "proc({})", p + 1),
        }
    }
}

/// One symbolic instruction, optionally naming a label position.
#[derive(Debug, Clone, PartialEq)]
pub struct OpInstr {
    pub op: Opcode,
    pub args: [OpArg; 2],
    pub label: Option<u32>,
}

impl OpInstr {
    pub fn new(op: Opcode, a: OpArg, b: OpArg) -> Self {
        OpInstr {
            op,
            args: [a, b],
            label: None,
        }
    }
}

/// One assembled proc: its stack-slot count and instruction list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpProc {
    pub nslots: usize,
    pub body: Vec<OpInstr>,
}

/// The assembled program with its constant pools.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpProgram {
    /// Procs; proc 0 is the entry.
    pub procs: Vec<OpProc>,
    pub fpool: Vec<f64>,
    pub ipool: Vec<i64>,
    pub dfas: Vec<PropertyDfa>,
    /// Split descriptors: lists of proc indices.
    pub splits: Vec<Vec<usize>>,
}

impl OpProgram {
    /// Intern a float constant, deduplicating by bit pattern.
    pub fn float(&mut self, v: f64) -> u16 {
        if let Some(pos) = self.fpool.iter().position(|f| f.to_bits() == v.to_bits()) {
            return pos as u16;
        }
        self.fpool.push(v);
        (self.fpool.len() - 1) as u16
    }

    /// Intern an integer constant.
    pub fn int(&mut self, v: i64) -> u16 {
        if let Some(pos) = self.ipool.iter().position(|&c| c == v) {
            return pos as u16;
        }
        self.ipool.push(v);
        (self.ipool.len() - 1) as u16
    }

    /// Intern a split descriptor.
    pub fn split(&mut self, procs: Vec<usize>) -> usize {
        if let Some(pos) = self.splits.iter().position(|s| *s == procs) {
            return pos;
        }
        self.splits.push(procs);
        self.splits.len() - 1
    }
}

impl fmt::Display for OpProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".DATA")?;
        for (i, v) in self.fpool.iter().enumerate() {
            writeln!(f, "  FLOAT({i})\t{v}")?;
        }
        for (i, v) in self.ipool.iter().enumerate() {
            writeln!(f, "  CONST({i})\t{v}")?;
        }
        for (i, s) in self.splits.iter().enumerate() {
            write!(f, "  SPLIT({i})\t")?;
            for p in s {
                write!(f, " {}", p + 1)?;
            }
            writeln!(f)?;
        }
        for (i, d) in self.dfas.iter().enumerate() {
            writeln!(f, "  DFA({i})\tpatterns={}", d.patterns().len())?;
        }
        for (pindex, proc) in self.procs.iter().enumerate() {
            writeln!(f, "\n.PROC {}\tslots={}", pindex + 1, proc.nslots)?;
            for instr in &proc.body {
                if let Some(label) = instr.label {
                    writeln!(f, "L{label}:")?;
                }
                write!(f, "\t{}", instr.op)?;
                match instr.args {
                    [OpArg::None, OpArg::None] => {}
                    [a, OpArg::None] => write!(f, "\t{a}")?,
                    [a, b] => write!(f, "\t{a}, {b}")?,
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
