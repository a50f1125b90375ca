//! Linear IR.
//!
//! The middle representation between constraint trees and op
//! assembly. The IR translator produces structured frame bodies
//! (`Seq`/`If`/`Loop`/`Break`); the linearizer rewrites each frame
//! into a list of `Block`s joined by `Branch`/`CBranch` and resolves
//! `CallId` references to frame indices.

mod linearize;
mod translate;

pub use linearize::linearize;
pub use translate::translate_ir;

use std::fmt::{self, Write};
use std::ops::Index;

use indexmap::IndexMap;

use jsv_asm::{ErrorCode, EventKind, PropertyDfa};

/// Index of a statement in its program's statement arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(u32);

/// Index of an expression in its program's expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(u32);

/// Index of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Comparison operator of a [`IrExpr::Cmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Ne,
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Ne => "NE",
            CmpOp::Lt => "LT",
            CmpOp::Le => "LE",
            CmpOp::Eq => "EQ",
            CmpOp::Ge => "GE",
            CmpOp::Gt => "GT",
        };
        f.write_str(s)
    }
}

/// IR statements. Frame-scoped resources (counters, bitvectors,
/// matchers, split lists) are declared on the [`Frame`], and statements
/// reference them by index.
#[derive(Debug, Clone, PartialEq)]
pub enum IrStmt {
    Nop,
    /// Return VALID from the frame, consuming the rest of the current
    /// composite value if one is open.
    Valid,
    /// Return INVALID with the given code.
    Invalid(ErrorCode),
    If(ExprId, StmtId, StmtId),
    Seq(Vec<StmtId>),
    /// Loop with a frame-unique index; exits via `Break`.
    Loop(u32, Vec<StmtId>),
    Break(u32),
    /// Fetch the next token.
    Token,
    /// Skip the next value, including whole objects and arrays.
    Consume,
    /// Arm the uniqueness tracker for the array being read.
    Unique,
    /// Set a bit of a frame bitvector.
    Bset(usize, u32),
    /// Clear a bit of a frame bitvector.
    Bclear(usize, u32),
    /// Increment a frame counter.
    Incr(usize),
    /// Run matcher `matcher` over the current string token and
    /// dispatch on the resulting case index (0 = no match).
    Match {
        matcher: usize,
        cases: Vec<(u32, StmtId)>,
        default: StmtId,
    },
    /// Copy a value between two locations.
    Move(ExprId, ExprId),
    /// Call another frame; continues when it returns valid.
    Call(FrameId),
    /// Call a frame by forest label; resolved during linearization.
    CallId(String),
    /// Run split list `list` in lock-step; store the per-frame
    /// validity bits into bitvector `bitvec`.
    SplitVec { list: usize, bitvec: usize },
    /// Linear form: a labeled basic block.
    Block(u32, Vec<StmtId>),
    /// Linear form: unconditional jump to a block label.
    Branch(u32),
    /// Linear form: conditional jump.
    CBranch(ExprId, u32, u32),
}

/// IR expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum IrExpr {
    Num(f64),
    Size(u64),
    Bool(bool),
    Int(i64),
    /// Type of the current token.
    TokType,
    /// Number value of the current token.
    TokNum,
    /// Length of the current token.
    TokLen,
    /// Current token has the given type.
    IsTok(EventKind),
    /// Number is integral.
    IsInt(ExprId),
    /// Number is an integer multiple of the divisor.
    MultipleOf(ExprId, f64),
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Not(ExprId),
    Cmp(CmpOp, ExprId, ExprId),
    /// Value of a frame counter.
    Count(usize),
    /// Single bit of a frame bitvector.
    BTest(usize, u32),
    /// All declared bits of a frame bitvector are set.
    BTestAll(usize),
    /// At least one bit under the mask is set.
    BTestAny(usize, u64),
    /// Exactly one bit under the mask is set.
    BTestOne(usize, u64),
    /// Number of set bits under the mask.
    BCount(usize, u64),
    /// Run split list `list` in lock-step; yields the count of frames
    /// that returned valid.
    Split(usize),
    /// Case index produced by the most recent run of a matcher.
    Match(usize),
    /// Integer temporary (assembler-internal).
    ITemp(u8),
    /// Float temporary (assembler-internal).
    FTemp(u8),
    /// Stack slot (assembler-internal).
    Slot(u16),
    /// Execute the statement, then evaluate the expression.
    SeqExpr(StmtId, ExprId),
}

/// A bitvector declaration: diagnostic name plus width in bits.
#[derive(Debug, Clone, PartialEq)]
pub struct BitvecDecl {
    pub name: String,
    pub nbits: usize,
}

/// Frame body: structured before linearization, blocks after.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Tree(StmtId),
    Blocks(Vec<StmtId>),
}

/// A callable unit of validation and its frame-scoped resources.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Counter names; a counter's index is its position.
    pub counters: Vec<String>,
    /// Bitvector declarations.
    pub bitvecs: Vec<BitvecDecl>,
    /// Matchers: indices into the program DFA table.
    pub matchers: Vec<usize>,
    /// Split lists: the frames each split runs in lock-step.
    pub split_lists: Vec<Vec<FrameId>>,
    /// The body.
    pub body: FrameBody,
}

impl Frame {
    fn placeholder() -> Self {
        Frame {
            counters: Vec::new(),
            bitvecs: Vec::new(),
            matchers: Vec::new(),
            split_lists: Vec::new(),
            body: FrameBody::Tree(StmtId(0)),
        }
    }
}

/// A full IR program: arenas, frames, and the DFA table shared with
/// the eventual byte-code program.
#[derive(Debug, Clone, Default)]
pub struct IrProgram {
    stmts: Vec<IrStmt>,
    exprs: Vec<IrExpr>,
    /// Frames; frame 0 is the program entry.
    pub frames: Vec<Frame>,
    /// Property DFAs referenced by frame matchers.
    pub dfas: Vec<PropertyDfa>,
    /// Forest label → frame, for `CallId` resolution.
    pub tree_labels: IndexMap<String, FrameId>,
}

impl IrProgram {
    pub fn stmt(&mut self, s: IrStmt) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(s);
        id
    }

    pub fn expr(&mut self, e: IrExpr) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(e);
        id
    }

    /// Register a DFA, reusing an existing equal entry.
    pub fn intern_dfa(&mut self, dfa: PropertyDfa) -> usize {
        if let Some(pos) = self.dfas.iter().position(|d| *d == dfa) {
            return pos;
        }
        self.dfas.push(dfa);
        self.dfas.len() - 1
    }

    pub fn replace_stmt(&mut self, id: StmtId, s: IrStmt) {
        self.stmts[id.0 as usize] = s;
    }

    /// Render a frame as indented text, for diagnostics.
    pub fn dump_frame(&self, id: FrameId) -> String {
        let mut out = String::new();
        let frame = &self.frames[id.index()];
        writeln!(out, "FRAME {}:", id.0 + 1).unwrap();
        for (i, name) in frame.counters.iter().enumerate() {
            writeln!(out, "  COUNTER {i} \"{name}\"").unwrap();
        }
        for (i, bv) in frame.bitvecs.iter().enumerate() {
            writeln!(out, "  BITVECTOR {i} \"{}\" nbits={}", bv.name, bv.nbits).unwrap();
        }
        for (i, dfa) in frame.matchers.iter().enumerate() {
            writeln!(out, "  MATCHER {i} dfa={dfa}").unwrap();
        }
        for (i, list) in frame.split_lists.iter().enumerate() {
            write!(out, "  SPLITLIST {i}:").unwrap();
            for f in list {
                write!(out, " {}", f.0 + 1).unwrap();
            }
            out.push('\n');
        }
        match &frame.body {
            FrameBody::Tree(root) => self.dump_stmt(*root, 1, &mut out),
            FrameBody::Blocks(blocks) => {
                for &b in blocks {
                    self.dump_stmt(b, 1, &mut out);
                }
            }
        }
        out
    }

    fn dump_stmt(&self, id: StmtId, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match &self[id] {
            IrStmt::Nop => writeln!(out, "{pad}NOP").unwrap(),
            IrStmt::Valid => writeln!(out, "{pad}VALID").unwrap(),
            IrStmt::Invalid(code) => {
                writeln!(out, "{pad}INVALID({}, \"{}\")", *code as u16, code.message()).unwrap()
            }
            IrStmt::If(c, t, e) => {
                writeln!(out, "{pad}IF {}", self.dump_expr(*c)).unwrap();
                self.dump_stmt(*t, depth + 1, out);
                writeln!(out, "{pad}ELSE").unwrap();
                self.dump_stmt(*e, depth + 1, out);
            }
            IrStmt::Seq(stmts) => {
                writeln!(out, "{pad}SEQ").unwrap();
                for &s in stmts {
                    self.dump_stmt(s, depth + 1, out);
                }
            }
            IrStmt::Loop(n, body) => {
                writeln!(out, "{pad}LOOP L_{n}").unwrap();
                for &s in body {
                    self.dump_stmt(s, depth + 1, out);
                }
            }
            IrStmt::Break(n) => writeln!(out, "{pad}BREAK L_{n}").unwrap(),
            IrStmt::Token => writeln!(out, "{pad}TOKEN").unwrap(),
            IrStmt::Consume => writeln!(out, "{pad}CONSUME").unwrap(),
            IrStmt::Unique => writeln!(out, "{pad}UNIQUE").unwrap(),
            IrStmt::Bset(bv, bit) => writeln!(out, "{pad}BSET bv={bv} bit={bit}").unwrap(),
            IrStmt::Bclear(bv, bit) => writeln!(out, "{pad}BCLEAR bv={bv} bit={bit}").unwrap(),
            IrStmt::Incr(c) => writeln!(out, "{pad}INCR counter={c}").unwrap(),
            IrStmt::Match {
                matcher,
                cases,
                default,
            } => {
                writeln!(out, "{pad}MATCH matcher={matcher}").unwrap();
                writeln!(out, "{pad}  default:").unwrap();
                self.dump_stmt(*default, depth + 2, out);
                for (which, stmt) in cases {
                    writeln!(out, "{pad}  case {which}:").unwrap();
                    self.dump_stmt(*stmt, depth + 2, out);
                }
            }
            IrStmt::Move(dst, src) => {
                writeln!(out, "{pad}MOVE {} <- {}", self.dump_expr(*dst), self.dump_expr(*src))
                    .unwrap()
            }
            IrStmt::Call(f) => writeln!(out, "{pad}CALL frame={}", f.0 + 1).unwrap(),
            IrStmt::CallId(label) => writeln!(out, "{pad}CALL_ID \"{label}\"").unwrap(),
            IrStmt::SplitVec { list, bitvec } => {
                writeln!(out, "{pad}SPLITVEC list={list} bv={bitvec}").unwrap()
            }
            IrStmt::Block(label, stmts) => {
                writeln!(out, "{pad}BLOCK L{label}:").unwrap();
                for &s in stmts {
                    self.dump_stmt(s, depth + 1, out);
                }
            }
            IrStmt::Branch(label) => writeln!(out, "{pad}BRANCH L{label}").unwrap(),
            IrStmt::CBranch(c, t, e) => {
                writeln!(out, "{pad}CBRANCH {} L{t} L{e}", self.dump_expr(*c)).unwrap()
            }
        }
    }

    fn dump_expr(&self, id: ExprId) -> String {
        match &self[id] {
            IrExpr::Num(v) => format!("NUM({v})"),
            IrExpr::Size(v) => format!("SIZE({v})"),
            IrExpr::Bool(v) => format!("BOOL({v})"),
            IrExpr::Int(v) => format!("INT({v})"),
            IrExpr::TokType => "TOK_TYPE".to_string(),
            IrExpr::TokNum => "TOK_NUM".to_string(),
            IrExpr::TokLen => "TOK_LEN".to_string(),
            IrExpr::IsTok(kind) => format!("ISTOK({kind})"),
            IrExpr::IsInt(e) => format!("ISINT({})", self.dump_expr(*e)),
            IrExpr::MultipleOf(e, d) => format!("MULTIPLE_OF({}, {d})", self.dump_expr(*e)),
            IrExpr::And(a, b) => format!("AND({}, {})", self.dump_expr(*a), self.dump_expr(*b)),
            IrExpr::Or(a, b) => format!("OR({}, {})", self.dump_expr(*a), self.dump_expr(*b)),
            IrExpr::Not(e) => format!("NOT({})", self.dump_expr(*e)),
            IrExpr::Cmp(op, a, b) => {
                format!("{op}({}, {})", self.dump_expr(*a), self.dump_expr(*b))
            }
            IrExpr::Count(c) => format!("COUNT({c})"),
            IrExpr::BTest(bv, bit) => format!("BTEST(bv={bv}, bit={bit})"),
            IrExpr::BTestAll(bv) => format!("BTESTALL(bv={bv})"),
            IrExpr::BTestAny(bv, mask) => format!("BTESTANY(bv={bv}, mask={mask:#x})"),
            IrExpr::BTestOne(bv, mask) => format!("BTESTONE(bv={bv}, mask={mask:#x})"),
            IrExpr::BCount(bv, mask) => format!("BCOUNT(bv={bv}, mask={mask:#x})"),
            IrExpr::Split(list) => format!("SPLIT(list={list})"),
            IrExpr::Match(m) => format!("MATCH({m})"),
            IrExpr::ITemp(i) => format!("ITEMP({i})"),
            IrExpr::FTemp(i) => format!("FTEMP({i})"),
            IrExpr::Slot(s) => format!("SLOT({s})"),
            IrExpr::SeqExpr(s, e) => {
                let mut stmt = String::new();
                self.dump_stmt(*s, 0, &mut stmt);
                format!("ESEQ({}; {})", stmt.trim_end(), self.dump_expr(*e))
            }
        }
    }
}

impl Index<StmtId> for IrProgram {
    type Output = IrStmt;

    fn index(&self, id: StmtId) -> &IrStmt {
        &self.stmts[id.0 as usize]
    }
}

impl Index<ExprId> for IrProgram {
    type Output = IrExpr;

    fn index(&self, id: ExprId) -> &IrExpr {
        &self.exprs[id.0 as usize]
    }
}
