//! Linear IR → op assembly.
//!
//! Assigns stack slots to frame resources, lowers expression trees to
//! load-and-compare sequences over the integer/float temporaries, and
//! turns `CBranch` conditions into short-circuit jump chains.

use jsv_asm::{BranchCond, Opcode, RegId};

use crate::ir::{CmpOp, ExprId, FrameBody, IrExpr, IrProgram, IrStmt, StmtId};
use crate::CompileError;

use super::{OpArg, OpInstr, OpProc, OpProgram};

/// Assemble a linearized IR program.
pub fn assemble(ir: &IrProgram) -> Result<OpProgram, CompileError> {
    let mut out = OpProgram {
        dfas: ir.dfas.clone(),
        ..OpProgram::default()
    };

    // Split descriptors reference procs by index; frames map to procs
    // one to one, so the pools can be built up front.
    let mut proc_splits: Vec<Vec<usize>> = Vec::with_capacity(ir.frames.len());
    for frame in &ir.frames {
        let mut indices = Vec::with_capacity(frame.split_lists.len());
        for list in &frame.split_lists {
            let procs: Vec<usize> = list.iter().map(|f| f.index()).collect();
            indices.push(out.split(procs));
        }
        proc_splits.push(indices);
    }

    for (findex, frame) in ir.frames.iter().enumerate() {
        let FrameBody::Blocks(blocks) = &frame.body else {
            return Err(CompileError::Internal(format!(
                "frame {findex} was not linearized"
            )));
        };

        let mut asm = ProcAsm::new(ir, &mut out, frame, &proc_splits[findex], blocks)?;
        for &block in blocks {
            asm.block(block)?;
        }
        let proc = asm.finish();
        out.procs.push(proc);
    }

    Ok(out)
}

struct ProcAsm<'i, 'o> {
    ir: &'i IrProgram,
    out: &'o mut OpProgram,
    body: Vec<OpInstr>,
    pending_labels: Vec<u32>,
    next_label: u32,
    counter_slots: Vec<u16>,
    /// Per bitvector: (base slot, bit width, word count).
    bitvec_slots: Vec<(u16, usize, usize)>,
    matcher_dfas: Vec<usize>,
    split_indices: Vec<usize>,
    nslots: u16,
    scratch: Option<u16>,
}

impl<'i, 'o> ProcAsm<'i, 'o> {
    fn new(
        ir: &'i IrProgram,
        out: &'o mut OpProgram,
        frame: &crate::ir::Frame,
        split_indices: &[usize],
        blocks: &[StmtId],
    ) -> Result<Self, CompileError> {
        let mut nslots: u16 = 0;
        let counter_slots: Vec<u16> = frame
            .counters
            .iter()
            .map(|_| {
                let s = nslots;
                nslots += 1;
                s
            })
            .collect();
        let bitvec_slots: Vec<(u16, usize, usize)> = frame
            .bitvecs
            .iter()
            .map(|bv| {
                let words = bv.nbits.div_ceil(64).max(1);
                let base = nslots;
                nslots += words as u16;
                (base, bv.nbits, words)
            })
            .collect();

        // Block labels precede assembler-generated ones.
        let mut next_label = 0;
        for &block in blocks {
            if let IrStmt::Block(label, _) = &ir[block] {
                next_label = next_label.max(*label + 1);
            }
        }

        let mut asm = ProcAsm {
            ir,
            out,
            body: Vec::new(),
            pending_labels: Vec::new(),
            next_label,
            counter_slots,
            bitvec_slots,
            matcher_dfas: frame.matchers.clone(),
            split_indices: split_indices.to_vec(),
            nslots,
            scratch: None,
        };
        // Placeholder; the slot count is patched once the body is
        // assembled and any scratch slot is known.
        asm.emit(Opcode::Proc, OpArg::Lit(0), OpArg::None);
        Ok(asm)
    }

    fn finish(mut self) -> OpProc {
        self.body[0].args[0] = OpArg::Lit(self.nslots as i64);
        OpProc {
            nslots: self.nslots as usize,
            body: self.body,
        }
    }

    fn fresh_label(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    fn place_label(&mut self, label: u32) {
        self.pending_labels.push(label);
    }

    fn emit(&mut self, op: Opcode, a: OpArg, b: OpArg) {
        while self.pending_labels.len() > 1 {
            let extra = self.pending_labels.remove(0);
            self.body.push(OpInstr {
                op: Opcode::Nop,
                args: [OpArg::None, OpArg::None],
                label: Some(extra),
            });
        }
        let label = self.pending_labels.pop();
        self.body.push(OpInstr {
            op,
            args: [a, b],
            label,
        });
    }

    fn jmp(&mut self, cond: BranchCond, label: u32) {
        self.emit(Opcode::Jmp, OpArg::Cond(cond), OpArg::Label(label));
    }

    fn scratch_slot(&mut self) -> u16 {
        if let Some(s) = self.scratch {
            return s;
        }
        let s = self.nslots;
        self.nslots += 1;
        self.scratch = Some(s);
        s
    }

    fn bitvec(&self, bv: usize) -> (u16, usize, usize) {
        self.bitvec_slots[bv]
    }

    fn block(&mut self, id: StmtId) -> Result<(), CompileError> {
        let IrStmt::Block(label, stmts) = self.ir[id].clone() else {
            return Err(CompileError::Internal("non-block frame entry".to_string()));
        };
        self.place_label(label);
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, id: StmtId) -> Result<(), CompileError> {
        match self.ir[id].clone() {
            IrStmt::Nop => self.emit(Opcode::Nop, OpArg::None, OpArg::None),
            IrStmt::Token => self.emit(Opcode::Token, OpArg::None, OpArg::None),
            IrStmt::Consume => self.emit(Opcode::Consume, OpArg::None, OpArg::None),
            IrStmt::Unique => self.emit(Opcode::Unique, OpArg::None, OpArg::None),
            IrStmt::Valid => self.emit(Opcode::Return, OpArg::Lit(0), OpArg::None),
            IrStmt::Invalid(code) => {
                self.emit(Opcode::Return, OpArg::Lit(code as i64), OpArg::None)
            }
            IrStmt::Bset(bv, bit) => {
                let (base, _, _) = self.bitvec(bv);
                let word = base + (bit / 64) as u16;
                self.emit(
                    Opcode::Bset,
                    OpArg::Slot(word),
                    OpArg::Lit((bit % 64) as i64),
                );
            }
            IrStmt::Bclear(bv, bit) => {
                let (base, _, _) = self.bitvec(bv);
                let word = base + (bit / 64) as u16;
                let mask = !(1i64 << (bit % 64));
                let arg = self.int_arg(mask);
                self.emit(Opcode::Band, OpArg::Slot(word), arg);
            }
            IrStmt::Incr(c) => {
                let slot = self.counter_slots[c];
                self.emit(Opcode::Incr, OpArg::Slot(slot), OpArg::Lit(1));
            }
            IrStmt::Match { matcher, cases, .. } => {
                if !cases.is_empty() {
                    return Err(CompileError::Internal(
                        "match dispatch survived linearization".to_string(),
                    ));
                }
                let dfa = self.matcher_dfas[matcher];
                self.emit(Opcode::Match, OpArg::Lit(dfa as i64), OpArg::None);
            }
            IrStmt::Move(dst, src) => {
                let dst = self.place_arg(dst)?;
                let src = self.place_arg(src)?;
                self.emit(Opcode::Move, dst, src);
            }
            IrStmt::Call(f) => self.emit(Opcode::Call, OpArg::Proc(f.index()), OpArg::None),
            IrStmt::SplitVec { list, bitvec } => {
                let split = self.split_indices[list];
                let (base, _, _) = self.bitvec(bitvec);
                self.emit(Opcode::Splitv, OpArg::Lit(split as i64), OpArg::Slot(base));
            }
            IrStmt::Branch(label) => self.jmp(BranchCond::Always, label),
            IrStmt::CBranch(cond, then_l, else_l) => self.cond(cond, then_l, else_l)?,
            other => {
                return Err(CompileError::Internal(format!(
                    "structured statement {other:?} survived linearization"
                )))
            }
        }
        Ok(())
    }

    /// Emit code that jumps to `t` when the expression holds and to
    /// `e` otherwise.
    fn cond(&mut self, expr: ExprId, t: u32, e: u32) -> Result<(), CompileError> {
        match self.ir[expr].clone() {
            IrExpr::Bool(true) => self.jmp(BranchCond::Always, t),
            IrExpr::Bool(false) => self.jmp(BranchCond::Always, e),
            IrExpr::And(a, b) => {
                let mid = self.fresh_label();
                self.cond(a, mid, e)?;
                self.place_label(mid);
                self.cond(b, t, e)?;
            }
            IrExpr::Or(a, b) => {
                let mid = self.fresh_label();
                self.cond(a, t, mid)?;
                self.place_label(mid);
                self.cond(b, t, e)?;
            }
            IrExpr::Not(a) => self.cond(a, e, t)?,
            IrExpr::SeqExpr(stmt, inner) => {
                self.stmt(stmt)?;
                self.cond(inner, t, e)?;
            }
            IrExpr::IsTok(kind) => {
                self.emit(Opcode::Icmp, OpArg::Reg(RegId::TT), OpArg::TokType(kind));
                self.jmp(BranchCond::Eq, t);
                self.jmp(BranchCond::Always, e);
            }
            IrExpr::IsInt(arg) => {
                let a = self.float_operand(arg, 0)?;
                self.emit(Opcode::Fint, a, OpArg::None);
                self.jmp(BranchCond::Eq, t);
                self.jmp(BranchCond::Always, e);
            }
            IrExpr::MultipleOf(arg, divisor) => {
                let a = self.float_operand(arg, 0)?;
                let pool = self.out.float(divisor);
                self.emit(
                    Opcode::Fload,
                    OpArg::Reg(RegId::ftmp(1)),
                    OpArg::Pool(pool),
                );
                self.emit(Opcode::Fint, a, OpArg::Reg(RegId::ftmp(1)));
                self.jmp(BranchCond::Eq, t);
                self.jmp(BranchCond::Always, e);
            }
            IrExpr::Cmp(op, l, r) => self.compare(op, l, r, t, e)?,
            IrExpr::BTest(bv, bit) => self.btest(bv, bit, t, e)?,
            IrExpr::BTestAll(bv) => self.btest_all(bv, t, e)?,
            IrExpr::BTestAny(bv, mask) => self.btest_any(bv, mask, t, e)?,
            IrExpr::BTestOne(bv, mask) => self.btest_one(bv, mask, t, e)?,
            other => {
                return Err(CompileError::Internal(format!(
                    "expression {other:?} is not a condition"
                )))
            }
        }
        Ok(())
    }

    fn compare(
        &mut self,
        op: CmpOp,
        l: ExprId,
        r: ExprId,
        t: u32,
        e: u32,
    ) -> Result<(), CompileError> {
        // BCOUNT only appears compared against small literals; the
        // supported forms reduce to bit tests.
        if let IrExpr::BCount(bv, mask) = self.ir[l].clone() {
            let IrExpr::Size(n) = self.ir[r] else {
                return Err(CompileError::Internal(
                    "BCOUNT compared against a non-literal".to_string(),
                ));
            };
            return match (op, n) {
                (CmpOp::Eq, 0) => self.btest_any(bv, mask, e, t),
                (CmpOp::Ge, 1) | (CmpOp::Ne, 0) => self.btest_any(bv, mask, t, e),
                (CmpOp::Eq, 1) => self.btest_one(bv, mask, t, e),
                _ => Err(CompileError::Internal(format!(
                    "unsupported BCOUNT comparison {op:?} {n}"
                ))),
            };
        }

        let float = self.is_float(l) || self.is_float(r);
        if float {
            let a = self.float_operand(l, 0)?;
            let b = self.float_operand(r, 1)?;
            self.emit(Opcode::Fcmp, a, b);
        } else {
            let a = self.int_operand(l, 0)?;
            let b = self.int_operand(r, 1)?;
            self.emit(Opcode::Icmp, a, b);
        }
        self.jmp(cond_of(op), t);
        self.jmp(BranchCond::Always, e);
        Ok(())
    }

    fn btest(&mut self, bv: usize, bit: u32, t: u32, e: u32) -> Result<(), CompileError> {
        let (base, _, _) = self.bitvec(bv);
        let word = base + (bit / 64) as u16;
        self.emit(
            Opcode::Iload,
            OpArg::Reg(RegId::itmp(0)),
            OpArg::Slot(word),
        );
        let mask = self.int_arg(1i64 << (bit % 64));
        self.emit(Opcode::Band, OpArg::Reg(RegId::itmp(0)), mask);
        self.emit(Opcode::Icmp, OpArg::Reg(RegId::itmp(0)), OpArg::Lit(0));
        self.jmp(BranchCond::Ne, t);
        self.jmp(BranchCond::Always, e);
        Ok(())
    }

    fn btest_all(&mut self, bv: usize, t: u32, e: u32) -> Result<(), CompileError> {
        let (base, nbits, words) = self.bitvec(bv);
        for word in 0..words {
            let bits = (nbits - word * 64).min(64);
            let mask = if bits == 64 { -1i64 } else { (1i64 << bits) - 1 };
            self.emit(
                Opcode::Iload,
                OpArg::Reg(RegId::itmp(0)),
                OpArg::Slot(base + word as u16),
            );
            let want = self.int_operand_const(mask, 1);
            self.emit(Opcode::Icmp, OpArg::Reg(RegId::itmp(0)), want);
            self.jmp(BranchCond::Ne, e);
        }
        self.jmp(BranchCond::Always, t);
        Ok(())
    }

    fn btest_any(&mut self, bv: usize, mask: u64, t: u32, e: u32) -> Result<(), CompileError> {
        let (base, _, _) = self.bitvec(bv);
        self.emit(
            Opcode::Iload,
            OpArg::Reg(RegId::itmp(0)),
            OpArg::Slot(base),
        );
        let mask = self.int_arg(mask as i64);
        self.emit(Opcode::Band, OpArg::Reg(RegId::itmp(0)), mask);
        self.emit(Opcode::Icmp, OpArg::Reg(RegId::itmp(0)), OpArg::Lit(0));
        self.jmp(BranchCond::Ne, t);
        self.jmp(BranchCond::Always, e);
        Ok(())
    }

    /// Exactly one bit under the mask: the masked word is non-zero and
    /// clearing its lowest set bit leaves zero.
    fn btest_one(&mut self, bv: usize, mask: u64, t: u32, e: u32) -> Result<(), CompileError> {
        let (base, _, _) = self.bitvec(bv);
        let s = self.scratch_slot();

        self.emit(Opcode::Move, OpArg::Slot(s), OpArg::Slot(base));
        let mask = self.int_arg(mask as i64);
        self.emit(Opcode::Band, OpArg::Slot(s), mask);
        self.emit(Opcode::Iload, OpArg::Reg(RegId::itmp(0)), OpArg::Slot(s));
        self.emit(Opcode::Icmp, OpArg::Reg(RegId::itmp(0)), OpArg::Lit(0));
        self.jmp(BranchCond::Eq, e);

        self.emit(Opcode::Iload, OpArg::Reg(RegId::itmp(1)), OpArg::Slot(s));
        self.emit(Opcode::Incr, OpArg::Slot(s), OpArg::Lit(-1));
        self.emit(Opcode::Band, OpArg::Slot(s), OpArg::Reg(RegId::itmp(1)));
        self.emit(Opcode::Iload, OpArg::Reg(RegId::itmp(0)), OpArg::Slot(s));
        self.emit(Opcode::Icmp, OpArg::Reg(RegId::itmp(0)), OpArg::Lit(0));
        self.jmp(BranchCond::Eq, t);
        self.jmp(BranchCond::Always, e);
        Ok(())
    }

    fn is_float(&self, expr: ExprId) -> bool {
        matches!(
            self.ir[expr],
            IrExpr::Num(_) | IrExpr::TokNum | IrExpr::FTemp(_)
        )
    }

    /// Lower an integer-valued operand, loading through the given
    /// temporary when it is not already a register or small literal.
    fn int_operand(&mut self, expr: ExprId, temp: u8) -> Result<OpArg, CompileError> {
        Ok(match self.ir[expr].clone() {
            IrExpr::Size(v) => self.int_operand_const(v as i64, temp),
            IrExpr::Int(v) => self.int_operand_const(v, temp),
            IrExpr::TokLen => OpArg::Reg(RegId::TLEN),
            IrExpr::TokType => OpArg::Reg(RegId::TT),
            IrExpr::Match(_) => OpArg::Reg(RegId::M),
            IrExpr::ITemp(i) => OpArg::Reg(RegId::itmp(i)),
            IrExpr::Count(c) => {
                let slot = self.counter_slots[c];
                let reg = RegId::itmp(temp);
                self.emit(Opcode::Iload, OpArg::Reg(reg), OpArg::Slot(slot));
                OpArg::Reg(reg)
            }
            IrExpr::Slot(s) => {
                let reg = RegId::itmp(temp);
                self.emit(Opcode::Iload, OpArg::Reg(reg), OpArg::Slot(s));
                OpArg::Reg(reg)
            }
            IrExpr::Split(list) => {
                let split = self.split_indices[list];
                let reg = RegId::itmp(temp);
                self.emit(Opcode::Split, OpArg::Lit(split as i64), OpArg::Reg(reg));
                OpArg::Reg(reg)
            }
            other => {
                return Err(CompileError::Internal(format!(
                    "expression {other:?} is not an integer operand"
                )))
            }
        })
    }

    fn int_operand_const(&mut self, v: i64, temp: u8) -> OpArg {
        if (jsv_asm::LIT_MIN as i64..=jsv_asm::LIT_MAX as i64).contains(&v) {
            OpArg::Lit(v)
        } else {
            let pool = self.out.int(v);
            let reg = RegId::itmp(temp);
            self.emit(Opcode::Iload, OpArg::Reg(reg), OpArg::Pool(pool));
            OpArg::Reg(reg)
        }
    }

    /// An argument for BAND/BCLEAR masks: small literal or pool.
    fn int_arg(&mut self, v: i64) -> OpArg {
        if (jsv_asm::LIT_MIN as i64..=jsv_asm::LIT_MAX as i64).contains(&v) {
            OpArg::Lit(v)
        } else {
            OpArg::Pool(self.out.int(v))
        }
    }

    fn float_operand(&mut self, expr: ExprId, temp: u8) -> Result<OpArg, CompileError> {
        Ok(match self.ir[expr].clone() {
            IrExpr::TokNum => OpArg::Reg(RegId::TNUM),
            IrExpr::FTemp(i) => OpArg::Reg(RegId::ftmp(i)),
            IrExpr::Num(v) => {
                let pool = self.out.float(v);
                let reg = RegId::ftmp(temp);
                self.emit(Opcode::Fload, OpArg::Reg(reg), OpArg::Pool(pool));
                OpArg::Reg(reg)
            }
            IrExpr::Size(v) => {
                let pool = self.out.float(v as f64);
                let reg = RegId::ftmp(temp);
                self.emit(Opcode::Fload, OpArg::Reg(reg), OpArg::Pool(pool));
                OpArg::Reg(reg)
            }
            other => {
                return Err(CompileError::Internal(format!(
                    "expression {other:?} is not a float operand"
                )))
            }
        })
    }

    /// A writable location for `MOVE`.
    fn place_arg(&mut self, expr: ExprId) -> Result<OpArg, CompileError> {
        Ok(match self.ir[expr] {
            IrExpr::ITemp(i) => OpArg::Reg(RegId::itmp(i)),
            IrExpr::FTemp(i) => OpArg::Reg(RegId::ftmp(i)),
            IrExpr::Slot(s) => OpArg::Slot(s),
            ref other => {
                return Err(CompileError::Internal(format!(
                    "expression {other:?} is not a location"
                )))
            }
        })
    }
}

fn cond_of(op: CmpOp) -> BranchCond {
    match op {
        CmpOp::Ne => BranchCond::Ne,
        CmpOp::Lt => BranchCond::Lt,
        CmpOp::Le => BranchCond::Le,
        CmpOp::Eq => BranchCond::Eq,
        CmpOp::Ge => BranchCond::Ge,
        CmpOp::Gt => BranchCond::Gt,
    }
}
