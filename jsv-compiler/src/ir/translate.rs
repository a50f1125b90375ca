//! Constraint forest → tree IR.
//!
//! Every forest tree becomes a frame; more frames are created on
//! demand for property values, split branches and array items. All
//! frames follow the same calling convention: a frame validates one
//! whole value and fetches its own first token (a frame entered
//! through a split receives the parent's current token as its first
//! fetch, so branch frames re-dispatch on the value the parent already
//! started).

use jsv_asm::{ErrorCode, EventKind, SWITCH_KINDS};

use crate::cnode::{Cnode, CnodeForest, CnodeId, CountKind, CountRange, NumRange, RangeFlags};
use crate::CompileError;

use super::{
    BitvecDecl, CmpOp, ExprId, Frame, FrameBody, FrameId, IrExpr, IrProgram, IrStmt, StmtId,
};

/// Translate a canonical forest into an IR program.
pub fn translate_ir(forest: &CnodeForest) -> Result<IrProgram, CompileError> {
    let mut b = IrBuilder {
        forest,
        prog: IrProgram::default(),
        consume_frame: None,
    };

    for _ in &forest.trees {
        b.prog.frames.push(Frame::placeholder());
    }
    for (label, &tree) in &forest.tree_ids {
        b.prog
            .tree_labels
            .insert(label.clone(), FrameId(tree as u32));
    }
    for (index, &tree) in forest.trees.iter().enumerate() {
        let frame = b.build_value_frame(&[tree])?;
        b.prog.frames[index] = frame;
    }
    Ok(b.prog)
}

/// How a group of split branches combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupOp {
    /// Every branch must validate.
    All,
    /// At least one branch must validate.
    Any,
    /// Exactly one branch must validate.
    One,
    /// No branch may validate.
    None,
}

/// Per-frame resource bookkeeping while its body is built.
#[derive(Default)]
struct FrameCx {
    counters: Vec<String>,
    bitvecs: Vec<BitvecDecl>,
    matchers: Vec<usize>,
    split_lists: Vec<Vec<FrameId>>,
    nloops: u32,
}

impl FrameCx {
    fn counter(&mut self, name: &str) -> usize {
        self.counters.push(name.to_string());
        self.counters.len() - 1
    }

    fn bitvec(&mut self, name: &str, nbits: usize) -> usize {
        self.bitvecs.push(BitvecDecl {
            name: name.to_string(),
            nbits,
        });
        self.bitvecs.len() - 1
    }

    fn matcher(&mut self, dfa: usize) -> usize {
        self.matchers.push(dfa);
        self.matchers.len() - 1
    }

    fn split_list(&mut self, frames: Vec<FrameId>) -> usize {
        self.split_lists.push(frames);
        self.split_lists.len() - 1
    }

    fn loop_index(&mut self) -> u32 {
        let n = self.nloops;
        self.nloops += 1;
        n
    }

    fn into_frame(self, body: FrameBody) -> Frame {
        Frame {
            counters: self.counters,
            bitvecs: self.bitvecs,
            matchers: self.matchers,
            split_lists: self.split_lists,
            body,
        }
    }
}

struct IrBuilder<'f> {
    forest: &'f CnodeForest,
    prog: IrProgram,
    /// Shared frame that consumes one arbitrary value.
    consume_frame: Option<FrameId>,
}

impl<'f> IrBuilder<'f> {
    fn node(&self, id: CnodeId) -> &Cnode {
        &self.forest.arena[id]
    }

    fn stmt(&mut self, s: IrStmt) -> StmtId {
        self.prog.stmt(s)
    }

    fn expr(&mut self, e: IrExpr) -> ExprId {
        self.prog.expr(e)
    }

    fn seq(&mut self, stmts: Vec<StmtId>) -> StmtId {
        match stmts.len() {
            1 => stmts[0],
            _ => self.stmt(IrStmt::Seq(stmts)),
        }
    }

    fn invalid(&mut self, code: ErrorCode) -> StmtId {
        self.stmt(IrStmt::Invalid(code))
    }

    // ---- frames ------------------------------------------------------

    fn push_frame(&mut self, frame: Frame) -> FrameId {
        self.prog.frames.push(frame);
        FrameId(self.prog.frames.len() as u32 - 1)
    }

    /// A frame validating one value against the conjunction of
    /// `roots`.
    fn new_value_frame(&mut self, roots: &[CnodeId]) -> Result<FrameId, CompileError> {
        let frame = self.build_value_frame(roots)?;
        Ok(self.push_frame(frame))
    }

    fn build_value_frame(&mut self, roots: &[CnodeId]) -> Result<Frame, CompileError> {
        let mut cx = FrameCx::default();
        let body = self.value_body(roots, &mut cx)?;
        Ok(cx.into_frame(FrameBody::Tree(body)))
    }

    /// The canonical frame body: fetch the first token and dispatch.
    fn value_body(&mut self, roots: &[CnodeId], cx: &mut FrameCx) -> Result<StmtId, CompileError> {
        if roots.len() > 1 {
            // Conjunction of callable constraints: fetch the value's
            // first token, then run every constraint over the value in
            // lock-step (the fetched token seeds each child).
            let token = self.stmt(IrStmt::Token);
            let groups = vec![(GroupOp::All, roots.to_vec())];
            let split = self.fused_split(groups, None, SplitWrap::Value, cx)?;
            return Ok(self.seq(vec![token, split]));
        }
        let root = roots[0];
        Ok(match self.node(root).clone() {
            Cnode::Valid => {
                let token = self.stmt(IrStmt::Token);
                let valid = self.stmt(IrStmt::Valid);
                self.seq(vec![token, valid])
            }
            Cnode::Invalid => self.invalid(ErrorCode::UnexpectedToken),
            Cnode::Ref(label) => {
                let call = self.stmt(IrStmt::CallId(label));
                let valid = self.stmt(IrStmt::Valid);
                self.seq(vec![call, valid])
            }
            Cnode::Switch(slots) => {
                let token = self.stmt(IrStmt::Token);
                let chain = self.switch_chain(&slots, cx)?;
                self.seq(vec![token, chain])
            }
            Cnode::And(_) | Cnode::Or(_) | Cnode::Xor(_) | Cnode::Not(_) => {
                let token = self.stmt(IrStmt::Token);
                let groups = self.combinator_groups(root);
                let split = self.fused_split(groups, None, SplitWrap::Value, cx)?;
                self.seq(vec![token, split])
            }
            other => {
                return Err(CompileError::Internal(format!(
                    "unexpected value root {other:?}"
                )))
            }
        })
    }

    /// Shared frame whose only job is to consume one value.
    fn consume_value_frame(&mut self) -> FrameId {
        if let Some(f) = self.consume_frame {
            return f;
        }
        let token = self.stmt(IrStmt::Token);
        let valid = self.stmt(IrStmt::Valid);
        let body = self.seq(vec![token, valid]);
        let frame = FrameCx::default().into_frame(FrameBody::Tree(body));
        let id = self.push_frame(frame);
        self.consume_frame = Some(id);
        id
    }

    // ---- token switch ------------------------------------------------

    /// `IF ISTOK(t1) … ELSE IF ISTOK(t2) … ELSE <default>` over the
    /// switch slots, with the majority constant folded into the final
    /// else.
    fn switch_chain(
        &mut self,
        slots: &[CnodeId; SWITCH_KINDS],
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        let is_invalid = |b: &Self, id: CnodeId| matches!(b.node(id), Cnode::Invalid);
        let is_valid = |b: &Self, id: CnodeId| matches!(b.node(id), Cnode::Valid);

        let n_invalid = slots.iter().filter(|&&s| is_invalid(self, s)).count();
        let n_valid = slots.iter().filter(|&&s| is_valid(self, s)).count();

        let default_invalid = n_invalid >= n_valid;
        let mut chain = if default_invalid {
            self.invalid(ErrorCode::UnexpectedToken)
        } else {
            self.stmt(IrStmt::Valid)
        };

        for slot in (0..SWITCH_KINDS).rev() {
            let id = slots[slot];
            let skip = if default_invalid {
                is_invalid(self, id)
            } else {
                is_valid(self, id)
            };
            if skip {
                continue;
            }
            let kind = EventKind::from_switch_slot(slot);
            let body = self.slot_body(kind, id, cx)?;
            let cond = self.expr(IrExpr::IsTok(kind));
            chain = self.stmt(IrStmt::If(cond, body, chain));
        }
        Ok(chain)
    }

    fn slot_body(
        &mut self,
        kind: EventKind,
        id: CnodeId,
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        match kind {
            EventKind::ObjectBeg => self.object_slot_body(id, cx),
            EventKind::ArrayBeg => self.array_slot_body(id, cx),
            _ => self.scalar_slot_body(id, cx),
        }
    }

    // ---- scalar slots ------------------------------------------------

    fn scalar_slot_body(&mut self, id: CnodeId, cx: &mut FrameCx) -> Result<StmtId, CompileError> {
        if matches!(self.node(id), Cnode::Valid) {
            return Ok(self.stmt(IrStmt::Valid));
        }
        if matches!(self.node(id), Cnode::Invalid) {
            return Ok(self.invalid(ErrorCode::UnexpectedToken));
        }
        if self.has_consuming(id) {
            // A ref (or combinator over refs) on a scalar value: run
            // the callable frames over the value in lock-step.
            let groups = self.combinator_groups(id);
            return self.fused_split(groups, None, SplitWrap::Value, cx);
        }

        let checks = self.scalar_checks(id, cx)?;
        let mut body = self.stmt(IrStmt::Valid);
        for (cond, code) in checks.into_iter().rev() {
            let fail = self.invalid(code);
            body = self.stmt(IrStmt::If(cond, body, fail));
        }
        Ok(body)
    }

    /// Pure (non-consuming) checks for one scalar-slot constraint.
    fn scalar_checks(
        &mut self,
        id: CnodeId,
        cx: &mut FrameCx,
    ) -> Result<Vec<(ExprId, ErrorCode)>, CompileError> {
        Ok(match self.node(id).clone() {
            Cnode::And(kids) => {
                let mut checks = Vec::new();
                for kid in kids {
                    checks.extend(self.scalar_checks(kid, cx)?);
                }
                checks
            }
            Cnode::NumRange(r) => vec![(self.num_range_expr(&r), ErrorCode::Number)],
            Cnode::NumInteger => {
                let tnum = self.expr(IrExpr::TokNum);
                let isint = self.expr(IrExpr::IsInt(tnum));
                vec![(isint, ErrorCode::NotInteger)]
            }
            Cnode::NumMultipleOf(d) => {
                let tnum = self.expr(IrExpr::TokNum);
                let multiple = self.expr(IrExpr::MultipleOf(tnum, d));
                vec![(multiple, ErrorCode::Number)]
            }
            Cnode::CountRange(CountKind::Length, r) => {
                vec![(self.len_range_expr(&r), ErrorCode::UnexpectedToken)]
            }
            Cnode::MatchSwitch { .. } => {
                vec![(self.string_match_expr(id, cx)?, ErrorCode::UnexpectedToken)]
            }
            Cnode::Or(_) | Cnode::Xor(_) | Cnode::Not(_) => {
                vec![(self.pure_expr(id, cx)?, ErrorCode::SplitCondition)]
            }
            other => {
                return Err(CompileError::Internal(format!(
                    "unexpected scalar constraint {other:?}"
                )))
            }
        })
    }

    /// A whole subtree as one boolean expression.
    fn pure_expr(&mut self, id: CnodeId, cx: &mut FrameCx) -> Result<ExprId, CompileError> {
        Ok(match self.node(id).clone() {
            Cnode::Valid => self.expr(IrExpr::Bool(true)),
            Cnode::Invalid => self.expr(IrExpr::Bool(false)),
            Cnode::And(kids) => {
                let exprs: Vec<ExprId> = kids
                    .iter()
                    .map(|&k| self.pure_expr(k, cx))
                    .collect::<Result<_, _>>()?;
                self.fold_binary(exprs, IrExpr::And)
            }
            Cnode::Or(kids) => {
                let exprs: Vec<ExprId> = kids
                    .iter()
                    .map(|&k| self.pure_expr(k, cx))
                    .collect::<Result<_, _>>()?;
                self.fold_binary(exprs, IrExpr::Or)
            }
            Cnode::Xor(kids) => {
                let exprs: Vec<ExprId> = kids
                    .iter()
                    .map(|&k| self.pure_expr(k, cx))
                    .collect::<Result<_, _>>()?;
                self.exactly_one_expr(exprs)
            }
            Cnode::Not(k) => {
                let inner = self.pure_expr(k, cx)?;
                self.expr(IrExpr::Not(inner))
            }
            _ => {
                let checks = self.scalar_checks(id, cx)?;
                let exprs: Vec<ExprId> = checks.into_iter().map(|(e, _)| e).collect();
                self.fold_binary(exprs, IrExpr::And)
            }
        })
    }

    fn fold_binary(&mut self, exprs: Vec<ExprId>, make: fn(ExprId, ExprId) -> IrExpr) -> ExprId {
        let mut iter = exprs.into_iter();
        let Some(first) = iter.next() else {
            return self.expr(IrExpr::Bool(true));
        };
        iter.fold(first, |acc, e| self.expr(make(acc, e)))
    }

    /// Exactly-one over pure booleans:
    /// `OR_i (t_i AND NOT (OR_{j≠i} t_j))`.
    fn exactly_one_expr(&mut self, terms: Vec<ExprId>) -> ExprId {
        let mut alts: Vec<ExprId> = Vec::with_capacity(terms.len());
        for (i, &t) in terms.iter().enumerate() {
            let others: Vec<ExprId> = terms
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &e)| e)
                .collect();
            let alt = if others.is_empty() {
                t
            } else {
                let any_other = self.fold_binary(others, IrExpr::Or);
                let none_other = self.expr(IrExpr::Not(any_other));
                self.expr(IrExpr::And(t, none_other))
            };
            alts.push(alt);
        }
        self.fold_binary(alts, IrExpr::Or)
    }

    fn num_range_expr(&mut self, r: &NumRange) -> ExprId {
        let mut parts = Vec::new();
        if r.flags.contains(RangeFlags::MIN) {
            let op = if r.flags.contains(RangeFlags::EXCL_MIN) {
                CmpOp::Gt
            } else {
                CmpOp::Ge
            };
            let tnum = self.expr(IrExpr::TokNum);
            let min = self.expr(IrExpr::Num(r.min));
            parts.push(self.expr(IrExpr::Cmp(op, tnum, min)));
        }
        if r.flags.contains(RangeFlags::MAX) {
            let op = if r.flags.contains(RangeFlags::EXCL_MAX) {
                CmpOp::Lt
            } else {
                CmpOp::Le
            };
            let tnum = self.expr(IrExpr::TokNum);
            let max = self.expr(IrExpr::Num(r.max));
            parts.push(self.expr(IrExpr::Cmp(op, tnum, max)));
        }
        self.fold_binary(parts, IrExpr::And)
    }

    fn len_range_expr(&mut self, r: &CountRange) -> ExprId {
        let mut parts = Vec::new();
        if r.min > 0 {
            let tlen = self.expr(IrExpr::TokLen);
            let min = self.expr(IrExpr::Size(r.min));
            parts.push(self.expr(IrExpr::Cmp(CmpOp::Ge, tlen, min)));
        }
        if r.upper {
            let tlen = self.expr(IrExpr::TokLen);
            let max = self.expr(IrExpr::Size(r.max));
            parts.push(self.expr(IrExpr::Cmp(CmpOp::Le, tlen, max)));
        }
        if parts.is_empty() {
            return self.expr(IrExpr::Bool(true));
        }
        self.fold_binary(parts, IrExpr::And)
    }

    /// Run a string-value match switch and accept when any case
    /// matched: `ESEQ(MATCH m; M(m) != 0)`.
    fn string_match_expr(
        &mut self,
        id: CnodeId,
        cx: &mut FrameCx,
    ) -> Result<ExprId, CompileError> {
        let Cnode::MatchSwitch {
            dfa,
            cases,
            default,
        } = self.node(id).clone()
        else {
            unreachable!("caller matched MatchSwitch");
        };
        for &case in &cases {
            let Cnode::MatchCase {
                value_constraint, ..
            } = self.node(case)
            else {
                unreachable!("match switch children are cases");
            };
            if !matches!(self.node(*value_constraint), Cnode::Valid) {
                return Err(CompileError::Internal(
                    "string match case with a non-trivial body".to_string(),
                ));
            }
        }
        let Cnode::MatchCase {
            value_constraint, ..
        } = self.node(default)
        else {
            unreachable!("default is a case");
        };
        let default_accepts = matches!(self.node(*value_constraint), Cnode::Valid);

        // Cases accept; when the default also accepts there is nothing
        // left to test.
        if default_accepts {
            return Ok(self.expr(IrExpr::Bool(true)));
        }
        let Some(dfa) = dfa else {
            return Ok(self.expr(IrExpr::Bool(false)));
        };
        let dfa_index = self.prog.intern_dfa(dfa);
        let matcher = cx.matcher(dfa_index);

        let nop = self.stmt(IrStmt::Nop);
        let run = self.stmt(IrStmt::Match {
            matcher,
            cases: Vec::new(),
            default: nop,
        });
        let m = self.expr(IrExpr::Match(matcher));
        let zero = self.expr(IrExpr::Size(0));
        let cmp = self.expr(IrExpr::Cmp(CmpOp::Ne, m, zero));
        Ok(self.expr(IrExpr::SeqExpr(run, cmp)))
    }

    // ---- splits ------------------------------------------------------

    /// Group the children of a combinator for lock-step validation.
    fn combinator_groups(&self, id: CnodeId) -> Vec<(GroupOp, Vec<CnodeId>)> {
        match self.node(id) {
            Cnode::And(kids) => {
                let mut all: Vec<CnodeId> = Vec::new();
                let mut groups = Vec::new();
                for &kid in kids {
                    match self.node(kid) {
                        Cnode::Or(b) => groups.push((GroupOp::Any, b.to_vec())),
                        Cnode::Xor(b) => groups.push((GroupOp::One, b.to_vec())),
                        Cnode::Not(x) => groups.push((GroupOp::None, vec![*x])),
                        _ => all.push(kid),
                    }
                }
                if !all.is_empty() {
                    groups.insert(0, (GroupOp::All, all));
                }
                groups
            }
            Cnode::Or(kids) => vec![(GroupOp::Any, kids.to_vec())],
            Cnode::Xor(kids) => vec![(GroupOp::One, kids.to_vec())],
            Cnode::Not(x) => vec![(GroupOp::None, vec![*x])],
            _ => vec![(GroupOp::All, vec![id])],
        }
    }

    /// Whether validating this subtree consumes tokens (needs a
    /// callable frame rather than a pure expression).
    fn has_consuming(&self, id: CnodeId) -> bool {
        match self.node(id) {
            Cnode::Ref(_) | Cnode::Switch(_) => true,
            Cnode::And(kids) | Cnode::Or(kids) | Cnode::Xor(kids) => {
                kids.iter().any(|&k| self.has_consuming(k))
            }
            Cnode::Not(k) => self.has_consuming(*k),
            _ => false,
        }
    }

    /// Terminal statement running grouped branches in lock-step and
    /// asserting the group conditions. `main` contributes bit 0.
    fn fused_split(
        &mut self,
        groups: Vec<(GroupOp, Vec<CnodeId>)>,
        main: Option<FrameId>,
        wrap: SplitWrap,
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        // Count form: a single group and no main frame.
        if main.is_none() && groups.len() == 1 {
            let (op, branches) = &groups[0];
            let mut frames = Vec::with_capacity(branches.len());
            for &branch in branches {
                frames.push(self.branch_frame(branch, wrap)?);
            }
            let n = frames.len() as u64;
            let list = cx.split_list(frames);
            let split = self.expr(IrExpr::Split(list));
            let (cmp, want) = match op {
                GroupOp::All => (CmpOp::Eq, n),
                GroupOp::Any => (CmpOp::Ge, 1),
                GroupOp::One => (CmpOp::Eq, 1),
                GroupOp::None => (CmpOp::Eq, 0),
            };
            let want = self.expr(IrExpr::Size(want));
            let cond = self.expr(IrExpr::Cmp(cmp, split, want));
            let valid = self.stmt(IrStmt::Valid);
            let fail = self.invalid(ErrorCode::SplitCondition);
            return Ok(self.stmt(IrStmt::If(cond, valid, fail)));
        }

        let mut frames: Vec<FrameId> = Vec::new();
        let mut conds: Vec<ExprId> = Vec::new();
        if let Some(main) = main {
            frames.push(main);
        }

        // Bits are assigned in frame order; build the group masks as
        // the frames are appended.
        let mut pending: Vec<(GroupOp, std::ops::Range<u32>)> = Vec::new();
        for (op, branches) in &groups {
            let start = frames.len() as u32;
            for &branch in branches {
                frames.push(self.branch_frame(branch, wrap)?);
            }
            pending.push((*op, start..frames.len() as u32));
        }
        if frames.len() > 64 {
            return Err(CompileError::Internal(
                "split of more than 64 frames".to_string(),
            ));
        }

        let bitvec = cx.bitvec("splits", frames.len());
        if main.is_some() {
            conds.push(self.expr(IrExpr::BTest(bitvec, 0)));
        }
        for (op, range) in pending {
            let mask = mask_of(range.clone());
            let cond = match op {
                GroupOp::All => {
                    let bits: Vec<ExprId> = range
                        .clone()
                        .map(|bit| self.expr(IrExpr::BTest(bitvec, bit)))
                        .collect();
                    self.fold_binary(bits, IrExpr::And)
                }
                GroupOp::Any => self.expr(IrExpr::BTestAny(bitvec, mask)),
                GroupOp::One => self.expr(IrExpr::BTestOne(bitvec, mask)),
                GroupOp::None => {
                    let any = self.expr(IrExpr::BTestAny(bitvec, mask));
                    self.expr(IrExpr::Not(any))
                }
            };
            conds.push(cond);
        }

        let list = cx.split_list(frames);
        let split = self.stmt(IrStmt::SplitVec { list, bitvec });
        let cond = self.fold_binary(conds, IrExpr::And);
        let valid = self.stmt(IrStmt::Valid);
        let fail = self.invalid(ErrorCode::SplitCondition);
        let check = self.stmt(IrStmt::If(cond, valid, fail));
        Ok(self.seq(vec![split, check]))
    }

    /// A callable frame for one split branch.
    fn branch_frame(&mut self, id: CnodeId, wrap: SplitWrap) -> Result<FrameId, CompileError> {
        let is_ref = matches!(self.node(id), Cnode::Ref(_));
        match wrap {
            SplitWrap::Value => self.new_value_frame(&[id]),
            _ if is_ref => self.new_value_frame(&[id]),
            SplitWrap::ObjectRest => self.new_rest_frame(EventKind::ObjectBeg, id),
            SplitWrap::ArrayRest => self.new_rest_frame(EventKind::ArrayBeg, id),
        }
    }

    /// A frame validating a composite value from its opening token,
    /// for branches extracted from an object or array slot.
    fn new_rest_frame(&mut self, kind: EventKind, id: CnodeId) -> Result<FrameId, CompileError> {
        let mut cx = FrameCx::default();
        let inner = match kind {
            EventKind::ObjectBeg => self.object_slot_body(id, &mut cx)?,
            _ => self.array_slot_body(id, &mut cx)?,
        };
        let token = self.stmt(IrStmt::Token);
        let cond = self.expr(IrExpr::IsTok(kind));
        let fail = self.invalid(ErrorCode::UnexpectedToken);
        let dispatch = self.stmt(IrStmt::If(cond, inner, fail));
        let body = self.seq(vec![token, dispatch]);
        Ok(self.push_frame(cx.into_frame(FrameBody::Tree(body))))
    }

    // ---- objects -----------------------------------------------------

    fn object_slot_body(&mut self, id: CnodeId, cx: &mut FrameCx) -> Result<StmtId, CompileError> {
        if matches!(self.node(id), Cnode::Valid) {
            return Ok(self.stmt(IrStmt::Valid));
        }
        if matches!(self.node(id), Cnode::Invalid) {
            return Ok(self.invalid(ErrorCode::UnexpectedToken));
        }

        let parts = self.object_parts(id)?;
        if parts.combinators.is_empty() {
            return self.inline_object_body(&parts, cx);
        }

        // All object work fuses into one lock-step split: the inline
        // constraints (if any) become a synthesized main frame, each
        // combinator child a group of branch frames.
        let main = if parts.has_inline() {
            let mut mcx = FrameCx::default();
            let inner = self.inline_object_body(&parts, &mut mcx)?;
            let token = self.stmt(IrStmt::Token);
            let cond = self.expr(IrExpr::IsTok(EventKind::ObjectBeg));
            let fail = self.invalid(ErrorCode::UnexpectedToken);
            let dispatch = self.stmt(IrStmt::If(cond, inner, fail));
            let body = self.seq(vec![token, dispatch]);
            Some(self.push_frame(mcx.into_frame(FrameBody::Tree(body))))
        } else {
            None
        };

        let mut groups = Vec::new();
        for &kid in &parts.combinators {
            groups.extend(self.combinator_groups(kid));
        }
        self.fused_split(groups, main, SplitWrap::ObjectRest, cx)
    }

    fn object_parts(&mut self, id: CnodeId) -> Result<ObjectParts, CompileError> {
        let mut parts = ObjectParts::default();
        let kids: Vec<CnodeId> = match self.node(id) {
            Cnode::And(kids) => kids.to_vec(),
            _ => vec![id],
        };
        for kid in kids {
            match self.node(kid).clone() {
                Cnode::ReqMask { nbits } => parts.mask = Some(nbits),
                Cnode::MatchSwitch { .. } => parts.mswitch = Some(kid),
                Cnode::CountRange(CountKind::Props, r) => parts.counts = Some(r),
                Cnode::Or(_) | Cnode::Xor(_) | Cnode::Not(_) | Cnode::Ref(_) => {
                    parts.combinators.push(kid)
                }
                other => {
                    return Err(CompileError::Internal(format!(
                        "unexpected object constraint {other:?}"
                    )))
                }
            }
        }
        Ok(parts)
    }

    /// The canonical object loop.
    fn inline_object_body(
        &mut self,
        parts: &ObjectParts,
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        let counter = parts.counts.map(|_| cx.counter("num_props"));
        let bitvec = parts.mask.map(|nbits| cx.bitvec("reqmask", nbits));

        let prop_part = match parts.mswitch {
            Some(ms) => self.match_part(ms, bitvec, cx)?,
            None => self.stmt(IrStmt::Consume),
        };

        let loop_index = cx.loop_index();
        let token = self.stmt(IrStmt::Token);
        let brk = self.stmt(IrStmt::Break(loop_index));
        let iteration = match counter {
            Some(c) => {
                let incr = self.stmt(IrStmt::Incr(c));
                self.seq(vec![prop_part, incr])
            }
            None => prop_part,
        };
        let is_end = self.expr(IrExpr::IsTok(EventKind::ObjectEnd));
        let step = self.stmt(IrStmt::If(is_end, brk, iteration));
        let looped = self.stmt(IrStmt::Loop(loop_index, vec![token, step]));

        // Post-loop checks, then VALID.
        let mut checks: Vec<(ExprId, ErrorCode)> = Vec::new();
        if let (Some(c), Some(r)) = (counter, parts.counts) {
            checks.extend(self.count_checks(c, &r, ErrorCode::TooFewProps, ErrorCode::TooManyProps));
        }
        if let Some(bv) = bitvec {
            let all = self.expr(IrExpr::BTestAll(bv));
            checks.push((all, ErrorCode::MissingRequiredProperties));
        }
        let mut tail = self.stmt(IrStmt::Valid);
        for (cond, code) in checks.into_iter().rev() {
            let fail = self.invalid(code);
            tail = self.stmt(IrStmt::If(cond, tail, fail));
        }
        Ok(self.seq(vec![looped, tail]))
    }

    fn count_checks(
        &mut self,
        counter: usize,
        r: &CountRange,
        low: ErrorCode,
        high: ErrorCode,
    ) -> Vec<(ExprId, ErrorCode)> {
        let mut checks = Vec::new();
        if r.min > 0 {
            let count = self.expr(IrExpr::Count(counter));
            let min = self.expr(IrExpr::Size(r.min));
            checks.push((self.expr(IrExpr::Cmp(CmpOp::Ge, count, min)), low));
        }
        if r.upper {
            let count = self.expr(IrExpr::Count(counter));
            let max = self.expr(IrExpr::Size(r.max));
            checks.push((self.expr(IrExpr::Cmp(CmpOp::Le, count, max)), high));
        }
        checks
    }

    /// Property-name dispatch inside the object loop.
    fn match_part(
        &mut self,
        ms: CnodeId,
        bitvec: Option<usize>,
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        let Cnode::MatchSwitch {
            dfa,
            default,
            cases,
        } = self.node(ms).clone()
        else {
            unreachable!("caller matched MatchSwitch");
        };

        let default_body = self.case_body(default, bitvec, cx)?;
        let Some(dfa) = dfa else {
            return Ok(default_body);
        };

        let dfa_index = self.prog.intern_dfa(dfa);
        let matcher = cx.matcher(dfa_index);
        let mut arms = Vec::with_capacity(cases.len());
        for (i, &case) in cases.iter().enumerate() {
            let body = self.case_body(case, bitvec, cx)?;
            arms.push((i as u32 + 1, body));
        }
        Ok(self.stmt(IrStmt::Match {
            matcher,
            cases: arms,
            default: default_body,
        }))
    }

    /// One match case: name checks, required marks, then the value.
    fn case_body(
        &mut self,
        case: CnodeId,
        bitvec: Option<usize>,
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        let Cnode::MatchCase {
            name_constraint,
            value_constraint,
            ..
        } = self.node(case).clone()
        else {
            unreachable!("match switch children are cases");
        };

        let (bits, remaining) = self.strip_reqbits(value_constraint);

        let mut stmts: Vec<StmtId> = Vec::new();
        for bit in bits {
            let bv = bitvec.ok_or_else(|| {
                CompileError::Internal("required bit outside a masked scope".to_string())
            })?;
            stmts.push(self.stmt(IrStmt::Bset(bv, bit)));
        }

        let value_part = if remaining.is_empty() {
            self.stmt(IrStmt::Consume)
        } else if remaining.len() == 1 && matches!(self.node(remaining[0]), Cnode::Valid) {
            self.stmt(IrStmt::Consume)
        } else if remaining.len() == 1 && matches!(self.node(remaining[0]), Cnode::Invalid) {
            self.invalid(ErrorCode::BadPropertyName)
        } else {
            // A single constraint calls its value frame; overlapping
            // patterns run every matched entry in lock-step.
            let frame = self.new_value_frame(&remaining)?;
            self.stmt(IrStmt::Call(frame))
        };
        stmts.push(value_part);
        let mut body = self.seq(stmts);

        if let Some(nc) = name_constraint {
            let cond = self.name_check_expr(nc, cx)?;
            let fail = self.invalid(ErrorCode::BadPropertyName);
            body = self.stmt(IrStmt::If(cond, body, fail));
        }
        Ok(body)
    }

    /// Evaluate a name constraint against the current name token.
    fn name_check_expr(&mut self, id: CnodeId, cx: &mut FrameCx) -> Result<ExprId, CompileError> {
        self.pure_expr(id, cx)
    }

    /// Split required-bit marks off a case's value constraint.
    fn strip_reqbits(&mut self, id: CnodeId) -> (Vec<u32>, Vec<CnodeId>) {
        match self.node(id).clone() {
            Cnode::ReqBit { bit } => (vec![bit as u32], Vec::new()),
            Cnode::And(kids) => {
                let mut bits = Vec::new();
                let mut rest = Vec::new();
                for kid in kids {
                    match self.node(kid) {
                        Cnode::ReqBit { bit } => bits.push(*bit as u32),
                        _ => rest.push(kid),
                    }
                }
                (bits, rest)
            }
            _ => (Vec::new(), vec![id]),
        }
    }

    // ---- arrays ------------------------------------------------------

    fn array_slot_body(&mut self, id: CnodeId, cx: &mut FrameCx) -> Result<StmtId, CompileError> {
        if matches!(self.node(id), Cnode::Valid) {
            return Ok(self.stmt(IrStmt::Valid));
        }
        if matches!(self.node(id), Cnode::Invalid) {
            return Ok(self.invalid(ErrorCode::UnexpectedToken));
        }

        let parts = self.array_parts(id)?;
        if !parts.combinators.is_empty() {
            let main = if parts.has_inline() {
                let mut mcx = FrameCx::default();
                let inner = self.inline_array_body(&parts, &mut mcx)?;
                let token = self.stmt(IrStmt::Token);
                let cond = self.expr(IrExpr::IsTok(EventKind::ArrayBeg));
                let fail = self.invalid(ErrorCode::UnexpectedToken);
                let dispatch = self.stmt(IrStmt::If(cond, inner, fail));
                let body = self.seq(vec![token, dispatch]);
                Some(self.push_frame(mcx.into_frame(FrameBody::Tree(body))))
            } else {
                None
            };
            let mut groups = Vec::new();
            for &kid in &parts.combinators {
                groups.extend(self.combinator_groups(kid));
            }
            return self.fused_split(groups, main, SplitWrap::ArrayRest, cx);
        }

        self.inline_array_body(&parts, cx)
    }

    fn array_parts(&mut self, id: CnodeId) -> Result<ArrayParts, CompileError> {
        let mut parts = ArrayParts::default();
        let kids: Vec<CnodeId> = match self.node(id) {
            Cnode::And(kids) => kids.to_vec(),
            _ => vec![id],
        };
        for kid in kids {
            match self.node(kid).clone() {
                Cnode::ArrItem { items, additional } => {
                    parts.items = items;
                    parts.additional = additional;
                    parts.has_items = true;
                }
                Cnode::CountRange(CountKind::Items, r) => parts.counts = Some(r),
                Cnode::ArrUnique => parts.unique = true,
                Cnode::ArrContains(sub) => parts.contains = Some(sub),
                Cnode::Or(_) | Cnode::Xor(_) | Cnode::Not(_) | Cnode::Ref(_) => {
                    parts.combinators.push(kid)
                }
                other => {
                    return Err(CompileError::Internal(format!(
                        "unexpected array constraint {other:?}"
                    )))
                }
            }
        }
        Ok(parts)
    }

    /// The canonical array loop. Items are validated by lock-step
    /// frames that receive the item's first token as their first
    /// fetch; a `uniqueItems` assertion arms the tracker before the
    /// loop starts.
    fn inline_array_body(
        &mut self,
        parts: &ArrayParts,
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        let need_counter = parts.counts.is_some() || !parts.items.is_empty();
        let counter = need_counter.then(|| cx.counter("num_items"));
        let contains_bit = parts.contains.map(|_| cx.bitvec("contains", 1));

        // Per-index item validation: tuple entries first, then the
        // trailing-items constraint.
        let trailing = self.item_part(parts.additional, true, parts.contains, contains_bit, cx)?;
        let mut item_part = trailing;
        for (index, &item) in parts.items.iter().enumerate().rev() {
            let this = self.item_part(Some(item), false, parts.contains, contains_bit, cx)?;
            let count = self.expr(IrExpr::Count(
                counter.expect("tuple items imply a counter"),
            ));
            let want = self.expr(IrExpr::Size(index as u64));
            let cond = self.expr(IrExpr::Cmp(CmpOp::Eq, count, want));
            item_part = self.stmt(IrStmt::If(cond, this, item_part));
        }

        let loop_index = cx.loop_index();
        let token = self.stmt(IrStmt::Token);
        let brk = self.stmt(IrStmt::Break(loop_index));
        let iteration = match counter {
            Some(c) => {
                let incr = self.stmt(IrStmt::Incr(c));
                self.seq(vec![item_part, incr])
            }
            None => item_part,
        };
        let is_end = self.expr(IrExpr::IsTok(EventKind::ArrayEnd));
        let step = self.stmt(IrStmt::If(is_end, brk, iteration));
        let looped = self.stmt(IrStmt::Loop(loop_index, vec![token, step]));

        let mut checks: Vec<(ExprId, ErrorCode)> = Vec::new();
        if let (Some(c), Some(r)) = (counter, parts.counts) {
            checks.extend(self.count_checks(c, &r, ErrorCode::TooFewItems, ErrorCode::TooManyItems));
        }
        if let Some(bv) = contains_bit {
            let hit = self.expr(IrExpr::BTest(bv, 0));
            checks.push((hit, ErrorCode::SplitCondition));
        }
        let mut tail = self.stmt(IrStmt::Valid);
        for (cond, code) in checks.into_iter().rev() {
            let fail = self.invalid(code);
            tail = self.stmt(IrStmt::If(cond, tail, fail));
        }

        let mut stmts = Vec::new();
        if parts.unique {
            stmts.push(self.stmt(IrStmt::Unique));
        }
        stmts.push(looped);
        stmts.push(tail);
        Ok(self.seq(stmts))
    }

    /// Validation of one array item whose first token is current.
    fn item_part(
        &mut self,
        constraint: Option<CnodeId>,
        trailing: bool,
        contains: Option<CnodeId>,
        contains_bit: Option<usize>,
        cx: &mut FrameCx,
    ) -> Result<StmtId, CompileError> {
        let trivial = match constraint {
            None => true,
            Some(c) => matches!(self.node(c), Cnode::Valid),
        };
        if let Some(c) = constraint {
            if matches!(self.node(c), Cnode::Invalid) {
                // additionalItems: false past the tuple end.
                let code = if trailing {
                    ErrorCode::TooManyItems
                } else {
                    ErrorCode::UnexpectedToken
                };
                return Ok(self.invalid(code));
            }
        }

        let mut frames: Vec<FrameId> = Vec::new();
        let mut item_bit: Option<u32> = None;
        if !trivial {
            item_bit = Some(frames.len() as u32);
            frames.push(self.new_value_frame(&[constraint.expect("non-trivial item")])?);
        }
        let mut contains_idx: Option<u32> = None;
        if let Some(sub) = contains {
            contains_idx = Some(frames.len() as u32);
            frames.push(self.new_value_frame(&[sub])?);
        }

        if frames.is_empty() {
            // Unconstrained item: scalars are already consumed; a
            // composite is drained by a trivial lock-step frame.
            let consume = self.consume_value_frame();
            let list = cx.split_list(vec![consume]);
            let split = self.expr(IrExpr::Split(list));
            let one = self.expr(IrExpr::Size(1));
            let cond = self.expr(IrExpr::Cmp(CmpOp::Eq, split, one));
            let nop = self.stmt(IrStmt::Nop);
            let fail = self.invalid(ErrorCode::SplitCondition);
            let drain = self.stmt(IrStmt::If(cond, nop, fail));
            let obj = self.expr(IrExpr::IsTok(EventKind::ObjectBeg));
            let arr = self.expr(IrExpr::IsTok(EventKind::ArrayBeg));
            let opens = self.expr(IrExpr::Or(obj, arr));
            let skip = self.stmt(IrStmt::Nop);
            return Ok(self.stmt(IrStmt::If(opens, drain, skip)));
        }

        let bitvec = cx.bitvec("item", frames.len());
        let list = cx.split_list(frames);
        let split = self.stmt(IrStmt::SplitVec { list, bitvec });

        let mut stmts = vec![split];
        if let Some(idx) = contains_idx {
            let hit = self.expr(IrExpr::BTest(bitvec, idx));
            let mark = self.stmt(IrStmt::Bset(
                contains_bit.expect("contains constraint declares its bit"),
                0,
            ));
            let nop = self.stmt(IrStmt::Nop);
            stmts.push(self.stmt(IrStmt::If(hit, mark, nop)));
        }
        if let Some(bit) = item_bit {
            let ok = self.expr(IrExpr::BTest(bitvec, bit));
            let nop = self.stmt(IrStmt::Nop);
            let fail = self.invalid(ErrorCode::SplitCondition);
            stmts.push(self.stmt(IrStmt::If(ok, nop, fail)));
        }
        Ok(self.seq(stmts))
    }
}

/// How split branches re-enter the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitWrap {
    /// Branches validate a whole value.
    Value,
    /// Branches validate an object from its `{`.
    ObjectRest,
    /// Branches validate an array from its `[`.
    ArrayRest,
}

#[derive(Default)]
struct ObjectParts {
    mask: Option<usize>,
    mswitch: Option<CnodeId>,
    counts: Option<CountRange>,
    combinators: Vec<CnodeId>,
}

impl ObjectParts {
    fn has_inline(&self) -> bool {
        self.mask.is_some() || self.mswitch.is_some() || self.counts.is_some()
    }
}

#[derive(Default)]
struct ArrayParts {
    items: Vec<CnodeId>,
    additional: Option<CnodeId>,
    has_items: bool,
    counts: Option<CountRange>,
    unique: bool,
    contains: Option<CnodeId>,
    combinators: Vec<CnodeId>,
}

impl ArrayParts {
    fn has_inline(&self) -> bool {
        self.has_items || self.counts.is_some() || self.unique || self.contains.is_some()
    }
}

fn mask_of(range: std::ops::Range<u32>) -> u64 {
    let mut mask = 0u64;
    for bit in range {
        mask |= 1 << bit;
    }
    mask
}
