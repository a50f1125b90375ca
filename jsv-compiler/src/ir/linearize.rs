//! Tree IR → basic blocks.
//!
//! Rewrites each frame's structured body into a list of labeled
//! blocks joined by `Branch`/`CBranch`, and resolves `CallId`
//! references to frame indices. `Valid`/`Invalid` are terminators;
//! statements after them are dead and dropped, and no empty blocks
//! are emitted.

use crate::CompileError;

use super::{CmpOp, FrameBody, FrameId, IrExpr, IrProgram, IrStmt, StmtId};

/// Linearize every frame of the program in place.
pub fn linearize(prog: &mut IrProgram) -> Result<(), CompileError> {
    for index in 0..prog.frames.len() {
        let body = prog.frames[index].body.clone();
        let root = match body {
            FrameBody::Tree(root) => root,
            FrameBody::Blocks(_) => continue,
        };
        let blocks = {
            let mut lin = Linearizer {
                prog: &mut *prog,
                blocks: Vec::new(),
                cur_label: 0,
                cur: Vec::new(),
                next_label: 1,
                terminated: false,
                loops: Vec::new(),
            };
            lin.emit(root)?;
            if !lin.terminated {
                // An empty or fully-simplified body still returns.
                let valid = lin.prog.stmt(IrStmt::Valid);
                lin.cur.push(valid);
            }
            lin.finish()
        };

        let block_stmts: Vec<StmtId> = blocks
            .into_iter()
            .map(|(label, stmts)| prog.stmt(IrStmt::Block(label, stmts)))
            .collect();
        prog.frames[index].body = FrameBody::Blocks(block_stmts);
    }
    Ok(())
}

struct Linearizer<'p> {
    prog: &'p mut IrProgram,
    blocks: Vec<(u32, Vec<StmtId>)>,
    cur_label: u32,
    cur: Vec<StmtId>,
    next_label: u32,
    terminated: bool,
    /// Stack of (loop index, exit label, header label).
    loops: Vec<(u32, u32, u32)>,
}

impl Linearizer<'_> {
    fn fresh(&mut self) -> u32 {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    /// Seal the current block and start a new one at `label`.
    fn start_block(&mut self, label: u32) {
        let stmts = std::mem::take(&mut self.cur);
        self.blocks.push((self.cur_label, stmts));
        self.cur_label = label;
        self.terminated = false;
    }

    fn finish(mut self) -> Vec<(u32, Vec<StmtId>)> {
        let stmts = std::mem::take(&mut self.cur);
        self.blocks.push((self.cur_label, stmts));

        // Fold empty blocks: unreferenced ones disappear, referenced
        // ones fall through to the lexically next block.
        let referenced = |blocks: &[(u32, Vec<StmtId>)], prog: &IrProgram, label: u32| {
            blocks.iter().any(|(_, stmts)| {
                stmts.iter().any(|&s| match &prog[s] {
                    IrStmt::Branch(l) => *l == label,
                    IrStmt::CBranch(_, t, e) => *t == label || *e == label,
                    _ => false,
                })
            })
        };

        loop {
            let Some(pos) = self.blocks.iter().position(|(_, stmts)| stmts.is_empty()) else {
                break;
            };
            let label = self.blocks[pos].0;
            if referenced(&self.blocks, self.prog, label) {
                if let Some(next) = self.blocks.get(pos + 1) {
                    let target = next.0;
                    let branch = self.prog.stmt(IrStmt::Branch(target));
                    self.blocks[pos].1.push(branch);
                } else {
                    let valid = self.prog.stmt(IrStmt::Valid);
                    self.blocks[pos].1.push(valid);
                }
            } else {
                self.blocks.remove(pos);
            }
        }
        self.blocks
    }

    fn emit(&mut self, id: StmtId) -> Result<(), CompileError> {
        if self.terminated {
            return Ok(());
        }
        let stmt = self.prog[id].clone();
        match stmt {
            IrStmt::Nop => {}
            IrStmt::Seq(stmts) => {
                for s in stmts {
                    self.emit(s)?;
                }
            }
            IrStmt::Valid | IrStmt::Invalid(_) => {
                self.cur.push(id);
                self.terminated = true;
            }
            IrStmt::If(cond, then_, else_) => {
                let then_l = self.fresh();
                let else_l = self.fresh();
                let join_l = self.fresh();

                let cbr = self.prog.stmt(IrStmt::CBranch(cond, then_l, else_l));
                self.cur.push(cbr);

                self.start_block(then_l);
                self.emit(then_)?;
                let then_done = self.terminated;
                if !then_done {
                    let br = self.prog.stmt(IrStmt::Branch(join_l));
                    self.cur.push(br);
                }

                self.start_block(else_l);
                self.emit(else_)?;
                let else_done = self.terminated;
                if !else_done {
                    let br = self.prog.stmt(IrStmt::Branch(join_l));
                    self.cur.push(br);
                }

                self.start_block(join_l);
                self.terminated = then_done && else_done;
            }
            IrStmt::Loop(index, body) => {
                let header_l = self.fresh();
                let exit_l = self.fresh();

                let br = self.prog.stmt(IrStmt::Branch(header_l));
                self.cur.push(br);

                self.start_block(header_l);
                self.loops.push((index, exit_l, header_l));
                for s in body {
                    self.emit(s)?;
                }
                if !self.terminated {
                    let back = self.prog.stmt(IrStmt::Branch(header_l));
                    self.cur.push(back);
                }
                self.loops.pop();

                self.start_block(exit_l);
            }
            IrStmt::Break(index) => {
                let (_, exit_l, _) = *self
                    .loops
                    .iter()
                    .rev()
                    .find(|(i, _, _)| *i == index)
                    .ok_or_else(|| {
                        CompileError::Internal(format!("break outside loop {index}"))
                    })?;
                let br = self.prog.stmt(IrStmt::Branch(exit_l));
                self.cur.push(br);
                self.terminated = true;
            }
            IrStmt::Match {
                matcher,
                cases,
                default,
            } => {
                if cases.is_empty() {
                    // Run-only match (string values); keep as-is.
                    self.cur.push(id);
                    return Ok(());
                }

                // Run the matcher, then dispatch on the case register
                // with an equality chain.
                let nop = self.prog.stmt(IrStmt::Nop);
                let run = self.prog.stmt(IrStmt::Match {
                    matcher,
                    cases: Vec::new(),
                    default: nop,
                });
                self.cur.push(run);

                let case_labels: Vec<u32> = cases.iter().map(|_| self.fresh()).collect();
                let default_l = self.fresh();
                let join_l = self.fresh();

                for (i, (which, _)) in cases.iter().enumerate() {
                    let m = self.prog.expr(IrExpr::Match(matcher));
                    let want = self.prog.expr(IrExpr::Size(*which as u64));
                    let eq = self.prog.expr(IrExpr::Cmp(CmpOp::Eq, m, want));
                    let next_test = if i + 1 < cases.len() {
                        self.fresh()
                    } else {
                        default_l
                    };
                    let cbr = self.prog.stmt(IrStmt::CBranch(eq, case_labels[i], next_test));
                    self.cur.push(cbr);
                    if i + 1 < cases.len() {
                        self.start_block(next_test);
                    }
                }

                let mut all_done = true;
                for ((_, body), label) in cases.iter().zip(&case_labels) {
                    self.start_block(*label);
                    self.emit(*body)?;
                    if !self.terminated {
                        all_done = false;
                        let br = self.prog.stmt(IrStmt::Branch(join_l));
                        self.cur.push(br);
                    }
                }
                self.start_block(default_l);
                self.emit(default)?;
                if !self.terminated {
                    all_done = false;
                    let br = self.prog.stmt(IrStmt::Branch(join_l));
                    self.cur.push(br);
                }

                self.start_block(join_l);
                self.terminated = all_done;
            }
            IrStmt::CallId(label) => {
                let frame = self.resolve(&label)?;
                let call = self.prog.stmt(IrStmt::Call(frame));
                self.cur.push(call);
            }
            IrStmt::Token
            | IrStmt::Consume
            | IrStmt::Unique
            | IrStmt::Bset(..)
            | IrStmt::Bclear(..)
            | IrStmt::Incr(_)
            | IrStmt::Move(..)
            | IrStmt::Call(_)
            | IrStmt::SplitVec { .. } => {
                self.cur.push(id);
            }
            IrStmt::Block(..) | IrStmt::Branch(_) | IrStmt::CBranch(..) => {
                return Err(CompileError::Internal(
                    "frame body is already linear".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn resolve(&self, label: &str) -> Result<FrameId, CompileError> {
        self.prog
            .tree_labels
            .get(label)
            .copied()
            .ok_or_else(|| CompileError::UnresolvedRef(label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnode::{canonify, simplify, translate};
    use jsv_asm::ErrorCode;
    use serde_json::json;

    fn linear_program(schema: serde_json::Value) -> IrProgram {
        let forest = translate(&schema).expect("translate");
        let forest = simplify(&forest);
        let forest = canonify(&forest).expect("canonify");
        let mut prog = super::super::translate_ir(&forest).expect("ir translate");
        linearize(&mut prog).expect("linearize");
        prog
    }

    fn frame_blocks(prog: &IrProgram, frame: usize) -> Vec<StmtId> {
        match &prog.frames[frame].body {
            FrameBody::Blocks(blocks) => blocks.clone(),
            FrameBody::Tree(_) => panic!("frame {frame} not linearized"),
        }
    }

    /// No structured statements survive, every branch target exists,
    /// every block is terminated, every call target is a real frame.
    fn check_invariants(prog: &IrProgram) {
        for findex in 0..prog.frames.len() {
            let blocks = frame_blocks(prog, findex);
            assert!(!blocks.is_empty());

            let mut labels = Vec::new();
            for &b in &blocks {
                let IrStmt::Block(label, _) = &prog[b] else {
                    panic!("frame body entry is not a block");
                };
                labels.push(*label);
            }

            for &b in &blocks {
                let IrStmt::Block(_, stmts) = &prog[b] else {
                    unreachable!();
                };
                assert!(!stmts.is_empty(), "empty block emitted");
                for (i, &s) in stmts.iter().enumerate() {
                    let last = i + 1 == stmts.len();
                    match &prog[s] {
                        IrStmt::If(..)
                        | IrStmt::Seq(_)
                        | IrStmt::Loop(..)
                        | IrStmt::Break(_)
                        | IrStmt::CallId(_)
                        | IrStmt::Block(..) => {
                            panic!("structured statement survived linearization")
                        }
                        IrStmt::Match { cases, .. } => assert!(cases.is_empty()),
                        IrStmt::Branch(l) => {
                            assert!(last, "branch in block interior");
                            assert!(labels.contains(l), "dangling branch target");
                        }
                        IrStmt::CBranch(_, t, e) => {
                            assert!(last, "cbranch in block interior");
                            assert!(labels.contains(t) && labels.contains(e));
                        }
                        IrStmt::Valid | IrStmt::Invalid(_) => {
                            assert!(last, "terminator in block interior")
                        }
                        IrStmt::Call(f) => assert!(f.index() < prog.frames.len()),
                        _ => {}
                    }
                }
                let &last = stmts.last().unwrap();
                assert!(
                    matches!(
                        prog[last],
                        IrStmt::Branch(_)
                            | IrStmt::CBranch(..)
                            | IrStmt::Valid
                            | IrStmt::Invalid(_)
                    ),
                    "block does not end in a terminator"
                );
            }
        }
    }

    #[test]
    fn empty_schema_linearizes_to_terminated_blocks() {
        let prog = linear_program(json!({}));
        check_invariants(&prog);
        assert_eq!(prog.frames.len(), 1);
    }

    #[test]
    fn scenarios_preserve_invariants() {
        for schema in [
            json!({"type": "number"}),
            json!({"type": "integer"}),
            json!({"minimum": 1.1}),
            json!({"properties": {"foo": {"type": "number"}, "bar": {"type": "string"}},
                   "required": ["foo"]}),
            json!({"dependencies": {"bar": ["foo"]}}),
            json!({"uniqueItems": true}),
            json!({"properties": {"foo": {"$ref": "#"}}}),
            json!({"oneOf": [{"type": "integer"}, {"minimum": 2}]}),
            json!({"items": [{"type": "number"}, {"type": "string"}],
                   "additionalItems": false, "minItems": 1}),
            json!({"contains": {"type": "number"}, "maxItems": 4}),
            json!({"propertyNames": {"maxLength": 3}, "minProperties": 1}),
            json!({"not": {"type": "string"}}),
            json!({"enum": ["a", "b", 3]}),
        ] {
            let prog = linear_program(schema.clone());
            check_invariants(&prog);
        }
    }

    #[test]
    fn ref_calls_resolve_to_frames() {
        let prog = linear_program(json!({"properties": {"foo": {"$ref": "#"}}}));
        // Root tree plus the property-value frame for foo.
        assert!(prog.frames.len() >= 2);
        let mut found_call = false;
        for findex in 0..prog.frames.len() {
            for &b in &frame_blocks(&prog, findex) {
                let IrStmt::Block(_, stmts) = &prog[b] else {
                    unreachable!();
                };
                for &s in stmts {
                    if let IrStmt::Call(target) = &prog[s] {
                        assert!(target.index() < prog.frames.len());
                        found_call = true;
                    }
                }
            }
        }
        assert!(found_call, "recursive ref must lower to a call");
    }

    #[test]
    fn object_loop_has_back_edge() {
        let prog = linear_program(json!({"properties": {"a": {"type": "number"}}}));
        let blocks = frame_blocks(&prog, 0);
        let mut labels = Vec::new();
        for &b in &blocks {
            let IrStmt::Block(label, _) = &prog[b] else {
                unreachable!();
            };
            labels.push(*label);
        }
        // Some block branches to an earlier-or-equal label: the loop
        // back edge.
        let mut has_back_edge = false;
        for (pos, &b) in blocks.iter().enumerate() {
            let IrStmt::Block(_, stmts) = &prog[b] else {
                unreachable!();
            };
            for &s in stmts {
                if let IrStmt::Branch(target) = &prog[s] {
                    let target_pos = labels.iter().position(|l| l == target).unwrap();
                    if target_pos <= pos {
                        has_back_edge = true;
                    }
                }
            }
        }
        assert!(has_back_edge);
    }

    #[test]
    fn invalid_code_is_preserved() {
        let prog = linear_program(json!({"type": "integer"}));
        let mut codes = Vec::new();
        for &b in &frame_blocks(&prog, 0) {
            let IrStmt::Block(_, stmts) = &prog[b] else {
                unreachable!();
            };
            for &s in stmts {
                if let IrStmt::Invalid(code) = &prog[s] {
                    codes.push(*code);
                }
            }
        }
        assert!(codes.contains(&ErrorCode::NotInteger));
        assert!(codes.contains(&ErrorCode::UnexpectedToken));
    }
}
