//! Op assembly → byte-code.
//!
//! Resolves labels and proc references to pc-relative deltas, packs
//! every instruction into 32 bits, and lays the split descriptors out
//! in the prefix-sum table format. Encodability is asserted here:
//! literals, slots and pool indices must fit their fields and branch
//! deltas their ranges.

use std::collections::HashMap;

use jsv_asm::{
    Arg, BranchCond, Instruction, Opcode, VmProgram, CALL_DELTA_MAX, CALL_DELTA_MIN,
    JMP_DELTA_MAX, JMP_DELTA_MIN, LIT_MAX, LIT_MIN, POOL_MAX, SLOT_MAX,
};

use crate::CompileError;

use super::{OpArg, OpProgram};

/// Encode an assembled program.
pub fn encode(asm: &OpProgram) -> Result<VmProgram, CompileError> {
    // First pass: code offsets for procs and labels.
    let mut proc_offsets = Vec::with_capacity(asm.procs.len());
    let mut label_offsets: Vec<HashMap<u32, u32>> = Vec::with_capacity(asm.procs.len());
    let mut off: u32 = 0;
    for proc in &asm.procs {
        proc_offsets.push(off);
        let mut labels = HashMap::new();
        for instr in &proc.body {
            if let Some(label) = instr.label {
                labels.insert(label, off);
            }
            off += 1;
        }
        label_offsets.push(labels);
    }

    // Second pass: pack.
    let mut code: Vec<u32> = Vec::with_capacity(off as usize);
    for (pindex, proc) in asm.procs.iter().enumerate() {
        for instr in &proc.body {
            let pc = code.len() as u32;
            let word = match instr.op {
                Opcode::Jmp => {
                    let (cond, target) = match instr.args {
                        [OpArg::Cond(c), OpArg::Label(l)] => (c, l),
                        _ => {
                            return Err(CompileError::Internal(
                                "malformed JMP arguments".to_string(),
                            ))
                        }
                    };
                    let target_off = *label_offsets[pindex].get(&target).ok_or_else(|| {
                        CompileError::Internal(format!("unresolved label L{target}"))
                    })?;
                    let delta = target_off as i64 - pc as i64;
                    if !(JMP_DELTA_MIN as i64..=JMP_DELTA_MAX as i64).contains(&delta) {
                        return Err(CompileError::BranchOutOfRange(delta));
                    }
                    Instruction::jmp(cond, delta as i32)
                }
                Opcode::Call => {
                    let target = match instr.args {
                        [OpArg::Proc(p), _] => p,
                        _ => {
                            return Err(CompileError::Internal(
                                "malformed CALL arguments".to_string(),
                            ))
                        }
                    };
                    let target_off = *proc_offsets.get(target).ok_or_else(|| {
                        CompileError::Internal(format!("call to missing proc {target}"))
                    })? as i64;
                    let delta = target_off - pc as i64;
                    if !(CALL_DELTA_MIN as i64..=CALL_DELTA_MAX as i64).contains(&delta) {
                        return Err(CompileError::BranchOutOfRange(delta));
                    }
                    Instruction::call(delta as i32)
                }
                op => {
                    let a = encode_arg(&instr.args[0])?;
                    let b = encode_arg(&instr.args[1])?;
                    if !a.fits_arg0() {
                        return Err(CompileError::Internal(
                            "first argument does not fit its field".to_string(),
                        ));
                    }
                    Instruction::new(op, a, b)
                }
            };
            code.push(word.to_u32());
        }
    }

    // Split descriptors become code offsets of their procs.
    let lists: Vec<Vec<u32>> = asm
        .splits
        .iter()
        .map(|procs| procs.iter().map(|&p| proc_offsets[p]).collect())
        .collect();

    Ok(VmProgram {
        code,
        fpool: asm.fpool.clone(),
        ipool: asm.ipool.clone(),
        dfas: asm.dfas.clone(),
        splits: VmProgram::build_split_table(&lists),
    })
}

fn encode_arg(arg: &OpArg) -> Result<Arg, CompileError> {
    Ok(match *arg {
        OpArg::None => Arg::None,
        OpArg::Reg(r) => Arg::Reg(r),
        OpArg::Slot(s) => {
            if s > SLOT_MAX {
                return Err(CompileError::LiteralOutOfRange(s as i64));
            }
            Arg::Slot(s)
        }
        OpArg::Pool(p) => {
            if p > POOL_MAX {
                return Err(CompileError::LiteralOutOfRange(p as i64));
            }
            Arg::Pool(p)
        }
        OpArg::Lit(v) => {
            if !(LIT_MIN as i64..=LIT_MAX as i64).contains(&v) {
                return Err(CompileError::LiteralOutOfRange(v));
            }
            Arg::Lit(v as i16)
        }
        OpArg::TokType(t) => Arg::Lit(t as i16),
        OpArg::Cond(_) | OpArg::Label(_) | OpArg::Proc(_) => {
            return Err(CompileError::Internal(
                "branch argument in a non-branch instruction".to_string(),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{OpInstr, OpProc};
    use jsv_asm::RegId;

    fn one_proc(body: Vec<OpInstr>) -> OpProgram {
        OpProgram {
            procs: vec![OpProc { nslots: 0, body }],
            ..OpProgram::default()
        }
    }

    #[test]
    fn labels_resolve_to_relative_deltas() {
        let mut ret = OpInstr::new(Opcode::Return, OpArg::Lit(0), OpArg::None);
        ret.label = Some(7);
        let prog = one_proc(vec![
            OpInstr::new(Opcode::Proc, OpArg::Lit(0), OpArg::None),
            OpInstr::new(Opcode::Jmp, OpArg::Cond(BranchCond::Always), OpArg::Label(7)),
            OpInstr::new(Opcode::Nop, OpArg::None, OpArg::None),
            ret,
        ]);
        let vm = encode(&prog).expect("encode");
        let jmp = Instruction::from(vm.code[1]);
        assert_eq!(jmp.op(), Ok(Opcode::Jmp));
        assert_eq!(jmp.jmp_delta(), 2);
    }

    #[test]
    fn call_deltas_cross_procs() {
        let caller = OpProc {
            nslots: 0,
            body: vec![
                OpInstr::new(Opcode::Proc, OpArg::Lit(0), OpArg::None),
                OpInstr::new(Opcode::Call, OpArg::Proc(1), OpArg::None),
                OpInstr::new(Opcode::Return, OpArg::Lit(0), OpArg::None),
            ],
        };
        let callee = OpProc {
            nslots: 0,
            body: vec![
                OpInstr::new(Opcode::Proc, OpArg::Lit(0), OpArg::None),
                OpInstr::new(Opcode::Return, OpArg::Lit(0), OpArg::None),
            ],
        };
        let prog = OpProgram {
            procs: vec![caller, callee],
            ..OpProgram::default()
        };
        let vm = encode(&prog).expect("encode");
        let call = Instruction::from(vm.code[1]);
        assert_eq!(call.op(), Ok(Opcode::Call));
        // Callee starts at offset 3; the call sits at offset 1.
        assert_eq!(call.call_delta(), 2);
    }

    #[test]
    fn oversized_literal_is_rejected() {
        let prog = one_proc(vec![
            OpInstr::new(Opcode::Proc, OpArg::Lit(0), OpArg::None),
            OpInstr::new(Opcode::Return, OpArg::Lit(4096), OpArg::None),
        ]);
        assert!(matches!(
            encode(&prog),
            Err(CompileError::LiteralOutOfRange(4096))
        ));
    }

    #[test]
    fn dangling_label_is_internal_error() {
        let prog = one_proc(vec![
            OpInstr::new(Opcode::Proc, OpArg::Lit(0), OpArg::None),
            OpInstr::new(Opcode::Jmp, OpArg::Cond(BranchCond::Eq), OpArg::Label(99)),
        ]);
        assert!(encode(&prog).is_err());
    }

    #[test]
    fn registers_and_slots_survive_packing() {
        let prog = one_proc(vec![
            OpInstr::new(Opcode::Proc, OpArg::Lit(2), OpArg::None),
            OpInstr::new(Opcode::Iload, OpArg::Reg(RegId::itmp(0)), OpArg::Slot(1)),
            OpInstr::new(Opcode::Return, OpArg::Lit(0), OpArg::None),
        ]);
        let vm = encode(&prog).expect("encode");
        let iload = Instruction::from(vm.code[1]);
        assert_eq!(iload.arg0(), Arg::Reg(RegId::itmp(0)));
        assert_eq!(iload.arg1(), Arg::Slot(1));
    }
}
