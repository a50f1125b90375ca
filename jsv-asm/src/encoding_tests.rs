use quickcheck_macros::quickcheck;
use test_case::test_case;

use super::*;

#[test_case(Instruction::nop(), Opcode::Nop, Arg::None, Arg::None; "nop")]
#[test_case(Instruction::proc(3), Opcode::Proc, Arg::Lit(3), Arg::None; "proc")]
#[test_case(
    Instruction::icmp(Arg::Reg(RegId::TT), Arg::Lit(5)),
    Opcode::Icmp, Arg::Reg(RegId::TT), Arg::Lit(5);
    "icmp tt lit"
)]
#[test_case(
    Instruction::fcmp(Arg::Reg(RegId::TNUM), Arg::Reg(RegId::ftmp(0))),
    Opcode::Fcmp, Arg::Reg(RegId::TNUM), Arg::Reg(RegId::ftmp(0));
    "fcmp tnum ftmp"
)]
#[test_case(
    Instruction::fint(Arg::Reg(RegId::TNUM), Arg::None),
    Opcode::Fint, Arg::Reg(RegId::TNUM), Arg::None;
    "fint one arg"
)]
#[test_case(
    Instruction::split(0, RegId::itmp(0)),
    Opcode::Split, Arg::Lit(0), Arg::Reg(RegId::itmp(0));
    "split"
)]
#[test_case(Instruction::splitv(1, 4), Opcode::Splitv, Arg::Lit(1), Arg::Slot(4); "splitv")]
#[test_case(Instruction::match_dfa(2), Opcode::Match, Arg::Lit(2), Arg::None; "match_op")]
#[test_case(
    Instruction::fload(RegId::ftmp(1), Arg::Pool(7)),
    Opcode::Fload, Arg::Reg(RegId::ftmp(1)), Arg::Pool(7);
    "fload pool"
)]
#[test_case(
    Instruction::iload(RegId::itmp(1), Arg::Slot(9)),
    Opcode::Iload, Arg::Reg(RegId::itmp(1)), Arg::Slot(9);
    "iload slot"
)]
#[test_case(
    Instruction::mov(Arg::Slot(1), Arg::Slot(2)),
    Opcode::Move, Arg::Slot(1), Arg::Slot(2);
    "move_op"
)]
#[test_case(Instruction::incr(3, Arg::Lit(-1)), Opcode::Incr, Arg::Slot(3), Arg::Lit(-1); "incr negative")]
#[test_case(Instruction::bset(0, 63), Opcode::Bset, Arg::Slot(0), Arg::Lit(63); "bset")]
#[test_case(
    Instruction::band(Arg::Reg(RegId::itmp(0)), Arg::Pool(0)),
    Opcode::Band, Arg::Reg(RegId::itmp(0)), Arg::Pool(0);
    "band"
)]
#[test_case(Instruction::unique(), Opcode::Unique, Arg::None, Arg::None; "unique")]
#[test_case(Instruction::ret(0), Opcode::Return, Arg::Lit(0), Arg::None; "return valid")]
#[test_case(
    Instruction::ret(ErrorCode::NotUnique as i16),
    Opcode::Return, Arg::Lit(0x0b), Arg::None;
    "return not unique"
)]
fn two_arg_layout_round_trips(instr: Instruction, op: Opcode, a: Arg, b: Arg) {
    assert_eq!(instr.op(), Ok(op));
    assert_eq!(instr.arg0(), a);
    assert_eq!(instr.arg1(), b);

    let reparsed = Instruction::from(instr.to_u32());
    assert_eq!(reparsed, instr);
    assert_eq!(Instruction::from(instr.to_bytes()), instr);
}

#[test]
fn jmp_layout_round_trips() {
    for cond in [
        BranchCond::Always,
        BranchCond::Eq,
        BranchCond::Ne,
        BranchCond::Lt,
        BranchCond::Le,
        BranchCond::Gt,
        BranchCond::Ge,
    ] {
        for delta in [JMP_DELTA_MIN, -1, 0, 1, JMP_DELTA_MAX] {
            let instr = Instruction::jmp(cond, delta);
            assert_eq!(instr.op(), Ok(Opcode::Jmp));
            assert_eq!(instr.jmp_cond(), Ok(cond));
            assert_eq!(instr.jmp_delta(), delta);
        }
    }
}

#[test]
fn call_layout_round_trips() {
    for delta in [CALL_DELTA_MIN, -1, 0, 1, CALL_DELTA_MAX] {
        let instr = Instruction::call(delta);
        assert_eq!(instr.op(), Ok(Opcode::Call));
        assert_eq!(instr.call_delta(), delta);
    }
}

#[quickcheck]
fn qc_jmp_delta_round_trips(delta: i32) -> bool {
    let delta = delta.clamp(JMP_DELTA_MIN, JMP_DELTA_MAX);
    Instruction::jmp(BranchCond::Ne, delta).jmp_delta() == delta
}

#[quickcheck]
fn qc_call_delta_round_trips(delta: i32) -> bool {
    let delta = delta.clamp(CALL_DELTA_MIN, CALL_DELTA_MAX);
    Instruction::call(delta).call_delta() == delta
}

#[quickcheck]
fn qc_two_arg_round_trips(slot: u16, lit: i16) -> bool {
    let slot = slot % (SLOT_MAX + 1);
    let lit = lit.clamp(LIT_MIN, LIT_MAX);
    let instr = Instruction::incr(slot, Arg::Lit(lit));
    instr.arg0() == Arg::Slot(slot) && instr.arg1() == Arg::Lit(lit)
}

#[test]
fn display_forms() {
    assert_eq!(
        Instruction::icmp(Arg::Reg(RegId::TT), Arg::Lit(6)).to_string(),
        "ICMP\t%TT, $6"
    );
    assert_eq!(Instruction::jmp(BranchCond::Eq, -3).to_string(), "JMP\teq, -3");
    assert_eq!(Instruction::call(12).to_string(), "CALL\t+12");
    assert_eq!(Instruction::token().to_string(), "TOKEN");
}
