//! The execution machine.
//!
//! A [`Machine`] executes one frame stack over one token stream. The
//! root machine drives the whole validation; a lock-step split spawns
//! one child machine per descriptor proc, delivers the parent's
//! current token to each child as its first fetch, and then feeds all
//! running children the same tokens until every one has returned.
//!
//! The machine is explicitly suspendable: whenever the next step needs
//! a token that has not arrived, [`Machine::step`] returns
//! [`MachineState::NeedToken`] and resumption through
//! [`Machine::feed`] restores execution exactly.

use std::cmp::Ordering;

use jsv_asm::{Arg, BranchCond, ErrorCode, Event, EventKind, Opcode, RegId, VmProgram};

use crate::error::VmError;
use crate::params::VmParams;
use crate::unique::{UniqOutcome, UniqueTracker};

/// Externally visible stop reason of a machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MachineState {
    /// The machine needs the next token.
    NeedToken,
    /// The machine's outer frame returned.
    Done(Outcome),
}

/// Outcome of a finished machine: valid, or invalid with a code.
pub(crate) type Outcome = Result<(), ErrorCode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterConsume {
    /// Resume the instruction stream.
    Continue,
    /// Finish a VALID return that had to drain its open composite.
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// Execute at `pc`.
    Run,
    /// Waiting for the next token.
    Token,
    /// Skipping tokens until a value is fully consumed.
    Consume { depth: u32, after: AfterConsume },
    /// Finished.
    Done(Option<ErrorCode>),
}

#[derive(Debug)]
enum SplitDest {
    /// Write the count of valid children into an integer register.
    Count(u8),
    /// Write the per-child validity bits into a slot.
    Bits(u16),
}

#[derive(Debug)]
struct SplitExec {
    children: Vec<Machine>,
    outcomes: Vec<Option<bool>>,
    dest: SplitDest,
    /// Kind of the last token the split consumed. The parent's token
    /// register is synced to it on completion, so a later RETURN sees
    /// the composite the children drained as closed.
    last: EventKind,
}

/// One frame stack executing over the stream.
#[derive(Debug)]
pub(crate) struct Machine {
    pc: usize,
    fp: usize,
    stack: Vec<u64>,
    flag: Option<Ordering>,
    iregs: [i64; 8],
    fregs: [f64; 8],
    m: u32,

    // Token registers.
    tt: EventKind,
    tnum: f64,
    tlen: u64,
    text: Vec<u8>,
    /// A partial string token is still accumulating.
    partial: bool,

    pending: Pending,
    /// Token re-delivered to a split child as its first fetch.
    seed: Option<Event>,
    split: Option<Box<SplitExec>>,
    uniq: Vec<UniqueTracker>,
    /// Split nesting depth of this machine.
    depth: usize,
}

impl Machine {
    pub fn new(entry: usize) -> Self {
        Machine {
            pc: entry,
            fp: 0,
            stack: Vec::new(),
            flag: None,
            iregs: [0; 8],
            fregs: [0.0; 8],
            m: 0,
            tt: EventKind::None,
            tnum: 0.0,
            tlen: 0,
            text: Vec::new(),
            partial: false,
            pending: Pending::Run,
            seed: None,
            split: None,
            uniq: Vec::new(),
            depth: 0,
        }
    }

    fn child(entry: usize, depth: usize, seed: Option<Event>) -> Self {
        Machine {
            depth,
            seed,
            ..Machine::new(entry)
        }
    }

    /// Run until the machine finishes or needs a token.
    pub fn step(&mut self, prog: &VmProgram, params: &VmParams) -> Result<MachineState, VmError> {
        loop {
            match self.pending {
                Pending::Done(code) => {
                    return Ok(MachineState::Done(match code {
                        None => Ok(()),
                        Some(code) => Err(code),
                    }));
                }
                Pending::Token | Pending::Consume { .. } => {
                    if let Some(seed) = self.seed.take() {
                        self.deliver(&seed)?;
                        continue;
                    }
                    return Ok(MachineState::NeedToken);
                }
                Pending::Run => {}
            }

            if self.split.is_some() {
                if self.drive_split(prog, params)? {
                    continue;
                }
                return Ok(MachineState::NeedToken);
            }

            self.exec(prog, params)?;
        }
    }

    /// Deliver one token. Trackers observe first, then the token goes
    /// to the active split children or this machine's own fetch.
    pub fn feed(&mut self, evt: &Event) -> Result<(), VmError> {
        let mut completed: Option<usize> = None;
        for (i, tracker) in self.uniq.iter_mut().enumerate() {
            match tracker.observe(evt) {
                UniqOutcome::Next => {}
                UniqOutcome::Duplicate => {
                    self.pending = Pending::Done(Some(ErrorCode::NotUnique));
                    return Ok(());
                }
                UniqOutcome::Complete => completed = Some(i),
            }
        }
        if let Some(i) = completed {
            self.uniq.remove(i);
        }

        if let Some(split) = self.split.as_mut() {
            split.last = evt.kind;
            for (child, outcome) in split.children.iter_mut().zip(&split.outcomes) {
                if outcome.is_none() {
                    child.feed(evt)?;
                }
            }
            return Ok(());
        }

        self.deliver(evt)
    }

    /// Satisfy this machine's own pending token need.
    fn deliver(&mut self, evt: &Event) -> Result<(), VmError> {
        match self.pending {
            Pending::Token => {
                if evt.kind == EventKind::String {
                    if !self.partial {
                        self.text.clear();
                        self.tlen = 0;
                        self.tt = EventKind::String;
                        self.tnum = 0.0;
                    }
                    self.text.extend_from_slice(&evt.text);
                    self.tlen += evt.text.len() as u64;
                    // A partial chunk leaves the fetch pending until
                    // the final chunk arrives.
                    self.partial = evt.partial;
                    if !evt.partial {
                        self.pending = Pending::Run;
                    }
                    return Ok(());
                }
                if self.partial {
                    return Err(VmError::MalformedStream(
                        "non-string token inside a partial string",
                    ));
                }

                self.tt = evt.kind;
                self.tnum = evt.num;
                self.tlen = 0;
                self.text.clear();
                self.pending = Pending::Run;
                Ok(())
            }
            Pending::Consume { depth, after } => {
                if evt.kind == EventKind::String && evt.partial {
                    return Ok(());
                }
                let mut depth = depth;
                match evt.kind {
                    EventKind::ObjectBeg | EventKind::ArrayBeg => depth += 1,
                    EventKind::ObjectEnd | EventKind::ArrayEnd => {
                        if depth == 0 {
                            return Err(VmError::MalformedStream(
                                "closing token where a value was expected",
                            ));
                        }
                        depth -= 1;
                    }
                    _ => {}
                }
                if depth == 0 {
                    // Track the last token so a later return sees the
                    // composite as closed.
                    self.tt = evt.kind;
                    match after {
                        AfterConsume::Continue => self.pending = Pending::Run,
                        AfterConsume::Return => {
                            self.pending = Pending::Run;
                            self.return_from_frame()?;
                        }
                    }
                } else {
                    self.pending = Pending::Consume { depth, after };
                }
                Ok(())
            }
            Pending::Run | Pending::Done(_) => {
                Err(VmError::Internal("token delivered to a running machine"))
            }
        }
    }

    /// Advance the active split; true when it completed.
    fn drive_split(&mut self, prog: &VmProgram, params: &VmParams) -> Result<bool, VmError> {
        let split = self.split.as_mut().expect("split is active");
        let mut all_done = true;
        for (child, outcome) in split.children.iter_mut().zip(split.outcomes.iter_mut()) {
            if outcome.is_some() {
                continue;
            }
            match child.step(prog, params)? {
                MachineState::NeedToken => all_done = false,
                MachineState::Done(Ok(())) => *outcome = Some(true),
                // A failed child is contained: it stops consuming and
                // simply does not count toward the split result.
                MachineState::Done(Err(_)) => *outcome = Some(false),
            }
        }
        if !all_done {
            return Ok(false);
        }

        let split = self.split.take().expect("split is active");
        let valid = split
            .outcomes
            .iter()
            .filter(|o| o.expect("all children are done"))
            .count() as i64;
        match split.dest {
            SplitDest::Count(reg) => self.iregs[reg as usize] = valid,
            SplitDest::Bits(slot) => {
                let mut bits: u64 = 0;
                for (i, outcome) in split.outcomes.iter().enumerate() {
                    if outcome == &Some(true) {
                        bits |= 1 << i;
                    }
                }
                self.write_slot(slot, bits)?;
            }
        }
        // The children consumed the value; the parent's token state
        // reflects how it ended.
        self.tt = split.last;
        self.tnum = 0.0;
        self.tlen = 0;
        self.text.clear();
        self.partial = false;
        Ok(true)
    }

    /// Decode and execute one instruction.
    fn exec(&mut self, prog: &VmProgram, params: &VmParams) -> Result<(), VmError> {
        let cur = self.pc;
        let instr = prog
            .fetch(cur)
            .ok_or(VmError::PcOutOfBounds(cur))?;
        let op = instr.op().map_err(|source| VmError::BadInstruction {
            pc: cur,
            raw: instr.to_u32(),
            source,
        })?;
        self.pc = cur + 1;

        match op {
            Opcode::Nop => {}
            Opcode::Proc => {
                let n = self.lit(instr.arg0(), cur)? as usize;
                if self.stack.len() + n > params.max_stack_slots {
                    self.pending = Pending::Done(Some(ErrorCode::StackOverflow));
                    return Ok(());
                }
                self.stack.resize(self.stack.len() + n, 0);
            }
            Opcode::Icmp => {
                let a = self.iread(prog, instr.arg0(), cur)?;
                let b = self.iread(prog, instr.arg1(), cur)?;
                self.flag = Some(a.cmp(&b));
            }
            Opcode::Fcmp => {
                let a = self.fread(prog, instr.arg0(), cur)?;
                let b = self.fread(prog, instr.arg1(), cur)?;
                self.flag = a.partial_cmp(&b);
            }
            Opcode::Fint => {
                let a = self.fread(prog, instr.arg0(), cur)?;
                let v = match instr.arg1() {
                    Arg::None => a,
                    divisor => a / self.fread(prog, divisor, cur)?,
                };
                self.flag = Some(if is_integral(v) {
                    Ordering::Equal
                } else {
                    Ordering::Less
                });
            }
            Opcode::Jmp => {
                let cond = instr.jmp_cond().map_err(|source| VmError::BadInstruction {
                    pc: cur,
                    raw: instr.to_u32(),
                    source,
                })?;
                if flag_matches(self.flag, cond) {
                    self.pc = offset(cur, instr.jmp_delta())?;
                }
            }
            Opcode::Call => {
                let target = offset(cur, instr.call_delta())?;
                if self.stack.len() + 2 > params.max_stack_slots {
                    self.pending = Pending::Done(Some(ErrorCode::StackOverflow));
                    return Ok(());
                }
                self.stack.push(self.pc as u64);
                self.stack.push(self.fp as u64);
                self.fp = self.stack.len();
                self.pc = target;
            }
            Opcode::Split | Opcode::Splitv => {
                let descriptor = self.lit(instr.arg0(), cur)? as usize;
                if descriptor >= prog.split_count() {
                    return Err(VmError::BadOperand {
                        pc: cur,
                        what: "split descriptor out of range",
                    });
                }
                if self.depth + 1 > params.max_split_depth {
                    self.pending = Pending::Done(Some(ErrorCode::StackOverflow));
                    return Ok(());
                }
                let dest = match (op, instr.arg1()) {
                    (Opcode::Split, Arg::Reg(r)) => {
                        let Some(i) = r.itmp_index() else {
                            return Err(VmError::BadOperand {
                                pc: cur,
                                what: "split result must be an integer temporary",
                            });
                        };
                        SplitDest::Count(i)
                    }
                    (Opcode::Splitv, Arg::Slot(s)) => SplitDest::Bits(s),
                    _ => {
                        return Err(VmError::BadOperand {
                            pc: cur,
                            what: "malformed split destination",
                        })
                    }
                };

                let seed = self.current_token_event();
                let last = seed.as_ref().map(|e| e.kind).unwrap_or(EventKind::None);
                let children: Vec<Machine> = prog
                    .split_procs(descriptor)
                    .iter()
                    .map(|&off| Machine::child(off as usize, self.depth + 1, seed.clone()))
                    .collect();
                let outcomes = vec![None; children.len()];
                self.split = Some(Box::new(SplitExec {
                    children,
                    outcomes,
                    dest,
                    last,
                }));
            }
            Opcode::Token => {
                self.pending = Pending::Token;
                self.text.clear();
                self.tlen = 0;
            }
            Opcode::Consume => {
                self.pending = Pending::Consume {
                    depth: 0,
                    after: AfterConsume::Continue,
                };
            }
            Opcode::Match => {
                let d = self.lit(instr.arg0(), cur)? as usize;
                let dfa = prog.dfas.get(d).ok_or(VmError::BadOperand {
                    pc: cur,
                    what: "dfa index out of range",
                })?;
                if self.tt != EventKind::String {
                    return Err(VmError::BadOperand {
                        pc: cur,
                        what: "match on a non-string token",
                    });
                }
                self.m = dfa.classify(&self.text);
            }
            Opcode::Fload => {
                let v = self.fread(prog, instr.arg1(), cur)?;
                self.fwrite(instr.arg0(), v, cur)?;
            }
            Opcode::Iload => {
                let v = self.iread(prog, instr.arg1(), cur)?;
                self.iwrite(instr.arg0(), v, cur)?;
            }
            Opcode::Move => {
                let v = self.iread(prog, instr.arg1(), cur)?;
                self.iwrite(instr.arg0(), v, cur)?;
            }
            Opcode::Incr => {
                let Arg::Slot(s) = instr.arg0() else {
                    return Err(VmError::BadOperand {
                        pc: cur,
                        what: "INCR destination must be a slot",
                    });
                };
                let k = self.iread(prog, instr.arg1(), cur)?;
                let v = self.read_slot(s)? as i64;
                self.write_slot(s, v.wrapping_add(k) as u64)?;
            }
            Opcode::Bset => {
                let Arg::Slot(s) = instr.arg0() else {
                    return Err(VmError::BadOperand {
                        pc: cur,
                        what: "BSET destination must be a slot",
                    });
                };
                let bit = self.lit(instr.arg1(), cur)?;
                let v = self.read_slot(s)?;
                self.write_slot(s, v | (1u64 << (bit as u32 & 63)))?;
            }
            Opcode::Band => {
                let k = self.iread(prog, instr.arg1(), cur)?;
                match instr.arg0() {
                    Arg::Slot(s) => {
                        let v = self.read_slot(s)? as i64;
                        self.write_slot(s, (v & k) as u64)?;
                    }
                    arg => {
                        let v = self.iread(prog, arg, cur)?;
                        self.iwrite(arg, v & k, cur)?;
                    }
                }
            }
            Opcode::Unique => {
                self.uniq.push(UniqueTracker::new());
            }
            Opcode::Return => {
                let code = self.lit(instr.arg0(), cur)? as u16;
                if code != 0 {
                    self.pending = Pending::Done(Some(ErrorCode::from(code)));
                    return Ok(());
                }
                if self.tt.opens() {
                    // A frame may declare a composite valid without
                    // reading it; drain it before leaving.
                    self.pending = Pending::Consume {
                        depth: 1,
                        after: AfterConsume::Return,
                    };
                    return Ok(());
                }
                self.return_from_frame()?;
            }
        }
        Ok(())
    }

    /// Unwind one frame after a VALID return.
    fn return_from_frame(&mut self) -> Result<(), VmError> {
        if self.fp == 0 {
            self.pending = Pending::Done(None);
            return Ok(());
        }
        if self.fp < 2 || self.fp > self.stack.len() {
            return Err(VmError::Internal("corrupt frame pointer"));
        }
        self.stack.truncate(self.fp);
        let saved_fp = self.stack.pop().expect("frame link") as usize;
        let ret_pc = self.stack.pop().expect("return pc") as usize;
        self.fp = saved_fp;
        self.pc = ret_pc;
        self.pending = Pending::Run;
        Ok(())
    }

    /// Current token as an event, when it can seed a split child.
    fn current_token_event(&self) -> Option<Event> {
        if !self.tt.starts_value() {
            return None;
        }
        Some(Event {
            kind: self.tt,
            num: self.tnum,
            text: self.text.clone(),
            partial: false,
        })
    }

    // ---- operand access ----------------------------------------------

    fn lit(&self, arg: Arg, pc: usize) -> Result<i64, VmError> {
        match arg {
            Arg::Lit(v) => Ok(v as i64),
            _ => Err(VmError::BadOperand {
                pc,
                what: "expected a literal",
            }),
        }
    }

    fn iread(&self, prog: &VmProgram, arg: Arg, pc: usize) -> Result<i64, VmError> {
        match arg {
            Arg::Lit(v) => Ok(v as i64),
            Arg::Pool(p) => prog.ipool.get(p as usize).copied().ok_or(VmError::BadOperand {
                pc,
                what: "integer pool index out of range",
            }),
            Arg::Slot(s) => Ok(self.read_slot(s)? as i64),
            Arg::Reg(r) => match r {
                RegId::TT => Ok(self.tt as i64),
                RegId::TLEN => Ok(self.tlen as i64),
                RegId::M => Ok(self.m as i64),
                r => match r.itmp_index() {
                    Some(i) => Ok(self.iregs[i as usize]),
                    None => Err(VmError::BadOperand {
                        pc,
                        what: "register is not integer-readable",
                    }),
                },
            },
            Arg::None => Err(VmError::BadOperand {
                pc,
                what: "missing integer operand",
            }),
        }
    }

    fn fread(&self, prog: &VmProgram, arg: Arg, pc: usize) -> Result<f64, VmError> {
        match arg {
            Arg::Lit(v) => Ok(v as f64),
            Arg::Pool(p) => prog.fpool.get(p as usize).copied().ok_or(VmError::BadOperand {
                pc,
                what: "float pool index out of range",
            }),
            Arg::Reg(RegId::TNUM) => Ok(self.tnum),
            Arg::Reg(r) => match r.ftmp_index() {
                Some(i) => Ok(self.fregs[i as usize]),
                None => Err(VmError::BadOperand {
                    pc,
                    what: "register is not float-readable",
                }),
            },
            _ => Err(VmError::BadOperand {
                pc,
                what: "missing float operand",
            }),
        }
    }

    fn iwrite(&mut self, arg: Arg, v: i64, pc: usize) -> Result<(), VmError> {
        match arg {
            Arg::Slot(s) => self.write_slot(s, v as u64),
            Arg::Reg(r) => match r.itmp_index() {
                Some(i) => {
                    self.iregs[i as usize] = v;
                    Ok(())
                }
                None => Err(VmError::BadOperand {
                    pc,
                    what: "register is not integer-writable",
                }),
            },
            _ => Err(VmError::BadOperand {
                pc,
                what: "destination is not writable",
            }),
        }
    }

    fn fwrite(&mut self, arg: Arg, v: f64, pc: usize) -> Result<(), VmError> {
        match arg {
            Arg::Reg(r) => match r.ftmp_index() {
                Some(i) => {
                    self.fregs[i as usize] = v;
                    Ok(())
                }
                None => Err(VmError::BadOperand {
                    pc,
                    what: "register is not float-writable",
                }),
            },
            _ => Err(VmError::BadOperand {
                pc,
                what: "destination is not float-writable",
            }),
        }
    }

    fn read_slot(&self, slot: u16) -> Result<u64, VmError> {
        self.stack
            .get(self.fp + slot as usize)
            .copied()
            .ok_or(VmError::SlotOutOfBounds {
                slot: slot as usize,
                pc: self.pc,
            })
    }

    fn write_slot(&mut self, slot: u16, v: u64) -> Result<(), VmError> {
        let index = self.fp + slot as usize;
        match self.stack.get_mut(index) {
            Some(cell) => {
                *cell = v;
                Ok(())
            }
            None => Err(VmError::SlotOutOfBounds {
                slot: slot as usize,
                pc: self.pc,
            }),
        }
    }
}

/// Integrality test behind `FINT`: finite and with no fractional part.
/// Zero is integral; the finiteness guard rejects NaN and ±∞.
fn is_integral(v: f64) -> bool {
    v.is_finite() && v == v.trunc()
}

fn flag_matches(flag: Option<Ordering>, cond: BranchCond) -> bool {
    match cond {
        BranchCond::Always => true,
        BranchCond::Eq => flag == Some(Ordering::Equal),
        BranchCond::Ne => flag != Some(Ordering::Equal),
        BranchCond::Lt => flag == Some(Ordering::Less),
        BranchCond::Le => matches!(flag, Some(Ordering::Less | Ordering::Equal)),
        BranchCond::Gt => flag == Some(Ordering::Greater),
        BranchCond::Ge => matches!(flag, Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn offset(pc: usize, delta: i32) -> Result<usize, VmError> {
    let target = pc as i64 + delta as i64;
    usize::try_from(target).map_err(|_| VmError::PcOutOfBounds(pc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SliceSource, TokenSource};
    use jsv_asm::Instruction;

    fn run(prog: &VmProgram, events: Vec<Event>) -> Result<Outcome, VmError> {
        let params = VmParams::default();
        let mut machine = Machine::new(0);
        let mut source = SliceSource::new(events);
        let mut evt = Event::default();
        loop {
            match machine.step(prog, &params)? {
                MachineState::Done(outcome) => return Ok(outcome),
                MachineState::NeedToken => match source.next(&mut evt) {
                    crate::source::SourceResult::Ok => machine.feed(&evt)?,
                    other => panic!("test stream drained: {other:?}"),
                },
            }
        }
    }

    fn program(code: Vec<Instruction>) -> VmProgram {
        VmProgram {
            code: code.into_iter().map(Instruction::to_u32).collect(),
            ..VmProgram::default()
        }
    }

    #[test]
    fn token_and_type_check() {
        // PROC 0; TOKEN; ICMP TT, $NUMBER; JMP eq +2; RETURN 1; RETURN 0
        let prog = program(vec![
            Instruction::proc(0),
            Instruction::token(),
            Instruction::icmp(Arg::Reg(RegId::TT), Arg::Lit(EventKind::Number as i16)),
            Instruction::jmp(BranchCond::Eq, 2),
            Instruction::ret(ErrorCode::UnexpectedToken as i16),
            Instruction::ret(0),
        ]);
        assert_eq!(run(&prog, vec![Event::number(3.0)]).unwrap(), Ok(()));
        assert_eq!(
            run(&prog, vec![Event::string(b"x".to_vec())]).unwrap(),
            Err(ErrorCode::UnexpectedToken)
        );
    }

    #[test]
    fn valid_return_consumes_open_composite() {
        // PROC 0; TOKEN; RETURN 0 — fed a whole object.
        let prog = program(vec![
            Instruction::proc(0),
            Instruction::token(),
            Instruction::ret(0),
        ]);
        let events = vec![
            Event::of(EventKind::ObjectBeg),
            Event::string(b"a".to_vec()),
            Event::number(1.0),
            Event::of(EventKind::ObjectEnd),
        ];
        assert_eq!(run(&prog, events).unwrap(), Ok(()));
    }

    #[test]
    fn fint_accepts_integers_and_zero() {
        // PROC 0; TOKEN; FINT TNUM; JMP eq +2; RETURN 2; RETURN 0
        let prog = program(vec![
            Instruction::proc(0),
            Instruction::token(),
            Instruction::fint(Arg::Reg(RegId::TNUM), Arg::None),
            Instruction::jmp(BranchCond::Eq, 2),
            Instruction::ret(ErrorCode::NotInteger as i16),
            Instruction::ret(0),
        ]);
        for (value, expect) in [
            (3.0, Ok(())),
            (0.0, Ok(())),
            (-2.0, Ok(())),
            (3.5, Err(ErrorCode::NotInteger)),
        ] {
            assert_eq!(run(&prog, vec![Event::number(value)]).unwrap(), expect, "{value}");
        }
    }

    #[test]
    fn call_and_return_restore_the_frame() {
        // proc0: PROC 1; CALL proc1; INCR [0], $1; RETURN 0
        // proc1: PROC 0; TOKEN; RETURN 0
        let prog = program(vec![
            Instruction::proc(1),
            Instruction::call(3),
            Instruction::incr(0, Arg::Lit(1)),
            Instruction::ret(0),
            Instruction::proc(0),
            Instruction::token(),
            Instruction::ret(0),
        ]);
        assert_eq!(run(&prog, vec![Event::of(EventKind::Null)]).unwrap(), Ok(()));
    }

    #[test]
    fn stack_overflow_is_surfaced_as_a_code() {
        // Infinite recursion: proc calls itself before any token.
        let prog = program(vec![Instruction::proc(0), Instruction::call(-1)]);
        let params = VmParams {
            max_stack_slots: 64,
            ..VmParams::default()
        };
        let mut machine = Machine::new(0);
        loop {
            match machine.step(&prog, &params).unwrap() {
                MachineState::Done(outcome) => {
                    assert_eq!(outcome, Err(ErrorCode::StackOverflow));
                    break;
                }
                MachineState::NeedToken => panic!("must overflow before any token"),
            }
        }
    }

    #[test]
    fn split_counts_valid_children() {
        // Entry: PROC 0; SPLIT 0, %I0; ICMP %I0, $1; JMP eq +2;
        //        RETURN 7; RETURN 0
        // Children at 6 and 9: one accepts numbers, one accepts strings.
        let accept = |kind: EventKind, code: ErrorCode| {
            vec![
                Instruction::proc(0),
                Instruction::token(),
                Instruction::icmp(Arg::Reg(RegId::TT), Arg::Lit(kind as i16)),
                Instruction::jmp(BranchCond::Eq, 2),
                Instruction::ret(code as i16),
                Instruction::ret(0),
            ]
        };
        let mut code = vec![
            Instruction::proc(0),
            Instruction::split(0, RegId::itmp(0)),
            Instruction::icmp(Arg::Reg(RegId::itmp(0)), Arg::Lit(1)),
            Instruction::jmp(BranchCond::Eq, 2),
            Instruction::ret(ErrorCode::SplitCondition as i16),
            Instruction::ret(0),
        ];
        let number_off = code.len() as u32;
        code.extend(accept(EventKind::Number, ErrorCode::UnexpectedToken));
        let string_off = code.len() as u32;
        code.extend(accept(EventKind::String, ErrorCode::UnexpectedToken));

        let prog = VmProgram {
            code: code.into_iter().map(Instruction::to_u32).collect(),
            splits: VmProgram::build_split_table(&[vec![number_off, string_off]]),
            ..VmProgram::default()
        };

        assert_eq!(run(&prog, vec![Event::number(1.0)]).unwrap(), Ok(()));
        assert_eq!(run(&prog, vec![Event::string(b"s".to_vec())]).unwrap(), Ok(()));
        assert_eq!(
            run(&prog, vec![Event::of(EventKind::Null)]).unwrap(),
            Err(ErrorCode::SplitCondition)
        );
    }
}
