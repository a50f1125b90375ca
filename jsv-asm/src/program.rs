//! Compiled validation program.
//!
//! A [`VmProgram`] is a flat, self-contained artifact: a `u32` code
//! array plus the constant pools it references. It borrows nothing
//! from the compiler that produced it and can be serialized to the
//! byte format documented on [`VmProgram::write`].

use std::fmt;
use std::io::{self, Read, Write};

use crate::{DfaError, Instruction, MatchPattern, Opcode, PropertyDfa};

/// Magic bytes opening a serialized program.
pub const MAGIC: [u8; 4] = *b"JSVP";

/// Current serialization format version.
pub const FORMAT_VERSION: u32 = 1;

// Sanity cap applied to every section count while reading, to fail
// fast on corrupt headers instead of attempting a huge allocation.
const MAX_SECTION_LEN: u32 = 1 << 24;

/// A compiled, executable validation program.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VmProgram {
    /// Packed instructions. Proc entry points are `PROC` instructions;
    /// the program entry is code offset 0.
    pub code: Vec<u32>,
    /// Float constant pool.
    pub fpool: Vec<f64>,
    /// Integer constant pool.
    pub ipool: Vec<i64>,
    /// Property-name DFAs, indexed by `MATCH` instructions.
    pub dfas: Vec<PropertyDfa>,
    /// Split table in prefix-sum layout: entries `0..n` are offsets
    /// into the tail, entry `n` marks the tail start, and the tail
    /// holds the code offsets of each split's procs.
    pub splits: Vec<u32>,
}

impl VmProgram {
    /// Number of split descriptors.
    pub fn split_count(&self) -> usize {
        if self.splits.is_empty() {
            0
        } else {
            self.splits[0] as usize - 1
        }
    }

    /// Code offsets of the procs in split descriptor `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or the table is malformed.
    pub fn split_procs(&self, index: usize) -> &[u32] {
        assert!(index < self.split_count());
        let beg = self.splits[index] as usize;
        let end = self.splits[index + 1] as usize;
        &self.splits[beg..end]
    }

    /// Build the prefix-sum split table from per-descriptor proc
    /// code-offset lists.
    pub fn build_split_table(lists: &[Vec<u32>]) -> Vec<u32> {
        if lists.is_empty() {
            return Vec::new();
        }
        let n = lists.len();
        let mut table = Vec::with_capacity(n + 1 + lists.iter().map(Vec::len).sum::<usize>());
        let mut off = (n + 1) as u32;
        for list in lists {
            table.push(off);
            off += list.len() as u32;
        }
        table.push(off);
        for list in lists {
            table.extend_from_slice(list);
        }
        table
    }

    /// Instruction at code offset `pc`, if in bounds.
    pub fn fetch(&self, pc: usize) -> Option<Instruction> {
        self.code.get(pc).map(|&raw| Instruction::from(raw))
    }

    /// Serialize to the program file format.
    ///
    /// Layout: magic, format version, five `u32` section counts
    /// (floats, ints, DFAs, split-table words, code words), float pool
    /// (f64 bits), int pool, DFA table (per DFA the labeled pattern
    /// sources; the automaton is rebuilt on read), split table, code.
    /// All fields are little-endian.
    pub fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&FORMAT_VERSION.to_le_bytes())?;

        for count in [
            self.fpool.len(),
            self.ipool.len(),
            self.dfas.len(),
            self.splits.len(),
            self.code.len(),
        ] {
            w.write_all(&(count as u32).to_le_bytes())?;
        }

        for &f in &self.fpool {
            w.write_all(&f.to_bits().to_le_bytes())?;
        }
        for &c in &self.ipool {
            w.write_all(&c.to_le_bytes())?;
        }
        for dfa in &self.dfas {
            w.write_all(&(dfa.patterns().len() as u32).to_le_bytes())?;
            for pattern in dfa.patterns() {
                let (tag, src) = match pattern {
                    MatchPattern::Literal(s) => (0u8, s),
                    MatchPattern::Search(s) => (1u8, s),
                };
                w.write_all(&[tag])?;
                w.write_all(&(src.len() as u32).to_le_bytes())?;
                w.write_all(src.as_bytes())?;
            }
        }
        for &s in &self.splits {
            w.write_all(&s.to_le_bytes())?;
        }
        for &c in &self.code {
            w.write_all(&c.to_le_bytes())?;
        }
        Ok(())
    }

    /// Serialize to a byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write(&mut buf).expect("vec write is infallible");
        buf
    }

    /// Deserialize from the program file format.
    pub fn read(r: &mut impl Read) -> Result<Self, ProgramReadError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(ProgramReadError::BadMagic(magic));
        }
        let version = read_u32(r)?;
        if version != FORMAT_VERSION {
            return Err(ProgramReadError::UnsupportedVersion(version));
        }

        let nfloat = read_len(r)?;
        let nint = read_len(r)?;
        let ndfa = read_len(r)?;
        let nsplit = read_len(r)?;
        let ncode = read_len(r)?;

        let mut fpool = Vec::with_capacity(nfloat);
        for _ in 0..nfloat {
            fpool.push(f64::from_bits(read_u64(r)?));
        }
        let mut ipool = Vec::with_capacity(nint);
        for _ in 0..nint {
            ipool.push(read_u64(r)? as i64);
        }

        let mut dfas = Vec::with_capacity(ndfa);
        for _ in 0..ndfa {
            let npat = read_len(r)?;
            let mut patterns = Vec::with_capacity(npat);
            for _ in 0..npat {
                let mut tag = [0u8; 1];
                r.read_exact(&mut tag)?;
                let len = read_len(r)?;
                let mut src = vec![0u8; len];
                r.read_exact(&mut src)?;
                let src = String::from_utf8(src)
                    .map_err(|_| ProgramReadError::Corrupt("pattern is not UTF-8"))?;
                patterns.push(match tag[0] {
                    0 => MatchPattern::Literal(src),
                    1 => MatchPattern::Search(src),
                    _ => return Err(ProgramReadError::Corrupt("unknown pattern tag")),
                });
            }
            dfas.push(PropertyDfa::build(patterns)?);
        }

        let mut splits = Vec::with_capacity(nsplit);
        for _ in 0..nsplit {
            splits.push(read_u32(r)?);
        }
        let mut code = Vec::with_capacity(ncode);
        for _ in 0..ncode {
            code.push(read_u32(r)?);
        }

        Ok(VmProgram {
            code,
            fpool,
            ipool,
            dfas,
            splits,
        })
    }
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_len(r: &mut impl Read) -> Result<usize, ProgramReadError> {
    let n = read_u32(r)?;
    if n > MAX_SECTION_LEN {
        return Err(ProgramReadError::Corrupt("section count too large"));
    }
    Ok(n as usize)
}

/// Failure while reading a serialized program.
#[derive(Debug)]
pub enum ProgramReadError {
    /// Underlying I/O failure.
    Io(io::Error),
    /// The input does not start with the program magic.
    BadMagic([u8; 4]),
    /// The format version is not supported by this build.
    UnsupportedVersion(u32),
    /// A stored DFA could not be rebuilt.
    Dfa(DfaError),
    /// Structural corruption.
    Corrupt(&'static str),
}

impl fmt::Display for ProgramReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgramReadError::Io(e) => write!(f, "i/o error: {e}"),
            ProgramReadError::BadMagic(m) => write!(f, "bad magic {m:02x?}"),
            ProgramReadError::UnsupportedVersion(v) => {
                write!(f, "unsupported format version {v}")
            }
            ProgramReadError::Dfa(e) => write!(f, "{e}"),
            ProgramReadError::Corrupt(what) => write!(f, "corrupt program: {what}"),
        }
    }
}

impl std::error::Error for ProgramReadError {}

impl From<io::Error> for ProgramReadError {
    fn from(e: io::Error) -> Self {
        ProgramReadError::Io(e)
    }
}

impl From<DfaError> for ProgramReadError {
    fn from(e: DfaError) -> Self {
        ProgramReadError::Dfa(e)
    }
}

impl fmt::Display for VmProgram {
    /// Disassembly dump: a `.DATA` section listing the pools and a
    /// `.CODE` section with one decoded instruction per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".DATA")?;
        for (i, v) in self.fpool.iter().enumerate() {
            writeln!(f, "  FLOAT({i})\t{v}")?;
        }
        for (i, v) in self.ipool.iter().enumerate() {
            writeln!(f, "  CONST({i})\t{v}")?;
        }
        for i in 0..self.split_count() {
            write!(f, "  SPLIT({i})\t")?;
            for off in self.split_procs(i) {
                write!(f, " {off}")?;
            }
            writeln!(f)?;
        }
        for (i, dfa) in self.dfas.iter().enumerate() {
            write!(f, "  DFA({i})\t")?;
            for (j, p) in dfa.patterns().iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{p}")?;
            }
            writeln!(f)?;
        }
        writeln!(f, ".CODE")?;
        for (pc, &raw) in self.code.iter().enumerate() {
            let instr = Instruction::from(raw);
            if instr.op() == Ok(Opcode::Proc) {
                writeln!(f)?;
            }
            writeln!(f, "{pc:05}\t{raw:#010x}\t{instr}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arg, RegId};

    fn sample() -> VmProgram {
        VmProgram {
            code: vec![
                Instruction::proc(2).to_u32(),
                Instruction::token().to_u32(),
                Instruction::icmp(Arg::Reg(RegId::TT), Arg::Lit(4)).to_u32(),
                Instruction::jmp(crate::BranchCond::Eq, 2).to_u32(),
                Instruction::ret(1).to_u32(),
                Instruction::ret(0).to_u32(),
            ],
            fpool: vec![1.5, -0.0],
            ipool: vec![i64::MIN, 42],
            dfas: vec![PropertyDfa::build(vec![
                MatchPattern::Literal("foo".into()),
                MatchPattern::Search("^b".into()),
            ])
            .unwrap()],
            splits: VmProgram::build_split_table(&[vec![0, 6], vec![6]]),
        }
    }

    #[test]
    fn serialization_round_trips_bit_exactly() {
        let prog = sample();
        let bytes = prog.to_bytes();
        let back = VmProgram::read(&mut bytes.as_slice()).expect("read");
        assert_eq!(back, prog);
        assert_eq!(back.to_bytes(), bytes);
    }

    #[test]
    fn split_table_layout() {
        let table = VmProgram::build_split_table(&[vec![10, 20], vec![30]]);
        assert_eq!(table, vec![3, 5, 6, 10, 20, 30]);

        let prog = VmProgram {
            splits: table,
            ..VmProgram::default()
        };
        assert_eq!(prog.split_count(), 2);
        assert_eq!(prog.split_procs(0), &[10, 20]);
        assert_eq!(prog.split_procs(1), &[30]);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            VmProgram::read(&mut bytes.as_slice()),
            Err(ProgramReadError::BadMagic(_))
        ));

        let mut bytes = sample().to_bytes();
        bytes[4] = 0xff;
        assert!(matches!(
            VmProgram::read(&mut bytes.as_slice()),
            Err(ProgramReadError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn dump_lists_pools_and_code() {
        let text = sample().to_string();
        assert!(text.contains(".DATA"));
        assert!(text.contains("FLOAT(0)"));
        assert!(text.contains("SPLIT(0)"));
        assert!(text.contains(".CODE"));
        assert!(text.contains("TOKEN"));
    }
}
