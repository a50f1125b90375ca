//! Constraint trees.
//!
//! The first intermediate representation: a typed tree that classifies
//! every node as control, token-switch, or per-type constraint. The
//! translator produces a [`CnodeForest`] from the schema AST, the
//! simplifier rewrites it to a fixed point, and the canonifier
//! replaces the property-set and required-set surface forms with
//! DFA-driven [`Cnode::MatchSwitch`] and bitmask
//! [`Cnode::ReqMask`]/[`Cnode::ReqBit`] nodes the IR translator can
//! emit directly.

mod canonify;
mod simplify;
mod translate;

pub use canonify::canonify;
pub use simplify::simplify;
pub use translate::translate;

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Index;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use jsv_asm::{EventKind, MatchPattern, PropertyDfa, SWITCH_KINDS};

bitflags::bitflags! {
    /// Which bounds of a numeric range are active, and whether the
    /// active bounds are exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RangeFlags: u8 {
        /// Lower bound is active.
        const MIN = 1 << 0;
        /// Upper bound is active.
        const MAX = 1 << 1;
        /// Lower bound is exclusive.
        const EXCL_MIN = 1 << 2;
        /// Upper bound is exclusive.
        const EXCL_MAX = 1 << 3;
    }
}

/// A numeric range constraint (`minimum` / `maximum`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumRange {
    pub flags: RangeFlags,
    pub min: f64,
    pub max: f64,
}

impl NumRange {
    /// Whether `v` satisfies the active bounds.
    pub fn contains(&self, v: f64) -> bool {
        if self.flags.contains(RangeFlags::MIN) {
            if self.flags.contains(RangeFlags::EXCL_MIN) {
                if v <= self.min {
                    return false;
                }
            } else if v < self.min {
                return false;
            }
        }
        if self.flags.contains(RangeFlags::MAX) {
            if self.flags.contains(RangeFlags::EXCL_MAX) {
                if v >= self.max {
                    return false;
                }
            } else if v > self.max {
                return false;
            }
        }
        true
    }

    /// Whether no number can satisfy the range.
    pub fn is_empty(&self) -> bool {
        if !self.flags.contains(RangeFlags::MIN) || !self.flags.contains(RangeFlags::MAX) {
            return false;
        }
        if self.min > self.max {
            return true;
        }
        self.min == self.max
            && self
                .flags
                .intersects(RangeFlags::EXCL_MIN | RangeFlags::EXCL_MAX)
    }
}

/// A count range over string length, property count or item count.
/// `max` is only meaningful when `upper` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountRange {
    pub min: u64,
    pub max: u64,
    pub upper: bool,
}

impl CountRange {
    /// Range with only a minimum.
    pub fn at_least(min: u64) -> Self {
        CountRange {
            min,
            max: 0,
            upper: false,
        }
    }

    /// Whether no count can satisfy the range.
    pub fn is_empty(&self) -> bool {
        self.upper && self.min > self.max
    }

    /// Intersection of two count ranges.
    pub fn intersect(&self, other: &CountRange) -> CountRange {
        let min = self.min.max(other.min);
        let (max, upper) = match (self.upper, other.upper) {
            (true, true) => (self.max.min(other.max), true),
            (true, false) => (self.max, true),
            (false, true) => (other.max, true),
            (false, false) => (0, false),
        };
        CountRange { min, max, upper }
    }
}

/// Which sort of count a [`Cnode::LengthRange`]-family node constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountKind {
    /// String length.
    Length,
    /// Object property count.
    Props,
    /// Array item count.
    Items,
}

/// Index of a node within its [`CnodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CnodeId(u32);

impl CnodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Child list storage for control nodes.
pub type CnodeList = SmallVec<[CnodeId; 4]>;

/// One constraint node. Children are ids into the owning arena.
#[derive(Debug, Clone, PartialEq)]
pub enum Cnode {
    /// Always valid.
    Valid,
    /// Always invalid.
    Invalid,
    /// All children must be valid.
    And(CnodeList),
    /// At least one child must be valid.
    Or(CnodeList),
    /// Exactly one child must be valid.
    Xor(CnodeList),
    /// Child must be invalid.
    Not(CnodeId),
    /// Nine-way dispatch on the token type of the value.
    Switch([CnodeId; SWITCH_KINDS]),

    /// Count range constraint; the kind records what is counted.
    CountRange(CountKind, CountRange),
    /// String must match the pattern.
    StrMatch(MatchPattern),
    /// Numeric range.
    NumRange(NumRange),
    /// Number must be integral.
    NumInteger,
    /// Number must be a multiple of the divisor.
    NumMultipleOf(f64),

    /// Object property constraints; children are `PropMatch`,
    /// `PropDefault` and `PropNames` nodes.
    PropSet(CnodeList),
    /// One pattern → value-constraint entry of a prop set.
    PropMatch {
        pattern: MatchPattern,
        constraint: CnodeId,
    },
    /// Constraint on properties no pattern matched.
    PropDefault(CnodeId),
    /// Constraint on the property names themselves.
    PropNames(CnodeId),
    /// The named properties must all be present.
    Required(BTreeSet<String>),

    /// Array item constraints: per-index tuple items, then the
    /// constraint for the remaining items (`None` leaves them
    /// unconstrained).
    ArrItem {
        items: Vec<CnodeId>,
        additional: Option<CnodeId>,
    },
    /// Array items must be unique.
    ArrUnique,
    /// At least one array item must satisfy the child.
    ArrContains(CnodeId),

    /// Call the validation tree registered under the resolved id.
    Ref(String),

    /// Canonical-only: declares a required-property bitmask of the
    /// given width for the enclosing object scope.
    ReqMask { nbits: usize },
    /// Canonical-only: the enclosing match case marks this bit.
    ReqBit { bit: usize },
    /// Canonical-only: DFA-driven dispatch over property names or a
    /// string value. `dfa` is `None` when there are no patterns and
    /// only the default applies. Children are `MatchCase` nodes;
    /// `default` is a `MatchCase` with an empty match set.
    MatchSwitch {
        dfa: Option<PropertyDfa>,
        default: CnodeId,
        cases: Vec<CnodeId>,
    },
    /// Canonical-only: one accepting case of a match switch.
    MatchCase {
        matchset: Vec<MatchPattern>,
        name_constraint: Option<CnodeId>,
        value_constraint: CnodeId,
    },
}

/// Arena owning the nodes of one pass.
#[derive(Debug, Clone, Default)]
pub struct CnodeArena {
    nodes: Vec<Cnode>,
}

impl CnodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocate a node, returning its id.
    pub fn alloc(&mut self, node: Cnode) -> CnodeId {
        let id = CnodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Overwrite an allocated node in place.
    pub(crate) fn replace(&mut self, id: CnodeId, node: Cnode) {
        self.nodes[id.index()] = node;
    }

    /// Deep-copy the tree rooted at `id` in `src` into this arena.
    pub fn copy_tree(&mut self, src: &CnodeArena, id: CnodeId) -> CnodeId {
        let node = match &src[id] {
            n @ (Cnode::Valid
            | Cnode::Invalid
            | Cnode::CountRange(..)
            | Cnode::StrMatch(_)
            | Cnode::NumRange(_)
            | Cnode::NumInteger
            | Cnode::NumMultipleOf(_)
            | Cnode::Required(_)
            | Cnode::ArrUnique
            | Cnode::Ref(_)
            | Cnode::ReqMask { .. }
            | Cnode::ReqBit { .. }) => n.clone(),
            Cnode::And(kids) => Cnode::And(self.copy_list(src, kids)),
            Cnode::Or(kids) => Cnode::Or(self.copy_list(src, kids)),
            Cnode::Xor(kids) => Cnode::Xor(self.copy_list(src, kids)),
            Cnode::Not(k) => {
                let k = *k;
                Cnode::Not(self.copy_tree(src, k))
            }
            Cnode::Switch(slots) => {
                let slots = *slots;
                let mut out = [CnodeId(0); SWITCH_KINDS];
                for (i, slot) in slots.iter().enumerate() {
                    out[i] = self.copy_tree(src, *slot);
                }
                Cnode::Switch(out)
            }
            Cnode::PropSet(kids) => Cnode::PropSet(self.copy_list(src, kids)),
            Cnode::PropMatch {
                pattern,
                constraint,
            } => {
                let (pattern, constraint) = (pattern.clone(), *constraint);
                Cnode::PropMatch {
                    pattern,
                    constraint: self.copy_tree(src, constraint),
                }
            }
            Cnode::PropDefault(k) => {
                let k = *k;
                Cnode::PropDefault(self.copy_tree(src, k))
            }
            Cnode::PropNames(k) => {
                let k = *k;
                Cnode::PropNames(self.copy_tree(src, k))
            }
            Cnode::ArrItem { items, additional } => {
                let (items, additional) = (items.clone(), *additional);
                Cnode::ArrItem {
                    items: items
                        .iter()
                        .map(|&item| self.copy_tree(src, item))
                        .collect(),
                    additional: additional.map(|a| self.copy_tree(src, a)),
                }
            }
            Cnode::ArrContains(k) => {
                let k = *k;
                Cnode::ArrContains(self.copy_tree(src, k))
            }
            Cnode::MatchSwitch {
                dfa,
                default,
                cases,
            } => {
                let (dfa, default, cases) = (dfa.clone(), *default, cases.clone());
                Cnode::MatchSwitch {
                    dfa,
                    default: self.copy_tree(src, default),
                    cases: cases.iter().map(|&c| self.copy_tree(src, c)).collect(),
                }
            }
            Cnode::MatchCase {
                matchset,
                name_constraint,
                value_constraint,
            } => {
                let (matchset, name_constraint, value_constraint) =
                    (matchset.clone(), *name_constraint, *value_constraint);
                Cnode::MatchCase {
                    matchset,
                    name_constraint: name_constraint.map(|n| self.copy_tree(src, n)),
                    value_constraint: self.copy_tree(src, value_constraint),
                }
            }
        };
        self.alloc(node)
    }

    fn copy_list(&mut self, src: &CnodeArena, kids: &CnodeList) -> CnodeList {
        kids.iter().map(|&k| self.copy_tree(src, k)).collect()
    }
}

impl Index<CnodeId> for CnodeArena {
    type Output = Cnode;

    fn index(&self, id: CnodeId) -> &Cnode {
        &self.nodes[id.index()]
    }
}

/// The forest of constraint trees produced by a pass: one tree per
/// callable validation root, plus the id tables.
#[derive(Debug, Clone, Default)]
pub struct CnodeForest {
    /// Node storage for this pass.
    pub arena: CnodeArena,
    /// Tree roots; tree 0 validates the document root.
    pub trees: Vec<CnodeId>,
    /// Every schema location label, in discovery order, mapped to its
    /// node. After simplification only tree roots survive here.
    pub all_ids: IndexMap<String, CnodeId>,
    /// Labels that are the target of a `$ref`.
    pub ref_ids: IndexSet<String>,
    /// Label → index into `trees`, for the labels that own a tree.
    pub tree_ids: IndexMap<String, usize>,
}

impl CnodeForest {
    /// Tree index owning the given ref label, if any.
    pub fn tree_of_id(&self, label: &str) -> Option<usize> {
        self.tree_ids.get(label).copied()
    }

    /// Structural equality of two trees, child order sensitive.
    pub fn trees_equal(&self, a: CnodeId, other: &CnodeForest, b: CnodeId) -> bool {
        nodes_equal(&self.arena, a, &other.arena, b)
    }

    /// Structural equality of whole forests: same tree count, same
    /// per-tree structure, same ref table.
    pub fn forests_equal(&self, other: &CnodeForest) -> bool {
        self.trees.len() == other.trees.len()
            && self.ref_ids == other.ref_ids
            && self.tree_ids.keys().eq(other.tree_ids.keys())
            && self
                .trees
                .iter()
                .zip(&other.trees)
                .all(|(&a, &b)| self.trees_equal(a, other, b))
    }

    /// Render a tree as indented text, for diagnostics.
    pub fn dump_tree(&self, id: CnodeId) -> String {
        let mut out = String::new();
        dump(&self.arena, id, 0, &mut out);
        out
    }
}

fn nodes_equal(aa: &CnodeArena, a: CnodeId, ba: &CnodeArena, b: CnodeId) -> bool {
    use Cnode::*;
    match (&aa[a], &ba[b]) {
        (Valid, Valid) | (Invalid, Invalid) | (NumInteger, NumInteger) | (ArrUnique, ArrUnique) => {
            true
        }
        (And(x), And(y)) | (Or(x), Or(y)) | (Xor(x), Xor(y)) | (PropSet(x), PropSet(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(&i, &j)| nodes_equal(aa, i, ba, j))
        }
        (Not(x), Not(y)) => nodes_equal(aa, *x, ba, *y),
        (Switch(x), Switch(y)) => x
            .iter()
            .zip(y.iter())
            .all(|(&i, &j)| nodes_equal(aa, i, ba, j)),
        (CountRange(kx, rx), CountRange(ky, ry)) => kx == ky && rx == ry,
        (StrMatch(x), StrMatch(y)) => x == y,
        (NumRange(x), NumRange(y)) => x == y,
        (NumMultipleOf(x), NumMultipleOf(y)) => x == y,
        (
            PropMatch {
                pattern: px,
                constraint: cx,
            },
            PropMatch {
                pattern: py,
                constraint: cy,
            },
        ) => px == py && nodes_equal(aa, *cx, ba, *cy),
        (PropDefault(x), PropDefault(y)) | (PropNames(x), PropNames(y)) => {
            nodes_equal(aa, *x, ba, *y)
        }
        (Required(x), Required(y)) => x == y,
        (
            ArrItem {
                items: ix,
                additional: ax,
            },
            ArrItem {
                items: iy,
                additional: ay,
            },
        ) => {
            ix.len() == iy.len()
                && ix
                    .iter()
                    .zip(iy.iter())
                    .all(|(&i, &j)| nodes_equal(aa, i, ba, j))
                && match (ax, ay) {
                    (None, None) => true,
                    (Some(i), Some(j)) => nodes_equal(aa, *i, ba, *j),
                    _ => false,
                }
        }
        (ArrContains(x), ArrContains(y)) => nodes_equal(aa, *x, ba, *y),
        (Ref(x), Ref(y)) => x == y,
        (ReqMask { nbits: x }, ReqMask { nbits: y }) => x == y,
        (ReqBit { bit: x }, ReqBit { bit: y }) => x == y,
        (
            MatchSwitch {
                dfa: dx,
                default: fx,
                cases: cx,
            },
            MatchSwitch {
                dfa: dy,
                default: fy,
                cases: cy,
            },
        ) => {
            dx == dy
                && nodes_equal(aa, *fx, ba, *fy)
                && cx.len() == cy.len()
                && cx
                    .iter()
                    .zip(cy.iter())
                    .all(|(&i, &j)| nodes_equal(aa, i, ba, j))
        }
        (
            MatchCase {
                matchset: mx,
                name_constraint: nx,
                value_constraint: vx,
            },
            MatchCase {
                matchset: my,
                name_constraint: ny,
                value_constraint: vy,
            },
        ) => {
            mx == my
                && match (nx, ny) {
                    (None, None) => true,
                    (Some(i), Some(j)) => nodes_equal(aa, *i, ba, *j),
                    _ => false,
                }
                && nodes_equal(aa, *vx, ba, *vy)
        }
        _ => false,
    }
}

fn dump(arena: &CnodeArena, id: CnodeId, depth: usize, out: &mut String) {
    use fmt::Write;

    let pad = "  ".repeat(depth);
    let node = &arena[id];
    match node {
        Cnode::Valid => writeln!(out, "{pad}VALID").unwrap(),
        Cnode::Invalid => writeln!(out, "{pad}INVALID").unwrap(),
        Cnode::And(kids) | Cnode::Or(kids) | Cnode::Xor(kids) => {
            let name = match node {
                Cnode::And(_) => "AND",
                Cnode::Or(_) => "OR",
                _ => "XOR",
            };
            writeln!(out, "{pad}{name}").unwrap();
            for &k in kids {
                dump(arena, k, depth + 1, out);
            }
        }
        Cnode::Not(k) => {
            writeln!(out, "{pad}NOT").unwrap();
            dump(arena, *k, depth + 1, out);
        }
        Cnode::Switch(slots) => {
            writeln!(out, "{pad}SWITCH").unwrap();
            for (i, &slot) in slots.iter().enumerate() {
                writeln!(out, "{pad}  {}:", EventKind::from_switch_slot(i)).unwrap();
                dump(arena, slot, depth + 2, out);
            }
        }
        Cnode::CountRange(kind, r) => {
            let name = match kind {
                CountKind::Length => "LENGTH_RANGE",
                CountKind::Props => "PROP_RANGE",
                CountKind::Items => "ITEM_RANGE",
            };
            if r.upper {
                writeln!(out, "{pad}{name} [{}, {}]", r.min, r.max).unwrap();
            } else {
                writeln!(out, "{pad}{name} [{}, ∞)", r.min).unwrap();
            }
        }
        Cnode::StrMatch(p) => writeln!(out, "{pad}STR_MATCH {p}").unwrap(),
        Cnode::NumRange(r) => {
            writeln!(
                out,
                "{pad}NUM_RANGE flags={:?} min={} max={}",
                r.flags, r.min, r.max
            )
            .unwrap();
        }
        Cnode::NumInteger => writeln!(out, "{pad}NUM_INTEGER").unwrap(),
        Cnode::NumMultipleOf(d) => writeln!(out, "{pad}NUM_MULTIPLE_OF {d}").unwrap(),
        Cnode::PropSet(kids) => {
            writeln!(out, "{pad}PROP_SET").unwrap();
            for &k in kids {
                dump(arena, k, depth + 1, out);
            }
        }
        Cnode::PropMatch {
            pattern,
            constraint,
        } => {
            writeln!(out, "{pad}PROP_MATCH {pattern}").unwrap();
            dump(arena, *constraint, depth + 1, out);
        }
        Cnode::PropDefault(k) => {
            writeln!(out, "{pad}PROP_DEFAULT").unwrap();
            dump(arena, *k, depth + 1, out);
        }
        Cnode::PropNames(k) => {
            writeln!(out, "{pad}PROP_NAMES").unwrap();
            dump(arena, *k, depth + 1, out);
        }
        Cnode::Required(names) => {
            write!(out, "{pad}REQUIRED [").unwrap();
            for (i, n) in names.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write!(out, "\"{n}\"").unwrap();
            }
            out.push_str("]\n");
        }
        Cnode::ArrItem { items, additional } => {
            writeln!(out, "{pad}ARR_ITEM tuple={}", items.len()).unwrap();
            for &item in items {
                dump(arena, item, depth + 1, out);
            }
            if let Some(a) = additional {
                writeln!(out, "{pad}  additional:").unwrap();
                dump(arena, *a, depth + 2, out);
            }
        }
        Cnode::ArrUnique => writeln!(out, "{pad}ARR_UNIQUE").unwrap(),
        Cnode::ArrContains(k) => {
            writeln!(out, "{pad}ARR_CONTAINS").unwrap();
            dump(arena, *k, depth + 1, out);
        }
        Cnode::Ref(id) => writeln!(out, "{pad}REF \"{id}\"").unwrap(),
        Cnode::ReqMask { nbits } => writeln!(out, "{pad}REQMASK nbits={nbits}").unwrap(),
        Cnode::ReqBit { bit } => writeln!(out, "{pad}REQBIT {bit}").unwrap(),
        Cnode::MatchSwitch {
            dfa,
            default,
            cases,
        } => {
            let npat = dfa.as_ref().map(|d| d.patterns().len()).unwrap_or(0);
            writeln!(out, "{pad}MATCH_SWITCH patterns={npat}").unwrap();
            for &c in cases {
                dump(arena, c, depth + 1, out);
            }
            writeln!(out, "{pad}  default:").unwrap();
            dump(arena, *default, depth + 2, out);
        }
        Cnode::MatchCase {
            matchset,
            name_constraint,
            value_constraint,
        } => {
            write!(out, "{pad}MATCH_CASE [").unwrap();
            for (i, p) in matchset.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write!(out, "{p}").unwrap();
            }
            out.push_str("]\n");
            if let Some(n) = name_constraint {
                writeln!(out, "{pad}  name:").unwrap();
                dump(arena, *n, depth + 2, out);
            }
            dump(arena, *value_constraint, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_range_intersection() {
        let a = CountRange {
            min: 1,
            max: 5,
            upper: true,
        };
        let b = CountRange::at_least(3);
        let c = a.intersect(&b);
        assert_eq!(
            c,
            CountRange {
                min: 3,
                max: 5,
                upper: true
            }
        );
        assert!(!c.is_empty());

        let d = c.intersect(&CountRange {
            min: 0,
            max: 2,
            upper: true,
        });
        assert!(d.is_empty());
    }

    #[test]
    fn num_range_membership() {
        let r = NumRange {
            flags: RangeFlags::MIN | RangeFlags::EXCL_MIN,
            min: 1.1,
            max: 0.0,
        };
        assert!(r.contains(1.2));
        assert!(!r.contains(1.1));
        assert!(!r.is_empty());

        let empty = NumRange {
            flags: RangeFlags::MIN | RangeFlags::MAX | RangeFlags::EXCL_MAX,
            min: 2.0,
            max: 2.0,
        };
        assert!(empty.is_empty());
    }

    #[test]
    fn copy_tree_preserves_structure() {
        let mut arena = CnodeArena::new();
        let v = arena.alloc(Cnode::Valid);
        let n = arena.alloc(Cnode::NumInteger);
        let and = arena.alloc(Cnode::And(CnodeList::from_slice(&[v, n])));

        let mut dst = CnodeArena::new();
        let copy = dst.copy_tree(&arena, and);
        assert!(nodes_equal(&arena, and, &dst, copy));
    }
}
