//! Constraint tree simplification.
//!
//! Rewrites each tree to a fixed point: boolean flattening and
//! constant absorption, range intersection/union, property-set and
//! required-set merging, and distribution of boolean operators over
//! token switches so that every tree ends up with a single outer
//! switch whose slots hold same-type constraints.

use super::{
    Cnode, CnodeArena, CnodeForest, CnodeId, CnodeList, CountKind, CountRange, NumRange, RangeFlags,
};

const MAX_ROUNDS: usize = 16;

/// Simplify a forest. The result owns a fresh arena; only tree roots
/// survive in `all_ids`.
pub fn simplify(forest: &CnodeForest) -> CnodeForest {
    let mut cur = simplify_once(forest);
    for _ in 0..MAX_ROUNDS {
        let next = simplify_once(&cur);
        if next.forests_equal(&cur) {
            return next;
        }
        cur = next;
    }
    debug_assert!(false, "simplifier did not reach a fixed point");
    cur
}

/// Simplify one subtree in place within its arena. Used by the
/// canonifier to normalize constraint conjunctions it builds after the
/// main simplification pass has run.
pub(crate) fn simplify_subtree(arena: &mut CnodeArena, id: CnodeId) -> CnodeId {
    Simplifier { arena }.simp(id)
}

fn simplify_once(forest: &CnodeForest) -> CnodeForest {
    let mut work = forest.arena.clone();
    let roots: Vec<CnodeId> = {
        let mut s = Simplifier { arena: &mut work };
        forest.trees.iter().map(|&t| s.simp(t)).collect()
    };

    // Compact the live trees into a fresh arena.
    let mut arena = CnodeArena::new();
    let trees: Vec<CnodeId> = roots.iter().map(|&r| arena.copy_tree(&work, r)).collect();

    let mut all_ids = indexmap::IndexMap::new();
    for (label, &tree) in &forest.tree_ids {
        all_ids.insert(label.clone(), trees[tree]);
    }

    CnodeForest {
        arena,
        trees,
        all_ids,
        ref_ids: forest.ref_ids.clone(),
        tree_ids: forest.tree_ids.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoolKind {
    And,
    Or,
    Xor,
}

struct Simplifier<'a> {
    arena: &'a mut CnodeArena,
}

impl Simplifier<'_> {
    fn simp(&mut self, id: CnodeId) -> CnodeId {
        match self.arena[id].clone() {
            Cnode::Valid
            | Cnode::Invalid
            | Cnode::StrMatch(_)
            | Cnode::NumInteger
            | Cnode::NumMultipleOf(_)
            | Cnode::Required(_)
            | Cnode::ArrUnique
            | Cnode::Ref(_)
            | Cnode::ReqMask { .. }
            | Cnode::ReqBit { .. } => id,

            // An unsatisfiable range is already invalid on its own.
            Cnode::NumRange(r) => {
                if r.is_empty() {
                    self.arena.alloc(Cnode::Invalid)
                } else {
                    id
                }
            }
            Cnode::CountRange(_, r) => {
                if r.is_empty() {
                    self.arena.alloc(Cnode::Invalid)
                } else {
                    id
                }
            }

            Cnode::And(kids) => self.combine(BoolKind::And, kids),
            Cnode::Or(kids) => self.combine(BoolKind::Or, kids),
            Cnode::Xor(kids) => self.combine(BoolKind::Xor, kids),

            Cnode::Not(k) => {
                let k = self.simp(k);
                match self.arena[k].clone() {
                    Cnode::Valid => self.arena.alloc(Cnode::Invalid),
                    Cnode::Invalid => self.arena.alloc(Cnode::Valid),
                    Cnode::Not(inner) => inner,
                    // Distribute negation over a switch so the outer
                    // switch stays the root of the tree.
                    Cnode::Switch(slots) => {
                        let mut out = slots;
                        for (i, &slot) in slots.iter().enumerate() {
                            let negated = self.arena.alloc(Cnode::Not(slot));
                            out[i] = self.simp(negated);
                        }
                        self.arena.alloc(Cnode::Switch(out))
                    }
                    _ => self.arena.alloc(Cnode::Not(k)),
                }
            }

            Cnode::Switch(slots) => {
                let mut out = slots;
                for (i, &slot) in slots.iter().enumerate() {
                    out[i] = self.simp(slot);
                }
                self.arena.alloc(Cnode::Switch(out))
            }

            Cnode::PropSet(kids) => {
                let kids = kids.iter().map(|&k| self.simp(k)).collect();
                self.arena.alloc(Cnode::PropSet(kids))
            }
            Cnode::PropMatch {
                pattern,
                constraint,
            } => {
                let constraint = self.simp(constraint);
                self.arena.alloc(Cnode::PropMatch {
                    pattern,
                    constraint,
                })
            }
            Cnode::PropDefault(k) => {
                let k = self.simp(k);
                self.arena.alloc(Cnode::PropDefault(k))
            }
            Cnode::PropNames(k) => {
                let k = self.simp(k);
                self.arena.alloc(Cnode::PropNames(k))
            }

            Cnode::ArrItem { items, additional } => {
                let items = items.iter().map(|&i| self.simp(i)).collect();
                let additional = additional.map(|a| self.simp(a));
                self.arena.alloc(Cnode::ArrItem { items, additional })
            }
            Cnode::ArrContains(k) => {
                let k = self.simp(k);
                self.arena.alloc(Cnode::ArrContains(k))
            }

            Cnode::MatchSwitch {
                dfa,
                default,
                cases,
            } => {
                let default = self.simp(default);
                let cases = cases.iter().map(|&c| self.simp(c)).collect();
                self.arena.alloc(Cnode::MatchSwitch {
                    dfa,
                    default,
                    cases,
                })
            }
            Cnode::MatchCase {
                matchset,
                name_constraint,
                value_constraint,
            } => {
                let name_constraint = name_constraint.map(|n| self.simp(n));
                let value_constraint = self.simp(value_constraint);
                self.arena.alloc(Cnode::MatchCase {
                    matchset,
                    name_constraint,
                    value_constraint,
                })
            }
        }
    }

    fn combine(&mut self, kind: BoolKind, kids: CnodeList) -> CnodeId {
        let mut flat: Vec<CnodeId> = Vec::with_capacity(kids.len());
        for kid in kids {
            let kid = self.simp(kid);
            // Rule 1: flatten associative booleans.
            match (&self.arena[kid], kind) {
                (Cnode::And(inner), BoolKind::And) | (Cnode::Or(inner), BoolKind::Or) => {
                    flat.extend(inner.iter().copied());
                }
                _ => flat.push(kid),
            }
        }

        // Rule 2: absorb constants.
        enum Absorb {
            Drop,
            Collapse(Cnode),
            Keep,
        }
        let mut kept: Vec<CnodeId> = Vec::with_capacity(flat.len());
        for kid in flat {
            let action = match (&self.arena[kid], kind) {
                (Cnode::Valid, BoolKind::And) => Absorb::Drop,
                (Cnode::Invalid, BoolKind::And) => Absorb::Collapse(Cnode::Invalid),
                (Cnode::Invalid, BoolKind::Or | BoolKind::Xor) => Absorb::Drop,
                (Cnode::Valid, BoolKind::Or) => Absorb::Collapse(Cnode::Valid),
                _ => Absorb::Keep,
            };
            match action {
                Absorb::Drop => {}
                Absorb::Collapse(node) => return self.arena.alloc(node),
                Absorb::Keep => kept.push(kid),
            }
        }

        // Rule 7: distribute over token switches.
        if kept.iter().any(|&k| matches!(self.arena[k], Cnode::Switch(_))) {
            return self.distribute(kind, kept);
        }

        let kept = match kind {
            BoolKind::And => self.merge_and(kept),
            BoolKind::Or => self.merge_or(kept),
            BoolKind::Xor => Ok(kept),
        };
        let kept = match kept {
            Ok(list) => list,
            Err(constant) => return constant,
        };

        // Rule 3: unary elision, and empty-list collapse.
        match (kept.len(), kind) {
            (0, BoolKind::And) => self.arena.alloc(Cnode::Valid),
            (0, _) => self.arena.alloc(Cnode::Invalid),
            (1, _) => kept[0],
            _ => {
                let list = CnodeList::from_vec(kept);
                self.arena.alloc(match kind {
                    BoolKind::And => Cnode::And(list),
                    BoolKind::Or => Cnode::Or(list),
                    BoolKind::Xor => Cnode::Xor(list),
                })
            }
        }
    }

    /// Rule 7. A child that is not a switch applies uniformly to every
    /// slot; slot lists re-enter `combine` so slot-level rules fire.
    fn distribute(&mut self, kind: BoolKind, kids: Vec<CnodeId>) -> CnodeId {
        let mut slots = [CnodeId(0); jsv_asm::SWITCH_KINDS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let mut list = CnodeList::new();
            for &kid in &kids {
                match &self.arena[kid] {
                    Cnode::Switch(sw) => list.push(sw[i]),
                    _ => list.push(kid),
                }
            }
            *slot = self.combine(kind, list);
        }
        self.arena.alloc(Cnode::Switch(slots))
    }

    /// Rules 4, 6, 8 under AND. `Err` carries a constant collapse.
    fn merge_and(&mut self, kids: Vec<CnodeId>) -> Result<Vec<CnodeId>, CnodeId> {
        let mut num_range: Option<NumRange> = None;
        let mut counts: [Option<(CountKind, CountRange)>; 3] = [None, None, None];
        let mut required: Option<std::collections::BTreeSet<String>> = None;
        let mut prop_sets: Vec<CnodeId> = Vec::new();
        let mut seen_unique = false;
        let mut rest: Vec<CnodeId> = Vec::new();

        for kid in kids {
            match self.arena[kid].clone() {
                Cnode::NumRange(r) => {
                    num_range = Some(match num_range {
                        None => r,
                        Some(prev) => num_intersect(prev, r),
                    });
                }
                Cnode::CountRange(kind, r) => {
                    let slot = count_slot(kind);
                    counts[slot] = Some(match counts[slot] {
                        None => (kind, r),
                        Some((_, prev)) => (kind, prev.intersect(&r)),
                    });
                }
                Cnode::Required(set) => {
                    required = Some(match required {
                        None => set,
                        Some(mut prev) => {
                            prev.extend(set);
                            prev
                        }
                    });
                }
                Cnode::PropSet(_) => prop_sets.push(kid),
                Cnode::ArrUnique => {
                    if !seen_unique {
                        seen_unique = true;
                        rest.push(kid);
                    }
                }
                _ => rest.push(kid),
            }
        }

        let mut out: Vec<CnodeId> = Vec::new();
        if let Some(r) = num_range {
            if r.is_empty() {
                return Err(self.arena.alloc(Cnode::Invalid));
            }
            out.push(self.arena.alloc(Cnode::NumRange(r)));
        }
        for entry in counts.into_iter().flatten() {
            let (kind, r) = entry;
            if r.is_empty() {
                return Err(self.arena.alloc(Cnode::Invalid));
            }
            out.push(self.arena.alloc(Cnode::CountRange(kind, r)));
        }
        if let Some(set) = required {
            out.push(self.arena.alloc(Cnode::Required(set)));
        }
        match prop_sets.len() {
            0 => {}
            1 => out.push(prop_sets[0]),
            _ => out.push(self.merge_prop_sets(prop_sets)),
        }
        out.extend(rest);
        Ok(out)
    }

    /// Rule 6: concatenate entries, intersect defaults and name
    /// constraints.
    fn merge_prop_sets(&mut self, sets: Vec<CnodeId>) -> CnodeId {
        let mut entries = CnodeList::new();
        let mut defaults: CnodeList = CnodeList::new();
        let mut names: CnodeList = CnodeList::new();

        for set in sets {
            let Cnode::PropSet(kids) = self.arena[set].clone() else {
                unreachable!("merge_prop_sets called on non-propset");
            };
            for kid in kids {
                match &self.arena[kid] {
                    Cnode::PropMatch { .. } => entries.push(kid),
                    Cnode::PropDefault(d) => defaults.push(*d),
                    Cnode::PropNames(n) => names.push(*n),
                    _ => entries.push(kid),
                }
            }
        }

        if !defaults.is_empty() {
            let merged = self.combine(BoolKind::And, defaults);
            entries.push(self.arena.alloc(Cnode::PropDefault(merged)));
        }
        if !names.is_empty() {
            let merged = self.combine(BoolKind::And, names);
            entries.push(self.arena.alloc(Cnode::PropNames(merged)));
        }
        self.arena.alloc(Cnode::PropSet(entries))
    }

    /// Rule 5: union ranges under OR, sorted by lower bound.
    fn merge_or(&mut self, kids: Vec<CnodeId>) -> Result<Vec<CnodeId>, CnodeId> {
        let mut num_ranges: Vec<NumRange> = Vec::new();
        let mut rest: Vec<CnodeId> = Vec::new();
        for kid in kids {
            match &self.arena[kid] {
                Cnode::NumRange(r) => num_ranges.push(*r),
                _ => rest.push(kid),
            }
        }
        if num_ranges.len() < 2 {
            let mut out: Vec<CnodeId> =
                num_ranges.into_iter().map(|r| self.arena.alloc(Cnode::NumRange(r))).collect();
            out.extend(rest);
            return Ok(out);
        }

        num_ranges.sort_by(|a, b| {
            lower_key(a)
                .partial_cmp(&lower_key(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut merged: Vec<NumRange> = Vec::new();
        for r in num_ranges {
            match merged.last_mut() {
                Some(prev) if ranges_connect(prev, &r) => {
                    *prev = range_union(*prev, r);
                }
                _ => merged.push(r),
            }
        }

        let mut out: Vec<CnodeId> = merged
            .into_iter()
            .map(|r| self.arena.alloc(Cnode::NumRange(r)))
            .collect();
        out.extend(rest);
        Ok(out)
    }
}

fn count_slot(kind: CountKind) -> usize {
    match kind {
        CountKind::Length => 0,
        CountKind::Props => 1,
        CountKind::Items => 2,
    }
}

fn num_intersect(a: NumRange, b: NumRange) -> NumRange {
    // (bound, exclusive) pairs; ties prefer the exclusive bound.
    let lower = |r: &NumRange| {
        r.flags
            .contains(RangeFlags::MIN)
            .then_some((r.min, r.flags.contains(RangeFlags::EXCL_MIN)))
    };
    let upper = |r: &NumRange| {
        r.flags
            .contains(RangeFlags::MAX)
            .then_some((r.max, r.flags.contains(RangeFlags::EXCL_MAX)))
    };

    let min = match (lower(&a), lower(&b)) {
        (None, x) | (x, None) => x,
        (Some((av, ax)), Some((bv, bx))) => {
            if av > bv {
                Some((av, ax))
            } else if bv > av {
                Some((bv, bx))
            } else {
                Some((av, ax || bx))
            }
        }
    };
    let max = match (upper(&a), upper(&b)) {
        (None, x) | (x, None) => x,
        (Some((av, ax)), Some((bv, bx))) => {
            if av < bv {
                Some((av, ax))
            } else if bv < av {
                Some((bv, bx))
            } else {
                Some((av, ax || bx))
            }
        }
    };

    let mut out = NumRange {
        flags: RangeFlags::empty(),
        min: 0.0,
        max: 0.0,
    };
    if let Some((v, excl)) = min {
        out.min = v;
        out.flags.insert(RangeFlags::MIN);
        out.flags.set(RangeFlags::EXCL_MIN, excl);
    }
    if let Some((v, excl)) = max {
        out.max = v;
        out.flags.insert(RangeFlags::MAX);
        out.flags.set(RangeFlags::EXCL_MAX, excl);
    }
    out
}

fn lower_key(r: &NumRange) -> f64 {
    if r.flags.contains(RangeFlags::MIN) {
        r.min
    } else {
        f64::NEG_INFINITY
    }
}

fn upper_key(r: &NumRange) -> f64 {
    if r.flags.contains(RangeFlags::MAX) {
        r.max
    } else {
        f64::INFINITY
    }
}

/// Overlapping or abutting, assuming `a`'s lower bound ≤ `b`'s.
fn ranges_connect(a: &NumRange, b: &NumRange) -> bool {
    let a_hi = upper_key(a);
    let b_lo = lower_key(b);
    if b_lo < a_hi {
        return true;
    }
    if b_lo > a_hi {
        return false;
    }
    // Touching bounds abut unless both are exclusive.
    !(a.flags.contains(RangeFlags::EXCL_MAX) && b.flags.contains(RangeFlags::EXCL_MIN))
}

fn range_union(a: NumRange, b: NumRange) -> NumRange {
    let mut out = a;
    // Lower bound comes from `a` (sorted), but an unbounded or
    // inclusive-at-equal `b` can loosen it.
    if !b.flags.contains(RangeFlags::MIN) {
        out.flags.remove(RangeFlags::MIN | RangeFlags::EXCL_MIN);
    } else if out.flags.contains(RangeFlags::MIN)
        && b.min == out.min
        && !b.flags.contains(RangeFlags::EXCL_MIN)
    {
        out.flags.remove(RangeFlags::EXCL_MIN);
    }

    let a_hi = upper_key(&a);
    let b_hi = upper_key(&b);
    if b_hi > a_hi {
        out.max = b.max;
        out.flags.set(RangeFlags::MAX, b.flags.contains(RangeFlags::MAX));
        out.flags
            .set(RangeFlags::EXCL_MAX, b.flags.contains(RangeFlags::EXCL_MAX));
        if !b.flags.contains(RangeFlags::MAX) {
            out.flags.remove(RangeFlags::MAX | RangeFlags::EXCL_MAX);
            out.max = 0.0;
        }
    } else if b_hi == a_hi && !b.flags.contains(RangeFlags::EXCL_MAX) {
        out.flags.remove(RangeFlags::EXCL_MAX);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnode::translate;
    use itertools::Itertools;
    use serde_json::json;

    fn simplified(schema: serde_json::Value) -> CnodeForest {
        let forest = translate(&schema).expect("translate");
        simplify(&forest)
    }

    #[test]
    fn simplify_is_idempotent() {
        let schemas = [
            json!({}),
            json!({"type": "number", "minimum": 1.0, "maximum": 5.0}),
            json!({"allOf": [{"minimum": 1}, {"minimum": 3, "maximum": 10}]}),
            json!({"anyOf": [{"minimum": 5}, {"maximum": 2}]}),
            json!({"oneOf": [{"type": "integer"}, {"minimum": 2}]}),
            json!({"properties": {"a": {"type": "string"}}, "required": ["a", "b"]}),
            json!({"dependencies": {"bar": ["foo"]}}),
            json!({"items": [{"type": "number"}], "additionalItems": {"type": "string"}}),
        ];
        for schema in schemas {
            let once = simplified(schema.clone());
            let twice = simplify(&once);
            assert!(
                twice.forests_equal(&once),
                "not idempotent for {schema}:\nonce:\n{}\ntwice:\n{}",
                once.dump_tree(once.trees[0]),
                twice.dump_tree(twice.trees[0]),
            );
        }
    }

    #[test]
    fn overlapping_and_ranges_intersect() {
        let forest = simplified(json!({"allOf": [{"minimum": 1}, {"minimum": 3, "maximum": 10}]}));
        let root = forest.trees[0];
        let Cnode::Switch(slots) = &forest.arena[root] else {
            panic!("root must be a switch");
        };
        let slot = slots[jsv_asm::EventKind::Number.switch_slot().unwrap()];
        match &forest.arena[slot] {
            Cnode::NumRange(r) => {
                assert_eq!(r.min, 3.0);
                assert_eq!(r.max, 10.0);
                assert_eq!(r.flags, RangeFlags::MIN | RangeFlags::MAX);
            }
            other => panic!("expected merged range, got {other:?}"),
        }
    }

    #[test]
    fn contradictory_ranges_become_invalid() {
        let forest = simplified(json!({"minimum": 5, "maximum": 2}));
        let root = forest.trees[0];
        let Cnode::Switch(slots) = &forest.arena[root] else {
            panic!("root must be a switch");
        };
        let slot = slots[jsv_asm::EventKind::Number.switch_slot().unwrap()];
        assert!(matches!(forest.arena[slot], Cnode::Invalid));
        // Other types stay unconstrained.
        let str_slot = slots[jsv_asm::EventKind::String.switch_slot().unwrap()];
        assert!(matches!(forest.arena[str_slot], Cnode::Valid));
    }

    #[test]
    fn or_ranges_union_when_overlapping() {
        let forest = simplified(json!({"anyOf": [
            {"minimum": 1, "maximum": 4},
            {"minimum": 3, "maximum": 10}
        ]}));
        let root = forest.trees[0];
        let Cnode::Switch(slots) = &forest.arena[root] else {
            panic!("root must be a switch");
        };
        let slot = slots[jsv_asm::EventKind::Number.switch_slot().unwrap()];
        match &forest.arena[slot] {
            Cnode::NumRange(r) => {
                assert_eq!((r.min, r.max), (1.0, 10.0));
            }
            other => panic!("expected merged union, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_or_ranges_stay_separate_sorted() {
        let forest = simplified(json!({"anyOf": [
            {"minimum": 5, "maximum": 6},
            {"minimum": 1, "maximum": 2}
        ]}));
        let root = forest.trees[0];
        let Cnode::Switch(slots) = &forest.arena[root] else {
            panic!("root must be a switch");
        };
        let slot = slots[jsv_asm::EventKind::Number.switch_slot().unwrap()];
        match &forest.arena[slot] {
            Cnode::Or(kids) => {
                assert_eq!(kids.len(), 2);
                let (Cnode::NumRange(a), Cnode::NumRange(b)) =
                    (&forest.arena[kids[0]], &forest.arena[kids[1]])
                else {
                    panic!("expected two ranges");
                };
                assert!(a.min < b.min);
            }
            other => panic!("expected OR of ranges, got {other:?}"),
        }
    }

    #[test]
    fn required_sets_union_under_and() {
        let forest = simplified(json!({"allOf": [
            {"required": ["a"]},
            {"required": ["b"]}
        ]}));
        let root = forest.trees[0];
        let Cnode::Switch(slots) = &forest.arena[root] else {
            panic!("root must be a switch");
        };
        let slot = slots[jsv_asm::EventKind::ObjectBeg.switch_slot().unwrap()];
        match &forest.arena[slot] {
            Cnode::Required(names) => {
                assert_eq!(names.iter().cloned().collect_vec(), vec!["a", "b"]);
            }
            other => panic!("expected merged required, got {other:?}"),
        }
    }

    #[test]
    fn switch_distribution_pushes_combinators_into_slots() {
        let forest = simplified(json!({"oneOf": [{"type": "integer"}, {"minimum": 2}]}));
        let root = forest.trees[0];
        let Cnode::Switch(slots) = &forest.arena[root] else {
            panic!("root must be a switch after distribution");
        };
        let num = slots[jsv_asm::EventKind::Number.switch_slot().unwrap()];
        match &forest.arena[num] {
            Cnode::Xor(kids) => assert_eq!(kids.len(), 2),
            other => panic!("expected slot-level xor, got {other:?}"),
        }
        // On a string the integer branch is invalid and the minimum
        // branch vacuously valid, so the slot collapses to valid.
        let s = slots[jsv_asm::EventKind::String.switch_slot().unwrap()];
        assert!(matches!(forest.arena[s], Cnode::Valid));
    }

    #[test]
    fn propsets_merge_under_and() {
        let forest = simplified(json!({"allOf": [
            {"properties": {"a": {"type": "number"}}},
            {"properties": {"b": {"type": "string"}}, "additionalProperties": false}
        ]}));
        let root = forest.trees[0];
        let Cnode::Switch(slots) = &forest.arena[root] else {
            panic!("root must be a switch");
        };
        let slot = slots[jsv_asm::EventKind::ObjectBeg.switch_slot().unwrap()];
        match &forest.arena[slot] {
            Cnode::PropSet(kids) => {
                let matches = kids
                    .iter()
                    .filter(|&&k| matches!(forest.arena[k], Cnode::PropMatch { .. }))
                    .count();
                let defaults = kids
                    .iter()
                    .filter(|&&k| matches!(forest.arena[k], Cnode::PropDefault(_)))
                    .count();
                assert_eq!((matches, defaults), (2, 1));
            }
            other => panic!("expected merged prop set, got {other:?}"),
        }
    }
}
