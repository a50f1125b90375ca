//! Constraint tree canonification.
//!
//! Replaces the surface forms the IR translator cannot emit directly:
//! `Required` sets become a `ReqMask` plus per-case `ReqBit` marks,
//! and property sets (and string patterns) become DFA-driven
//! `MatchSwitch`/`MatchCase` dispatch. Canonifying an already
//! canonical tree is a no-op.

use std::collections::BTreeSet;

use jsv_asm::{EventKind, MatchPattern, PropertyDfa};

use super::simplify::simplify_subtree;
use super::{Cnode, CnodeArena, CnodeForest, CnodeId, CnodeList};
use crate::CompileError;

/// Canonify a simplified forest.
pub fn canonify(forest: &CnodeForest) -> Result<CnodeForest, CompileError> {
    let mut c = Canonifier {
        arena: forest.arena.clone(),
    };
    let roots: Vec<CnodeId> = forest
        .trees
        .iter()
        .map(|&t| c.canon(t))
        .collect::<Result<_, _>>()?;

    let mut arena = CnodeArena::new();
    let trees: Vec<CnodeId> = roots.iter().map(|&r| arena.copy_tree(&c.arena, r)).collect();

    let mut all_ids = indexmap::IndexMap::new();
    for (label, &tree) in &forest.tree_ids {
        all_ids.insert(label.clone(), trees[tree]);
    }

    Ok(CnodeForest {
        arena,
        trees,
        all_ids,
        ref_ids: forest.ref_ids.clone(),
        tree_ids: forest.tree_ids.clone(),
    })
}

/// One labeled pattern of a match switch under construction.
#[derive(Debug, Clone, Copy)]
enum Entry {
    /// A property value schema, not yet canonified.
    Schema(CnodeId),
    /// A required-name marker setting the given mask bit.
    Bit(usize),
}

struct Canonifier {
    arena: CnodeArena,
}

impl Canonifier {
    /// Canonify a value-context subtree.
    fn canon(&mut self, id: CnodeId) -> Result<CnodeId, CompileError> {
        Ok(match self.arena[id].clone() {
            Cnode::Switch(slots) => {
                let mut out = slots;
                for (i, &slot) in slots.iter().enumerate() {
                    out[i] = match EventKind::from_switch_slot(i) {
                        EventKind::String => self.canon_string(slot)?,
                        EventKind::ObjectBeg => self.canon_object(slot)?,
                        _ => self.canon(slot)?,
                    };
                }
                self.arena.alloc(Cnode::Switch(out))
            }

            Cnode::And(kids) => {
                let kids = self.canon_list(kids, Self::canon)?;
                self.arena.alloc(Cnode::And(kids))
            }
            Cnode::Or(kids) => {
                let kids = self.canon_list(kids, Self::canon)?;
                self.arena.alloc(Cnode::Or(kids))
            }
            Cnode::Xor(kids) => {
                let kids = self.canon_list(kids, Self::canon)?;
                self.arena.alloc(Cnode::Xor(kids))
            }
            Cnode::Not(k) => {
                let k = self.canon(k)?;
                self.arena.alloc(Cnode::Not(k))
            }

            Cnode::ArrItem { items, additional } => {
                let items = items
                    .iter()
                    .map(|&i| self.canon(i))
                    .collect::<Result<_, _>>()?;
                let additional = additional.map(|a| self.canon(a)).transpose()?;
                self.arena.alloc(Cnode::ArrItem { items, additional })
            }
            Cnode::ArrContains(k) => {
                let k = self.canon(k)?;
                self.arena.alloc(Cnode::ArrContains(k))
            }

            Cnode::PropSet(_) | Cnode::Required(_) => {
                return Err(CompileError::Internal(
                    "property constraints outside an object scope".to_string(),
                ));
            }

            // Already canonical or atomic.
            _ => id,
        })
    }

    fn canon_list(
        &mut self,
        kids: CnodeList,
        f: fn(&mut Self, CnodeId) -> Result<CnodeId, CompileError>,
    ) -> Result<CnodeList, CompileError> {
        let mut out = CnodeList::new();
        for kid in kids {
            out.push(f(self, kid)?);
        }
        Ok(out)
    }

    /// Canonify a string-slot subtree: `StrMatch` becomes a
    /// single-case match switch over the string value.
    fn canon_string(&mut self, id: CnodeId) -> Result<CnodeId, CompileError> {
        Ok(match self.arena[id].clone() {
            Cnode::StrMatch(pattern) => {
                let dfa = build_dfa(vec![pattern.clone()])?;
                let valid = self.arena.alloc(Cnode::Valid);
                let case = self.arena.alloc(Cnode::MatchCase {
                    matchset: vec![pattern],
                    name_constraint: None,
                    value_constraint: valid,
                });
                let invalid = self.arena.alloc(Cnode::Invalid);
                let default = self.arena.alloc(Cnode::MatchCase {
                    matchset: Vec::new(),
                    name_constraint: None,
                    value_constraint: invalid,
                });
                self.arena.alloc(Cnode::MatchSwitch {
                    dfa: Some(dfa),
                    default,
                    cases: vec![case],
                })
            }
            Cnode::And(kids) => {
                let kids = self.canon_list(kids, Self::canon_string)?;
                self.arena.alloc(Cnode::And(kids))
            }
            Cnode::Or(kids) => {
                let kids = self.canon_list(kids, Self::canon_string)?;
                self.arena.alloc(Cnode::Or(kids))
            }
            Cnode::Xor(kids) => {
                let kids = self.canon_list(kids, Self::canon_string)?;
                self.arena.alloc(Cnode::Xor(kids))
            }
            Cnode::Not(k) => {
                let k = self.canon_string(k)?;
                self.arena.alloc(Cnode::Not(k))
            }
            _ => self.canon(id)?,
        })
    }

    /// Canonify an object-slot subtree: one scope owns one required
    /// mask and one match switch; combinator branches are separate
    /// scopes.
    fn canon_object(&mut self, id: CnodeId) -> Result<CnodeId, CompileError> {
        match self.arena[id].clone() {
            Cnode::And(kids) => self.canon_object_scope(kids),
            Cnode::PropSet(_) | Cnode::Required(_) => {
                self.canon_object_scope(CnodeList::from_slice(&[id]))
            }
            Cnode::Or(kids) => {
                let kids = self.canon_list(kids, Self::canon_object)?;
                Ok(self.arena.alloc(Cnode::Or(kids)))
            }
            Cnode::Xor(kids) => {
                let kids = self.canon_list(kids, Self::canon_object)?;
                Ok(self.arena.alloc(Cnode::Xor(kids)))
            }
            Cnode::Not(k) => {
                let k = self.canon_object(k)?;
                Ok(self.arena.alloc(Cnode::Not(k)))
            }
            _ => self.canon(id),
        }
    }

    fn canon_object_scope(&mut self, kids: CnodeList) -> Result<CnodeId, CompileError> {
        let mut required: Option<BTreeSet<String>> = None;
        let mut entries: Vec<(MatchPattern, Entry)> = Vec::new();
        let mut default: Option<CnodeId> = None;
        let mut names: Option<CnodeId> = None;
        let mut have_prop_set = false;
        let mut rest: Vec<CnodeId> = Vec::new();

        for kid in kids {
            match self.arena[kid].clone() {
                Cnode::Required(set) => {
                    // The simplifier merges sibling required sets.
                    required = Some(set);
                }
                Cnode::PropSet(members) => {
                    have_prop_set = true;
                    for member in members {
                        match self.arena[member].clone() {
                            Cnode::PropMatch {
                                pattern,
                                constraint,
                            } => entries.push((pattern, Entry::Schema(constraint))),
                            Cnode::PropDefault(d) => default = Some(self.canon(d)?),
                            Cnode::PropNames(n) => {
                                let part = self.string_part(n)?;
                                names = Some(self.canon_string(part)?);
                            }
                            _ => {
                                return Err(CompileError::Internal(
                                    "unexpected prop-set member".to_string(),
                                ));
                            }
                        }
                    }
                }
                _ => rest.push(self.canon_object(kid)?),
            }
        }

        if required.is_none() && !have_prop_set {
            return Ok(match rest.len() {
                0 => self.arena.alloc(Cnode::Valid),
                1 => rest[0],
                _ => self.arena.alloc(Cnode::And(CnodeList::from_vec(rest))),
            });
        }

        // Required names join the pattern list so their cases can mark
        // bits; names sort lexicographically for stable bit numbering.
        let nbits = required.as_ref().map(BTreeSet::len).unwrap_or(0);
        if let Some(set) = &required {
            for (bit, name) in set.iter().enumerate() {
                entries.push((MatchPattern::Literal(name.clone()), Entry::Bit(bit)));
            }
        }

        let mswitch = self.build_match_switch(entries, default, names)?;
        let mut out: Vec<CnodeId> = Vec::new();
        if nbits > 0 {
            out.push(self.arena.alloc(Cnode::ReqMask { nbits }));
        }
        out.push(mswitch);
        out.extend(rest);

        Ok(if out.len() == 1 {
            out[0]
        } else {
            self.arena.alloc(Cnode::And(CnodeList::from_vec(out)))
        })
    }

    fn build_match_switch(
        &mut self,
        entries: Vec<(MatchPattern, Entry)>,
        default: Option<CnodeId>,
        names: Option<CnodeId>,
    ) -> Result<CnodeId, CompileError> {
        let default_value = match default {
            Some(d) => d,
            None => self.arena.alloc(Cnode::Valid),
        };
        let default_case = self.arena.alloc(Cnode::MatchCase {
            matchset: Vec::new(),
            name_constraint: names,
            value_constraint: default_value,
        });

        if entries.is_empty() {
            return Ok(self.arena.alloc(Cnode::MatchSwitch {
                dfa: None,
                default: default_case,
                cases: Vec::new(),
            }));
        }

        let patterns: Vec<MatchPattern> = entries.iter().map(|(p, _)| p.clone()).collect();
        let dfa = build_dfa(patterns.clone())?;

        let mut cases = Vec::with_capacity(dfa.case_count());
        for set in dfa.match_sets().to_vec() {
            let matchset: Vec<MatchPattern> = set.iter().map(|&i| patterns[i].clone()).collect();

            // Overlapping entries intersect. The raw schemas are ANDed
            // and re-simplified first, so their switches merge into one
            // dispatch; required-bit marks stay outside the merge.
            let mut bits: Vec<usize> = Vec::new();
            let mut schemas: Vec<CnodeId> = Vec::new();
            for &i in &set {
                match entries[i].1 {
                    Entry::Bit(bit) => bits.push(bit),
                    Entry::Schema(id) => schemas.push(id),
                }
            }
            let value = match schemas.len() {
                0 => None,
                1 => Some(self.canon(schemas[0])?),
                _ => {
                    let and = self.arena.alloc(Cnode::And(CnodeList::from_vec(schemas)));
                    let merged = simplify_subtree(&mut self.arena, and);
                    Some(self.canon(merged)?)
                }
            };

            let value_constraint = {
                let mut parts: Vec<CnodeId> = bits
                    .into_iter()
                    .map(|bit| self.arena.alloc(Cnode::ReqBit { bit }))
                    .collect();
                if let Some(v) = value {
                    parts.push(v);
                }
                match parts.len() {
                    0 => self.arena.alloc(Cnode::Valid),
                    1 => parts[0],
                    _ => self.arena.alloc(Cnode::And(CnodeList::from_vec(parts))),
                }
            };

            cases.push(self.arena.alloc(Cnode::MatchCase {
                matchset,
                name_constraint: names,
                value_constraint,
            }));
        }

        Ok(self.arena.alloc(Cnode::MatchSwitch {
            dfa: Some(dfa),
            default: default_case,
            cases,
        }))
    }

    /// Project a value schema onto its string-applicable part, for
    /// `propertyNames` constraints evaluated against name tokens.
    fn string_part(&mut self, id: CnodeId) -> Result<CnodeId, CompileError> {
        Ok(match self.arena[id].clone() {
            Cnode::Switch(slots) => slots[EventKind::String.switch_slot().unwrap()],
            Cnode::And(kids) => {
                let kids = self.canon_list(kids, Self::string_part)?;
                self.arena.alloc(Cnode::And(kids))
            }
            Cnode::Or(kids) => {
                let kids = self.canon_list(kids, Self::string_part)?;
                self.arena.alloc(Cnode::Or(kids))
            }
            Cnode::Xor(kids) => {
                let kids = self.canon_list(kids, Self::string_part)?;
                self.arena.alloc(Cnode::Xor(kids))
            }
            Cnode::Not(k) => {
                let k = self.string_part(k)?;
                self.arena.alloc(Cnode::Not(k))
            }
            Cnode::Valid | Cnode::Invalid => id,
            other => {
                return Err(CompileError::Internal(format!(
                    "cannot project {other:?} onto the string slot"
                )))
            }
        })
    }
}

fn build_dfa(patterns: Vec<MatchPattern>) -> Result<PropertyDfa, CompileError> {
    let summary = patterns
        .iter()
        .map(|p| p.source().to_string())
        .collect::<Vec<_>>()
        .join("|");
    PropertyDfa::build(patterns).map_err(|e| CompileError::PatternCompile {
        path: String::new(),
        pattern: summary,
        reason: e.to_string(),
    })
}
