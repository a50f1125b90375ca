//! Property-name matching.
//!
//! The compiler builds one DFA per match switch over the union of the
//! switch's labeled patterns, and dispatches on which subset of
//! patterns accepts a name. The automaton construction itself is
//! delegated to `regex-automata` dense DFAs; this module is the glue:
//! pattern labeling, reachable match-set enumeration, and incremental
//! (partial-token friendly) walking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use regex_automata::{
    dfa::{dense, Automaton, StartKind},
    util::{primitives::StateID, start},
    Anchored, MatchKind,
};

/// A labeled pattern fed into a [`PropertyDfa`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MatchPattern {
    /// Matches a name byte-for-byte (a `properties` key).
    Literal(String),
    /// Matches when the regex matches anywhere in the name
    /// (`patternProperties` / `pattern` search semantics).
    Search(String),
}

impl MatchPattern {
    /// Regex source implementing this pattern under whole-string,
    /// anchored matching.
    pub fn to_regex(&self) -> String {
        match self {
            MatchPattern::Literal(s) => regex_syntax::escape(s),
            MatchPattern::Search(s) => format!("(?s:.*)(?:{s})(?s:.*)"),
        }
    }

    /// The pattern source as written in the schema.
    pub fn source(&self) -> &str {
        match self {
            MatchPattern::Literal(s) | MatchPattern::Search(s) => s,
        }
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPattern::Literal(s) => write!(f, "\"{s}\""),
            MatchPattern::Search(s) => write!(f, "/{s}/"),
        }
    }
}

/// Sorted indices of the patterns a match case covers.
pub type MatchSet = Vec<usize>;

/// DFA construction failure, wrapping the automaton library's error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfaError(pub String);

impl fmt::Display for DfaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot build property DFA: {}", self.0)
    }
}

impl std::error::Error for DfaError {}

/// In-flight state of a DFA walk over a (possibly chunked) name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfaCursor(StateID);

/// A multi-pattern DFA over property names (or string values), with
/// one dispatch case per reachable set of simultaneously-accepting
/// patterns.
///
/// Case indices are 1-based; 0 means "no pattern matched". Cases are
/// numbered in ascending order of their smallest end-state id, which
/// makes construction deterministic for a given pattern list.
#[derive(Clone)]
pub struct PropertyDfa {
    patterns: Vec<MatchPattern>,
    dfa: dense::DFA<Vec<u32>>,
    start: StateID,
    cases: Vec<MatchSet>,
    state_cases: HashMap<StateID, u32>,
}

impl PropertyDfa {
    /// Build the DFA for `patterns` and enumerate its match cases.
    pub fn build(patterns: Vec<MatchPattern>) -> Result<Self, DfaError> {
        let sources: Vec<String> = patterns.iter().map(MatchPattern::to_regex).collect();
        let dfa = dense::Builder::new()
            .configure(
                dense::Config::new()
                    .start_kind(StartKind::Anchored)
                    .match_kind(MatchKind::All)
                    .minimize(true),
            )
            .build_many(&sources)
            .map_err(|e| DfaError(e.to_string()))?;

        let start = dfa
            .start_state(&start::Config::new().anchored(Anchored::Yes))
            .map_err(|e| DfaError(e.to_string()))?;

        let (cases, state_cases) = enumerate_cases(&dfa, start);

        Ok(PropertyDfa {
            patterns,
            dfa,
            start,
            cases,
            state_cases,
        })
    }

    /// The labeled patterns this DFA was built from.
    pub fn patterns(&self) -> &[MatchPattern] {
        &self.patterns
    }

    /// Match sets, one per case; case `c` (1-based) is at `c - 1`.
    pub fn match_sets(&self) -> &[MatchSet] {
        &self.cases
    }

    /// Number of dispatch cases (excluding the implicit "no match").
    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// Cursor positioned before the first name byte.
    pub fn cursor(&self) -> DfaCursor {
        DfaCursor(self.start)
    }

    /// Feed name bytes through the DFA.
    pub fn advance(&self, cursor: &mut DfaCursor, bytes: &[u8]) {
        for &b in bytes {
            cursor.0 = self.dfa.next_state(cursor.0, b);
        }
    }

    /// Close the walk at end of name; returns the case index, 0 when
    /// no pattern matched.
    pub fn finish(&self, cursor: DfaCursor) -> u32 {
        let eoi = self.dfa.next_eoi_state(cursor.0);
        self.state_cases.get(&eoi).copied().unwrap_or(0)
    }

    /// One-shot classification of a complete name.
    pub fn classify(&self, name: &[u8]) -> u32 {
        let mut cursor = self.cursor();
        self.advance(&mut cursor, name);
        self.finish(cursor)
    }
}

/// BFS the reachable states, collect the distinct end-of-input match
/// sets, and number them by ascending minimal end-state id.
fn enumerate_cases(
    dfa: &dense::DFA<Vec<u32>>,
    start: StateID,
) -> (Vec<MatchSet>, HashMap<StateID, u32>) {
    let mut seen: HashSet<StateID> = HashSet::new();
    let mut queue: VecDeque<StateID> = VecDeque::new();
    seen.insert(start);
    queue.push_back(start);

    // end state id -> match set
    let mut end_states: Vec<(StateID, MatchSet)> = Vec::new();
    let mut end_seen: HashSet<StateID> = HashSet::new();

    while let Some(state) = queue.pop_front() {
        let eoi = dfa.next_eoi_state(state);
        if dfa.is_match_state(eoi) && end_seen.insert(eoi) {
            let mut set: MatchSet = (0..dfa.match_len(eoi))
                .map(|i| dfa.match_pattern(eoi, i).as_usize())
                .collect();
            set.sort_unstable();
            set.dedup();
            end_states.push((eoi, set));
        }
        if dfa.is_dead_state(state) {
            continue;
        }
        for b in 0..=255u8 {
            let next = dfa.next_state(state, b);
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    end_states.sort_by_key(|(id, _)| id.as_usize());

    let mut cases: Vec<MatchSet> = Vec::new();
    let mut case_of_set: HashMap<MatchSet, u32> = HashMap::new();
    let mut state_cases: HashMap<StateID, u32> = HashMap::new();
    for (id, set) in end_states {
        let case = *case_of_set.entry(set.clone()).or_insert_with(|| {
            cases.push(set);
            cases.len() as u32
        });
        state_cases.insert(id, case);
    }
    (cases, state_cases)
}

impl fmt::Debug for PropertyDfa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDfa")
            .field("patterns", &self.patterns)
            .field("cases", &self.cases)
            .finish_non_exhaustive()
    }
}

// Rebuilding from the same pattern list is deterministic, so pattern
// equality is program equality.
impl PartialEq for PropertyDfa {
    fn eq(&self, other: &Self) -> bool {
        self.patterns == other.patterns
    }
}

impl Eq for PropertyDfa {}

#[cfg(test)]
mod tests {
    use super::*;

    fn dfa(patterns: &[MatchPattern]) -> PropertyDfa {
        PropertyDfa::build(patterns.to_vec()).expect("patterns build")
    }

    #[test]
    fn literal_names_get_disjoint_cases() {
        let d = dfa(&[
            MatchPattern::Literal("foo".into()),
            MatchPattern::Literal("bar".into()),
        ]);
        assert_eq!(d.case_count(), 2);

        let foo = d.classify(b"foo");
        let bar = d.classify(b"bar");
        assert_ne!(foo, 0);
        assert_ne!(bar, 0);
        assert_ne!(foo, bar);
        assert_eq!(d.classify(b"quux"), 0);
        assert_eq!(d.classify(b"fooo"), 0);

        assert_eq!(d.match_sets()[foo as usize - 1], vec![0]);
        assert_eq!(d.match_sets()[bar as usize - 1], vec![1]);
    }

    #[test]
    fn search_patterns_overlap_literals() {
        let d = dfa(&[
            MatchPattern::Literal("foo".into()),
            MatchPattern::Search("^f".into()),
        ]);
        let foo = d.classify(b"foo");
        let fizz = d.classify(b"fizz");
        assert_eq!(d.match_sets()[foo as usize - 1], vec![0, 1]);
        assert_eq!(d.match_sets()[fizz as usize - 1], vec![1]);
        assert_eq!(d.classify(b"bar"), 0);
    }

    #[test]
    fn search_is_unanchored() {
        let d = dfa(&[MatchPattern::Search("oo".into())]);
        assert_ne!(d.classify(b"foo"), 0);
        assert_ne!(d.classify(b"oops"), 0);
        assert_eq!(d.classify(b"o"), 0);
    }

    #[test]
    fn chunked_walk_matches_one_shot() {
        let d = dfa(&[
            MatchPattern::Literal("stream".into()),
            MatchPattern::Search("ea".into()),
        ]);
        let mut cursor = d.cursor();
        d.advance(&mut cursor, b"str");
        d.advance(&mut cursor, b"eam");
        assert_eq!(d.finish(cursor), d.classify(b"stream"));
    }

    #[test]
    fn empty_literal_matches_empty_name() {
        let d = dfa(&[MatchPattern::Literal(String::new())]);
        assert_ne!(d.classify(b""), 0);
        assert_eq!(d.classify(b"x"), 0);
    }

    #[test]
    fn case_numbering_is_stable() {
        let patterns = vec![
            MatchPattern::Literal("alpha".into()),
            MatchPattern::Literal("beta".into()),
            MatchPattern::Search("a$".into()),
        ];
        let a = dfa(&patterns);
        let b = dfa(&patterns);
        assert_eq!(a.match_sets(), b.match_sets());
        for name in [&b"alpha"[..], b"beta", b"gamma", b"a"] {
            assert_eq!(a.classify(name), b.classify(name));
        }
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(PropertyDfa::build(vec![MatchPattern::Search("(".into())]).is_err());
    }
}
