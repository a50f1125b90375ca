//! Uniqueness tracking for `uniqueItems` arrays.
//!
//! A tracker is armed when the machine enters a unique array and then
//! observes every token the machine reads until the array closes. Each
//! completed item is reduced to a canonical byte encoding — a tag byte
//! per value, numbers as normalized IEEE-754 bits, object members
//! sorted by key — so equal values collide regardless of how they were
//! spelled, and object key order never matters. The seen-set hashes
//! with a per-tracker random state, so the seed changes on every
//! validation.

use std::collections::HashSet;

use jsv_asm::{Event, EventKind};

/// What an observed token did to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UniqOutcome {
    /// Keep feeding tokens.
    Next,
    /// The tracked array closed; every item was unique.
    Complete,
    /// The token completed an item equal to an earlier one.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Array,
    /// Object waiting for a key (or `}`).
    ObjectKey,
    /// Object waiting for the value of the last key.
    ObjectValue,
}

#[derive(Debug)]
struct Composite {
    container: Container,
    entries: Vec<Vec<u8>>,
}

/// Pushdown tracker over one unique array.
#[derive(Debug, Default)]
pub(crate) struct UniqueTracker {
    seen: HashSet<Vec<u8>>,
    stack: Vec<Composite>,
    /// Accumulated bytes of an in-flight partial string.
    partial: Vec<u8>,
}

impl UniqueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one token of the tracked array's item stream.
    pub fn observe(&mut self, evt: &Event) -> UniqOutcome {
        let entry: Vec<u8> = match evt.kind {
            EventKind::None => return UniqOutcome::Next,
            EventKind::Null | EventKind::True | EventKind::False => vec![evt.kind as u8],
            EventKind::Number => {
                let mut e = Vec::with_capacity(9);
                e.push(EventKind::Number as u8);
                e.extend_from_slice(&normalize_number(evt.num).to_le_bytes());
                e
            }
            EventKind::String => {
                if evt.partial {
                    self.partial.extend_from_slice(&evt.text);
                    return UniqOutcome::Next;
                }
                let mut e = Vec::with_capacity(1 + self.partial.len() + evt.text.len());
                e.push(EventKind::String as u8);
                e.append(&mut self.partial);
                e.extend_from_slice(&evt.text);
                e
            }
            EventKind::ArrayBeg => {
                self.stack.push(Composite {
                    container: Container::Array,
                    entries: Vec::new(),
                });
                return UniqOutcome::Next;
            }
            EventKind::ObjectBeg => {
                self.stack.push(Composite {
                    container: Container::ObjectKey,
                    entries: Vec::new(),
                });
                return UniqOutcome::Next;
            }
            EventKind::ArrayEnd => {
                let Some(top) = self.stack.pop() else {
                    // The unique array itself closed.
                    return UniqOutcome::Complete;
                };
                debug_assert_eq!(top.container, Container::Array);
                encode_composite(EventKind::ArrayBeg, top.entries)
            }
            EventKind::ObjectEnd => {
                let Some(top) = self.stack.pop() else {
                    return UniqOutcome::Complete;
                };
                debug_assert_eq!(top.container, Container::ObjectKey);
                encode_object(top.entries)
            }
        };
        self.finish_entry(entry)
    }

    fn finish_entry(&mut self, entry: Vec<u8>) -> UniqOutcome {
        match self.stack.last_mut() {
            None => {
                if self.seen.insert(entry) {
                    UniqOutcome::Next
                } else {
                    UniqOutcome::Duplicate
                }
            }
            Some(top) => {
                top.entries.push(entry);
                top.container = match top.container {
                    Container::Array => Container::Array,
                    Container::ObjectKey => Container::ObjectValue,
                    Container::ObjectValue => Container::ObjectKey,
                };
                UniqOutcome::Next
            }
        }
    }
}

/// `-0` collapses onto `0` so the two spellings collide.
fn normalize_number(v: f64) -> u64 {
    if v == 0.0 {
        0.0f64.to_bits()
    } else {
        v.to_bits()
    }
}

fn encode_composite(tag: EventKind, entries: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + entries.iter().map(Vec::len).sum::<usize>());
    out.push(tag as u8);
    for e in entries {
        out.extend_from_slice(&e);
    }
    out
}

/// Objects encode with their members sorted by key, making the
/// encoding insensitive to member order.
fn encode_object(entries: Vec<Vec<u8>>) -> Vec<u8> {
    debug_assert!(entries.len() % 2 == 0, "object members come in pairs");
    let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(entries.len() / 2);
    let mut iter = entries.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    out.push(EventKind::ObjectBeg as u8);
    for (k, v) in pairs {
        out.extend_from_slice(&k);
        out.extend_from_slice(&v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(tracker: &mut UniqueTracker, events: &[Event]) -> Vec<UniqOutcome> {
        events.iter().map(|e| tracker.observe(e)).collect()
    }

    fn evs(spec: &str) -> Vec<Event> {
        // Tiny shorthand: each character is one event.
        spec.chars()
            .map(|c| match c {
                '[' => Event::of(EventKind::ArrayBeg),
                ']' => Event::of(EventKind::ArrayEnd),
                '{' => Event::of(EventKind::ObjectBeg),
                '}' => Event::of(EventKind::ObjectEnd),
                'n' => Event::of(EventKind::Null),
                't' => Event::of(EventKind::True),
                'f' => Event::of(EventKind::False),
                d @ '0'..='9' => Event::number(d.to_digit(10).unwrap() as f64),
                c => Event::string(c.to_string().into_bytes()),
            })
            .collect()
    }

    #[test]
    fn scalar_duplicates_are_detected() {
        let mut t = UniqueTracker::new();
        let out = feed(&mut t, &evs("121"));
        assert_eq!(out, vec![UniqOutcome::Next, UniqOutcome::Next, UniqOutcome::Duplicate]);
    }

    #[test]
    fn distinct_scalars_complete() {
        let mut t = UniqueTracker::new();
        let out = feed(&mut t, &evs("12n]"));
        assert_eq!(out.last(), Some(&UniqOutcome::Complete));
        assert!(!out.contains(&UniqOutcome::Duplicate));
    }

    #[test]
    fn number_and_string_spellings_do_not_collide() {
        let mut t = UniqueTracker::new();
        let one_num = Event::number(1.0);
        let one_str = Event::string(b"1".to_vec());
        assert_eq!(t.observe(&one_num), UniqOutcome::Next);
        assert_eq!(t.observe(&one_str), UniqOutcome::Next);
    }

    #[test]
    fn negative_zero_collides_with_zero() {
        let mut t = UniqueTracker::new();
        assert_eq!(t.observe(&Event::number(0.0)), UniqOutcome::Next);
        assert_eq!(t.observe(&Event::number(-0.0)), UniqOutcome::Duplicate);
    }

    #[test]
    fn arrays_are_order_sensitive() {
        let mut t = UniqueTracker::new();
        let out = feed(&mut t, &evs("[12][21]"));
        assert!(!out.contains(&UniqOutcome::Duplicate));

        let mut t = UniqueTracker::new();
        let out = feed(&mut t, &evs("[12][12]"));
        assert_eq!(out.last(), Some(&UniqOutcome::Duplicate));
    }

    #[test]
    fn objects_are_key_order_insensitive() {
        // [{"a":1,"b":2},{"b":2,"a":1}]
        let mut t = UniqueTracker::new();
        let events = vec![
            Event::of(EventKind::ObjectBeg),
            Event::string(b"a".to_vec()),
            Event::number(1.0),
            Event::string(b"b".to_vec()),
            Event::number(2.0),
            Event::of(EventKind::ObjectEnd),
            Event::of(EventKind::ObjectBeg),
            Event::string(b"b".to_vec()),
            Event::number(2.0),
            Event::string(b"a".to_vec()),
            Event::number(1.0),
            Event::of(EventKind::ObjectEnd),
        ];
        let out = feed(&mut t, &events);
        assert_eq!(out.last(), Some(&UniqOutcome::Duplicate));
    }

    #[test]
    fn nested_composites_encode_recursively() {
        let mut t = UniqueTracker::new();
        let out = feed(&mut t, &evs("[[1]][[1]]"));
        assert_eq!(out.last(), Some(&UniqOutcome::Duplicate));
    }

    #[test]
    fn partial_strings_accumulate() {
        let mut t = UniqueTracker::new();
        let mut chunk1 = Event::string(b"he".to_vec());
        chunk1.partial = true;
        let chunk2 = Event::string(b"llo".to_vec());
        assert_eq!(t.observe(&chunk1), UniqOutcome::Next);
        assert_eq!(t.observe(&chunk2), UniqOutcome::Next);
        assert_eq!(
            t.observe(&Event::string(b"hello".to_vec())),
            UniqOutcome::Duplicate
        );
    }
}
