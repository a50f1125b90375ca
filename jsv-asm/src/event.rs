//! JSON token events.
//!
//! The compiler and the VM share this model: a validation frame opens
//! with a nine-way switch over [`EventKind`], and token-type literals
//! inside instructions encode the same discriminants.

use core::fmt;

/// Number of event kinds a type switch dispatches over.
///
/// [`EventKind::None`] is the "no event" placeholder and does not get a
/// switch slot.
pub const SWITCH_KINDS: usize = 9;

/// Kind of a streaming JSON event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum EventKind {
    /// No event. Produced by a drained source, never by a parse.
    #[default]
    None = 0x00,
    /// `null`
    Null = 0x01,
    /// `true`
    True = 0x02,
    /// `false`
    False = 0x03,
    /// A number; the event carries its `f64` value.
    Number = 0x04,
    /// A string; the event carries its bytes, possibly partial.
    String = 0x05,
    /// `{`
    ObjectBeg = 0x06,
    /// `}`
    ObjectEnd = 0x07,
    /// `[`
    ArrayBeg = 0x08,
    /// `]`
    ArrayEnd = 0x09,
}

impl EventKind {
    /// Slot of this kind in a type switch, or `None` for [`EventKind::None`].
    pub const fn switch_slot(self) -> Option<usize> {
        match self {
            EventKind::None => None,
            k => Some(k as usize - 1),
        }
    }

    /// Kind occupying switch slot `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= SWITCH_KINDS`.
    pub fn from_switch_slot(slot: usize) -> Self {
        assert!(slot < SWITCH_KINDS);
        Self::try_from(slot as u8 + 1).expect("slot bounds checked")
    }

    /// Whether this event begins a JSON value.
    pub const fn starts_value(self) -> bool {
        matches!(
            self,
            EventKind::Null
                | EventKind::True
                | EventKind::False
                | EventKind::Number
                | EventKind::String
                | EventKind::ObjectBeg
                | EventKind::ArrayBeg
        )
    }

    /// Whether this event opens a composite value.
    pub const fn opens(self) -> bool {
        matches!(self, EventKind::ObjectBeg | EventKind::ArrayBeg)
    }

    /// Whether this event closes a composite value.
    pub const fn closes(self) -> bool {
        matches!(self, EventKind::ObjectEnd | EventKind::ArrayEnd)
    }
}

impl TryFrom<u8> for EventKind {
    type Error = InvalidEventKind;

    fn try_from(b: u8) -> Result<Self, InvalidEventKind> {
        use EventKind::*;
        match b {
            0x00 => Ok(None),
            0x01 => Ok(Null),
            0x02 => Ok(True),
            0x03 => Ok(False),
            0x04 => Ok(Number),
            0x05 => Ok(String),
            0x06 => Ok(ObjectBeg),
            0x07 => Ok(ObjectEnd),
            0x08 => Ok(ArrayBeg),
            0x09 => Ok(ArrayEnd),
            _ => Err(InvalidEventKind(b)),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::None => "$NONE",
            EventKind::Null => "$NULL",
            EventKind::True => "$TRUE",
            EventKind::False => "$FALSE",
            EventKind::Number => "$NUMBER",
            EventKind::String => "$STRING",
            EventKind::ObjectBeg => "$OBJECT_BEG",
            EventKind::ObjectEnd => "$OBJECT_END",
            EventKind::ArrayBeg => "$ARRAY_BEG",
            EventKind::ArrayEnd => "$ARRAY_END",
        };
        f.write_str(name)
    }
}

/// The byte can't be mapped to any [`EventKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidEventKind(pub u8);

impl fmt::Display for InvalidEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event kind byte 0x{:02x}", self.0)
    }
}

impl std::error::Error for InvalidEventKind {}

/// One streaming JSON event.
///
/// The payload fields are only meaningful for the kinds that carry
/// them: `num` for numbers, `text`/`partial` for strings. Sources are
/// expected to reuse one `Event` allocation across calls.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Number value when `kind` is [`EventKind::Number`].
    pub num: f64,
    /// String bytes when `kind` is [`EventKind::String`].
    pub text: Vec<u8>,
    /// Whether a string event is a partial chunk with more to follow.
    pub partial: bool,
}

impl Event {
    /// Reset to the empty event, keeping the text allocation.
    pub fn clear(&mut self) {
        self.kind = EventKind::None;
        self.num = 0.0;
        self.text.clear();
        self.partial = false;
    }

    /// Event for a bare kind with no payload.
    pub fn of(kind: EventKind) -> Self {
        Event {
            kind,
            ..Self::default()
        }
    }

    /// Number event.
    pub fn number(num: f64) -> Self {
        Event {
            kind: EventKind::Number,
            num,
            ..Self::default()
        }
    }

    /// Complete string event.
    pub fn string(text: impl Into<Vec<u8>>) -> Self {
        Event {
            kind: EventKind::String,
            text: text.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn kind_byte_round_trip() {
        for kind in EventKind::iter() {
            assert_eq!(EventKind::try_from(kind as u8), Ok(kind));
        }
        assert!(EventKind::try_from(0x0a).is_err());
    }

    #[test]
    fn switch_slots_cover_all_value_kinds() {
        let mut seen = [false; SWITCH_KINDS];
        for kind in EventKind::iter() {
            if let Some(slot) = kind.switch_slot() {
                assert!(!seen[slot]);
                seen[slot] = true;
                assert_eq!(EventKind::from_switch_slot(slot), kind);
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
