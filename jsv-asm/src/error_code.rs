//! Validation failure codes.

use core::fmt;

/// Failure code carried by a `RETURN` instruction and surfaced from
/// validation.
///
/// The numbering is stable: it is part of the byte-code contract, and
/// serialized programs rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The code can't be mapped to any known `ErrorCode`.
    Unknown = 0x00,
    /// Token type did not match the frame's type switch.
    UnexpectedToken = 0x01,
    /// Number had a fractional component where an integer was required.
    NotInteger = 0x02,
    /// Number failed a range or multiple-of check.
    Number = 0x03,
    /// Property count below the declared minimum.
    TooFewProps = 0x04,
    /// Property count above the declared maximum.
    TooManyProps = 0x05,
    /// One or more required properties never appeared.
    MissingRequiredProperties = 0x06,
    /// An OR/XOR/dependencies combinator was not satisfied.
    SplitCondition = 0x07,
    /// Property name not accepted.
    BadPropertyName = 0x08,
    /// Item count below the declared minimum.
    TooFewItems = 0x09,
    /// Item count above the declared maximum.
    TooManyItems = 0x0a,
    /// Duplicate item in a `uniqueItems` array.
    NotUnique = 0x0b,
    /// Internal invariant: no match case applied.
    MatchCase = 0x0c,
    /// `CALL` or `SPLIT` exceeded the configured stack depth.
    StackOverflow = 0x0d,
}

impl ErrorCode {
    /// Short human-readable message for diagnostics.
    pub const fn message(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown error",
            ErrorCode::UnexpectedToken => "unexpected token",
            ErrorCode::NotInteger => "number is not an integer",
            ErrorCode::Number => "number not valid",
            ErrorCode::TooFewProps => "too few properties",
            ErrorCode::TooManyProps => "too many properties",
            ErrorCode::MissingRequiredProperties => "missing required properties",
            ErrorCode::SplitCondition => "invalid split condition",
            ErrorCode::BadPropertyName => "bad property name",
            ErrorCode::TooFewItems => "too few items",
            ErrorCode::TooManyItems => "too many items",
            ErrorCode::NotUnique => "array items are not unique",
            ErrorCode::MatchCase => "invalid match case",
            ErrorCode::StackOverflow => "stack overflow",
        }
    }
}

impl From<u16> for ErrorCode {
    /// Converts the `u16` into an `ErrorCode`, mapping unassigned
    /// values to [`ErrorCode::Unknown`].
    fn from(code: u16) -> Self {
        use ErrorCode::*;
        match code {
            0x01 => UnexpectedToken,
            0x02 => NotInteger,
            0x03 => Number,
            0x04 => TooFewProps,
            0x05 => TooManyProps,
            0x06 => MissingRequiredProperties,
            0x07 => SplitCondition,
            0x08 => BadPropertyName,
            0x09 => TooFewItems,
            0x0a => TooManyItems,
            0x0b => NotUnique,
            0x0c => MatchCase,
            0x0d => StackOverflow,
            _ => Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.message(), *self as u16)
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn u16_round_trip() {
        let past_last = ErrorCode::iter().last().unwrap() as u16 + 1;
        for i in 1..past_last {
            let code = ErrorCode::from(i);
            assert_eq!(code as u16, i);
        }
        for i in [0u16, past_last, 0x100, u16::MAX] {
            assert_eq!(ErrorCode::from(i), ErrorCode::Unknown);
        }
    }
}
