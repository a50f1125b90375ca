//! Chunk-fed streaming JSON lexer.
//!
//! Turns caller-provided byte chunks into the event stream the VM
//! consumes. The lexer owns all cross-chunk state: a value can be
//! split at any byte boundary and the stream picks up where it left
//! off. String escapes (including surrogate pairs) are decoded, so
//! events carry the actual string bytes. Complete string tokens are
//! emitted in one event; the `partial` flag stays false.

use jsv_asm::{Event, EventKind};

use crate::source::{SourceResult, TokenSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Array,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// A value; `true` when a closing `]` is also acceptable.
    Value(bool),
    /// A member name or `}`.
    NameOrEnd,
    /// The `:` after a member name.
    Colon,
    /// `,` or the container's closing token.
    CommaOrEnd,
    /// The root value is complete.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Between tokens.
    Idle,
    /// Inside a string literal.
    Str,
    /// Inside a string escape; the byte after `\`.
    StrEscape,
    /// Inside a `\u` sequence; holds collected hex digit count.
    StrUnicode,
    /// Inside a number.
    Number,
    /// Inside `null` / `true` / `false`; progress in bytes.
    Literal,
}

/// Streaming lexer implementing [`TokenSource`].
#[derive(Debug)]
pub struct Lexer {
    buf: Vec<u8>,
    pos: usize,
    ended: bool,
    error: Option<&'static str>,

    stack: Vec<Ctx>,
    expect: Expect,

    scan: Scan,
    strbuf: Vec<u8>,
    unicode: u32,
    unicode_len: u8,
    /// A pending high surrogate awaiting its low half.
    surrogate: Option<u16>,
    numbuf: Vec<u8>,
    litbuf: Vec<u8>,
}

impl Default for Lexer {
    fn default() -> Self {
        Lexer {
            buf: Vec::new(),
            pos: 0,
            ended: false,
            error: None,
            stack: Vec::new(),
            expect: Expect::Value(false),
            scan: Scan::Idle,
            strbuf: Vec::new(),
            unicode: 0,
            unicode_len: 0,
            surrogate: None,
            numbuf: Vec::new(),
            litbuf: Vec::new(),
        }
    }
}

impl Lexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an input chunk.
    pub fn feed(&mut self, bytes: &[u8]) {
        // Compact consumed input before growing the buffer.
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Mark the end of input; a trailing number can then complete.
    pub fn end(&mut self) {
        self.ended = true;
    }

    /// Whether a complete root value has been produced.
    pub fn done(&self) -> bool {
        self.expect == Expect::Done
    }

    /// The last syntax error, for diagnostics.
    pub fn last_error(&self) -> Option<&'static str> {
        self.error
    }

    fn fail(&mut self, reason: &'static str) -> SourceResult {
        self.error = Some(reason);
        SourceResult::Error
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// A value token was completed; update the grammar state.
    fn after_value(&mut self) {
        self.expect = if self.stack.is_empty() {
            Expect::Done
        } else {
            Expect::CommaOrEnd
        };
    }

    fn emit_scalar(&self, evt: &mut Event, kind: EventKind) {
        evt.clear();
        evt.kind = kind;
    }
}

impl TokenSource for Lexer {
    fn next(&mut self, evt: &mut Event) -> SourceResult {
        if self.error.is_some() {
            return SourceResult::Error;
        }
        loop {
            match self.scan {
                Scan::Idle => {}
                Scan::Str | Scan::StrEscape | Scan::StrUnicode => {
                    match self.scan_string() {
                        Ok(true) => {
                            evt.clear();
                            evt.kind = EventKind::String;
                            std::mem::swap(&mut evt.text, &mut self.strbuf);
                            self.strbuf.clear();
                            if self.expect == Expect::NameOrEnd {
                                self.expect = Expect::Colon;
                            } else {
                                self.after_value();
                            }
                            return SourceResult::Ok;
                        }
                        Ok(false) => return SourceResult::More,
                        Err(reason) => return self.fail(reason),
                    }
                }
                Scan::Number => match self.scan_number() {
                    Ok(Some(num)) => {
                        evt.clear();
                        evt.kind = EventKind::Number;
                        evt.num = num;
                        self.after_value();
                        return SourceResult::Ok;
                    }
                    Ok(None) => return SourceResult::More,
                    Err(reason) => return self.fail(reason),
                },
                Scan::Literal => match self.scan_literal() {
                    Ok(Some(kind)) => {
                        self.emit_scalar(evt, kind);
                        self.after_value();
                        return SourceResult::Ok;
                    }
                    Ok(None) => return SourceResult::More,
                    Err(reason) => return self.fail(reason),
                },
            }

            // Between tokens: skip whitespace.
            while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
                self.pos += 1;
            }
            let Some(byte) = self.peek() else {
                return SourceResult::More;
            };

            match self.expect {
                Expect::Done => return self.fail("content after the root value"),
                Expect::Colon => {
                    if byte != b':' {
                        return self.fail("expected ':' after a member name");
                    }
                    self.pos += 1;
                    self.expect = Expect::Value(false);
                    continue;
                }
                Expect::CommaOrEnd => {
                    match (byte, self.stack.last()) {
                        (b',', Some(Ctx::Array)) => {
                            self.pos += 1;
                            self.expect = Expect::Value(false);
                        }
                        (b',', Some(Ctx::Object)) => {
                            self.pos += 1;
                            self.expect = Expect::NameOrEnd;
                        }
                        (b']', Some(Ctx::Array)) => {
                            self.pos += 1;
                            self.stack.pop();
                            self.emit_scalar(evt, EventKind::ArrayEnd);
                            self.after_value();
                            return SourceResult::Ok;
                        }
                        (b'}', Some(Ctx::Object)) => {
                            self.pos += 1;
                            self.stack.pop();
                            self.emit_scalar(evt, EventKind::ObjectEnd);
                            self.after_value();
                            return SourceResult::Ok;
                        }
                        _ => return self.fail("expected ',' or a closing token"),
                    }
                    continue;
                }
                Expect::NameOrEnd => match byte {
                    b'"' => {
                        self.pos += 1;
                        self.scan = Scan::Str;
                        continue;
                    }
                    b'}' => {
                        self.pos += 1;
                        self.stack.pop();
                        self.emit_scalar(evt, EventKind::ObjectEnd);
                        self.after_value();
                        return SourceResult::Ok;
                    }
                    _ => return self.fail("expected a member name or '}'"),
                },
                Expect::Value(allow_close) => match byte {
                    b'{' => {
                        self.pos += 1;
                        self.stack.push(Ctx::Object);
                        self.expect = Expect::NameOrEnd;
                        self.emit_scalar(evt, EventKind::ObjectBeg);
                        return SourceResult::Ok;
                    }
                    b'[' => {
                        self.pos += 1;
                        self.stack.push(Ctx::Array);
                        self.expect = Expect::Value(true);
                        self.emit_scalar(evt, EventKind::ArrayBeg);
                        return SourceResult::Ok;
                    }
                    b']' if allow_close => {
                        self.pos += 1;
                        self.stack.pop();
                        self.emit_scalar(evt, EventKind::ArrayEnd);
                        self.after_value();
                        return SourceResult::Ok;
                    }
                    b'"' => {
                        self.pos += 1;
                        self.scan = Scan::Str;
                        self.expect = Expect::Value(false);
                        continue;
                    }
                    b'n' | b't' | b'f' => {
                        self.scan = Scan::Literal;
                        self.litbuf.clear();
                        continue;
                    }
                    b'-' | b'0'..=b'9' => {
                        self.scan = Scan::Number;
                        self.numbuf.clear();
                        continue;
                    }
                    _ => return self.fail("expected a value"),
                },
            }
        }
    }
}

impl Lexer {
    /// Scan string content; `Ok(true)` when the closing quote arrived.
    fn scan_string(&mut self) -> Result<bool, &'static str> {
        loop {
            match self.scan {
                Scan::Str => {
                    let Some(b) = self.bump() else {
                        return Ok(false);
                    };
                    match b {
                        b'"' => {
                            if self.surrogate.is_some() {
                                return Err("unpaired surrogate escape");
                            }
                            self.scan = Scan::Idle;
                            return Ok(true);
                        }
                        b'\\' => self.scan = Scan::StrEscape,
                        0x00..=0x1f => return Err("control character in string"),
                        b => {
                            if self.surrogate.is_some() {
                                return Err("unpaired surrogate escape");
                            }
                            self.strbuf.push(b);
                        }
                    }
                }
                Scan::StrEscape => {
                    let Some(b) = self.bump() else {
                        return Ok(false);
                    };
                    if b == b'u' {
                        self.unicode = 0;
                        self.unicode_len = 0;
                        self.scan = Scan::StrUnicode;
                        continue;
                    }
                    if self.surrogate.is_some() {
                        return Err("unpaired surrogate escape");
                    }
                    let decoded = match b {
                        b'"' => b'"',
                        b'\\' => b'\\',
                        b'/' => b'/',
                        b'b' => 0x08,
                        b'f' => 0x0c,
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        _ => return Err("unknown escape"),
                    };
                    self.strbuf.push(decoded);
                    self.scan = Scan::Str;
                }
                Scan::StrUnicode => {
                    let Some(b) = self.bump() else {
                        return Ok(false);
                    };
                    let digit = match b {
                        b'0'..=b'9' => (b - b'0') as u32,
                        b'a'..=b'f' => (b - b'a') as u32 + 10,
                        b'A'..=b'F' => (b - b'A') as u32 + 10,
                        _ => return Err("bad unicode escape"),
                    };
                    self.unicode = (self.unicode << 4) | digit;
                    self.unicode_len += 1;
                    if self.unicode_len < 4 {
                        continue;
                    }

                    let unit = self.unicode as u16;
                    self.scan = Scan::Str;
                    match self.surrogate.take() {
                        Some(high) => {
                            if !(0xdc00..=0xdfff).contains(&unit) {
                                return Err("unpaired surrogate escape");
                            }
                            let c = 0x10000
                                + (((high as u32) - 0xd800) << 10)
                                + ((unit as u32) - 0xdc00);
                            let c = char::from_u32(c).ok_or("bad surrogate pair")?;
                            let mut utf8 = [0u8; 4];
                            self.strbuf.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                        }
                        None => {
                            if (0xd800..=0xdbff).contains(&unit) {
                                self.surrogate = Some(unit);
                            } else if (0xdc00..=0xdfff).contains(&unit) {
                                return Err("unpaired surrogate escape");
                            } else {
                                let c = char::from_u32(unit as u32).ok_or("bad unicode escape")?;
                                let mut utf8 = [0u8; 4];
                                self.strbuf
                                    .extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
                            }
                        }
                    }
                }
                _ => unreachable!("scan_string called outside a string"),
            }
        }
    }

    /// Scan number content; numbers only complete at a delimiter or
    /// end of input.
    fn scan_number(&mut self) -> Result<Option<f64>, &'static str> {
        loop {
            match self.peek() {
                Some(b @ (b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E')) => {
                    self.numbuf.push(b);
                    self.pos += 1;
                }
                Some(_) => break,
                None if self.ended => break,
                None => return Ok(None),
            }
        }
        let text = std::str::from_utf8(&self.numbuf).map_err(|_| "bad number")?;
        if !well_formed_number(text) {
            return Err("bad number");
        }
        let num: f64 = text.parse().map_err(|_| "bad number")?;
        if !num.is_finite() {
            return Err("number out of range");
        }
        self.scan = Scan::Idle;
        self.numbuf.clear();
        Ok(Some(num))
    }

    fn scan_literal(&mut self) -> Result<Option<EventKind>, &'static str> {
        const WORDS: [(&[u8], EventKind); 3] = [
            (b"null", EventKind::Null),
            (b"true", EventKind::True),
            (b"false", EventKind::False),
        ];
        while let Some(b) = self.peek() {
            if !b.is_ascii_lowercase() {
                break;
            }
            self.litbuf.push(b);
            self.pos += 1;
            if self.litbuf.len() > 5 {
                return Err("unknown literal");
            }
        }
        for (word, kind) in WORDS {
            if self.litbuf == word {
                self.scan = Scan::Idle;
                self.litbuf.clear();
                return Ok(Some(kind));
            }
            if word.starts_with(&self.litbuf) && self.peek().is_none() && !self.ended {
                return Ok(None);
            }
        }
        if self.peek().is_none() && !self.ended {
            return Ok(None);
        }
        Err("unknown literal")
    }
}

/// JSON's number grammar, checked before handing off to `parse`.
fn well_formed_number(s: &str) -> bool {
    let mut chars = s.as_bytes();
    if let [b'-', rest @ ..] = chars {
        chars = rest;
    }
    // Integer part: 0, or a non-zero digit followed by digits.
    let digits = chars.iter().take_while(|b| b.is_ascii_digit()).count();
    match (digits, chars.first()) {
        (0, _) => return false,
        (n, Some(b'0')) if n > 1 => return false,
        _ => {}
    }
    chars = &chars[digits..];
    if let [b'.', rest @ ..] = chars {
        let frac = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if frac == 0 {
            return false;
        }
        chars = &rest[frac..];
    }
    if let [b'e' | b'E', rest @ ..] = chars {
        let rest = match rest {
            [b'+' | b'-', r @ ..] => r,
            r => r,
        };
        let exp = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if exp == 0 {
            return false;
        }
        chars = &rest[exp..];
    }
    chars.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(input: &str) -> Vec<Event> {
        let mut lexer = Lexer::new();
        lexer.feed(input.as_bytes());
        lexer.end();
        drain(&mut lexer)
    }

    fn drain(lexer: &mut Lexer) -> Vec<Event> {
        let mut out = Vec::new();
        let mut evt = Event::default();
        loop {
            match lexer.next(&mut evt) {
                SourceResult::Ok => out.push(evt.clone()),
                SourceResult::More => return out,
                SourceResult::Error => panic!("lex error: {:?}", lexer.last_error()),
            }
        }
    }

    fn kinds(input: &str) -> Vec<EventKind> {
        events(input).into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn scalars() {
        assert_eq!(kinds("null"), vec![EventKind::Null]);
        assert_eq!(kinds("true"), vec![EventKind::True]);
        assert_eq!(kinds("false"), vec![EventKind::False]);

        let evts = events("3.25");
        assert_eq!(evts[0].kind, EventKind::Number);
        assert_eq!(evts[0].num, 3.25);

        let evts = events("\"hi\"");
        assert_eq!(evts[0].kind, EventKind::String);
        assert_eq!(evts[0].text, b"hi");
    }

    #[test]
    fn nested_structure() {
        use EventKind::*;
        assert_eq!(
            kinds("[1,[2,{}]]"),
            vec![ArrayBeg, Number, ArrayBeg, Number, ObjectBeg, ObjectEnd, ArrayEnd, ArrayEnd]
        );
        assert_eq!(
            kinds("{\"a\":1,\"b\":[true]}"),
            vec![ObjectBeg, String, Number, String, ArrayBeg, True, ArrayEnd, ObjectEnd]
        );
    }

    #[test]
    fn string_escapes_decode() {
        let evts = events(r#""a\n\t\"\\\u0041""#);
        assert_eq!(evts[0].text, b"a\n\t\"\\A");
    }

    #[test]
    fn surrogate_pairs_combine() {
        let evts = events(r#""\ud83d\ude00""#);
        assert_eq!(evts[0].text, "😀".as_bytes());
    }

    #[test]
    fn chunked_input_resumes_anywhere() {
        let full = r#"{"key": [1.5, "va\u0041lue", null]}"#;
        let whole = {
            let mut lexer = Lexer::new();
            lexer.feed(full.as_bytes());
            lexer.end();
            drain(&mut lexer)
        };

        for split in 1..full.len() {
            let mut lexer = Lexer::new();
            let mut all = Vec::new();
            lexer.feed(&full.as_bytes()[..split]);
            all.extend(drain(&mut lexer));
            lexer.feed(&full.as_bytes()[split..]);
            lexer.end();
            all.extend(drain(&mut lexer));
            assert_eq!(all, whole, "split at {split}");
        }
    }

    #[test]
    fn trailing_number_needs_end_of_input() {
        let mut lexer = Lexer::new();
        lexer.feed(b"12");
        let mut evt = Event::default();
        assert_eq!(lexer.next(&mut evt), SourceResult::More);
        lexer.feed(b"3");
        assert_eq!(lexer.next(&mut evt), SourceResult::More);
        lexer.end();
        assert_eq!(lexer.next(&mut evt), SourceResult::Ok);
        assert_eq!(evt.num, 123.0);
    }

    #[test]
    fn syntax_errors_are_reported() {
        for bad in ["{", "{]", "[1,]", "{\"a\" 1}", "nope", "01", "1.", "--1", "\"\\x\""] {
            let mut lexer = Lexer::new();
            lexer.feed(bad.as_bytes());
            lexer.end();
            let mut evt = Event::default();
            let mut result = lexer.next(&mut evt);
            while result == SourceResult::Ok {
                result = lexer.next(&mut evt);
            }
            // Either a syntax error, or truncated input that never
            // completes ("{" alone).
            match result {
                SourceResult::Error => {}
                SourceResult::More => assert!(!lexer.done(), "{bad}"),
                SourceResult::Ok => unreachable!(),
            }
        }
    }

    #[test]
    fn empty_containers() {
        use EventKind::*;
        assert_eq!(kinds("{}"), vec![ObjectBeg, ObjectEnd]);
        assert_eq!(kinds("[]"), vec![ArrayBeg, ArrayEnd]);
    }
}
