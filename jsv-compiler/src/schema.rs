//! Schema AST access helpers.
//!
//! The schema AST is a `serde_json::Value` produced by the external
//! schema parser. These helpers read keyword payloads with
//! path-carrying errors, and handle JSON-pointer labels for schema
//! locations.

use serde_json::Value;

use crate::CompileError;

/// Escape a path segment per the JSON-pointer rules.
pub fn ptr_escape(seg: &str) -> String {
    seg.replace('~', "~0").replace('/', "~1")
}

/// Unescape a JSON-pointer path segment.
pub fn ptr_unescape(seg: &str) -> String {
    seg.replace("~1", "/").replace("~0", "~")
}

/// Label of a child schema location.
pub fn child_path(base: &str, seg: &str) -> String {
    format!("{base}/{}", ptr_escape(seg))
}

/// Label of an indexed child schema location.
pub fn index_path(base: &str, index: usize) -> String {
    format!("{base}/{index}")
}

pub fn malformed(path: &str, reason: impl Into<String>) -> CompileError {
    CompileError::MalformedSchema {
        path: path.to_string(),
        reason: reason.into(),
    }
}

pub fn expect_object<'v>(
    v: &'v Value,
    path: &str,
    what: &str,
) -> Result<&'v serde_json::Map<String, Value>, CompileError> {
    v.as_object()
        .ok_or_else(|| malformed(path, format!("{what} must be an object")))
}

pub fn expect_array<'v>(v: &'v Value, path: &str, what: &str) -> Result<&'v [Value], CompileError> {
    v.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| malformed(path, format!("{what} must be an array")))
}

pub fn expect_str<'v>(v: &'v Value, path: &str, what: &str) -> Result<&'v str, CompileError> {
    v.as_str()
        .ok_or_else(|| malformed(path, format!("{what} must be a string")))
}

pub fn expect_bool(v: &Value, path: &str, what: &str) -> Result<bool, CompileError> {
    v.as_bool()
        .ok_or_else(|| malformed(path, format!("{what} must be a boolean")))
}

pub fn expect_f64(v: &Value, path: &str, what: &str) -> Result<f64, CompileError> {
    v.as_f64()
        .ok_or_else(|| malformed(path, format!("{what} must be a number")))
}

pub fn expect_count(v: &Value, path: &str, what: &str) -> Result<u64, CompileError> {
    v.as_u64()
        .ok_or_else(|| malformed(path, format!("{what} must be a non-negative integer")))
}

/// Validate a schema regex with the pattern collaborator, wrapping its
/// error without re-interpretation.
pub fn check_pattern(pattern: &str, path: &str) -> Result<(), CompileError> {
    regex_syntax::Parser::new()
        .parse(pattern)
        .map(drop)
        .map_err(|e| CompileError::PatternCompile {
            path: path.to_string(),
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_escaping_round_trips() {
        for seg in ["plain", "a/b", "x~y", "~1", ""] {
            assert_eq!(ptr_unescape(&ptr_escape(seg)), seg);
        }
        assert_eq!(child_path("#", "a/b"), "#/a~1b");
    }

    #[test]
    fn pattern_errors_carry_the_pattern() {
        let err = check_pattern("(", "#/pattern").unwrap_err();
        match err {
            CompileError::PatternCompile { pattern, .. } => assert_eq!(pattern, "("),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
