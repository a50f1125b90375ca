//! Streaming byte-code interpreter for the `jsv` JSON-Schema
//! validator.
//!
//! The VM executes a compiled [`jsv_asm::VmProgram`] against a JSON
//! event stream in a single left-to-right pass, suspending whenever
//! the stream runs dry. The typical entry point is [`Validator`],
//! which bundles the interpreter with the chunk-fed [`Lexer`]; [`Vm`]
//! runs against any [`TokenSource`].

#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod error;
mod interpreter;
mod lexer;
mod machine;
mod params;
mod source;
mod state;
mod unique;
mod validator;

pub use error::VmError;
pub use interpreter::Vm;
pub use lexer::Lexer;
pub use params::VmParams;
pub use source::{SliceSource, SourceResult, TokenSource};
pub use state::Status;
pub use validator::Validator;

#[cfg(test)]
mod tests {
    use super::*;
    use jsv_asm::ErrorCode;
    use jsv_compiler::compile;
    use serde_json::json;

    fn validate(schema: serde_json::Value, doc: &str) -> Status {
        let prog = compile(&schema).expect("schema compiles");
        Validator::validate_all(&prog, doc.as_bytes()).expect("no fatal error")
    }

    #[test]
    fn end_to_end_smoke() {
        assert_eq!(validate(json!({}), "null"), Status::Valid);
        assert_eq!(
            validate(json!({"type": "number"}), "\"x\""),
            Status::Invalid(ErrorCode::UnexpectedToken)
        );
    }

    #[test]
    fn chunked_feeding_suspends_and_resumes() {
        let prog = compile(&json!({"type": "object"})).expect("compile");
        let doc = br#"{"a": [1, 2, {"b": "c"}]}"#;
        let mut v = Validator::new(&prog);
        let mut status = Status::More;
        for chunk in doc.chunks(3) {
            status = v.validate_step(chunk).expect("no fatal error");
        }
        assert_eq!(status, Status::Valid);
    }

    #[test]
    fn ref_recursion_with_small_stack_overflows() {
        let prog = compile(&json!({"properties": {"foo": {"$ref": "#"}}})).expect("compile");
        let params = VmParams {
            max_stack_slots: 24,
            ..VmParams::default()
        };
        // Deep enough nesting to exhaust 24 slots of call frames.
        let mut doc = String::new();
        for _ in 0..16 {
            doc.push_str("{\"foo\":");
        }
        doc.push_str("{}");
        for _ in 0..16 {
            doc.push('}');
        }

        let mut v = Validator::with_params(&prog, params);
        let status = v.validate_step(doc.as_bytes()).expect("no fatal error");
        assert_eq!(status, Status::Invalid(ErrorCode::StackOverflow));
    }
}
