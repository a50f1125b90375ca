//! Program artifact behavior: serialization round-trips, disassembly,
//! and executing a program that went through bytes.

use jsv::prelude::*;
use serde_json::json;
use test_case::test_case;

#[test_case(json!({}); "empty")]
#[test_case(json!({"type": "integer"}); "integer")]
#[test_case(json!({"properties": {"foo": {"type": "number"}}, "required": ["foo"]}); "object")]
#[test_case(json!({"dependencies": {"bar": ["foo"]}}); "dependencies")]
#[test_case(json!({"uniqueItems": true, "items": {"minimum": 0}}); "array")]
#[test_case(json!({"oneOf": [{"type": "integer"}, {"minimum": 2}]}); "one of")]
#[test_case(json!({"pattern": "^x", "minLength": 2}); "string")]
fn serialization_round_trips_bit_exactly(schema: serde_json::Value) {
    let prog = compile(&schema).expect("compile");
    let bytes = prog.to_bytes();
    let back = VmProgram::read(&mut bytes.as_slice()).expect("read back");
    assert_eq!(back, prog);
    assert_eq!(back.to_bytes(), bytes);
}

#[test]
fn reloaded_programs_validate_identically() {
    let schema = json!({
        "properties": {"name": {"pattern": "^[a-z]+$"}, "age": {"type": "integer"}},
        "required": ["name"]
    });
    let prog = compile(&schema).expect("compile");
    let bytes = prog.to_bytes();
    let reloaded = VmProgram::read(&mut bytes.as_slice()).expect("read back");

    for (doc, expected) in [
        (r#"{"name": "ada", "age": 36}"#, Status::Valid),
        (
            r#"{"age": 36}"#,
            Status::Invalid(ErrorCode::MissingRequiredProperties),
        ),
        (
            r#"{"name": "Ada"}"#,
            Status::Invalid(ErrorCode::UnexpectedToken),
        ),
        (
            r#"{"name": "ada", "age": 1.5}"#,
            Status::Invalid(ErrorCode::NotInteger),
        ),
    ] {
        let original = Validator::validate_all(&prog, doc.as_bytes()).expect("run original");
        let fresh = Validator::validate_all(&reloaded, doc.as_bytes()).expect("run reloaded");
        assert_eq!(original, expected, "{doc}");
        assert_eq!(fresh, expected, "{doc}");
    }
}

#[test]
fn disassembly_shows_sections() {
    let prog = compile(&json!({"minimum": 1.5})).expect("compile");
    let text = prog.to_string();
    assert!(text.contains(".DATA"));
    assert!(text.contains("FLOAT(0)\t1.5"));
    assert!(text.contains(".CODE"));
    assert!(text.contains("TOKEN"));
    assert!(text.contains("RETURN"));
}

#[test]
fn configured_stack_limit_is_enforced() {
    let prog = compile(&json!({"properties": {"next": {"$ref": "#"}}})).expect("compile");

    let mut doc = String::new();
    for _ in 0..16 {
        doc.push_str("{\"next\":");
    }
    doc.push_str("{}");
    for _ in 0..16 {
        doc.push('}');
    }

    // A small call-stack budget fails deep recursion with the
    // dedicated code.
    let params = VmParams {
        max_stack_slots: 24,
        ..VmParams::default()
    };
    let mut v = Validator::with_params(&prog, params);
    let status = v.validate_step(doc.as_bytes()).expect("no fatal error");
    assert_eq!(status, Status::Invalid(ErrorCode::StackOverflow));

    // The default budget accepts the same document.
    let ok = Validator::validate_all(&prog, doc.as_bytes()).expect("no fatal error");
    assert_eq!(ok, Status::Valid);
}

#[test]
fn truncated_bytes_are_rejected() {
    let prog = compile(&json!({"type": "number"})).expect("compile");
    let bytes = prog.to_bytes();
    for cut in [0, 3, 7, bytes.len() / 2, bytes.len() - 1] {
        assert!(
            VmProgram::read(&mut &bytes[..cut]).is_err(),
            "cut at {cut} must fail"
        );
    }
}
