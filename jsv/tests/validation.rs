//! End-to-end validation behavior, one compiled program per schema,
//! driven through the byte-fed validator.

use jsv::prelude::*;
use rstest::{fixture, rstest};
use serde_json::json;
use test_case::test_case;

fn check(schema: &serde_json::Value, doc: &str) -> Status {
    let prog = compile(schema).expect("schema compiles");
    let mut v = Validator::new(&prog);
    match v.validate_step(doc.as_bytes()).expect("no fatal error") {
        Status::More => v.finish().expect("no fatal error"),
        status => status,
    }
}

const VALID: Status = Status::Valid;

fn invalid(code: ErrorCode) -> Status {
    Status::Invalid(code)
}

#[test_case("null"; "null_doc")]
#[test_case("true"; "true_doc")]
#[test_case("0"; "zero_doc")]
#[test_case("\"x\""; "string_doc")]
#[test_case("[]"; "empty_array_doc")]
#[test_case("{}"; "empty_object_doc")]
#[test_case("[1,[2,{}]]"; "nested_doc")]
fn empty_schema_accepts_anything(doc: &str) {
    assert_eq!(check(&json!({}), doc), VALID);
}

#[test]
fn type_number() {
    let schema = json!({"type": "number"});
    assert_eq!(check(&schema, "3.14"), VALID);
    assert_eq!(check(&schema, "\"3\""), invalid(ErrorCode::UnexpectedToken));
}

#[test]
fn type_integer() {
    let schema = json!({"type": "integer"});
    assert_eq!(check(&schema, "3"), VALID);
    assert_eq!(check(&schema, "3.5"), invalid(ErrorCode::NotInteger));
    assert_eq!(check(&schema, "0"), VALID);
    assert_eq!(check(&schema, "-7"), VALID);
}

#[test]
fn minimum() {
    let schema = json!({"minimum": 1.1});
    assert_eq!(check(&schema, "1.1"), VALID);
    assert_eq!(check(&schema, "1.0"), invalid(ErrorCode::Number));
    // Non-numbers are unconstrained.
    assert_eq!(check(&schema, "\"x\""), VALID);
}

#[fixture]
fn bounded_number() -> VmProgram {
    compile(&json!({"minimum": 1, "maximum": 10, "multipleOf": 0.5}))
        .expect("schema compiles")
}

#[rstest]
#[case::at_minimum("1", Status::Valid)]
#[case::at_maximum("10", Status::Valid)]
#[case::half_step("2.5", Status::Valid)]
#[case::below_minimum("0.5", Status::Invalid(ErrorCode::Number))]
#[case::above_maximum("10.5", Status::Invalid(ErrorCode::Number))]
#[case::off_step("2.7", Status::Invalid(ErrorCode::Number))]
#[case::non_number("\"x\"", Status::Valid)]
fn numeric_bounds(bounded_number: VmProgram, #[case] doc: &str, #[case] expected: Status) {
    let status = Validator::validate_all(&bounded_number, doc.as_bytes())
        .expect("no fatal error");
    assert_eq!(status, expected);
}

#[test]
fn exclusive_minimum() {
    let schema = json!({"minimum": 1.1, "exclusiveMinimum": true});
    assert_eq!(check(&schema, "1.1"), invalid(ErrorCode::Number));
    assert_eq!(check(&schema, "1.2"), VALID);
}

#[test]
fn multiple_of() {
    let schema = json!({"multipleOf": 0.5});
    assert_eq!(check(&schema, "2"), VALID);
    assert_eq!(check(&schema, "2.5"), VALID);
    assert_eq!(check(&schema, "2.7"), invalid(ErrorCode::Number));
}

#[test]
fn properties_and_required() {
    let schema = json!({
        "properties": {"foo": {"type": "number"}, "bar": {"type": "string"}},
        "required": ["foo"]
    });
    assert_eq!(check(&schema, r#"{"foo": 1}"#), VALID);
    assert_eq!(check(&schema, r#"{"foo": 1, "bar": "x"}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"bar": "x"}"#),
        invalid(ErrorCode::MissingRequiredProperties)
    );
    assert_eq!(
        check(&schema, r#"{"foo": "x"}"#),
        invalid(ErrorCode::UnexpectedToken)
    );
    // Unknown properties are unconstrained.
    assert_eq!(check(&schema, r#"{"foo": 1, "quux": [1, 2]}"#), VALID);
}

#[test]
fn dependencies_string_form() {
    let schema = json!({"dependencies": {"bar": ["foo"]}});
    assert_eq!(check(&schema, r#"{"bar": 1, "foo": 2}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"bar": 1}"#),
        invalid(ErrorCode::SplitCondition)
    );
    assert_eq!(check(&schema, r#"{"foo": 1}"#), VALID);
    assert_eq!(check(&schema, r#"{}"#), VALID);
    // Dependencies only constrain objects.
    assert_eq!(check(&schema, "17"), VALID);
}

#[test]
fn dependencies_schema_form() {
    let schema = json!({"dependencies": {"bar": {"minProperties": 2}}});
    assert_eq!(check(&schema, r#"{"bar": 1, "foo": 2}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"bar": 1}"#),
        invalid(ErrorCode::SplitCondition)
    );
    assert_eq!(check(&schema, r#"{"foo": 1}"#), VALID);
}

#[test]
fn unique_items() {
    let schema = json!({"uniqueItems": true});
    assert_eq!(check(&schema, "[1,2,3]"), VALID);
    assert_eq!(check(&schema, "[1,2,1]"), invalid(ErrorCode::NotUnique));
    // Key order does not make objects distinct.
    assert_eq!(
        check(&schema, r#"[{"a":1,"b":2},{"b":2,"a":1}]"#),
        invalid(ErrorCode::NotUnique)
    );
    assert_eq!(
        check(&schema, r#"[{"a":1,"b":2},{"a":1,"b":3}]"#),
        VALID
    );
    // Arrays stay order-sensitive.
    assert_eq!(check(&schema, "[[1,2],[2,1]]"), VALID);
    assert_eq!(check(&schema, "[[1,2],[1,2]]"), invalid(ErrorCode::NotUnique));
    // Non-arrays are unconstrained.
    assert_eq!(check(&schema, "3"), VALID);
}

#[test]
fn ref_recursion() {
    let schema = json!({"properties": {"foo": {"$ref": "#"}}});
    assert_eq!(check(&schema, r#"{"foo": {"foo": {}}}"#), VALID);
    assert_eq!(check(&schema, r#"{"foo": {"foo": {"foo": 3}}}"#), VALID);
}

#[test]
fn one_of_xor() {
    let schema = json!({"oneOf": [{"type": "integer"}, {"minimum": 2}]});
    // Integer, below the minimum: exactly one branch.
    assert_eq!(check(&schema, "1"), VALID);
    // Integer and >= 2: both branches.
    assert_eq!(check(&schema, "2"), invalid(ErrorCode::SplitCondition));
    // Fractional but >= 2: only the minimum branch.
    assert_eq!(check(&schema, "2.5"), VALID);
    // On a string the integer branch rejects (it declares a type) and
    // the minimum branch is vacuously valid: exactly one.
    assert_eq!(check(&schema, "\"x\""), VALID);
}

#[test]
fn any_of_over_objects() {
    let schema = json!({"anyOf": [
        {"required": ["a"]},
        {"required": ["b"]}
    ]});
    assert_eq!(check(&schema, r#"{"a": 1}"#), VALID);
    assert_eq!(check(&schema, r#"{"b": 1}"#), VALID);
    assert_eq!(check(&schema, r#"{"a": 1, "b": 2}"#), VALID);
    assert_eq!(check(&schema, r#"{"c": 1}"#), invalid(ErrorCode::SplitCondition));
}

#[test]
fn all_of_ranges() {
    let schema = json!({"allOf": [{"minimum": 1}, {"maximum": 9}]});
    assert_eq!(check(&schema, "5"), VALID);
    assert_eq!(check(&schema, "0"), invalid(ErrorCode::Number));
    assert_eq!(check(&schema, "10"), invalid(ErrorCode::Number));
}

#[test]
fn not_inverts() {
    let schema = json!({"not": {"type": "string"}});
    assert_eq!(check(&schema, "3"), VALID);
    assert_eq!(check(&schema, "\"x\""), invalid(ErrorCode::UnexpectedToken));
}

#[test]
fn string_constraints() {
    let schema = json!({"minLength": 2, "maxLength": 4, "pattern": "^a"});
    assert_eq!(check(&schema, "\"ab\""), VALID);
    assert_eq!(check(&schema, "\"abcde\""), invalid(ErrorCode::UnexpectedToken));
    assert_eq!(check(&schema, "\"bb\""), invalid(ErrorCode::UnexpectedToken));
}

#[test]
fn property_counts() {
    let schema = json!({"minProperties": 1, "maxProperties": 2});
    assert_eq!(check(&schema, r#"{}"#), invalid(ErrorCode::TooFewProps));
    assert_eq!(check(&schema, r#"{"a": 1}"#), VALID);
    assert_eq!(check(&schema, r#"{"a": 1, "b": 2}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"a": 1, "b": 2, "c": 3}"#),
        invalid(ErrorCode::TooManyProps)
    );
}

#[test]
fn item_counts() {
    let schema = json!({"minItems": 1, "maxItems": 2});
    assert_eq!(check(&schema, "[]"), invalid(ErrorCode::TooFewItems));
    assert_eq!(check(&schema, "[1]"), VALID);
    assert_eq!(check(&schema, "[1,2]"), VALID);
    assert_eq!(check(&schema, "[1,2,3]"), invalid(ErrorCode::TooManyItems));
}

#[test]
fn homogeneous_items() {
    let schema = json!({"items": {"type": "number"}});
    assert_eq!(check(&schema, "[]"), VALID);
    assert_eq!(check(&schema, "[1, 2.5, 3]"), VALID);
    assert_eq!(check(&schema, "[1, \"x\"]"), invalid(ErrorCode::SplitCondition));
}

#[test]
fn tuple_items() {
    let schema = json!({
        "items": [{"type": "number"}, {"type": "string"}],
        "additionalItems": false
    });
    assert_eq!(check(&schema, "[1, \"a\"]"), VALID);
    assert_eq!(check(&schema, "[1]"), VALID);
    assert_eq!(check(&schema, "[1, \"a\", 2]"), invalid(ErrorCode::TooManyItems));
    assert_eq!(check(&schema, "[\"a\", \"b\"]"), invalid(ErrorCode::SplitCondition));
}

#[test]
fn contains() {
    let schema = json!({"contains": {"type": "number"}});
    assert_eq!(check(&schema, "[\"a\", 1]"), VALID);
    assert_eq!(check(&schema, "[\"a\", \"b\"]"), invalid(ErrorCode::SplitCondition));
    assert_eq!(check(&schema, "[]"), invalid(ErrorCode::SplitCondition));
}

#[test]
fn additional_properties_false() {
    let schema = json!({
        "properties": {"a": {}},
        "additionalProperties": false
    });
    assert_eq!(check(&schema, r#"{"a": 1}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"b": 1}"#),
        invalid(ErrorCode::BadPropertyName)
    );
}

#[test]
fn pattern_properties_overlap_literals() {
    let schema = json!({
        "properties": {"x-a": {"type": "number"}},
        "patternProperties": {"^x-": {"type": "integer"}}
    });
    // "x-a" must satisfy both: a number and an integer.
    assert_eq!(check(&schema, r#"{"x-a": 3}"#), VALID);
    assert_eq!(check(&schema, r#"{"x-a": 3.5}"#), invalid(ErrorCode::SplitCondition));
    // Other x- names only need the pattern entry.
    assert_eq!(check(&schema, r#"{"x-b": 3}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"x-b": 3.5}"#),
        invalid(ErrorCode::NotInteger)
    );
}

#[test]
fn property_names() {
    let schema = json!({"propertyNames": {"maxLength": 3}});
    assert_eq!(check(&schema, r#"{"ab": 1, "abc": 2}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"abcd": 1}"#),
        invalid(ErrorCode::BadPropertyName)
    );
}

#[test]
fn const_and_enum() {
    let schema = json!({"const": 7});
    assert_eq!(check(&schema, "7"), VALID);
    assert_eq!(check(&schema, "8"), invalid(ErrorCode::Number));

    let schema = json!({"enum": ["a", "b", 3]});
    assert_eq!(check(&schema, "\"a\""), VALID);
    assert_eq!(check(&schema, "\"b\""), VALID);
    assert_eq!(check(&schema, "3"), VALID);
    assert_eq!(check(&schema, "\"c\""), invalid(ErrorCode::UnexpectedToken));
    assert_eq!(check(&schema, "null"), invalid(ErrorCode::UnexpectedToken));
}

#[test]
fn ref_to_definition() {
    let schema = json!({
        "definitions": {"positive": {"minimum": 0, "exclusiveMinimum": true}},
        "items": {"$ref": "#/definitions/positive"}
    });
    assert_eq!(check(&schema, "[1, 2.5]"), VALID);
    assert_eq!(check(&schema, "[1, 0]"), invalid(ErrorCode::SplitCondition));
}

#[test]
fn nested_object_values() {
    let schema = json!({
        "properties": {
            "outer": {
                "properties": {"inner": {"type": "number"}},
                "required": ["inner"]
            }
        }
    });
    assert_eq!(check(&schema, r#"{"outer": {"inner": 1}}"#), VALID);
    assert_eq!(
        check(&schema, r#"{"outer": {}}"#),
        invalid(ErrorCode::MissingRequiredProperties)
    );
}

#[test]
fn chunked_input_reaches_the_same_verdicts() {
    let schema = json!({
        "properties": {"foo": {"type": "number"}},
        "required": ["foo"]
    });
    let prog = compile(&schema).expect("compile");
    let doc = br#"{"foo": 1, "bar": [true, {"deep": "value"}]}"#;

    for chunk_len in 1..doc.len() {
        let mut v = Validator::new(&prog);
        let mut status = Status::More;
        for chunk in doc.chunks(chunk_len) {
            status = v.validate_step(chunk).expect("no fatal error");
            if status.is_terminal() {
                break;
            }
        }
        assert_eq!(status, Status::Valid, "chunk length {chunk_len}");
    }
}

#[test]
fn bare_number_document_needs_finish() {
    let prog = compile(&json!({"type": "integer"})).expect("compile");
    let mut v = Validator::new(&prog);
    assert_eq!(v.validate_step(b"42").expect("no fatal error"), Status::More);
    assert_eq!(v.finish().expect("no fatal error"), Status::Valid);
}

#[test]
fn malformed_json_is_a_fatal_error() {
    let prog = compile(&json!({})).expect("compile");
    let mut v = Validator::new(&prog);
    let result = v.validate_step(b"{nope}");
    assert!(matches!(result, Err(VmError::MalformedStream(_))));
}

#[test]
fn validators_share_one_program() {
    let prog = compile(&json!({"type": "number"})).expect("compile");
    let a = Validator::validate_all(&prog, b"1").expect("no fatal error");
    let b = Validator::validate_all(&prog, b"\"no\"").expect("no fatal error");
    let c = Validator::validate_all(&prog, b"2.5").expect("no fatal error");
    assert_eq!(a, Status::Valid);
    assert_eq!(b, Status::Invalid(ErrorCode::UnexpectedToken));
    assert_eq!(c, Status::Valid);
}
