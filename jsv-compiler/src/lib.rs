//! Compiles JSON-Schema documents into executable byte-code for the
//! `jsv` streaming validator.
//!
//! The pipeline is a straight line of four representations:
//!
//! ```text
//! schema AST --translate--> CnodeForest --simplify--> --canonify-->
//!   --translate_ir--> IrProgram --linearize--> (blocks)
//!   --assemble--> OpProgram --encode--> VmProgram
//! ```
//!
//! [`compile`] drives all of it; the pass functions are public for
//! tests and tooling that want to inspect the intermediate forms.

#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod asm;
pub mod cnode;
pub mod ir;
pub mod schema;

use serde_json::Value;

use jsv_asm::VmProgram;

/// Compiler configuration. The dump switches log the intermediate
/// representations at `trace!` level as each pass completes.
#[derive(Debug, Clone, Default)]
pub struct CompileOpts {
    /// Log the constraint forest after simplify and canonify.
    pub dump_cnode: bool,
    /// Log the IR frames after translation and linearization.
    pub dump_ir: bool,
    /// Log the assembled op program.
    pub dump_op: bool,
}

/// Compilation failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// A keyword payload does not have the shape the dialect requires.
    #[error("malformed schema at {path}: {reason}")]
    MalformedSchema {
        /// JSON-pointer label of the offending schema location.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A `$ref` target does not name a known schema location.
    #[error("unresolved $ref target {0:?}")]
    UnresolvedRef(String),
    /// The keyword is recognized but not compiled by this dialect.
    #[error("unsupported keyword {keyword:?} at {path}")]
    UnsupportedKeyword {
        /// JSON-pointer label of the offending schema location.
        path: String,
        /// The keyword.
        keyword: String,
    },
    /// The pattern collaborator rejected a regex.
    #[error("cannot compile pattern {pattern:?} at {path}: {reason}")]
    PatternCompile {
        /// JSON-pointer label of the offending schema location.
        path: String,
        /// The pattern source.
        pattern: String,
        /// The collaborator's reason, unedited.
        reason: String,
    },
    /// A literal does not fit its instruction field.
    #[error("literal out of encodable range: {0}")]
    LiteralOutOfRange(i64),
    /// A branch target is further than a delta can express.
    #[error("branch delta out of encodable range: {0}")]
    BranchOutOfRange(i64),
    /// A compiler invariant was violated.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

/// Compile a schema AST into a byte-code program.
pub fn compile(schema: &Value) -> Result<VmProgram, CompileError> {
    compile_with_opts(schema, &CompileOpts::default())
}

/// Compile with explicit options.
pub fn compile_with_opts(schema: &Value, opts: &CompileOpts) -> Result<VmProgram, CompileError> {
    let forest = {
        let _span = tracing::debug_span!("translate").entered();
        cnode::translate(schema)?
    };

    let forest = {
        let _span = tracing::debug_span!("simplify").entered();
        cnode::simplify(&forest)
    };
    if opts.dump_cnode {
        for (i, &tree) in forest.trees.iter().enumerate() {
            tracing::trace!(tree = i, "simplified:\n{}", forest.dump_tree(tree));
        }
    }

    let forest = {
        let _span = tracing::debug_span!("canonify").entered();
        cnode::canonify(&forest)?
    };
    if opts.dump_cnode {
        for (i, &tree) in forest.trees.iter().enumerate() {
            tracing::trace!(tree = i, "canonical:\n{}", forest.dump_tree(tree));
        }
    }

    let mut ir = {
        let _span = tracing::debug_span!("ir_translate").entered();
        ir::translate_ir(&forest)?
    };
    if opts.dump_ir {
        for i in 0..ir.frames.len() {
            tracing::trace!("{}", ir.dump_frame(ir::FrameId(i as u32)));
        }
    }

    {
        let _span = tracing::debug_span!("linearize").entered();
        ir::linearize(&mut ir)?;
    }
    if opts.dump_ir {
        for i in 0..ir.frames.len() {
            tracing::trace!("{}", ir.dump_frame(ir::FrameId(i as u32)));
        }
    }

    let op = {
        let _span = tracing::debug_span!("assemble").entered();
        asm::assemble(&ir)?
    };
    if opts.dump_op {
        tracing::trace!("assembled:\n{op}");
    }

    let _span = tracing::debug_span!("encode").entered();
    encode_checked(&op)
}

fn encode_checked(op: &asm::OpProgram) -> Result<VmProgram, CompileError> {
    let prog = asm::encode(op)?;
    tracing::debug!(
        code = prog.code.len(),
        floats = prog.fpool.len(),
        ints = prog.ipool.len(),
        dfas = prog.dfas.len(),
        splits = prog.split_count(),
        "compiled program"
    );
    Ok(prog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsv_asm::{Instruction, Opcode};
    use serde_json::json;
    use test_case::test_case;

    #[test_case(json!({}); "empty")]
    #[test_case(json!({"type": "number"}); "type number")]
    #[test_case(json!({"type": "integer"}); "type integer")]
    #[test_case(json!({"minimum": 1.1}); "minimum")]
    #[test_case(json!({"multipleOf": 3}); "multiple of")]
    #[test_case(json!({"minLength": 1, "maxLength": 8}); "length range")]
    #[test_case(json!({"pattern": "^a+$"}); "pattern")]
    #[test_case(json!({"properties": {"foo": {"type": "number"},
                                      "bar": {"type": "string"}},
                       "required": ["foo"]}); "properties and required")]
    #[test_case(json!({"dependencies": {"bar": ["foo"]}}); "dependencies string form")]
    #[test_case(json!({"dependencies": {"bar": {"minProperties": 2}}}); "dependencies schema form")]
    #[test_case(json!({"uniqueItems": true}); "unique items")]
    #[test_case(json!({"properties": {"foo": {"$ref": "#"}}}); "recursive ref")]
    #[test_case(json!({"oneOf": [{"type": "integer"}, {"minimum": 2}]}); "one of")]
    #[test_case(json!({"allOf": [{"minimum": 1}, {"maximum": 9}]}); "all of")]
    #[test_case(json!({"anyOf": [{"type": "string"}, {"type": "number"}]}); "any of")]
    #[test_case(json!({"not": {"type": "string"}}); "not")]
    #[test_case(json!({"items": {"type": "number"}, "minItems": 1}); "homogeneous items")]
    #[test_case(json!({"items": [{"type": "number"}, {"type": "string"}],
                       "additionalItems": false}); "tuple items")]
    #[test_case(json!({"contains": {"type": "number"}}); "contains")]
    #[test_case(json!({"propertyNames": {"maxLength": 3}}); "property names")]
    #[test_case(json!({"additionalProperties": false,
                       "patternProperties": {"^x-": {}}}); "pattern properties")]
    #[test_case(json!({"enum": [1, "two", null]}); "enum_keyword")]
    #[test_case(json!({"const": 7}); "const_keyword")]
    #[test_case(json!({"definitions": {"n": {"type": "number"}},
                       "items": {"$ref": "#/definitions/n"}}); "ref to definition")]
    fn compiles(schema: Value) {
        let prog = compile(&schema).expect("schema must compile");
        assert!(!prog.code.is_empty());
        // Entry proc opens the program.
        let first = Instruction::from(prog.code[0]);
        assert_eq!(first.op(), Ok(Opcode::Proc));
    }

    #[test]
    fn unresolved_ref_is_reported() {
        let err = compile(&json!({"$ref": "#/definitions/missing"})).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedRef(_)));
    }

    #[test]
    fn unsupported_keyword_is_reported() {
        let err = compile(&json!({"format": "uri"})).unwrap_err();
        match err {
            CompileError::UnsupportedKeyword { keyword, .. } => assert_eq!(keyword, "format"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bad_pattern_is_reported() {
        let err = compile(&json!({"pattern": "("})).unwrap_err();
        assert!(matches!(err, CompileError::PatternCompile { .. }));
    }

    #[test]
    fn malformed_payload_carries_its_path() {
        let err = compile(&json!({"properties": {"a": {"minimum": "nope"}}})).unwrap_err();
        match err {
            CompileError::MalformedSchema { path, .. } => {
                assert_eq!(path, "#/properties/a");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn compilation_is_deterministic() {
        let schema = json!({
            "properties": {"a": {"minimum": 1}, "b": {"pattern": "x"}},
            "required": ["a"],
            "oneOf": [{"type": "object"}, {"type": "number"}]
        });
        let p1 = compile(&schema).expect("compile");
        let p2 = compile(&schema).expect("compile");
        assert_eq!(p1.to_bytes(), p2.to_bytes());
    }
}
