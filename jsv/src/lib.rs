//! Streaming JSON-Schema validation.
//!
//! `jsv` compiles a JSON-Schema document into a compact byte-code
//! program and validates JSON input against it in a single
//! left-to-right pass over the token stream, without materializing the
//! input as a tree.
//!
//! ```
//! use jsv::prelude::*;
//!
//! let schema = serde_json::json!({
//!     "properties": {"name": {"type": "string"}},
//!     "required": ["name"]
//! });
//! let program = jsv::compile(&schema).expect("schema compiles");
//!
//! let mut validator = Validator::new(&program);
//! let status = validator.validate_step(br#"{"name": "ok"}"#).unwrap();
//! assert_eq!(status, Status::Valid);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

#[doc(no_inline)]
pub use jsv_asm;
#[doc(no_inline)]
pub use jsv_compiler;
#[doc(no_inline)]
pub use jsv_vm;

pub use jsv_compiler::{compile, compile_with_opts, CompileError, CompileOpts};
pub use jsv_vm::{Status, Validator, Vm, VmError, VmParams};

pub mod prelude {
    //! The common imports for compiling and validating.
    #[doc(no_inline)]
    pub use jsv_asm::{ErrorCode, VmProgram};
    #[doc(no_inline)]
    pub use jsv_compiler::{compile, CompileError, CompileOpts};
    #[doc(no_inline)]
    pub use jsv_vm::{Lexer, Status, TokenSource, Validator, Vm, VmError, VmParams};
}
