//! Byte-fed validation front end.

use jsv_asm::VmProgram;

use crate::error::VmError;
use crate::interpreter::Vm;
use crate::lexer::Lexer;
use crate::params::VmParams;
use crate::state::Status;

/// A validator bundling the VM with the streaming lexer, fed by byte
/// chunks.
#[derive(Debug)]
pub struct Validator<'p> {
    vm: Vm<'p>,
    lexer: Lexer,
}

impl<'p> Validator<'p> {
    /// Validator with default parameters.
    pub fn new(prog: &'p VmProgram) -> Self {
        Self::with_params(prog, VmParams::default())
    }

    /// Validator with explicit limits.
    pub fn with_params(prog: &'p VmProgram, params: VmParams) -> Self {
        Validator {
            vm: Vm::with_params(prog, params),
            lexer: Lexer::new(),
        }
    }

    /// Feed a chunk of the document. Returns [`Status::More`] until
    /// the document is decided.
    pub fn validate_step(&mut self, input: &[u8]) -> Result<Status, VmError> {
        self.lexer.feed(input);
        self.vm.run(&mut self.lexer)
    }

    /// Signal the end of input and finish.
    ///
    /// Needed for documents whose last token only completes at end of
    /// input (a bare trailing number). Fails with
    /// [`VmError::TruncatedInput`] when the document is still
    /// incomplete.
    pub fn finish(&mut self) -> Result<Status, VmError> {
        self.lexer.end();
        match self.vm.run(&mut self.lexer)? {
            Status::More => Err(VmError::TruncatedInput),
            status => Ok(status),
        }
    }

    /// Validate a complete in-memory document.
    pub fn validate_all(prog: &'p VmProgram, input: &[u8]) -> Result<Status, VmError> {
        let mut v = Validator::new(prog);
        match v.validate_step(input)? {
            Status::More => v.finish(),
            status => Ok(status),
        }
    }
}
