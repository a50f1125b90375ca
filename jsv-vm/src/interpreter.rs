//! The VM driver.
//!
//! [`Vm`] owns the per-execution state (root machine, parameters) and
//! borrows the compiled program immutably, so any number of instances
//! can share one program. Execution is cooperative: [`Vm::run`] pulls
//! tokens from the source until the document is decided or the source
//! drains.

use jsv_asm::{Event, VmProgram};

use crate::error::VmError;
use crate::machine::{Machine, MachineState};
use crate::params::VmParams;
use crate::source::{SourceResult, TokenSource};
use crate::state::Status;

/// A validation execution over one compiled program.
#[derive(Debug)]
pub struct Vm<'p> {
    prog: &'p VmProgram,
    params: VmParams,
    root: Machine,
    evt: Event,
    finished: Option<Status>,
}

impl<'p> Vm<'p> {
    /// Execution with default parameters.
    pub fn new(prog: &'p VmProgram) -> Self {
        Self::with_params(prog, VmParams::default())
    }

    /// Execution with explicit limits.
    pub fn with_params(prog: &'p VmProgram, params: VmParams) -> Self {
        Vm {
            prog,
            params,
            root: Machine::new(0),
            evt: Event::default(),
            finished: None,
        }
    }

    /// The program being executed.
    pub fn program(&self) -> &'p VmProgram {
        self.prog
    }

    /// The configured limits.
    pub fn params(&self) -> &VmParams {
        &self.params
    }

    /// Step the execution against a token source. Returns a terminal
    /// status once reached; repeated calls keep returning it.
    pub fn run(&mut self, source: &mut dyn TokenSource) -> Result<Status, VmError> {
        if let Some(done) = self.finished {
            return Ok(done);
        }
        loop {
            match self.root.step(self.prog, &self.params)? {
                MachineState::Done(Ok(())) => {
                    tracing::trace!("validation finished: valid");
                    self.finished = Some(Status::Valid);
                    return Ok(Status::Valid);
                }
                MachineState::Done(Err(code)) => {
                    tracing::trace!(code = %code, "validation finished: invalid");
                    self.finished = Some(Status::Invalid(code));
                    return Ok(Status::Invalid(code));
                }
                MachineState::NeedToken => match source.next(&mut self.evt) {
                    SourceResult::Ok => self.root.feed(&self.evt)?,
                    SourceResult::More => return Ok(Status::More),
                    SourceResult::Error => {
                        return Err(VmError::MalformedStream("token source error"))
                    }
                },
            }
        }
    }
}
