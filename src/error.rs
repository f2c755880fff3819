//! Typed error kinds raised during validation, execution and host calls,
//! and the uniform result record handed back to the embedder.

use thiserror::Error;

/// Reason a contract execution stopped abruptly inside JITted code.
///
/// The first five kinds correspond one-to-one to the error trampolines
/// emitted by the code writer; `MemoryOutOfBounds` is raised by the
/// bounds checks in front of every linear-memory access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapKind {
    /// The `unreachable` instruction was executed.
    Unreachable,
    /// Invalid float-to-int conversion, division by zero or signed
    /// division overflow.
    Arithmetic,
    /// `call_indirect` with an index outside the table.
    CallIndirectOutOfRange,
    /// `call_indirect` whose type token did not match the target.
    CallIndirectTypeMismatch,
    /// The call-depth budget was exhausted.
    StackOverflow,
    /// A load or store fell outside linear memory.
    MemoryOutOfBounds,
}

impl TrapKind {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            TrapKind::Unreachable => "unreachable executed",
            TrapKind::Arithmetic => "arithmetic error",
            TrapKind::CallIndirectOutOfRange => "call_indirect out of range",
            TrapKind::CallIndirectTypeMismatch => "call_indirect type mismatch",
            TrapKind::StackOverflow => "call depth exhausted",
            TrapKind::MemoryOutOfBounds => "memory access out of bounds",
        }
    }
}

/// Error raised while validating, compiling or running a contract.
///
/// Every variant maps onto exactly one [`StatusCode`]; `EndExecution` is
/// the non-error termination raised by `finish`/`revert`, whose status is
/// decided by the result slot it populated.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("execution ended")]
    EndExecution,
    #[error("trap: {}", .0.describe())]
    Trap(TrapKind),
    #[error("out of gas")]
    OutOfGas,
    #[error("argument out of range: {0}")]
    ArgumentOutOfRange(String),
    #[error("invalid memory access: {0}")]
    InvalidMemoryAccess(String),
    #[error("static mode violation in {0}")]
    StaticModeViolation(&'static str),
    #[error("contract validation failure: {0}")]
    ContractValidationFailure(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<anyhow::Error> for VmError {
    fn from(err: anyhow::Error) -> Self {
        VmError::InternalError(format!("{err:#}"))
    }
}

/// Status of a finished invocation, mirroring the embedder's status
/// enumeration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    Revert,
    /// A trap: unreachable, arithmetic fault, bad indirect call or call
    /// depth exhaustion.
    Failure,
    OutOfGas,
    ArgumentOutOfRange,
    InvalidMemoryAccess,
    StaticModeViolation,
    ContractValidationFailure,
    InternalError,
    /// The input was not WebAssembly and the VM is configured to hand it
    /// back to the client (`evm1mode = fallback`).
    Rejected,
}

/// Uniform result of one contract invocation.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub status_code: StatusCode,
    pub gas_left: i64,
    pub output: Vec<u8>,
}

impl ExecutionResult {
    pub fn new(status_code: StatusCode, gas_left: i64, output: Vec<u8>) -> Self {
        Self {
            status_code,
            gas_left,
            output,
        }
    }

    /// Result for a failed invocation; no gas is refunded and no output
    /// is produced.
    pub fn failure(status_code: StatusCode) -> Self {
        Self::new(status_code, 0, Vec::new())
    }

    pub fn is_revert(&self) -> bool {
        self.status_code == StatusCode::Revert
    }
}

impl VmError {
    /// Status this error maps to. `EndExecution` is resolved by the
    /// caller from the result slot and must not reach this point.
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            VmError::EndExecution => StatusCode::InternalError,
            VmError::Trap(TrapKind::MemoryOutOfBounds) => StatusCode::InvalidMemoryAccess,
            VmError::Trap(_) => StatusCode::Failure,
            VmError::OutOfGas => StatusCode::OutOfGas,
            VmError::ArgumentOutOfRange(_) => StatusCode::ArgumentOutOfRange,
            VmError::InvalidMemoryAccess(_) => StatusCode::InvalidMemoryAccess,
            VmError::StaticModeViolation(_) => StatusCode::StaticModeViolation,
            VmError::ContractValidationFailure(_) => StatusCode::ContractValidationFailure,
            VmError::InternalError(_) => StatusCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_statuses() {
        assert_eq!(
            VmError::Trap(TrapKind::StackOverflow).status(),
            StatusCode::Failure
        );
        assert_eq!(
            VmError::Trap(TrapKind::MemoryOutOfBounds).status(),
            StatusCode::InvalidMemoryAccess
        );
        assert_eq!(VmError::OutOfGas.status(), StatusCode::OutOfGas);
    }
}
