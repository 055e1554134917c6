//! Error types shared across the bridge and the runtime core

use crate::cpu::CpuContext;
use crate::ptr::NativePointer;
use std::fmt;
use thiserror::Error;

/// The hardware condition captured by the trap catcher during a native
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Invalid memory access (SIGSEGV / SIGBUS)
    AccessViolation,
    /// Illegal or privileged instruction (SIGILL)
    IllegalInstruction,
    /// Arithmetic fault such as integer divide by zero (SIGFPE)
    Arithmetic,
    /// Breakpoint or trace trap (SIGTRAP)
    Breakpoint,
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrapKind::AccessViolation => "access violation",
            TrapKind::IllegalInstruction => "illegal instruction",
            TrapKind::Arithmetic => "arithmetic",
            TrapKind::Breakpoint => "breakpoint",
        };
        f.write_str(name)
    }
}

/// Structured exception captured when a native callee traps
#[derive(Debug, Clone)]
pub struct NativeExceptionDetails {
    /// What kind of trap occurred
    pub kind: TrapKind,
    /// Faulting or trapping address
    pub address: NativePointer,
    /// CPU state at the point of the trap
    pub context: CpuContext,
}

/// Errors raised by the value bridge, the call frame engine, the closure
/// synthesizer, and the runtime core
#[derive(Debug, Error)]
pub enum CoreError {
    /// A managed value could not be converted to or from the requested
    /// ABI type
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The argument vector length did not match the function prototype
    #[error("bad argument count")]
    ArgumentCountMismatch,

    /// A category-level misuse: primitive weak-ref target, write to a
    /// read-only CPU context, unknown ABI or register name
    #[error("{0}")]
    InvalidType(String),

    /// A hardware trap was caught while dispatching into native code
    #[error("native exception: {} at {}", .0.kind, .0.address)]
    NativeException(NativeExceptionDetails),

    /// The operation is not supported by this build or input
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Trampoline or call-interface allocation failed
    #[error("allocation failed: {0}")]
    AllocationFailed(String),
}

/// Bridge and runtime result
pub type CoreResult<T> = Result<T, CoreError>;
