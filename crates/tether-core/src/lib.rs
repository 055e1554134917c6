//! Tether core runtime
//!
//! This crate provides the native<->managed bridge and runtime core for
//! embedding a scripting runtime inside a host process:
//! - Value bridge between managed values and the C ABI
//! - Call frame engine for invoking arbitrary native prototypes
//! - Closure synthesizer producing C function pointers backed by managed
//!   callables
//! - Runtime core: scopes, timers, weak references, message sinks,
//!   deferred unprotection, event waits
//! - Hardware-trap recovery around native dispatch
//! - Architecture-specific CPU context accessors

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod core;
pub mod cpu;
pub mod error;
pub mod exceptor;
pub mod ffi;
pub mod interp;
pub mod ptr;
mod scheduler;
pub mod script;

pub use crate::core::{Core, CoreOptions, MessageEmitter, Scope, Stage};
pub use crate::cpu::{Access, CpuContext, CpuContextView};
pub use crate::error::{CoreError, CoreResult, NativeExceptionDetails, TrapKind};
pub use crate::exceptor::Exceptor;
pub use crate::ffi::{AbiType, NativeCallback, NativeFunction};
pub use crate::interp::{Heap, HeapRef, Interpreter, Value};
pub use crate::ptr::NativePointer;
pub use crate::script::ScriptMeta;
