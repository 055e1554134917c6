//! Managed interpreter stand-in
//!
//! The scripting interpreter proper is outside the core; what the bridge
//! needs from it is a value model, a heap with explicit protection counts,
//! and callables it can invoke under the interpreter lock. This module
//! provides exactly that surface:
//! - Managed values ([`Value`])
//! - A protected-slab heap with weak watchers and mark/sweep collection
//! - Host-provided callables stored as heap objects

mod heap;
mod value;

pub use heap::{Heap, HeapObject, HeapStats};
pub use value::{CallableFn, HeapRef, Value};

/// The interpreter state guarded by the runtime core's mutex
///
/// Managed code runs single-threaded; every native entry locks this
/// context for the duration of a scope.
#[derive(Default)]
pub struct Interpreter {
    /// The managed heap
    pub heap: Heap,
}

impl Interpreter {
    /// Create an empty interpreter context
    pub fn new() -> Self {
        Self::default()
    }
}
