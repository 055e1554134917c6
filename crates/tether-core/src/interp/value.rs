//! Managed value representation

use crate::core::Scope;
use crate::ptr::NativePointer;
use std::fmt;
use std::sync::Arc;

/// Largest integer magnitude an f64 represents losslessly
const MAX_SAFE_INTEGER: u64 = 1 << 53;

/// Handle to an object in the managed heap
///
/// A `HeapRef` does not keep its target alive; liveness is governed by the
/// heap entry's protect count and reachability from protected roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef(pub(crate) u32);

impl HeapRef {
    /// Raw handle id
    pub fn id(self) -> u32 {
        self.0
    }
}

/// A managed callable invoked under a scope
///
/// The `Err` arm is a thrown managed value.
pub type CallableFn = dyn Fn(&mut Scope<'_>, &[Value]) -> Result<Value, Value> + Send + Sync;

/// A managed value as seen by the bridge
#[derive(Clone)]
pub enum Value {
    /// The undefined value
    Undefined,
    /// The null value
    Null,
    /// Boolean
    Bool(bool),
    /// Double-precision number
    Number(f64),
    /// Signed 64-bit wrapper, used when a value does not fit an f64
    Int64(i64),
    /// Unsigned 64-bit wrapper, used when a value does not fit an f64
    UInt64(u64),
    /// Address-sized pointer
    Pointer(NativePointer),
    /// Heap string
    Str(HeapRef),
    /// Heap ordered sequence
    Seq(HeapRef),
    /// Heap byte buffer
    Bytes(HeapRef),
    /// Heap callable
    Callable(HeapRef),
}

impl Value {
    /// Wrap a signed 64-bit integer, using a plain number when lossless
    pub fn from_i64(v: i64) -> Value {
        if v.unsigned_abs() <= MAX_SAFE_INTEGER {
            Value::Number(v as f64)
        } else {
            Value::Int64(v)
        }
    }

    /// Wrap an unsigned 64-bit integer, using a plain number when lossless
    pub fn from_u64(v: u64) -> Value {
        if v <= MAX_SAFE_INTEGER {
            Value::Number(v as f64)
        } else {
            Value::UInt64(v)
        }
    }

    /// Numeric view across `Number` and the 64-bit wrappers
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Signed 64-bit view, exact for the wrapper variants
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Unsigned 64-bit view, exact for the wrapper variants
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => Some(*n as u64),
            Value::Int64(v) => Some(*v as u64),
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    /// Whether this value holds a heap reference
    pub fn heap_ref(&self) -> Option<HeapRef> {
        match self {
            Value::Str(r) | Value::Seq(r) | Value::Bytes(r) | Value::Callable(r) => Some(*r),
            _ => None,
        }
    }

    /// Category name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Pointer(_) => "pointer",
            Value::Str(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Bytes(_) => "bytes",
            Value::Callable(_) => "callable",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Int64(v) => write!(f, "int64({})", v),
            Value::UInt64(v) => write!(f, "uint64({})", v),
            Value::Pointer(p) => write!(f, "{}", p),
            Value::Str(r) => write!(f, "str#{}", r.0),
            Value::Seq(r) => write!(f, "seq#{}", r.0),
            Value::Bytes(r) => write!(f, "bytes#{}", r.0),
            Value::Callable(r) => write!(f, "callable#{}", r.0),
        }
    }
}

/// Shared handle to a callable object
///
/// Callables are immutable `Fn`s so a callable may re-enter itself through
/// a native round trip without self-deadlocking.
pub(crate) type CallableHandle = Arc<CallableFn>;
