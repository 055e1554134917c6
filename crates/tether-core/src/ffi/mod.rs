//! The native<->managed value bridge
//!
//! - Type descriptors and ABI tags ([`types`])
//! - Scalar and aggregate marshaling ([`marshal`])
//! - Native-function records and the call frame engine ([`function`])
//! - Trampoline synthesis for managed callables ([`callback`])

pub mod callback;
pub mod function;
pub mod marshal;
pub mod types;

pub use callback::NativeCallback;
pub use function::NativeFunction;
pub use marshal::{from_foreign, to_foreign, value_to_pointer};
pub use types::{abi_by_name, align_up, AbiType};
