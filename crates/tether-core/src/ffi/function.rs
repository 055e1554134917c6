//! Native-function records and the call frame engine
//!
//! A record prepares its libffi call interface once at construction; each
//! invocation builds an aligned argument block, releases the interpreter
//! mutex, dispatches under the trap catcher and marshals the return slot
//! back.

use super::marshal::{from_foreign, to_foreign};
use super::types::{abi_by_name, align_up, AbiType, FfiTypeStore};
use crate::core::Scope;
use crate::error::{CoreError, CoreResult};
use crate::exceptor::Exceptor;
use crate::interp::{Heap, Value};
use crate::ptr::NativePointer;
use libffi::low;
use std::mem;
use std::os::raw::c_void;

/// Scratch buffer with a guaranteed start alignment
pub(crate) struct AlignedBuf {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes aligned to `align`
    pub fn zeroed(len: usize, align: usize) -> Self {
        let mut storage = vec![0u8; len + align];
        let addr = storage.as_mut_ptr() as usize;
        let offset = (align - (addr % align)) % align;
        Self {
            storage,
            offset,
            len,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let (offset, len) = (self.offset, self.len);
        &mut self.storage[offset..offset + len]
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        unsafe { self.storage.as_mut_ptr().add(self.offset) }
    }
}

/// A callable wrapper around a raw native code address
///
/// Holds the prepared call interface, the concrete argument types (with
/// the variadic split recorded when a `"..."` marker was present) and the
/// precomputed argument-block size.
pub struct NativeFunction {
    fn_ptr: NativePointer,
    return_type: AbiType,
    arg_types: Vec<AbiType>,
    variadic: bool,
    fixed_argc: usize,
    arglist_size: usize,
    cif: Box<low::ffi_cif>,
    #[allow(dead_code)]
    raw_arg_types: Box<[*mut low::ffi_type]>,
    #[allow(dead_code)]
    store: FfiTypeStore,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("fn_ptr", &self.fn_ptr)
            .field("return_type", &self.return_type)
            .field("arg_types", &self.arg_types)
            .field("variadic", &self.variadic)
            .field("fixed_argc", &self.fixed_argc)
            .field("arglist_size", &self.arglist_size)
            .finish_non_exhaustive()
    }
}

// The raw pointers reference libffi's built-in type descriptors or
// storage owned by this record, both stable for the record's lifetime.
unsafe impl Send for NativeFunction {}
unsafe impl Sync for NativeFunction {}

impl NativeFunction {
    /// Create a record from script-level descriptors
    ///
    /// `arg_specs` may contain a single `"..."` marker; the types after it
    /// describe the concrete variadic arguments of this binding.
    pub fn new(
        heap: &Heap,
        fn_ptr: NativePointer,
        return_spec: &Value,
        arg_specs: &[Value],
        abi_name: Option<&str>,
    ) -> CoreResult<NativeFunction> {
        let return_type = AbiType::parse(heap, return_spec)?;

        let mut arg_types = Vec::with_capacity(arg_specs.len());
        let mut fixed_argc = None;
        for spec in arg_specs {
            let is_marker = match spec {
                Value::Str(r) => heap.str_value(*r) == Some("..."),
                _ => false,
            };
            if is_marker {
                if fixed_argc.is_some() {
                    return Err(CoreError::Unsupported(
                        "only one variadic marker may be specified".into(),
                    ));
                }
                fixed_argc = Some(arg_types.len());
            } else {
                arg_types.push(AbiType::parse(heap, spec)?);
            }
        }

        Self::from_parts(fn_ptr, return_type, arg_types, fixed_argc, abi_name)
    }

    /// Create a record from already-parsed types
    pub fn from_parts(
        fn_ptr: NativePointer,
        return_type: AbiType,
        arg_types: Vec<AbiType>,
        fixed_argc: Option<usize>,
        abi_name: Option<&str>,
    ) -> CoreResult<NativeFunction> {
        let abi = abi_by_name(abi_name.unwrap_or("default"))?;
        let variadic = fixed_argc.is_some();
        let fixed_argc = fixed_argc.unwrap_or(arg_types.len());

        let mut store = FfiTypeStore::new();
        let rtype = store.raw_type(&return_type);
        let raw_arg_types: Box<[*mut low::ffi_type]> =
            arg_types.iter().map(|t| store.raw_type(t)).collect();

        let mut cif: Box<low::ffi_cif> = Box::new(unsafe { mem::zeroed() });
        let prepared = unsafe {
            if variadic {
                low::prep_cif_var(
                    &mut *cif,
                    abi,
                    fixed_argc,
                    arg_types.len(),
                    rtype,
                    raw_arg_types.as_ptr() as *mut *mut low::ffi_type,
                )
            } else {
                low::prep_cif(
                    &mut *cif,
                    abi,
                    arg_types.len(),
                    rtype,
                    raw_arg_types.as_ptr() as *mut *mut low::ffi_type,
                )
            }
        };
        prepared.map_err(|_| {
            CoreError::InvalidType("failed to compile function call interface".into())
        })?;

        let mut arglist_size = 0;
        for ty in &arg_types {
            arglist_size = align_up(arglist_size, ty.alignment());
            arglist_size += ty.size();
        }

        Ok(NativeFunction {
            fn_ptr,
            return_type,
            arg_types,
            variadic,
            fixed_argc,
            arglist_size,
            cif,
            raw_arg_types,
            store,
        })
    }

    /// The wrapped code address
    pub fn fn_ptr(&self) -> NativePointer {
        self.fn_ptr
    }

    /// Return type of the prototype
    pub fn return_type(&self) -> &AbiType {
        &self.return_type
    }

    /// Concrete argument types expected by `invoke`
    pub fn arg_types(&self) -> &[AbiType] {
        &self.arg_types
    }

    /// Whether the interface was prepared in its variadic form
    pub fn variadic(&self) -> bool {
        self.variadic
    }

    /// Number of fixed arguments before the variadic tail
    pub fn fixed_argc(&self) -> usize {
        self.fixed_argc
    }

    /// Total argument-block size in bytes
    pub fn arglist_size(&self) -> usize {
        self.arglist_size
    }

    /// Call through the prepared interface
    ///
    /// The interpreter mutex is released around the dispatch; a hardware
    /// trap in the callee surfaces as `NativeException` with the captured
    /// CPU state.
    pub fn invoke(&self, scope: &mut Scope<'_>, args: &[Value]) -> CoreResult<Value> {
        if args.len() != self.arg_types.len() {
            return Err(CoreError::ArgumentCountMismatch);
        }

        let rsize = self.return_type.size().max(mem::size_of::<usize>());
        let ralign = self.return_type.alignment().max(mem::align_of::<usize>());
        let mut return_slot = AlignedBuf::zeroed(rsize, ralign);

        let block_align = self
            .arg_types
            .first()
            .map(|t| t.alignment())
            .unwrap_or(1)
            .max(mem::align_of::<usize>());
        // Zero-filled block: high bits of sub-pointer integers are clear.
        let mut block = AlignedBuf::zeroed(self.arglist_size.max(1), block_align);

        let mut slots: Vec<*mut c_void> = Vec::with_capacity(args.len());
        let mut offset = 0;
        for (ty, value) in self.arg_types.iter().zip(args.iter()) {
            offset = align_up(offset, ty.alignment());
            to_foreign(scope.heap(), ty, value, &mut block.as_mut_slice()[offset..])?;
            slots.push(unsafe { block.as_mut_ptr().add(offset) } as *mut c_void);
            offset += ty.size();
        }

        let cif = &*self.cif as *const low::ffi_cif as *mut low::ffi_cif;
        let code: unsafe extern "C" fn() = unsafe { mem::transmute(self.fn_ptr.address()) };
        let return_ptr = return_slot.as_mut_ptr() as *mut c_void;
        let slots_ptr = slots.as_mut_ptr();

        let exceptor = Exceptor::obtain();
        let outcome = scope.suspend(|| {
            exceptor.try_call(|| unsafe {
                libffi::raw::ffi_call(cif, Some(code), return_ptr, slots_ptr);
            })
        });

        match outcome {
            Err(details) => Err(CoreError::NativeException(details)),
            Ok(()) => {
                if self.return_type.is_void() {
                    Ok(Value::Undefined)
                } else {
                    from_foreign(scope.heap(), &self.return_type, return_slot.as_slice())
                }
            }
        }
    }
}
