//! Closure synthesizer
//!
//! Wraps a managed callable behind an executable trampoline so scripts can
//! hand out C function pointers. The trampoline may be entered from any
//! native thread; entry serializes on the interpreter mutex. An uncaught
//! managed throw is converted to a zero return and routed to the
//! unhandled-exception sink, preserving the native contract.

use super::marshal::{from_foreign, to_foreign};
use super::types::{abi_by_name, AbiType, FfiTypeStore};
use crate::core::{Core, Scope};
use crate::error::{CoreError, CoreResult};
use crate::interp::{HeapRef, Value};
use crate::ptr::NativePointer;
use libffi::low;
use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::slice;

struct CallbackRecord {
    core: Core,
    func: HeapRef,
    return_type: AbiType,
    arg_types: Vec<AbiType>,
    cif: Box<low::ffi_cif>,
    #[allow(dead_code)]
    raw_arg_types: Box<[*mut low::ffi_type]>,
    #[allow(dead_code)]
    store: FfiTypeStore,
}

impl CallbackRecord {
    /// Native-side entry: convert arguments, invoke the managed callable
    /// under a scope, convert the return
    ///
    /// # Safety
    ///
    /// `result` and `args` come from the libffi closure dispatcher and
    /// follow its layout contract.
    unsafe fn invoke(&self, result: *mut c_void, args: *mut *mut c_void) {
        let mut scope = self.core.enter();

        if !self.return_type.is_void() {
            // Cleared up front: high bits of sub-pointer returns are zero
            // and a managed throw yields a predictable value.
            let rsize = self.return_type.size().max(mem::size_of::<usize>());
            ptr::write_bytes(result as *mut u8, 0, rsize);
        }

        let mut argv = Vec::with_capacity(self.arg_types.len());
        let mut transient = Vec::new();
        for (i, ty) in self.arg_types.iter().enumerate() {
            let slot = slice::from_raw_parts(*args.add(i) as *const u8, ty.size());
            match from_foreign(scope.heap(), ty, slot) {
                Ok(value) => {
                    if let Some(r) = value.heap_ref() {
                        transient.push(r);
                    }
                    argv.push(value);
                }
                Err(_) => {
                    for r in transient {
                        scope.heap().unprotect(r);
                    }
                    return;
                }
            }
        }

        let returned = scope.call(self.func, &argv);

        if let Some(value) = returned {
            if !self.return_type.is_void() {
                let rslice = slice::from_raw_parts_mut(result as *mut u8, self.return_type.size());
                let _ = to_foreign(scope.heap(), &self.return_type, &value, rslice);
            }
        }

        for r in transient {
            scope.heap().unprotect(r);
        }
    }
}

unsafe extern "C" fn callback_trampoline(
    _cif: *mut low::ffi_cif,
    result: *mut c_void,
    args: *mut *mut c_void,
    user_data: *mut c_void,
) {
    let record = &*(user_data as *const CallbackRecord);
    record.invoke(result, args);
}

/// A managed callable exposed as a C function pointer
///
/// The record keeps a strong reference to the callable for the
/// trampoline's lifetime; dropping the record frees the trampoline and
/// releases the callable through the deferred-unprotect queue.
pub struct NativeCallback {
    code: NativePointer,
    closure: *mut low::ffi_closure,
    record: *mut CallbackRecord,
}

// The record is owned by this value and only shared with the trampoline,
// which serializes on the interpreter mutex.
unsafe impl Send for NativeCallback {}
unsafe impl Sync for NativeCallback {}

impl NativeCallback {
    /// Synthesize a trampoline for a managed callable, under the caller's
    /// scope
    pub fn new(
        scope: &mut Scope<'_>,
        func: HeapRef,
        return_spec: &Value,
        arg_specs: &[Value],
        abi_name: Option<&str>,
    ) -> CoreResult<NativeCallback> {
        let return_type = AbiType::parse(scope.heap(), return_spec)?;
        let mut arg_types = Vec::with_capacity(arg_specs.len());
        for spec in arg_specs {
            arg_types.push(AbiType::parse(scope.heap(), spec)?);
        }
        scope.heap().protect(func);
        Self::build(scope.core(), func, return_type, arg_types, abi_name)
    }

    /// Synthesize a trampoline from already-parsed types
    pub fn from_parts(
        core: &Core,
        func: HeapRef,
        return_type: AbiType,
        arg_types: Vec<AbiType>,
        abi_name: Option<&str>,
    ) -> CoreResult<NativeCallback> {
        core.enter().heap().protect(func);
        Self::build(core.clone(), func, return_type, arg_types, abi_name)
    }

    /// The record takes over the protection added by its caller; on
    /// failure the protection is released through the deferred queue.
    fn build(
        core: Core,
        func: HeapRef,
        return_type: AbiType,
        arg_types: Vec<AbiType>,
        abi_name: Option<&str>,
    ) -> CoreResult<NativeCallback> {
        let result = Self::build_inner(core.clone(), func, return_type, arg_types, abi_name);
        if result.is_err() {
            core.unprotect_later(func);
        }
        result
    }

    fn build_inner(
        core: Core,
        func: HeapRef,
        return_type: AbiType,
        arg_types: Vec<AbiType>,
        abi_name: Option<&str>,
    ) -> CoreResult<NativeCallback> {
        let abi = abi_by_name(abi_name.unwrap_or("default"))?;

        let mut store = FfiTypeStore::new();
        let rtype = store.raw_type(&return_type);
        let raw_arg_types: Box<[*mut low::ffi_type]> =
            arg_types.iter().map(|t| store.raw_type(t)).collect();

        let mut cif: Box<low::ffi_cif> = Box::new(unsafe { mem::zeroed() });
        unsafe {
            low::prep_cif(
                &mut *cif,
                abi,
                arg_types.len(),
                rtype,
                raw_arg_types.as_ptr() as *mut *mut low::ffi_type,
            )
        }
        .map_err(|_| CoreError::InvalidType("failed to compile function call interface".into()))?;

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(CoreError::AllocationFailed("failed to allocate closure".into()));
        }

        let record = Box::into_raw(Box::new(CallbackRecord {
            core,
            func,
            return_type,
            arg_types,
            cif,
            raw_arg_types,
            store,
        }));

        let status = unsafe {
            libffi::raw::ffi_prep_closure_loc(
                closure,
                &mut *(*record).cif,
                Some(callback_trampoline),
                record as *mut c_void,
                code.0,
            )
        };
        if status != libffi::raw::ffi_status_FFI_OK {
            unsafe {
                low::closure_free(closure);
                drop(Box::from_raw(record));
            }
            return Err(CoreError::AllocationFailed("failed to prepare closure".into()));
        }

        Ok(NativeCallback {
            code: NativePointer::new(code.0 as usize),
            closure,
            record,
        })
    }

    /// The executable trampoline address; pass anywhere a C function
    /// pointer is expected
    pub fn ptr(&self) -> NativePointer {
        self.code
    }

    /// The trampoline address as a managed value
    pub fn as_value(&self) -> Value {
        Value::Pointer(self.code)
    }
}

impl Drop for NativeCallback {
    fn drop(&mut self) {
        unsafe {
            low::closure_free(self.closure);
            let record = Box::from_raw(self.record);
            // Releasing the callable must not run inside this finalizer;
            // queue it for the interpreter thread.
            record.core.unprotect_later(record.func);
        }
    }
}
