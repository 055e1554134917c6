//! ABI type descriptors and calling-convention tags
//!
//! Descriptors come from the closed name table scripts use, plus
//! recursive struct descriptors built from nested sequences. A descriptor
//! knows its C size and alignment; the libffi `ffi_type` nodes backing a
//! prepared call interface are owned by a [`FfiTypeStore`] so their
//! addresses stay stable for the interface's lifetime.

use crate::error::{CoreError, CoreResult};
use crate::interp::{Heap, Value};
use libffi::low;
use std::mem;
use std::os::raw::{c_int, c_long};
use std::ptr::addr_of_mut;

/// A C-level type for argument and return marshaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiType {
    /// No value; legal only as a return type
    Void,
    /// Untyped pointer
    Pointer,
    /// C `int`
    SInt,
    /// C `unsigned int`
    UInt,
    /// C `long`
    SLong,
    /// C `unsigned long`
    ULong,
    /// C `signed char`; also the representation of `bool`
    SChar,
    /// C `unsigned char`
    UChar,
    /// C `float`
    Float,
    /// C `double`
    Double,
    /// Fixed-width signed 8-bit
    SInt8,
    /// Fixed-width unsigned 8-bit
    UInt8,
    /// Fixed-width signed 16-bit
    SInt16,
    /// Fixed-width unsigned 16-bit
    UInt16,
    /// Fixed-width signed 32-bit
    SInt32,
    /// Fixed-width unsigned 32-bit
    UInt32,
    /// Fixed-width signed 64-bit
    SInt64,
    /// Fixed-width unsigned 64-bit
    UInt64,
    /// Aggregate of fields laid out per C struct rules
    Struct(Vec<AbiType>),
}

const TYPE_NAMES: &[(&str, AbiType)] = &[
    ("void", AbiType::Void),
    ("pointer", AbiType::Pointer),
    ("int", AbiType::SInt),
    ("uint", AbiType::UInt),
    ("long", AbiType::SLong),
    ("ulong", AbiType::ULong),
    ("char", AbiType::SChar),
    ("uchar", AbiType::UChar),
    ("float", AbiType::Float),
    ("double", AbiType::Double),
    ("int8", AbiType::SInt8),
    ("uint8", AbiType::UInt8),
    ("int16", AbiType::SInt16),
    ("uint16", AbiType::UInt16),
    ("int32", AbiType::SInt32),
    ("uint32", AbiType::UInt32),
    ("int64", AbiType::SInt64),
    ("uint64", AbiType::UInt64),
    ("bool", AbiType::SChar),
];

/// Round `offset` up to the next multiple of `alignment`
#[inline]
pub fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

impl AbiType {
    /// Look up a scalar type by its script-visible name
    pub fn by_name(name: &str) -> Option<AbiType> {
        TYPE_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t.clone())
    }

    /// Parse a descriptor value: a name string, or a sequence of field
    /// descriptors for a struct
    pub fn parse(heap: &Heap, spec: &Value) -> CoreResult<AbiType> {
        match spec {
            Value::Str(r) => {
                let name = heap
                    .str_value(*r)
                    .ok_or_else(|| CoreError::TypeMismatch("expected a type name".into()))?;
                AbiType::by_name(name)
                    .ok_or_else(|| CoreError::InvalidType(format!("unsupported type: {}", name)))
            }
            Value::Seq(r) => {
                let specs = heap
                    .seq(*r)
                    .ok_or_else(|| CoreError::TypeMismatch("expected a field list".into()))?
                    .to_vec();
                if specs.is_empty() {
                    return Err(CoreError::InvalidType(
                        "struct type needs at least one field".into(),
                    ));
                }
                let mut fields = Vec::with_capacity(specs.len());
                for spec in &specs {
                    let field = AbiType::parse(heap, spec)?;
                    if field == AbiType::Void {
                        return Err(CoreError::InvalidType(
                            "void is not a valid field type".into(),
                        ));
                    }
                    fields.push(field);
                }
                Ok(AbiType::Struct(fields))
            }
            other => Err(CoreError::TypeMismatch(format!(
                "expected a type specification, got {}",
                other.type_name()
            ))),
        }
    }

    /// Whether this is the void type
    pub fn is_void(&self) -> bool {
        matches!(self, AbiType::Void)
    }

    /// C size in bytes
    pub fn size(&self) -> usize {
        match self {
            AbiType::Void => 0,
            AbiType::Pointer => mem::size_of::<usize>(),
            AbiType::SInt | AbiType::UInt => mem::size_of::<c_int>(),
            AbiType::SLong | AbiType::ULong => mem::size_of::<c_long>(),
            AbiType::SChar | AbiType::UChar | AbiType::SInt8 | AbiType::UInt8 => 1,
            AbiType::SInt16 | AbiType::UInt16 => 2,
            AbiType::SInt32 | AbiType::UInt32 | AbiType::Float => 4,
            AbiType::SInt64 | AbiType::UInt64 | AbiType::Double => 8,
            AbiType::Struct(fields) => {
                let mut size = 0;
                for field in fields {
                    size = align_up(size, field.alignment()) + field.size();
                }
                align_up(size, self.alignment())
            }
        }
    }

    /// C alignment in bytes
    pub fn alignment(&self) -> usize {
        match self {
            AbiType::Void => 1,
            AbiType::Pointer => mem::align_of::<usize>(),
            AbiType::SInt | AbiType::UInt => mem::align_of::<c_int>(),
            AbiType::SLong | AbiType::ULong => mem::align_of::<c_long>(),
            AbiType::SChar | AbiType::UChar | AbiType::SInt8 | AbiType::UInt8 => 1,
            AbiType::SInt16 | AbiType::UInt16 => 2,
            AbiType::SInt32 | AbiType::UInt32 => mem::align_of::<u32>(),
            AbiType::Float => mem::align_of::<f32>(),
            AbiType::SInt64 | AbiType::UInt64 => mem::align_of::<u64>(),
            AbiType::Double => mem::align_of::<f64>(),
            AbiType::Struct(fields) => fields.iter().map(|f| f.alignment()).max().unwrap_or(1),
        }
    }

    /// Byte offset of each field of a struct type
    pub fn field_offsets(&self) -> Vec<usize> {
        match self {
            AbiType::Struct(fields) => {
                let mut offsets = Vec::with_capacity(fields.len());
                let mut offset = 0;
                for field in fields {
                    offset = align_up(offset, field.alignment());
                    offsets.push(offset);
                    offset += field.size();
                }
                offsets
            }
            _ => Vec::new(),
        }
    }
}

/// Look up a calling-convention tag by name
///
/// The recognized set is platform-dependent; `"default"` is always valid.
pub fn abi_by_name(name: &str) -> CoreResult<low::ffi_abi> {
    match name {
        "default" => Ok(low::ffi_abi_FFI_DEFAULT_ABI),
        #[cfg(all(target_arch = "x86_64", windows))]
        "win64" => Ok(libffi::raw::ffi_abi_FFI_WIN64),
        #[cfg(all(target_arch = "x86_64", not(windows)))]
        "unix64" => Ok(libffi::raw::ffi_abi_FFI_UNIX64),
        #[cfg(target_arch = "x86")]
        "sysv" => Ok(libffi::raw::ffi_abi_FFI_SYSV),
        #[cfg(target_arch = "x86")]
        "stdcall" => Ok(libffi::raw::ffi_abi_FFI_STDCALL),
        #[cfg(target_arch = "x86")]
        "thiscall" => Ok(libffi::raw::ffi_abi_FFI_THISCALL),
        #[cfg(target_arch = "x86")]
        "fastcall" => Ok(libffi::raw::ffi_abi_FFI_FASTCALL),
        #[cfg(all(target_arch = "x86", windows))]
        "mscdecl" => Ok(libffi::raw::ffi_abi_FFI_MS_CDECL),
        #[cfg(target_arch = "arm")]
        "sysv" => Ok(libffi::raw::ffi_abi_FFI_SYSV),
        #[cfg(target_arch = "arm")]
        "vfp" => Ok(libffi::raw::ffi_abi_FFI_VFP),
        _ => Err(CoreError::InvalidType("invalid abi specified".into())),
    }
}

/// Owner of the `ffi_type` nodes referenced by a prepared call interface
///
/// Scalar types resolve to libffi's built-in statics; struct types are
/// boxed here together with their null-terminated element arrays so every
/// raw pointer handed to libffi stays valid while the store lives.
#[derive(Default)]
pub struct FfiTypeStore {
    nodes: Vec<Box<low::ffi_type>>,
    element_arrays: Vec<Box<[*mut low::ffi_type]>>,
}

impl FfiTypeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a descriptor to a raw `ffi_type`, allocating struct nodes
    /// in this store
    pub fn raw_type(&mut self, ty: &AbiType) -> *mut low::ffi_type {
        unsafe {
            match ty {
                AbiType::Void => addr_of_mut!(low::types::void),
                AbiType::Pointer => addr_of_mut!(low::types::pointer),
                AbiType::SInt | AbiType::SInt32 => addr_of_mut!(low::types::sint32),
                AbiType::UInt | AbiType::UInt32 => addr_of_mut!(low::types::uint32),
                AbiType::SLong => {
                    if mem::size_of::<c_long>() == 8 {
                        addr_of_mut!(low::types::sint64)
                    } else {
                        addr_of_mut!(low::types::sint32)
                    }
                }
                AbiType::ULong => {
                    if mem::size_of::<c_long>() == 8 {
                        addr_of_mut!(low::types::uint64)
                    } else {
                        addr_of_mut!(low::types::uint32)
                    }
                }
                AbiType::SChar | AbiType::SInt8 => addr_of_mut!(low::types::sint8),
                AbiType::UChar | AbiType::UInt8 => addr_of_mut!(low::types::uint8),
                AbiType::SInt16 => addr_of_mut!(low::types::sint16),
                AbiType::UInt16 => addr_of_mut!(low::types::uint16),
                AbiType::SInt64 => addr_of_mut!(low::types::sint64),
                AbiType::UInt64 => addr_of_mut!(low::types::uint64),
                AbiType::Float => addr_of_mut!(low::types::float),
                AbiType::Double => addr_of_mut!(low::types::double),
                AbiType::Struct(fields) => self.struct_node(fields),
            }
        }
    }

    fn struct_node(&mut self, fields: &[AbiType]) -> *mut low::ffi_type {
        let mut elements: Vec<*mut low::ffi_type> = fields
            .iter()
            .map(|field| self.raw_type(field))
            .collect();
        elements.push(std::ptr::null_mut());

        let elements = elements.into_boxed_slice();
        let elements_ptr = elements.as_ptr() as *mut *mut low::ffi_type;
        self.element_arrays.push(elements);

        let mut node = Box::new(low::ffi_type {
            size: 0,
            alignment: 0,
            type_: low::type_tag::STRUCT,
            elements: elements_ptr,
        });
        let node_ptr = &mut *node as *mut low::ffi_type;
        self.nodes.push(node);
        node_ptr
    }
}
