//! Conversion between managed values and ABI slots
//!
//! `to_foreign` packs a managed value into a caller-provided slot;
//! `from_foreign` reads a slot back into a managed value. Integer
//! conversions trust the caller to supply in-range values and keep the low
//! bits on overflow. Struct slots are packed field by field honoring each
//! field's alignment.

use super::types::{align_up, AbiType};
use crate::error::{CoreError, CoreResult};
use crate::interp::{Heap, Value};
use crate::ptr::NativePointer;
use std::os::raw::c_long;

/// Coerce a managed value to a pointer
///
/// Accepts pointer values, numerics (including the 64-bit wrappers) and
/// null; everything else is a type mismatch.
pub fn value_to_pointer(value: &Value) -> CoreResult<NativePointer> {
    match value {
        Value::Pointer(p) => Ok(*p),
        Value::Null => Ok(NativePointer::NULL),
        Value::Number(n) => Ok(NativePointer::new(*n as i64 as usize)),
        Value::Int64(v) => Ok(NativePointer::new(*v as usize)),
        Value::UInt64(v) => Ok(NativePointer::new(*v as usize)),
        other => Err(CoreError::TypeMismatch(format!(
            "expected a pointer, got {}",
            other.type_name()
        ))),
    }
}

fn require_i64(value: &Value, ty: &AbiType) -> CoreResult<i64> {
    value.as_i64().ok_or_else(|| {
        CoreError::TypeMismatch(format!(
            "expected a number for {:?}, got {}",
            ty,
            value.type_name()
        ))
    })
}

fn require_u64(value: &Value, ty: &AbiType) -> CoreResult<u64> {
    value.as_u64().ok_or_else(|| {
        CoreError::TypeMismatch(format!(
            "expected a number for {:?}, got {}",
            ty,
            value.type_name()
        ))
    })
}

fn require_f64(value: &Value, ty: &AbiType) -> CoreResult<f64> {
    value.as_number().ok_or_else(|| {
        CoreError::TypeMismatch(format!(
            "expected a number for {:?}, got {}",
            ty,
            value.type_name()
        ))
    })
}

/// Pack a managed value into the slot at `dst[0..ty.size()]`
pub fn to_foreign(heap: &Heap, ty: &AbiType, value: &Value, dst: &mut [u8]) -> CoreResult<()> {
    match ty {
        AbiType::Void => Err(CoreError::TypeMismatch(
            "void is not a valid argument type".into(),
        )),
        AbiType::Pointer => {
            let p = value_to_pointer(value)?;
            dst[..std::mem::size_of::<usize>()].copy_from_slice(&p.address().to_ne_bytes());
            Ok(())
        }
        AbiType::SInt | AbiType::SInt32 => {
            let v = require_i64(value, ty)? as i32;
            dst[..4].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::UInt | AbiType::UInt32 => {
            let v = require_u64(value, ty)? as u32;
            dst[..4].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::SLong => {
            let v = require_i64(value, ty)?;
            if std::mem::size_of::<c_long>() == 8 {
                dst[..8].copy_from_slice(&v.to_ne_bytes());
            } else {
                dst[..4].copy_from_slice(&(v as i32).to_ne_bytes());
            }
            Ok(())
        }
        AbiType::ULong => {
            let v = require_u64(value, ty)?;
            if std::mem::size_of::<c_long>() == 8 {
                dst[..8].copy_from_slice(&v.to_ne_bytes());
            } else {
                dst[..4].copy_from_slice(&(v as u32).to_ne_bytes());
            }
            Ok(())
        }
        AbiType::SChar | AbiType::SInt8 => {
            dst[0] = require_i64(value, ty)? as i8 as u8;
            Ok(())
        }
        AbiType::UChar | AbiType::UInt8 => {
            dst[0] = require_u64(value, ty)? as u8;
            Ok(())
        }
        AbiType::SInt16 => {
            let v = require_i64(value, ty)? as i16;
            dst[..2].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::UInt16 => {
            let v = require_u64(value, ty)? as u16;
            dst[..2].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::SInt64 => {
            let v = require_i64(value, ty)?;
            dst[..8].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::UInt64 => {
            let v = require_u64(value, ty)?;
            dst[..8].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::Float => {
            let v = require_f64(value, ty)? as f32;
            dst[..4].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::Double => {
            let v = require_f64(value, ty)?;
            dst[..8].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        AbiType::Struct(fields) => {
            let seq_ref = match value {
                Value::Seq(r) => *r,
                other => {
                    return Err(CoreError::TypeMismatch(format!(
                        "expected a sequence for a struct argument, got {}",
                        other.type_name()
                    )))
                }
            };
            let elements = heap
                .seq(seq_ref)
                .ok_or_else(|| CoreError::TypeMismatch("stale sequence reference".into()))?
                .to_vec();
            if elements.len() != fields.len() {
                return Err(CoreError::TypeMismatch(format!(
                    "expected {} struct fields, got {}",
                    fields.len(),
                    elements.len()
                )));
            }
            let mut offset = 0;
            for (field, element) in fields.iter().zip(elements.iter()) {
                offset = align_up(offset, field.alignment());
                to_foreign(heap, field, element, &mut dst[offset..])?;
                offset += field.size();
            }
            Ok(())
        }
    }
}

/// Read the slot at `src[0..ty.size()]` back into a managed value
///
/// `void` yields the undefined value; struct slots materialize as an
/// ordered sequence of field values.
pub fn from_foreign(heap: &mut Heap, ty: &AbiType, src: &[u8]) -> CoreResult<Value> {
    let value = match ty {
        AbiType::Void => Value::Undefined,
        AbiType::Pointer => {
            let mut bytes = [0u8; std::mem::size_of::<usize>()];
            bytes.copy_from_slice(&src[..std::mem::size_of::<usize>()]);
            Value::Pointer(NativePointer::new(usize::from_ne_bytes(bytes)))
        }
        AbiType::SInt | AbiType::SInt32 => {
            Value::Number(i32::from_ne_bytes(src[..4].try_into().unwrap()) as f64)
        }
        AbiType::UInt | AbiType::UInt32 => {
            Value::Number(u32::from_ne_bytes(src[..4].try_into().unwrap()) as f64)
        }
        AbiType::SLong => {
            if std::mem::size_of::<c_long>() == 8 {
                Value::from_i64(i64::from_ne_bytes(src[..8].try_into().unwrap()))
            } else {
                Value::Number(i32::from_ne_bytes(src[..4].try_into().unwrap()) as f64)
            }
        }
        AbiType::ULong => {
            if std::mem::size_of::<c_long>() == 8 {
                Value::from_u64(u64::from_ne_bytes(src[..8].try_into().unwrap()))
            } else {
                Value::Number(u32::from_ne_bytes(src[..4].try_into().unwrap()) as f64)
            }
        }
        AbiType::SChar | AbiType::SInt8 => Value::Number(src[0] as i8 as f64),
        AbiType::UChar | AbiType::UInt8 => Value::Number(src[0] as f64),
        AbiType::SInt16 => Value::Number(i16::from_ne_bytes(src[..2].try_into().unwrap()) as f64),
        AbiType::UInt16 => Value::Number(u16::from_ne_bytes(src[..2].try_into().unwrap()) as f64),
        AbiType::SInt64 => Value::from_i64(i64::from_ne_bytes(src[..8].try_into().unwrap())),
        AbiType::UInt64 => Value::from_u64(u64::from_ne_bytes(src[..8].try_into().unwrap())),
        AbiType::Float => Value::Number(f32::from_ne_bytes(src[..4].try_into().unwrap()) as f64),
        AbiType::Double => Value::Number(f64::from_ne_bytes(src[..8].try_into().unwrap())),
        AbiType::Struct(fields) => {
            let mut elements = Vec::with_capacity(fields.len());
            let mut offset = 0;
            for field in fields {
                offset = align_up(offset, field.alignment());
                elements.push(from_foreign(heap, field, &src[offset..])?);
                offset += field.size();
            }
            Value::Seq(heap.alloc_seq(elements))
        }
    };
    Ok(value)
}
