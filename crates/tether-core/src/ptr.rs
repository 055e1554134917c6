//! Opaque address-sized pointer values
//!
//! `NativePointer` is the sole representation of an address crossing the
//! managed/native boundary. All arithmetic wraps at the pointer width.

use crate::error::{CoreError, CoreResult};
use std::cmp::Ordering;
use std::fmt;

/// An opaque address-sized integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NativePointer(usize);

impl NativePointer {
    /// The null pointer
    pub const NULL: NativePointer = NativePointer(0);

    /// Create a pointer from a raw address
    pub fn new(address: usize) -> Self {
        NativePointer(address)
    }

    /// Parse a pointer from its string form
    ///
    /// Accepts `0x`-prefixed hex and plain decimal, matching what the
    /// script surface produces via `toString` and `toJSON`.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let text = text.trim();
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            usize::from_str_radix(hex, 16)
        } else {
            text.parse::<usize>()
        };
        parsed
            .map(NativePointer)
            .map_err(|_| CoreError::TypeMismatch(format!("expected a pointer, got {:?}", text)))
    }

    /// Raw address value
    #[inline]
    pub fn address(self) -> usize {
        self.0
    }

    /// Whether this is the null pointer
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer addition (wrapping)
    pub fn add(self, rhs: NativePointer) -> NativePointer {
        NativePointer(self.0.wrapping_add(rhs.0))
    }

    /// Pointer subtraction (wrapping)
    pub fn sub(self, rhs: NativePointer) -> NativePointer {
        NativePointer(self.0.wrapping_sub(rhs.0))
    }

    /// Bitwise and
    pub fn and(self, rhs: NativePointer) -> NativePointer {
        NativePointer(self.0 & rhs.0)
    }

    /// Bitwise or
    pub fn or(self, rhs: NativePointer) -> NativePointer {
        NativePointer(self.0 | rhs.0)
    }

    /// Bitwise xor
    pub fn xor(self, rhs: NativePointer) -> NativePointer {
        NativePointer(self.0 ^ rhs.0)
    }

    /// Logical shift right
    pub fn shr(self, rhs: NativePointer) -> NativePointer {
        NativePointer(self.0.wrapping_shr(rhs.0 as u32))
    }

    /// Logical shift left
    pub fn shl(self, rhs: NativePointer) -> NativePointer {
        NativePointer(self.0.wrapping_shl(rhs.0 as u32))
    }

    /// Three-way comparison: -1, 0 or 1
    pub fn compare(self, rhs: NativePointer) -> i32 {
        match self.0.cmp(&rhs.0) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Truncate to the low 32 bits, sign-extended semantics
    pub fn to_int32(self) -> i32 {
        self.0 as u32 as i32
    }

    /// Format with the given radix
    ///
    /// Radix 10 yields plain decimal; radix 16 yields unprefixed hex.
    /// `to_string_default` is the no-radix form with a `0x` prefix.
    pub fn to_string_radix(self, radix: u32) -> CoreResult<String> {
        match radix {
            10 => Ok(format!("{}", self.0)),
            16 => Ok(format!("{:x}", self.0)),
            _ => Err(CoreError::InvalidType("unsupported radix".into())),
        }
    }

    /// Default string form: `0x`-prefixed hex
    pub fn to_string_default(self) -> String {
        format!("{:#x}", self.0)
    }

    /// JSON representation, identical to the default string form
    pub fn to_json(self) -> String {
        self.to_string_default()
    }

    /// Emit the address as a memory-scan pattern: hex byte pairs in host
    /// byte order, space separated, one pair per address byte
    pub fn to_match_pattern(self) -> String {
        let bytes = if cfg!(target_endian = "little") {
            self.0.to_le_bytes()
        } else {
            self.0.to_be_bytes()
        };
        let mut out = String::with_capacity(bytes.len() * 3);
        for (i, b) in bytes.iter().enumerate() {
            if i != 0 {
                out.push(' ');
            }
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

impl fmt::Display for NativePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for NativePointer {
    fn from(address: usize) -> Self {
        NativePointer(address)
    }
}

impl From<NativePointer> for usize {
    fn from(ptr: NativePointer) -> Self {
        ptr.0
    }
}
