//! Architecture-specific CPU context
//!
//! A `CpuContext` is a fixed bag of general-purpose registers plus `pc`
//! and `sp` aliases. The register set is selected at compile time from one
//! declarative name table per architecture; accessors resolve names
//! against that table rather than being generated per register.

use crate::error::{CoreError, CoreResult};
use crate::ptr::NativePointer;

#[cfg(target_arch = "x86_64")]
mod arch {
    /// Register layout for x86-64
    pub const REGISTER_NAMES: &[&str] = &[
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip",
    ];
    pub const PC: usize = 16;
    pub const SP: usize = 4;
}

#[cfg(target_arch = "x86")]
mod arch {
    /// Register layout for x86
    pub const REGISTER_NAMES: &[&str] = &[
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip",
    ];
    pub const PC: usize = 8;
    pub const SP: usize = 4;
}

#[cfg(target_arch = "aarch64")]
mod arch {
    /// Register layout for ARM64
    pub const REGISTER_NAMES: &[&str] = &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "pc",
    ];
    pub const PC: usize = 32;
    pub const SP: usize = 31;
}

#[cfg(target_arch = "arm")]
mod arch {
    /// Register layout for ARM
    pub const REGISTER_NAMES: &[&str] = &[
        "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "lr", "sp", "pc",
    ];
    pub const PC: usize = 10;
    pub const SP: usize = 9;
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm"
)))]
mod arch {
    /// Minimal layout for architectures without a dedicated table
    pub const REGISTER_NAMES: &[&str] = &["sp", "pc"];
    pub const PC: usize = 1;
    pub const SP: usize = 0;
}

/// Number of registers in this architecture's context
pub const REGISTER_COUNT: usize = arch::REGISTER_NAMES.len();

/// Names of the registers in this architecture's context, in storage order
pub fn register_names() -> &'static [&'static str] {
    arch::REGISTER_NAMES
}

/// Whether a context wrapper permits register writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Gets only; sets fail with an "invalid operation" error
    ReadOnly,
    /// Gets and sets
    ReadWrite,
}

/// A snapshot or live view of general-purpose CPU state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuContext {
    regs: [u64; REGISTER_COUNT],
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            regs: [0; REGISTER_COUNT],
        }
    }
}

impl CpuContext {
    /// Create a zeroed context
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(name: &str) -> CoreResult<usize> {
        let resolved = match name {
            "pc" => return Ok(arch::PC),
            "sp" => return Ok(arch::SP),
            other => other,
        };
        arch::REGISTER_NAMES
            .iter()
            .position(|n| *n == resolved)
            .ok_or_else(|| CoreError::InvalidType(format!("unknown register: {}", name)))
    }

    /// Read a register by name
    pub fn register(&self, name: &str) -> CoreResult<NativePointer> {
        Ok(NativePointer::new(self.regs[Self::index_of(name)?] as usize))
    }

    /// Write a register by name
    pub fn set_register(&mut self, name: &str, value: NativePointer) -> CoreResult<()> {
        self.regs[Self::index_of(name)?] = value.address() as u64;
        Ok(())
    }
}

/// A context wrapper enforcing the access policy of its origin
///
/// Contexts handed to scripts from a trap capture are read-only; contexts
/// from an interception point with writeback are read-write.
#[derive(Debug, Clone)]
pub struct CpuContextView {
    context: CpuContext,
    access: Access,
}

impl CpuContextView {
    /// Wrap a context with the given access policy
    pub fn new(context: CpuContext, access: Access) -> Self {
        Self { context, access }
    }

    /// The wrapped context
    pub fn context(&self) -> &CpuContext {
        &self.context
    }

    /// Read a register; the result is always a pointer-typed value
    pub fn get(&self, name: &str) -> CoreResult<NativePointer> {
        self.context.register(name)
    }

    /// Write a register; fails when the wrapper is read-only
    pub fn set(&mut self, name: &str, value: NativePointer) -> CoreResult<()> {
        if self.access == Access::ReadOnly {
            return Err(CoreError::InvalidType("invalid operation".into()));
        }
        self.context.set_register(name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_roundtrip() {
        let mut ctx = CpuContext::new();
        ctx.set_register("sp", NativePointer::new(0x1000)).unwrap();
        assert_eq!(ctx.register("sp").unwrap().address(), 0x1000);
    }

    #[test]
    fn test_pc_sp_aliases() {
        let mut ctx = CpuContext::new();
        ctx.set_register("pc", NativePointer::new(0x4004)).unwrap();
        let canonical = register_names()[super::arch::PC];
        assert_eq!(ctx.register(canonical).unwrap().address(), 0x4004);
    }

    #[test]
    fn test_unknown_register() {
        let ctx = CpuContext::new();
        assert!(matches!(
            ctx.register("zz9"),
            Err(CoreError::InvalidType(_))
        ));
    }

    #[test]
    fn test_readonly_view_rejects_writes() {
        let mut view = CpuContextView::new(CpuContext::new(), Access::ReadOnly);
        let err = view.set("sp", NativePointer::new(4)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidType(_)));

        let mut view = CpuContextView::new(CpuContext::new(), Access::ReadWrite);
        view.set("sp", NativePointer::new(4)).unwrap();
        assert_eq!(view.get("sp").unwrap().address(), 4);
    }
}
