//! Target task memory
//!
//! The mapper only ever writes bytes and applies protections; both
//! operations go through this trait so a mapping can target the local
//! process, a buffer (tests, same-process staging) or a real Mach task
//! port.

use crate::error::{MapperError, MapperResult};

/// Destination address space for a mapping
pub trait TaskMemory {
    /// Copy bytes to `address`
    fn write(&mut self, address: u64, bytes: &[u8]) -> MapperResult<()>;

    /// Apply a VM protection to `[address, address + size)`
    fn protect(&mut self, address: u64, size: u64, protection: u32) -> MapperResult<()>;
}

/// A buffer-backed address range, used for tests and same-process staging
pub struct BufferTask {
    base: u64,
    bytes: Vec<u8>,
    protections: Vec<(u64, u64, u32)>,
}

impl BufferTask {
    /// Create a writable range `[base, base + size)`
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            bytes: vec![0; size],
            protections: Vec::new(),
        }
    }

    /// Base address of the range
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Read back a slice of the range
    pub fn read(&self, address: u64, len: usize) -> &[u8] {
        let offset = (address - self.base) as usize;
        &self.bytes[offset..offset + len]
    }

    /// Read back a little-endian pointer-sized word
    pub fn read_u64(&self, address: u64) -> u64 {
        u64::from_le_bytes(self.read(address, 8).try_into().unwrap())
    }

    /// The protection recorded for the page containing `address`, if any
    pub fn protection_at(&self, address: u64) -> Option<u32> {
        self.protections
            .iter()
            .rev()
            .find(|(start, size, _)| address >= *start && address < *start + *size)
            .map(|(_, _, prot)| *prot)
    }
}

impl TaskMemory for BufferTask {
    fn write(&mut self, address: u64, bytes: &[u8]) -> MapperResult<()> {
        if address < self.base {
            return Err(MapperError::Task(format!(
                "write below task range: {:#x}",
                address
            )));
        }
        let offset = (address - self.base) as usize;
        let end = offset + bytes.len();
        if end > self.bytes.len() {
            return Err(MapperError::Task(format!(
                "write beyond task range: {:#x}+{:#x}",
                address,
                bytes.len()
            )));
        }
        self.bytes[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    fn protect(&mut self, address: u64, size: u64, protection: u32) -> MapperResult<()> {
        self.protections.push((address, size, protection));
        Ok(())
    }
}

/// A Mach task port on macOS
#[cfg(target_os = "macos")]
pub struct MachTask {
    task: mach2::port::mach_port_t,
}

#[cfg(target_os = "macos")]
impl MachTask {
    /// Wrap an already-obtained task port
    pub fn new(task: mach2::port::mach_port_t) -> Self {
        Self { task }
    }

    /// The current process's task port
    pub fn current() -> Self {
        Self {
            task: unsafe { mach2::traps::mach_task_self() },
        }
    }
}

#[cfg(target_os = "macos")]
impl TaskMemory for MachTask {
    fn write(&mut self, address: u64, bytes: &[u8]) -> MapperResult<()> {
        let kr = unsafe {
            mach2::vm::mach_vm_write(
                self.task,
                address,
                bytes.as_ptr() as usize as mach2::vm_types::vm_offset_t,
                bytes.len() as mach2::message::mach_msg_type_number_t,
            )
        };
        if kr != mach2::kern_return::KERN_SUCCESS {
            return Err(MapperError::Task(format!("mach_vm_write failed: {}", kr)));
        }
        Ok(())
    }

    fn protect(&mut self, address: u64, size: u64, protection: u32) -> MapperResult<()> {
        let kr = unsafe {
            mach2::vm::mach_vm_protect(self.task, address, size, 0, protection as i32)
        };
        if kr != mach2::kern_return::KERN_SUCCESS {
            return Err(MapperError::Task(format!("mach_vm_protect failed: {}", kr)));
        }
        Ok(())
    }
}
