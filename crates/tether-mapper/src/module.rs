//! Parsed Mach-O module
//!
//! A `Module` owns an image's bytes plus everything the mapper needs from
//! its load commands: segments, dependency names, init/term pointer
//! arrays, the dyld-info streams (decoded on demand into typed detail
//! records) and the export trie.

use crate::error::{MapperError, MapperResult};
use crate::macho::*;

/// Supported instruction sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    /// x86-64
    X86_64,
    /// ARM64
    Arm64,
}

impl CpuType {
    /// VM page size for this architecture
    pub fn page_size(self) -> u64 {
        match self {
            CpuType::X86_64 => 4096,
            CpuType::Arm64 => 16384,
        }
    }

    fn matches_raw(self, raw: i32) -> bool {
        match self {
            CpuType::X86_64 => raw == CPU_TYPE_X86_64,
            CpuType::Arm64 => raw == CPU_TYPE_ARM64,
        }
    }
}

/// A load segment
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment name (`__TEXT`, `__DATA`, ...)
    pub name: String,
    /// Preferred VM address
    pub vm_address: u64,
    /// VM size
    pub vm_size: u64,
    /// Offset of the segment's bytes in the file
    pub file_offset: u64,
    /// Number of bytes backed by the file
    pub file_size: u64,
    /// Initial VM protection
    pub protection: u32,
}

/// A contiguous array of init or term function pointers
#[derive(Debug, Clone, Copy)]
pub struct PointerArray {
    /// Preferred VM address of the first slot
    pub vm_address: u64,
    /// Number of pointer slots
    pub count: u64,
}

/// One decoded rebase entry
#[derive(Debug, Clone, Copy)]
pub struct RebaseDetails {
    /// Rebase type (`REBASE_TYPE_*`)
    pub kind: u8,
    /// Index into the module's segment list
    pub segment_index: usize,
    /// Byte offset within the segment
    pub offset: u64,
}

/// One decoded bind entry
#[derive(Debug, Clone)]
pub struct BindDetails {
    /// Bind type (`BIND_TYPE_*`)
    pub kind: u8,
    /// Index into the module's segment list
    pub segment_index: usize,
    /// Byte offset within the segment
    pub offset: u64,
    /// Dependency ordinal (1-based; `BIND_SPECIAL_DYLIB_*` otherwise)
    pub library_ordinal: i64,
    /// Mangled symbol name
    pub symbol_name: String,
    /// `BIND_SYMBOL_FLAGS_*`
    pub symbol_flags: u8,
    /// Value added to the resolved address
    pub addend: i64,
}

/// A symbol's resolution as found in the export trie
#[derive(Debug, Clone)]
pub struct ExportDetails {
    /// `EXPORT_SYMBOL_FLAGS_*`
    pub flags: u64,
    /// Image-relative offset of the symbol (or absolute value)
    pub offset: u64,
    /// Image-relative stub offset when `STUB_AND_RESOLVER` is set
    pub stub: u64,
    /// Image-relative resolver offset when `STUB_AND_RESOLVER` is set
    pub resolver: u64,
    /// Dependency ordinal of the re-export target
    pub reexport_ordinal: u64,
    /// Name of the symbol in the re-export target
    pub reexport_symbol: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct DyldInfo {
    rebase_off: u32,
    rebase_size: u32,
    bind_off: u32,
    bind_size: u32,
    lazy_bind_off: u32,
    lazy_bind_size: u32,
    export_off: u32,
    export_size: u32,
}

/// A parsed 64-bit Mach-O image
#[derive(Debug)]
pub struct Module {
    /// Install name (from `LC_ID_DYLIB`) or the name it was opened under
    pub name: String,
    /// Instruction set of the image
    pub cpu: CpuType,
    /// Pointer width in bytes
    pub pointer_size: usize,
    /// VM page size
    pub page_size: u64,
    /// Load address; zero until assigned by the mapper
    pub base_address: u64,
    /// Preferred address of the first segment
    pub preferred_address: u64,
    /// Load segments in file order
    pub segments: Vec<Segment>,
    /// Install names of direct dependencies, in load-command order
    pub dependencies: Vec<String>,
    init_arrays: Vec<PointerArray>,
    term_arrays: Vec<PointerArray>,
    info: DyldInfo,
    data: Vec<u8>,
}

impl Module {
    /// Parse an image for the given instruction set
    pub fn parse(name: &str, data: Vec<u8>, cpu: CpuType) -> MapperResult<Module> {
        let mut r = Reader::at(&data, 0);
        let magic = r.u32()?;
        if magic != MH_MAGIC_64 {
            return Err(MapperError::Unsupported(format!(
                "not a 64-bit Mach-O image (magic {:#x})",
                magic
            )));
        }
        let cputype = r.i32()?;
        if !cpu.matches_raw(cputype) {
            return Err(MapperError::Malformed(format!(
                "cpu type mismatch: image has {:#x}",
                cputype
            )));
        }
        let _cpusubtype = r.i32()?;
        let _filetype = r.u32()?;
        let ncmds = r.u32()?;
        let _sizeofcmds = r.u32()?;
        let _flags = r.u32()?;
        let _reserved = r.u32()?;

        let mut install_name = name.to_string();
        let mut segments = Vec::new();
        let mut dependencies = Vec::new();
        let mut init_arrays = Vec::new();
        let mut term_arrays = Vec::new();
        let mut info = DyldInfo::default();

        for _ in 0..ncmds {
            let cmd_start = r.pos();
            let cmd = r.u32()?;
            let cmdsize = r.u32()? as usize;
            if cmdsize < 8 {
                return Err(MapperError::Malformed("load command too small".into()));
            }

            match cmd {
                LC_SEGMENT_64 => {
                    let seg_name = r.name16()?;
                    let vm_address = r.u64()?;
                    let vm_size = r.u64()?;
                    let file_offset = r.u64()?;
                    let file_size = r.u64()?;
                    let _maxprot = r.i32()?;
                    let initprot = r.i32()?;
                    let nsects = r.u32()?;
                    let _seg_flags = r.u32()?;

                    for _ in 0..nsects {
                        let _sectname = r.name16()?;
                        let _segname = r.name16()?;
                        let addr = r.u64()?;
                        let size = r.u64()?;
                        let _offset = r.u32()?;
                        let _align = r.u32()?;
                        let _reloff = r.u32()?;
                        let _nreloc = r.u32()?;
                        let flags = r.u32()?;
                        let _reserved1 = r.u32()?;
                        let _reserved2 = r.u32()?;
                        let _reserved3 = r.u32()?;

                        match flags & SECTION_TYPE_MASK {
                            S_MOD_INIT_FUNC_POINTERS => init_arrays.push(PointerArray {
                                vm_address: addr,
                                count: size / 8,
                            }),
                            S_MOD_TERM_FUNC_POINTERS => term_arrays.push(PointerArray {
                                vm_address: addr,
                                count: size / 8,
                            }),
                            _ => {}
                        }
                    }

                    segments.push(Segment {
                        name: seg_name,
                        vm_address,
                        vm_size,
                        file_offset,
                        file_size,
                        protection: initprot as u32,
                    });
                }
                LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                    let name_offset = r.u32()? as usize;
                    let mut name_reader = Reader::at(&data, cmd_start + name_offset);
                    dependencies.push(name_reader.cstr()?);
                }
                LC_ID_DYLIB => {
                    let name_offset = r.u32()? as usize;
                    let mut name_reader = Reader::at(&data, cmd_start + name_offset);
                    install_name = name_reader.cstr()?;
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    info.rebase_off = r.u32()?;
                    info.rebase_size = r.u32()?;
                    info.bind_off = r.u32()?;
                    info.bind_size = r.u32()?;
                    let _weak_bind_off = r.u32()?;
                    let _weak_bind_size = r.u32()?;
                    info.lazy_bind_off = r.u32()?;
                    info.lazy_bind_size = r.u32()?;
                    info.export_off = r.u32()?;
                    info.export_size = r.u32()?;
                }
                _ => {}
            }

            r.seek(cmd_start + cmdsize);
        }

        let preferred_address = segments.first().map(|s| s.vm_address).unwrap_or(0);

        Ok(Module {
            name: install_name,
            cpu,
            pointer_size: 8,
            page_size: cpu.page_size(),
            base_address: 0,
            preferred_address,
            segments,
            dependencies,
            init_arrays,
            term_arrays,
            info,
            data,
        })
    }

    /// Assign the load address
    pub fn set_base_address(&mut self, base: u64) {
        self.base_address = base;
    }

    /// Difference between the load address and the preferred address
    pub fn slide(&self) -> u64 {
        self.base_address.wrapping_sub(self.preferred_address)
    }

    /// Image bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable image bytes, for applying rebases and binds before copying
    /// into the task
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Init-pointer arrays at their preferred addresses
    pub fn init_pointer_arrays(&self) -> &[PointerArray] {
        &self.init_arrays
    }

    /// Term-pointer arrays at their preferred addresses
    pub fn term_pointer_arrays(&self) -> &[PointerArray] {
        &self.term_arrays
    }

    /// Install name of the dependency with the given 1-based ordinal
    pub fn dependency_name(&self, ordinal: u64) -> MapperResult<&str> {
        self.dependencies
            .get(ordinal.wrapping_sub(1) as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| {
                MapperError::Malformed(format!("dependency ordinal {} out of range", ordinal))
            })
    }

    /// File offset of a byte addressed by segment index + offset
    pub fn file_offset_of(&self, segment_index: usize, offset: u64) -> MapperResult<usize> {
        let segment = self
            .segments
            .get(segment_index)
            .ok_or_else(|| MapperError::Malformed("segment index out of range".into()))?;
        if offset >= segment.file_size {
            return Err(MapperError::Malformed(
                "segment offset beyond file-backed bytes".into(),
            ));
        }
        Ok((segment.file_offset + offset) as usize)
    }

    /// Decode the rebase opcode stream
    pub fn rebases(&self) -> MapperResult<Vec<RebaseDetails>> {
        let mut out = Vec::new();
        if self.info.rebase_size == 0 {
            return Ok(out);
        }
        let start = self.info.rebase_off as usize;
        let end = start + self.info.rebase_size as usize;
        if end > self.data.len() {
            return Err(MapperError::Malformed("rebase info out of bounds".into()));
        }
        let mut r = Reader::at(&self.data[..end], start);

        let mut kind = 0u8;
        let mut segment_index = 0usize;
        let mut offset = 0u64;
        while r.has(1) {
            let byte = r.u8()?;
            let opcode = byte & REBASE_OPCODE_MASK;
            let imm = byte & REBASE_IMMEDIATE_MASK;
            match opcode {
                REBASE_OPCODE_DONE => break,
                REBASE_OPCODE_SET_TYPE_IMM => kind = imm,
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    segment_index = imm as usize;
                    offset = r.uleb()?;
                }
                REBASE_OPCODE_ADD_ADDR_ULEB => offset = offset.wrapping_add(r.uleb()?),
                REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                    offset = offset.wrapping_add(imm as u64 * self.pointer_size as u64)
                }
                REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                    for _ in 0..imm {
                        out.push(RebaseDetails {
                            kind,
                            segment_index,
                            offset,
                        });
                        offset += self.pointer_size as u64;
                    }
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                    let count = r.uleb()?;
                    for _ in 0..count {
                        out.push(RebaseDetails {
                            kind,
                            segment_index,
                            offset,
                        });
                        offset += self.pointer_size as u64;
                    }
                }
                REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                    out.push(RebaseDetails {
                        kind,
                        segment_index,
                        offset,
                    });
                    offset = offset.wrapping_add(r.uleb()? + self.pointer_size as u64);
                }
                REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = r.uleb()?;
                    let skip = r.uleb()?;
                    for _ in 0..count {
                        out.push(RebaseDetails {
                            kind,
                            segment_index,
                            offset,
                        });
                        offset = offset.wrapping_add(skip + self.pointer_size as u64);
                    }
                }
                _ => {
                    return Err(MapperError::Malformed(format!(
                        "unknown rebase opcode {:#x}",
                        opcode
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Decode the non-lazy bind opcode stream
    pub fn binds(&self) -> MapperResult<Vec<BindDetails>> {
        self.parse_binds(self.info.bind_off as usize, self.info.bind_size as usize)
    }

    /// Decode the lazy bind opcode stream
    pub fn lazy_binds(&self) -> MapperResult<Vec<BindDetails>> {
        self.parse_binds(
            self.info.lazy_bind_off as usize,
            self.info.lazy_bind_size as usize,
        )
    }

    fn parse_binds(&self, start: usize, size: usize) -> MapperResult<Vec<BindDetails>> {
        let mut out = Vec::new();
        if size == 0 {
            return Ok(out);
        }
        let end = start + size;
        if end > self.data.len() {
            return Err(MapperError::Malformed("bind info out of bounds".into()));
        }
        let mut r = Reader::at(&self.data[..end], start);

        let mut kind = BIND_TYPE_POINTER;
        let mut segment_index = 0usize;
        let mut offset = 0u64;
        let mut library_ordinal = 0i64;
        let mut symbol_name = String::new();
        let mut symbol_flags = 0u8;
        let mut addend = 0i64;

        while r.has(1) {
            let byte = r.u8()?;
            let opcode = byte & BIND_OPCODE_MASK;
            let imm = byte & BIND_IMMEDIATE_MASK;
            match opcode {
                // In the lazy stream DONE only terminates one entry.
                BIND_OPCODE_DONE => continue,
                BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => library_ordinal = imm as i64,
                BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => library_ordinal = r.uleb()? as i64,
                BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                    library_ordinal = if imm == 0 {
                        0
                    } else {
                        // Sign-extend the 4-bit immediate.
                        (imm as i64 & 0x0f) | -16
                    };
                }
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                    symbol_flags = imm;
                    symbol_name = r.cstr()?;
                }
                BIND_OPCODE_SET_TYPE_IMM => kind = imm,
                BIND_OPCODE_SET_ADDEND_SLEB => addend = r.sleb()?,
                BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                    segment_index = imm as usize;
                    offset = r.uleb()?;
                }
                BIND_OPCODE_ADD_ADDR_ULEB => offset = offset.wrapping_add(r.uleb()?),
                BIND_OPCODE_DO_BIND => {
                    out.push(BindDetails {
                        kind,
                        segment_index,
                        offset,
                        library_ordinal,
                        symbol_name: symbol_name.clone(),
                        symbol_flags,
                        addend,
                    });
                    offset += self.pointer_size as u64;
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                    out.push(BindDetails {
                        kind,
                        segment_index,
                        offset,
                        library_ordinal,
                        symbol_name: symbol_name.clone(),
                        symbol_flags,
                        addend,
                    });
                    offset = offset.wrapping_add(r.uleb()? + self.pointer_size as u64);
                }
                BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                    out.push(BindDetails {
                        kind,
                        segment_index,
                        offset,
                        library_ordinal,
                        symbol_name: symbol_name.clone(),
                        symbol_flags,
                        addend,
                    });
                    offset = offset
                        .wrapping_add((imm as u64 + 1) * self.pointer_size as u64);
                }
                BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                    let count = r.uleb()?;
                    let skip = r.uleb()?;
                    for _ in 0..count {
                        out.push(BindDetails {
                            kind,
                            segment_index,
                            offset,
                            library_ordinal,
                            symbol_name: symbol_name.clone(),
                            symbol_flags,
                            addend,
                        });
                        offset = offset.wrapping_add(skip + self.pointer_size as u64);
                    }
                }
                _ => {
                    return Err(MapperError::Malformed(format!(
                        "unknown bind opcode {:#x}",
                        opcode
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Look up a mangled symbol in the export trie
    pub fn resolve_export(&self, symbol: &str) -> Option<ExportDetails> {
        if self.info.export_size == 0 {
            return None;
        }
        let start = self.info.export_off as usize;
        let end = start + self.info.export_size as usize;
        if end > self.data.len() {
            return None;
        }
        let trie = &self.data[start..end];
        self.walk_trie(trie, 0, symbol.as_bytes())
    }

    fn walk_trie(&self, trie: &[u8], node: usize, remaining: &[u8]) -> Option<ExportDetails> {
        let mut r = Reader::at(trie, node);
        let terminal_size = r.uleb().ok()?;

        if remaining.is_empty() {
            if terminal_size == 0 {
                return None;
            }
            let flags = r.uleb().ok()?;
            let mut details = ExportDetails {
                flags,
                offset: 0,
                stub: 0,
                resolver: 0,
                reexport_ordinal: 0,
                reexport_symbol: String::new(),
            };
            if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
                details.reexport_ordinal = r.uleb().ok()?;
                details.reexport_symbol = r.cstr().ok()?;
            } else {
                details.offset = r.uleb().ok()?;
                if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                    details.stub = details.offset;
                    details.resolver = r.uleb().ok()?;
                }
            }
            return Some(details);
        }

        // Skip the terminal payload to reach the edge list.
        let after_terminal = r.pos() + terminal_size as usize;
        let mut r = Reader::at(trie, after_terminal);
        let child_count = r.u8().ok()?;
        for _ in 0..child_count {
            let label = r.cstr().ok()?;
            let child_offset = r.uleb().ok()? as usize;
            if let Some(rest) = remaining.strip_prefix(label.as_bytes()) {
                return self.walk_trie(trie, child_offset, rest);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_macho() {
        let err = Module::parse("x", vec![0u8; 64], CpuType::X86_64).unwrap_err();
        assert!(matches!(err, MapperError::Unsupported(_)));
    }

    #[test]
    fn test_page_sizes() {
        assert_eq!(CpuType::X86_64.page_size(), 4096);
        assert_eq!(CpuType::Arm64.page_size(), 16384);
    }
}
