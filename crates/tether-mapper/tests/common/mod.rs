//! Synthetic Mach-O image builder for mapper tests
//!
//! Emits a minimal but well-formed 64-bit dylib with a fixed layout:
//! `__TEXT` at preferred 0x0 (file 0x0..0x800), `__DATA` at 0x1000
//! (file 0x800..0xc00) and `__LINKEDIT` at 0x2000 (file 0xc00..0x1000)
//! holding the rebase, bind and export-trie blobs.

#![allow(dead_code)]

use std::collections::HashMap;
use tether_mapper::{CpuType, ExistingImage, ImageSource, MapperError, MapperResult};

pub const TEXT_VM: u64 = 0x0;
pub const DATA_VM: u64 = 0x1000;
pub const SEG_VM_SIZE: u64 = 0x1000;
pub const DATA_FILE_OFF: usize = 0x800;
pub const LINKEDIT_FILE_OFF: usize = 0xc00;
pub const FILE_SIZE: usize = 0x1000;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_DYLIB: u32 = 0x6;
const LC_SEGMENT_64: u32 = 0x19;
const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_DYLD_INFO_ONLY: u32 = 0x8000_0022;
const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9;
const S_MOD_TERM_FUNC_POINTERS: u32 = 0xa;

const VM_PROT_READ: i32 = 1;
const VM_PROT_WRITE: i32 = 2;
const VM_PROT_EXECUTE: i32 = 4;

#[derive(Clone)]
pub enum ExportKind {
    Regular { offset: u64 },
    Resolver { stub: u64, resolver: u64 },
    Reexport { ordinal: u64, name: String },
    Absolute { value: u64 },
}

#[derive(Clone)]
struct BindSpec {
    symbol: String,
    ordinal: i64,
    data_offset: u64,
    addend: i64,
    weak: bool,
}

pub struct ImageBuilder {
    cpu: CpuType,
    install_name: String,
    deps: Vec<String>,
    exports: Vec<(String, ExportKind)>,
    binds: Vec<BindSpec>,
    rebases: Vec<u64>,
    init_sections: Vec<(u64, u64)>,
    term_sections: Vec<(u64, u64)>,
    data: Vec<u8>,
}

impl ImageBuilder {
    pub fn new(install_name: &str, cpu: CpuType) -> Self {
        Self {
            cpu,
            install_name: install_name.to_string(),
            deps: Vec::new(),
            exports: Vec::new(),
            binds: Vec::new(),
            rebases: Vec::new(),
            init_sections: Vec::new(),
            term_sections: Vec::new(),
            data: vec![0; 0x400],
        }
    }

    pub fn dependency(mut self, name: &str) -> Self {
        self.deps.push(name.to_string());
        self
    }

    pub fn export(mut self, name: &str, kind: ExportKind) -> Self {
        self.exports.push((name.to_string(), kind));
        self
    }

    pub fn bind(mut self, symbol: &str, ordinal: i64, data_offset: u64, addend: i64) -> Self {
        self.binds.push(BindSpec {
            symbol: symbol.to_string(),
            ordinal,
            data_offset,
            addend,
            weak: false,
        });
        self
    }

    pub fn weak_bind(mut self, symbol: &str, ordinal: i64, data_offset: u64) -> Self {
        self.binds.push(BindSpec {
            symbol: symbol.to_string(),
            ordinal,
            data_offset,
            addend: 0,
            weak: true,
        });
        self
    }

    pub fn rebase(mut self, data_offset: u64) -> Self {
        self.rebases.push(data_offset);
        self
    }

    /// Store a pointer-sized value in the `__DATA` payload
    pub fn data_u64(mut self, data_offset: u64, value: u64) -> Self {
        let off = data_offset as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn init_pointers(mut self, data_offset: u64, count: u64) -> Self {
        self.init_sections.push((data_offset, count));
        self
    }

    pub fn term_pointers(mut self, data_offset: u64, count: u64) -> Self {
        self.term_sections.push((data_offset, count));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let rebase_blob = self.build_rebase_blob();
        let bind_blob = self.build_bind_blob();
        let export_blob = self.build_export_blob();
        assert!(rebase_blob.len() <= 0x80, "rebase blob too large");
        assert!(bind_blob.len() <= 0x80, "bind blob too large");
        assert!(export_blob.len() <= 0x100, "export trie too large");

        let rebase_off = LINKEDIT_FILE_OFF;
        let bind_off = LINKEDIT_FILE_OFF + 0x80;
        let export_off = LINKEDIT_FILE_OFF + 0x100;

        let mut cmds: Vec<Vec<u8>> = Vec::new();
        cmds.push(segment_command(
            "__TEXT",
            TEXT_VM,
            SEG_VM_SIZE,
            0,
            DATA_FILE_OFF as u64,
            VM_PROT_READ | VM_PROT_EXECUTE,
            &[],
        ));

        let mut data_sections = Vec::new();
        for (off, count) in &self.init_sections {
            data_sections.push(section(
                "__mod_init_func",
                "__DATA",
                DATA_VM + off,
                count * 8,
                S_MOD_INIT_FUNC_POINTERS,
            ));
        }
        for (off, count) in &self.term_sections {
            data_sections.push(section(
                "__mod_term_func",
                "__DATA",
                DATA_VM + off,
                count * 8,
                S_MOD_TERM_FUNC_POINTERS,
            ));
        }
        cmds.push(segment_command(
            "__DATA",
            DATA_VM,
            SEG_VM_SIZE,
            DATA_FILE_OFF as u64,
            0x400,
            VM_PROT_READ | VM_PROT_WRITE,
            &data_sections,
        ));
        cmds.push(segment_command(
            "__LINKEDIT",
            0x2000,
            SEG_VM_SIZE,
            LINKEDIT_FILE_OFF as u64,
            0x400,
            VM_PROT_READ,
            &[],
        ));

        cmds.push(dylib_command(LC_ID_DYLIB, &self.install_name));
        for dep in &self.deps {
            cmds.push(dylib_command(LC_LOAD_DYLIB, dep));
        }

        let mut dyld_info = Vec::new();
        put_u32(&mut dyld_info, LC_DYLD_INFO_ONLY);
        put_u32(&mut dyld_info, 48);
        put_u32(&mut dyld_info, rebase_off as u32);
        put_u32(&mut dyld_info, rebase_blob.len() as u32);
        put_u32(&mut dyld_info, bind_off as u32);
        put_u32(&mut dyld_info, bind_blob.len() as u32);
        put_u32(&mut dyld_info, 0); // weak_bind_off
        put_u32(&mut dyld_info, 0); // weak_bind_size
        put_u32(&mut dyld_info, 0); // lazy_bind_off
        put_u32(&mut dyld_info, 0); // lazy_bind_size
        put_u32(&mut dyld_info, export_off as u32);
        put_u32(&mut dyld_info, export_blob.len() as u32);
        cmds.push(dyld_info);

        let sizeofcmds: usize = cmds.iter().map(|c| c.len()).sum();

        let mut image = Vec::with_capacity(FILE_SIZE);
        put_u32(&mut image, MH_MAGIC_64);
        put_i32(
            &mut image,
            match self.cpu {
                CpuType::X86_64 => 0x0100_0007,
                CpuType::Arm64 => 0x0100_000c,
            },
        );
        put_i32(&mut image, 3); // cpusubtype
        put_u32(&mut image, MH_DYLIB);
        put_u32(&mut image, cmds.len() as u32);
        put_u32(&mut image, sizeofcmds as u32);
        put_u32(&mut image, 0); // flags
        put_u32(&mut image, 0); // reserved
        for cmd in cmds {
            image.extend_from_slice(&cmd);
        }
        assert!(image.len() <= DATA_FILE_OFF, "load commands overflow __TEXT");

        image.resize(DATA_FILE_OFF, 0);
        image.extend_from_slice(&self.data);
        image.resize(LINKEDIT_FILE_OFF, 0);

        let mut linkedit = vec![0u8; 0x400];
        linkedit[..rebase_blob.len()].copy_from_slice(&rebase_blob);
        linkedit[0x80..0x80 + bind_blob.len()].copy_from_slice(&bind_blob);
        linkedit[0x100..0x100 + export_blob.len()].copy_from_slice(&export_blob);
        image.extend_from_slice(&linkedit);

        assert_eq!(image.len(), FILE_SIZE);
        image
    }

    fn build_rebase_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        if self.rebases.is_empty() {
            return blob;
        }
        blob.push(0x11); // SET_TYPE_IMM | POINTER
        for off in &self.rebases {
            blob.push(0x21); // SET_SEGMENT_AND_OFFSET_ULEB, segment 1
            put_uleb(&mut blob, *off);
            blob.push(0x51); // DO_REBASE_IMM_TIMES, 1
        }
        blob.push(0x00); // DONE
        blob
    }

    fn build_bind_blob(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        if self.binds.is_empty() {
            return blob;
        }
        for bind in &self.binds {
            match bind.ordinal {
                n if n > 0 => {
                    assert!(n < 16, "ordinal too large for the builder");
                    blob.push(0x10 | n as u8); // SET_DYLIB_ORDINAL_IMM
                }
                n => {
                    // SET_DYLIB_SPECIAL_IMM with a sign-extended immediate
                    blob.push(0x30 | (n as u8 & 0x0f));
                }
            }
            let flags = if bind.weak { 0x1 } else { 0x0 };
            blob.push(0x40 | flags); // SET_SYMBOL_TRAILING_FLAGS_IMM
            blob.extend_from_slice(bind.symbol.as_bytes());
            blob.push(0);
            blob.push(0x51); // SET_TYPE_IMM | POINTER
            if bind.addend != 0 {
                blob.push(0x60); // SET_ADDEND_SLEB
                put_sleb(&mut blob, bind.addend);
            }
            blob.push(0x71); // SET_SEGMENT_AND_OFFSET_ULEB, segment 1
            put_uleb(&mut blob, bind.data_offset);
            blob.push(0x90); // DO_BIND
        }
        blob.push(0x00); // DONE
        blob
    }

    fn build_export_blob(&self) -> Vec<u8> {
        if self.exports.is_empty() {
            return Vec::new();
        }

        let infos: Vec<Vec<u8>> = self
            .exports
            .iter()
            .map(|(_, kind)| {
                let mut info = Vec::new();
                match kind {
                    ExportKind::Regular { offset } => {
                        put_uleb(&mut info, 0x00);
                        put_uleb(&mut info, *offset);
                    }
                    ExportKind::Resolver { stub, resolver } => {
                        put_uleb(&mut info, 0x10);
                        put_uleb(&mut info, *stub);
                        put_uleb(&mut info, *resolver);
                    }
                    ExportKind::Reexport { ordinal, name } => {
                        put_uleb(&mut info, 0x08);
                        put_uleb(&mut info, *ordinal);
                        info.extend_from_slice(name.as_bytes());
                        info.push(0);
                    }
                    ExportKind::Absolute { value } => {
                        put_uleb(&mut info, 0x02);
                        put_uleb(&mut info, *value);
                    }
                }
                info
            })
            .collect();

        // Flat trie: the root carries one full-name edge per symbol.
        let header_size: usize = 2
            + self
                .exports
                .iter()
                .map(|(name, _)| name.len() + 1 + 1)
                .sum::<usize>();

        let mut blob = Vec::new();
        blob.push(0x00); // root is not terminal
        blob.push(self.exports.len() as u8);
        let mut child_offset = header_size;
        for ((name, _), info) in self.exports.iter().zip(infos.iter()) {
            blob.extend_from_slice(name.as_bytes());
            blob.push(0);
            assert!(child_offset < 0x80, "trie node offset needs wide uleb");
            blob.push(child_offset as u8);
            child_offset += 1 + info.len() + 1;
        }
        for info in &infos {
            assert!(info.len() < 0x80);
            blob.push(info.len() as u8);
            blob.extend_from_slice(info);
            blob.push(0); // no children
        }
        blob
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_uleb(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn put_sleb(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn section(sectname: &str, segname: &str, addr: u64, size: u64, flags: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(80);
    out.extend_from_slice(&name16(sectname));
    out.extend_from_slice(&name16(segname));
    put_u64(&mut out, addr);
    put_u64(&mut out, size);
    put_u32(&mut out, 0); // offset
    put_u32(&mut out, 3); // align
    put_u32(&mut out, 0); // reloff
    put_u32(&mut out, 0); // nreloc
    put_u32(&mut out, flags);
    put_u32(&mut out, 0);
    put_u32(&mut out, 0);
    put_u32(&mut out, 0);
    out
}

fn segment_command(
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    prot: i32,
    sections: &[Vec<u8>],
) -> Vec<u8> {
    let cmdsize = 72 + sections.iter().map(|s| s.len()).sum::<usize>();
    let mut out = Vec::with_capacity(cmdsize);
    put_u32(&mut out, LC_SEGMENT_64);
    put_u32(&mut out, cmdsize as u32);
    out.extend_from_slice(&name16(name));
    put_u64(&mut out, vmaddr);
    put_u64(&mut out, vmsize);
    put_u64(&mut out, fileoff);
    put_u64(&mut out, filesize);
    put_i32(&mut out, prot); // maxprot
    put_i32(&mut out, prot); // initprot
    put_u32(&mut out, sections.len() as u32);
    put_u32(&mut out, 0); // flags
    for s in sections {
        out.extend_from_slice(s);
    }
    out
}

fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
    let name_len_padded = (name.len() + 1 + 7) & !7;
    let cmdsize = 24 + name_len_padded;
    let mut out = Vec::with_capacity(cmdsize);
    put_u32(&mut out, cmd);
    put_u32(&mut out, cmdsize as u32);
    put_u32(&mut out, 24); // name offset
    put_u32(&mut out, 0); // timestamp
    put_u32(&mut out, 0); // current_version
    put_u32(&mut out, 0); // compatibility_version
    out.extend_from_slice(name.as_bytes());
    out.resize(cmdsize, 0);
    out
}

/// Image source backed by a name map, plus optional existing images
#[derive(Default)]
pub struct TestSource {
    images: HashMap<String, Vec<u8>>,
    existing: Vec<(String, u64, Vec<u8>)>,
}

impl TestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, image: Vec<u8>) -> Self {
        self.images.insert(name.to_string(), image);
        self
    }

    pub fn with_existing(mut self, name: &str, base: u64, image: Vec<u8>) -> Self {
        self.existing.push((name.to_string(), base, image));
        self
    }
}

impl ImageSource for TestSource {
    fn open(&self, name: &str) -> MapperResult<Vec<u8>> {
        self.images
            .get(name)
            .cloned()
            .ok_or_else(|| MapperError::ImageNotFound(name.to_string()))
    }

    fn existing_images(&self) -> Vec<ExistingImage> {
        self.existing
            .iter()
            .map(|(name, base, bytes)| ExistingImage {
                name: name.clone(),
                base_address: *base,
                bytes: bytes.clone(),
            })
            .collect()
    }
}
