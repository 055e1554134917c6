//! In-process image mapper
//!
//! Loads a dynamic library image into a task without the OS loader:
//! dependencies are resolved transitively into a flat, dependency-ordered
//! list of pending images sharing one name table; each image is budgeted,
//! rebased, bound against the graph, given a synthesized runtime area and
//! copied into the task. Images already present in the task participate
//! in symbol resolution as existing mappings.

use crate::emit::{self, ResolverFixup, RuntimePlan};
use crate::error::{MapperError, MapperResult};
use crate::macho::*;
use crate::module::{BindDetails, CpuType, Module};
use crate::task::TaskMemory;
use rustc_hash::FxHashMap;

/// Symbols of the atexit family are satisfied by the runtime-area stub so
/// mapped libraries cannot install process-lifetime handlers.
const ATEXIT_SYMBOLS: &[&str] = &[
    "_atexit",
    "_atexit_b",
    "___cxa_atexit",
    "___cxa_thread_atexit",
    "__tlv_atexit",
];

/// Marker written for atexit references resolved before the runtime area
/// has an address.
const ATEXIT_PENDING_MARKER: u64 = 0xdead_beef;

/// An image already loaded in the target task
pub struct ExistingImage {
    /// Name the image is known under
    pub name: String,
    /// Its load address in the task
    pub base_address: u64,
    /// Its bytes, for export-trie resolution
    pub bytes: Vec<u8>,
}

/// Provides image bytes for the mapper
pub trait ImageSource {
    /// Open the image with the given install name
    fn open(&self, name: &str) -> MapperResult<Vec<u8>>;

    /// Images already present in the target task
    fn existing_images(&self) -> Vec<ExistingImage> {
        Vec::new()
    }
}

/// An entry in the shared name table: an image this mapper brings in, or
/// one already present in the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MappingRef {
    Pending(usize),
    Existing(usize),
}

#[derive(Debug)]
struct SymbolValue {
    address: u64,
    resolver: u64,
}

#[derive(Debug)]
struct MapperNode {
    module: Module,
    dependencies: Vec<MappingRef>,
    runtime_vm_size: u64,
    runtime_file_size: u64,
    vm_size: u64,
    runtime: Vec<u8>,
    runtime_address: u64,
    constructor_offset: usize,
    destructor_offset: usize,
    atexit_stub_offset: usize,
    mapped: bool,
}

impl MapperNode {
    fn shell(module: Module) -> Self {
        Self {
            module,
            dependencies: Vec::new(),
            runtime_vm_size: 0,
            runtime_file_size: 0,
            vm_size: 0,
            runtime: Vec::new(),
            runtime_address: 0,
            constructor_offset: 0,
            destructor_offset: 0,
            atexit_stub_offset: 0,
            mapped: false,
        }
    }
}

/// Maps one image and its not-yet-present dependencies into a task
#[derive(Debug)]
pub struct Mapper {
    cpu: CpuType,
    nodes: Vec<MapperNode>,
    /// Node indices in dependency order (dependencies before dependents);
    /// the last entry is the requested image
    order: Vec<usize>,
    root: usize,
    mappings: FxHashMap<String, MappingRef>,
    existing: Vec<Module>,
}

impl Mapper {
    /// Build the mapper tree for `name`, recursively loading dependencies
    /// that are not already present in the task
    pub fn new(name: &str, cpu: CpuType, source: &dyn ImageSource) -> MapperResult<Mapper> {
        let mut mapper = Mapper {
            cpu,
            nodes: Vec::new(),
            order: Vec::new(),
            root: 0,
            mappings: FxHashMap::default(),
            existing: Vec::new(),
        };

        for image in source.existing_images() {
            let mut module = Module::parse(&image.name, image.bytes, cpu)?;
            module.set_base_address(image.base_address);
            let idx = mapper.existing.len();
            mapper
                .mappings
                .insert(image.name.clone(), MappingRef::Existing(idx));
            if module.name != image.name {
                mapper
                    .mappings
                    .insert(module.name.clone(), MappingRef::Existing(idx));
            }
            mapper.existing.push(module);
        }

        mapper.root = mapper.add_module(name, source)?;

        for idx in 0..mapper.nodes.len() {
            mapper.init_footprint_budget(idx)?;
        }

        log::debug!(
            "mapper for {:?} ready: {} pending image(s), {} existing",
            name,
            mapper.nodes.len(),
            mapper.existing.len()
        );
        Ok(mapper)
    }

    fn add_module(&mut self, name: &str, source: &dyn ImageSource) -> MapperResult<usize> {
        let bytes = source.open(name)?;
        let module = Module::parse(name, bytes, self.cpu)?;

        let idx = self.nodes.len();
        let install_name = module.name.clone();
        // Registered before dependencies resolve so cyclic references
        // find this image instead of loading it twice.
        self.mappings
            .insert(name.to_string(), MappingRef::Pending(idx));
        if install_name != name {
            self.mappings
                .insert(install_name, MappingRef::Pending(idx));
        }
        self.nodes.push(MapperNode::shell(module));

        let dep_names = self.nodes[idx].module.dependencies.clone();
        let mut dependencies = Vec::with_capacity(dep_names.len());
        for dep in &dep_names {
            dependencies.push(self.resolve_dependency(dep, source)?);
        }
        self.nodes[idx].dependencies = dependencies;

        // Finish order puts every dependency ahead of its users.
        self.order.push(idx);
        Ok(idx)
    }

    fn resolve_dependency(
        &mut self,
        name: &str,
        source: &dyn ImageSource,
    ) -> MapperResult<MappingRef> {
        if let Some(mapping) = self.mappings.get(name) {
            return Ok(*mapping);
        }
        let idx = self.add_module(name, source)?;
        Ok(MappingRef::Pending(idx))
    }

    fn init_footprint_budget(&mut self, idx: usize) -> MapperResult<()> {
        let page_size = self.nodes[idx].module.page_size;
        let mut segments_size = 0u64;
        for segment in &self.nodes[idx].module.segments {
            segments_size += segment.vm_size;
            if segment.vm_size % page_size != 0 {
                segments_size += page_size - (segment.vm_size % page_size);
            }
        }

        let footprint = emit::footprint(self.cpu);
        let mut total = footprint.base;
        if idx == self.root {
            total += (self.order.len().max(1) - 1) * footprint.dependency;
        }
        for bind in self.all_binds(idx)? {
            if let Some(value) = self.resolve_bind_target(idx, &bind)? {
                if value.resolver != 0 {
                    total += footprint.resolver;
                }
            }
        }
        total += self.nodes[idx].module.init_pointer_arrays().len() * footprint.init;
        total += self.nodes[idx].module.term_pointer_arrays().len() * footprint.term;

        let node = &mut self.nodes[idx];
        node.runtime_file_size = total as u64;
        node.runtime_vm_size = total as u64;
        if node.runtime_vm_size % page_size != 0 {
            node.runtime_vm_size += page_size - (node.runtime_vm_size % page_size);
        }
        node.vm_size = segments_size + node.runtime_vm_size;
        Ok(())
    }

    fn all_binds(&self, idx: usize) -> MapperResult<Vec<BindDetails>> {
        let module = &self.nodes[idx].module;
        let mut binds = module.binds()?;
        binds.extend(module.lazy_binds()?);
        Ok(binds)
    }

    fn module_of(&self, mapping: MappingRef) -> &Module {
        match mapping {
            MappingRef::Pending(i) => &self.nodes[i].module,
            MappingRef::Existing(i) => &self.existing[i],
        }
    }

    /// Resolve a bind's dependency reference to a mapping
    fn dependency(&self, idx: usize, ordinal: i64) -> MapperResult<MappingRef> {
        match ordinal {
            BIND_SPECIAL_DYLIB_SELF => Ok(MappingRef::Pending(idx)),
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE | BIND_SPECIAL_DYLIB_FLAT_LOOKUP => Err(
                MapperError::Unsupported(format!("special bind ordinal {}", ordinal)),
            ),
            n if n > 0 => self.nodes[idx]
                .dependencies
                .get(n as usize - 1)
                .copied()
                .ok_or_else(|| {
                    MapperError::Malformed(format!("bind ordinal {} out of range", n))
                }),
            other => Err(MapperError::Unsupported(format!(
                "bind ordinal {}",
                other
            ))),
        }
    }

    fn resolve_bind_target(
        &self,
        idx: usize,
        bind: &BindDetails,
    ) -> MapperResult<Option<SymbolValue>> {
        let dependency = self.dependency(idx, bind.library_ordinal)?;
        self.resolve_symbol(dependency, &bind.symbol_name)
    }

    fn resolve_symbol(
        &self,
        mapping: MappingRef,
        symbol: &str,
    ) -> MapperResult<Option<SymbolValue>> {
        if ATEXIT_SYMBOLS.contains(&symbol) {
            let root = &self.nodes[self.root];
            let address = if root.atexit_stub_offset != 0 {
                root.runtime_address + root.atexit_stub_offset as u64
            } else {
                // Resolving before the runtime area exists.
                ATEXIT_PENDING_MARKER
            };
            return Ok(Some(SymbolValue {
                address,
                resolver: 0,
            }));
        }

        let module = self.module_of(mapping);
        let details = match module.resolve_export(symbol) {
            Some(details) => details,
            None => return Ok(None),
        };

        if details.flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let target_name = module.dependency_name(details.reexport_ordinal)?.to_string();
            let target = self.mappings.get(&target_name).copied().ok_or_else(|| {
                MapperError::ImageNotFound(target_name.clone())
            })?;
            return self.resolve_symbol(target, &details.reexport_symbol);
        }

        let value = match details.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK {
            EXPORT_SYMBOL_FLAGS_KIND_REGULAR => {
                if details.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                    SymbolValue {
                        address: module.base_address + details.stub,
                        resolver: module.base_address + details.resolver,
                    }
                } else {
                    SymbolValue {
                        address: module.base_address + details.offset,
                        resolver: 0,
                    }
                }
            }
            EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL => SymbolValue {
                address: module.base_address + details.offset,
                resolver: 0,
            },
            EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => SymbolValue {
                address: details.offset,
                resolver: 0,
            },
            kind => {
                return Err(MapperError::Unsupported(format!(
                    "export kind {:#x}",
                    kind
                )))
            }
        };
        Ok(Some(value))
    }

    /// Total VM footprint of every image this mapper will place
    pub fn size(&self) -> u64 {
        self.nodes.iter().map(|n| n.vm_size).sum()
    }

    /// Map everything into the task at ascending addresses from
    /// `base_address`, dependencies first
    pub fn map(&mut self, base_address: u64, task: &mut dyn TaskMemory) -> MapperResult<()> {
        if self.nodes[self.root].mapped {
            return Err(MapperError::Unsupported("image is already mapped".into()));
        }

        let order = self.order.clone();
        let mut base = base_address;
        for idx in order {
            self.map_node(idx, base, task)?;
            base += self.nodes[idx].vm_size;
        }
        Ok(())
    }

    fn map_node(
        &mut self,
        idx: usize,
        base: u64,
        task: &mut dyn TaskMemory,
    ) -> MapperResult<()> {
        {
            let node = &mut self.nodes[idx];
            node.module.set_base_address(base);
            node.runtime_address = base + node.vm_size - node.runtime_vm_size;
        }

        let plan = self.build_runtime_plan(idx)?;
        let blob = emit::emit_runtime(self.cpu, &plan);
        debug_assert!(blob.code.len() <= self.nodes[idx].runtime_file_size as usize);
        {
            let node = &mut self.nodes[idx];
            node.runtime = blob.code;
            node.constructor_offset = blob.constructor_offset;
            node.destructor_offset = blob.destructor_offset;
            node.atexit_stub_offset = blob.atexit_stub_offset;
        }

        self.apply_rebases(idx)?;
        self.apply_binds(idx)?;

        let node = &self.nodes[idx];
        let module = &node.module;
        let preferred = module.preferred_address;
        for segment in &module.segments {
            let segment_address = base + segment.vm_address - preferred;
            let start = segment.file_offset as usize;
            let end = start + segment.file_size as usize;
            task.write(segment_address, &module.data()[start..end])?;
            task.protect(segment_address, segment.vm_size, segment.protection)?;
        }

        let node = &self.nodes[idx];
        task.write(node.runtime_address, &node.runtime)?;
        task.protect(
            node.runtime_address,
            node.runtime_vm_size,
            VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY | VM_PROT_EXECUTE,
        )?;

        self.nodes[idx].mapped = true;
        log::debug!(
            "mapped {:?} at {:#x} (runtime at {:#x})",
            self.nodes[idx].module.name,
            base,
            self.nodes[idx].runtime_address
        );
        Ok(())
    }

    fn build_runtime_plan(&self, idx: usize) -> MapperResult<RuntimePlan> {
        let mut plan = RuntimePlan::default();
        let node = &self.nodes[idx];
        let module = &node.module;
        let slide = module.slide();

        if idx == self.root {
            for child in self.order.iter().filter(|i| **i != self.root) {
                let child = &self.nodes[*child];
                plan.child_constructors
                    .push(child.runtime_address + child.constructor_offset as u64);
                plan.child_destructors
                    .push(child.runtime_address + child.destructor_offset as u64);
            }
        }

        for bind in self.all_binds(idx)? {
            if let Some(value) = self.resolve_bind_target(idx, &bind)? {
                if value.resolver != 0 {
                    let segment = &module.segments[bind.segment_index];
                    plan.resolver_fixups.push(ResolverFixup {
                        resolver: value.resolver,
                        addend: bind.addend as u64,
                        entry: slide.wrapping_add(segment.vm_address + bind.offset),
                    });
                }
            }
        }

        for array in module.init_pointer_arrays() {
            plan.init_arrays
                .push((slide.wrapping_add(array.vm_address), array.count));
        }
        for array in module.term_pointer_arrays() {
            plan.term_arrays
                .push((slide.wrapping_add(array.vm_address), array.count));
        }

        Ok(plan)
    }

    fn apply_rebases(&mut self, idx: usize) -> MapperResult<()> {
        let rebases = self.nodes[idx].module.rebases()?;
        let slide = self.nodes[idx].module.slide();
        for rebase in rebases {
            match rebase.kind {
                REBASE_TYPE_POINTER | REBASE_TYPE_TEXT_ABSOLUTE32 => {
                    let offset = self.nodes[idx]
                        .module
                        .file_offset_of(rebase.segment_index, rebase.offset)?;
                    let data = self.nodes[idx].module.data_mut();
                    let slot: [u8; 8] = data[offset..offset + 8].try_into().unwrap();
                    let value = u64::from_le_bytes(slot).wrapping_add(slide);
                    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
                }
                other => {
                    return Err(MapperError::Unsupported(format!(
                        "rebase type {}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    fn apply_binds(&mut self, idx: usize) -> MapperResult<()> {
        for bind in self.all_binds(idx)? {
            if bind.kind != BIND_TYPE_POINTER {
                return Err(MapperError::Unsupported(format!(
                    "bind type {}",
                    bind.kind
                )));
            }

            let resolved = match self.resolve_bind_target(idx, &bind)? {
                Some(value) => value.address.wrapping_add(bind.addend as u64),
                None => {
                    if bind.symbol_flags & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0 {
                        0
                    } else {
                        return Err(MapperError::SymbolNotFound(bind.symbol_name.clone()));
                    }
                }
            };

            let offset = self.nodes[idx]
                .module
                .file_offset_of(bind.segment_index, bind.offset)?;
            let data = self.nodes[idx].module.data_mut();
            data[offset..offset + 8].copy_from_slice(&resolved.to_le_bytes());
        }
        Ok(())
    }

    /// Address of the mapped image's synthesized constructor
    pub fn constructor(&self) -> MapperResult<u64> {
        let root = &self.nodes[self.root];
        if !root.mapped {
            return Err(MapperError::Unsupported("image is not mapped yet".into()));
        }
        Ok(root.runtime_address + root.constructor_offset as u64)
    }

    /// Address of the mapped image's synthesized destructor
    pub fn destructor(&self) -> MapperResult<u64> {
        let root = &self.nodes[self.root];
        if !root.mapped {
            return Err(MapperError::Unsupported("image is not mapped yet".into()));
        }
        Ok(root.runtime_address + root.destructor_offset as u64)
    }

    /// Resolve an unmangled symbol in the mapped image
    ///
    /// Returns `None` for unknown symbols and for symbols whose
    /// resolution carries a resolver (their pre-resolver stub must not
    /// leak).
    pub fn resolve(&self, symbol: &str) -> MapperResult<Option<u64>> {
        if !self.nodes[self.root].mapped {
            return Err(MapperError::Unsupported("image is not mapped yet".into()));
        }
        let mangled = format!("_{}", symbol);
        match self.resolve_symbol(MappingRef::Pending(self.root), &mangled)? {
            Some(value) if value.resolver == 0 => Ok(Some(value.address)),
            _ => Ok(None),
        }
    }

    /// The parsed root module
    pub fn module(&self) -> &Module {
        &self.nodes[self.root].module
    }

    /// Runtime-area address and size of the root image, once mapped
    pub fn runtime_area(&self) -> (u64, u64) {
        let root = &self.nodes[self.root];
        (root.runtime_address, root.runtime_vm_size)
    }

    /// Load addresses of every pending image, in map order
    pub fn image_bases(&self) -> Vec<(String, u64)> {
        self.order
            .iter()
            .map(|idx| {
                let node = &self.nodes[*idx];
                (node.module.name.clone(), node.module.base_address)
            })
            .collect()
    }
}
