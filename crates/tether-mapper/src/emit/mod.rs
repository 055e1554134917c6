//! Runtime-area code emission
//!
//! Every mapped image gets a small synthesized blob at the top of its
//! allocation: a constructor that calls direct-dependency constructors,
//! runs resolver fixups and walks init-pointer arrays; a destructor that
//! mirrors it in reverse; and an atexit stub that returns zero. Emission
//! is selected by the image's cpu type, not the host's.

pub mod arm64;
pub mod x86;

use crate::module::CpuType;

/// Per-entry byte budgets for the emitted runtime
///
/// Sized to this module's own encodings; the total budget is
/// `base + children * dependency + resolvers * resolver + init_arrays *
/// init + term_arrays * term`.
#[derive(Debug, Clone, Copy)]
pub struct Footprint {
    /// Prologues, epilogues and the atexit stub
    pub base: usize,
    /// One direct dependency (constructor + destructor calls)
    pub dependency: usize,
    /// One bind whose resolution carries a resolver
    pub resolver: usize,
    /// One init-pointer array loop
    pub init: usize,
    /// One term-pointer array loop
    pub term: usize,
}

/// Byte budgets for the given instruction set
pub fn footprint(cpu: CpuType) -> Footprint {
    match cpu {
        CpuType::X86_64 => Footprint {
            base: 32,
            dependency: 24,
            resolver: 40,
            init: 36,
            term: 36,
        },
        CpuType::Arm64 => Footprint {
            base: 96,
            dependency: 40,
            resolver: 64,
            init: 56,
            term: 56,
        },
    }
}

/// A bind entry whose symbol resolves through a resolver function
#[derive(Debug, Clone, Copy)]
pub struct ResolverFixup {
    /// Address of the resolver to call
    pub resolver: u64,
    /// Value added to the resolver's result
    pub addend: u64,
    /// Address of the pointer slot receiving the result
    pub entry: u64,
}

/// Everything the emitted runtime must do for one image
#[derive(Debug, Default)]
pub struct RuntimePlan {
    /// Constructor addresses of direct dependencies, in dependency order
    pub child_constructors: Vec<u64>,
    /// Destructor addresses of direct dependencies, in dependency order
    /// (called in reverse)
    pub child_destructors: Vec<u64>,
    /// Resolver-carrying binds to fix up before initializers run
    pub resolver_fixups: Vec<ResolverFixup>,
    /// Init-pointer arrays as (address, count), already slid
    pub init_arrays: Vec<(u64, u64)>,
    /// Term-pointer arrays as (address, count), already slid
    pub term_arrays: Vec<(u64, u64)>,
}

/// An emitted runtime blob with its entry offsets
#[derive(Debug)]
pub struct RuntimeBlob {
    /// The code bytes
    pub code: Vec<u8>,
    /// Offset of the constructor entry
    pub constructor_offset: usize,
    /// Offset of the destructor entry
    pub destructor_offset: usize,
    /// Offset of the atexit stub
    pub atexit_stub_offset: usize,
}

/// Emit the runtime for one image
pub fn emit_runtime(cpu: CpuType, plan: &RuntimePlan) -> RuntimeBlob {
    match cpu {
        CpuType::X86_64 => emit_x86_runtime(plan),
        CpuType::Arm64 => emit_arm64_runtime(plan),
    }
}

fn emit_x86_runtime(plan: &RuntimePlan) -> RuntimeBlob {
    use x86::{Reg, X86Writer};

    let mut w = X86Writer::new();

    let constructor_offset = w.offset();
    w.put_push_reg(Reg::Rbp);
    w.put_push_reg(Reg::Rbx);
    w.put_sub_reg_imm8(Reg::Rsp, 8);

    for ctor in &plan.child_constructors {
        w.put_mov_reg_u64(Reg::Rcx, *ctor);
        w.put_call_reg(Reg::Rcx);
    }
    for fixup in &plan.resolver_fixups {
        w.put_mov_reg_u64(Reg::Rcx, fixup.resolver);
        w.put_call_reg(Reg::Rcx);
        w.put_mov_reg_u64(Reg::Rcx, fixup.addend);
        w.put_add_reg_reg(Reg::Rax, Reg::Rcx);
        w.put_mov_reg_u64(Reg::Rcx, fixup.entry);
        w.put_store_reg_at(Reg::Rcx, Reg::Rax);
    }
    for (address, count) in &plan.init_arrays {
        w.put_mov_reg_u64(Reg::Rbp, *address);
        w.put_mov_reg_u64(Reg::Rbx, *count);
        let top = w.offset();
        w.put_load_reg_rbp(Reg::Rax);
        // TODO: pass argc, argv, envp, apple, program vars
        w.put_call_reg(Reg::Rax);
        w.put_add_reg_imm8(Reg::Rbp, 8);
        w.put_dec_reg(Reg::Rbx);
        w.put_jnz_back(top);
    }

    w.put_add_reg_imm8(Reg::Rsp, 8);
    w.put_pop_reg(Reg::Rbx);
    w.put_pop_reg(Reg::Rbp);
    w.put_ret();

    let destructor_offset = w.offset();
    w.put_push_reg(Reg::Rbp);
    w.put_push_reg(Reg::Rbx);
    w.put_sub_reg_imm8(Reg::Rsp, 8);

    for (address, count) in &plan.term_arrays {
        w.put_mov_reg_u64(Reg::Rbp, address + (count - 1) * 8);
        w.put_mov_reg_u64(Reg::Rbx, *count);
        let top = w.offset();
        w.put_load_reg_rbp(Reg::Rax);
        w.put_call_reg(Reg::Rax);
        w.put_sub_reg_imm8(Reg::Rbp, 8);
        w.put_dec_reg(Reg::Rbx);
        w.put_jnz_back(top);
    }
    for dtor in plan.child_destructors.iter().rev() {
        w.put_mov_reg_u64(Reg::Rcx, *dtor);
        w.put_call_reg(Reg::Rcx);
    }

    w.put_add_reg_imm8(Reg::Rsp, 8);
    w.put_pop_reg(Reg::Rbx);
    w.put_pop_reg(Reg::Rbp);
    w.put_ret();

    let atexit_stub_offset = w.offset();
    w.put_xor_reg_reg(Reg::Rax);
    w.put_ret();

    RuntimeBlob {
        code: w.into_code(),
        constructor_offset,
        destructor_offset,
        atexit_stub_offset,
    }
}

fn emit_arm64_runtime(plan: &RuntimePlan) -> RuntimeBlob {
    use arm64::{Arm64Writer, FP, LR, X0, X1, X19, X20, X21, X22};

    let mut w = Arm64Writer::new();

    let constructor_offset = w.offset();
    w.put_push_pair(FP, LR);
    w.put_mov_fp_sp();
    w.put_push_pair(X19, X20);
    w.put_push_pair(X21, X22);

    for ctor in &plan.child_constructors {
        w.put_load_u64(X0, *ctor);
        w.put_blr(X0);
    }
    for fixup in &plan.resolver_fixups {
        w.put_load_u64(X1, fixup.resolver);
        w.put_blr(X1);
        w.put_load_u64(X1, fixup.addend);
        w.put_add_reg(X0, X0, X1);
        w.put_load_u64(X1, fixup.entry);
        w.put_store_reg_reg(X0, X1);
    }
    for (address, count) in &plan.init_arrays {
        w.put_load_u64(X19, *address);
        w.put_load_u64(X20, *count);
        let top = w.offset();
        w.put_load_reg_reg(X0, X19);
        // TODO: pass argc, argv, envp, apple, program vars
        w.put_blr(X0);
        w.put_add_imm(X19, X19, 8);
        w.put_sub_imm(X20, X20, 1);
        w.put_cbnz_back(X20, top);
    }

    w.put_pop_pair(X21, X22);
    w.put_pop_pair(X19, X20);
    w.put_pop_pair(FP, LR);
    w.put_ret();

    let destructor_offset = w.offset();
    w.put_push_pair(FP, LR);
    w.put_mov_fp_sp();
    w.put_push_pair(X19, X20);
    w.put_push_pair(X21, X22);

    for (address, count) in &plan.term_arrays {
        w.put_load_u64(X19, address + (count - 1) * 8);
        w.put_load_u64(X20, *count);
        let top = w.offset();
        w.put_load_reg_reg(X0, X19);
        w.put_blr(X0);
        w.put_sub_imm(X19, X19, 8);
        w.put_sub_imm(X20, X20, 1);
        w.put_cbnz_back(X20, top);
    }
    for dtor in plan.child_destructors.iter().rev() {
        w.put_load_u64(X0, *dtor);
        w.put_blr(X0);
    }

    w.put_pop_pair(X21, X22);
    w.put_pop_pair(X19, X20);
    w.put_pop_pair(FP, LR);
    w.put_ret();

    let atexit_stub_offset = w.offset();
    w.put_load_u64(X0, 0);
    w.put_ret();

    RuntimeBlob {
        code: w.into_code(),
        constructor_offset,
        destructor_offset,
        atexit_stub_offset,
    }
}
