//! Scoped hardware-trap catcher
//!
//! The call frame engine wraps native dispatch in a guard that converts
//! SIGSEGV/SIGBUS/SIGILL/SIGFPE/SIGTRAP in the callee into a structured
//! exception and unwinds back to the engine. Handlers are process-wide and
//! installed once; the per-thread recovery slot decides whether a given
//! trap belongs to an active guard. Traps outside a guard fall through to
//! the default disposition.

use crate::error::{NativeExceptionDetails, TrapKind};
use once_cell::sync::OnceCell;

#[cfg(unix)]
mod imp {
    use super::*;
    use crate::cpu::CpuContext;
    use crate::ptr::NativePointer;
    use std::cell::{Cell, RefCell};
    use std::os::raw::{c_int, c_void};
    use std::ptr;

    extern "C" {
        fn tether_try(
            slot: *mut *mut c_void,
            body: unsafe extern "C" fn(*mut c_void),
            ctx: *mut c_void,
        ) -> c_int;
        fn tether_unwind(env: *mut c_void) -> !;
    }

    thread_local! {
        /// Recovery environment for the guard active on this thread, if any
        static RECOVERY: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
        /// Exception captured by the handler before unwinding
        static CAPTURED: RefCell<Option<NativeExceptionDetails>> = const { RefCell::new(None) };
    }

    const GUARDED_SIGNALS: &[c_int] = &[
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGILL,
        libc::SIGFPE,
        libc::SIGTRAP,
    ];

    fn trap_kind(signo: c_int) -> TrapKind {
        match signo {
            libc::SIGSEGV | libc::SIGBUS => TrapKind::AccessViolation,
            libc::SIGILL => TrapKind::IllegalInstruction,
            libc::SIGFPE => TrapKind::Arithmetic,
            _ => TrapKind::Breakpoint,
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
    unsafe fn capture_cpu_context(ucontext: *mut c_void) -> CpuContext {
        let uc = &*(ucontext as *const libc::ucontext_t);
        let gregs = &uc.uc_mcontext.gregs;
        let mut ctx = CpuContext::new();
        let pairs: &[(&str, c_int)] = &[
            ("rax", libc::REG_RAX),
            ("rcx", libc::REG_RCX),
            ("rdx", libc::REG_RDX),
            ("rbx", libc::REG_RBX),
            ("rsp", libc::REG_RSP),
            ("rbp", libc::REG_RBP),
            ("rsi", libc::REG_RSI),
            ("rdi", libc::REG_RDI),
            ("r8", libc::REG_R8),
            ("r9", libc::REG_R9),
            ("r10", libc::REG_R10),
            ("r11", libc::REG_R11),
            ("r12", libc::REG_R12),
            ("r13", libc::REG_R13),
            ("r14", libc::REG_R14),
            ("r15", libc::REG_R15),
            ("rip", libc::REG_RIP),
        ];
        for (name, reg) in pairs {
            let value = gregs[*reg as usize] as u64;
            let _ = ctx.set_register(name, NativePointer::new(value as usize));
        }
        ctx
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64", target_env = "gnu"))]
    unsafe fn capture_cpu_context(ucontext: *mut c_void) -> CpuContext {
        let uc = &*(ucontext as *const libc::ucontext_t);
        let mc = &uc.uc_mcontext;
        let mut ctx = CpuContext::new();
        for i in 0..29 {
            let name = crate::cpu::register_names()[i];
            let _ = ctx.set_register(name, NativePointer::new(mc.regs[i] as usize));
        }
        let _ = ctx.set_register("fp", NativePointer::new(mc.regs[29] as usize));
        let _ = ctx.set_register("lr", NativePointer::new(mc.regs[30] as usize));
        let _ = ctx.set_register("sp", NativePointer::new(mc.sp as usize));
        let _ = ctx.set_register("pc", NativePointer::new(mc.pc as usize));
        ctx
    }

    #[cfg(not(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64"),
        target_env = "gnu"
    )))]
    unsafe fn capture_cpu_context(_ucontext: *mut c_void) -> CpuContext {
        CpuContext::new()
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
        (*info).si_addr() as usize
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
        (*info).si_addr as usize
    }

    unsafe extern "C" fn on_trap(signo: c_int, info: *mut libc::siginfo_t, ucontext: *mut c_void) {
        let env = RECOVERY.with(|slot| slot.get());
        if env.is_null() {
            // Not ours: fall back to the default disposition; the faulting
            // instruction re-raises on return.
            libc::signal(signo, libc::SIG_DFL);
            return;
        }

        let context = capture_cpu_context(ucontext);
        let address = if signo == libc::SIGTRAP {
            context.register("pc").unwrap_or(NativePointer::NULL)
        } else {
            NativePointer::new(fault_address(info))
        };

        let details = NativeExceptionDetails {
            kind: trap_kind(signo),
            address,
            context,
        };
        CAPTURED.with(|slot| *slot.borrow_mut() = Some(details));

        tether_unwind(env);
    }

    pub(super) fn install_handlers() {
        unsafe {
            let handler: unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) = on_trap;
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut action.sa_mask);
            for signo in GUARDED_SIGNALS {
                libc::sigaction(*signo, &action, ptr::null_mut());
            }
        }
    }

    pub(super) fn guarded_call<F: FnOnce()>(f: F) -> Result<(), NativeExceptionDetails> {
        unsafe extern "C" fn body<F: FnOnce()>(ctx: *mut c_void) {
            let payload = &mut *(ctx as *mut Option<F>);
            (payload.take().unwrap())();
        }

        let mut payload = Some(f);
        // A re-entrant dispatch on this thread stacks its guard over ours;
        // the outer environment comes back once the inner call returns.
        let previous = RECOVERY.with(|slot| slot.get());
        let slot_ptr = RECOVERY.with(|slot| slot.as_ptr());
        let completed = unsafe {
            tether_try(
                slot_ptr,
                body::<F>,
                &mut payload as *mut Option<F> as *mut c_void,
            )
        };
        RECOVERY.with(|slot| slot.set(previous));

        if completed != 0 {
            Ok(())
        } else {
            let details = CAPTURED.with(|slot| slot.borrow_mut().take());
            Err(details.unwrap_or(NativeExceptionDetails {
                kind: TrapKind::AccessViolation,
                address: NativePointer::NULL,
                context: CpuContext::new(),
            }))
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub(super) fn install_handlers() {}

    pub(super) fn guarded_call<F: FnOnce()>(f: F) -> Result<(), NativeExceptionDetails> {
        f();
        Ok(())
    }
}

/// Process-wide trap catcher
///
/// Obtain once and reuse; installation is idempotent.
pub struct Exceptor {
    _private: (),
}

static EXCEPTOR: OnceCell<Exceptor> = OnceCell::new();

impl Exceptor {
    /// Get the shared exceptor, installing signal handlers on first use
    pub fn obtain() -> &'static Exceptor {
        EXCEPTOR.get_or_init(|| {
            imp::install_handlers();
            log::debug!("trap handlers installed");
            Exceptor { _private: () }
        })
    }

    /// Run `f`, converting a hardware trap inside it into a structured
    /// exception
    ///
    /// The guard applies to the current thread only. Guards nest: a
    /// re-entrant dispatch installs its own recovery environment and the
    /// outer one is restored when it returns.
    pub fn try_call<F: FnOnce()>(&self, f: F) -> Result<(), NativeExceptionDetails> {
        imp::guarded_call(f)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_clean_call_passes_through() {
        let exceptor = Exceptor::obtain();
        let mut ran = false;
        exceptor.try_call(|| ran = true).unwrap();
        assert!(ran);
    }

    #[test]
    fn test_null_read_is_caught() {
        let exceptor = Exceptor::obtain();
        let result = exceptor.try_call(|| unsafe {
            let p = std::ptr::null::<u8>();
            std::ptr::read_volatile(p);
        });
        let details = result.unwrap_err();
        assert_eq!(details.kind, TrapKind::AccessViolation);
        assert!(details.address.is_null());
    }

    #[test]
    fn test_nested_guards_restore_outer_recovery() {
        let exceptor = Exceptor::obtain();
        let result = exceptor.try_call(|| {
            // The inner guard catches its own trap.
            let inner = Exceptor::obtain().try_call(|| unsafe {
                std::ptr::read_volatile(0x10 as *const u8);
            });
            assert!(inner.is_err());
            // The outer environment is active again.
            unsafe {
                std::ptr::read_volatile(0x20 as *const u8);
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_consecutive_guards() {
        let exceptor = Exceptor::obtain();
        for _ in 0..3 {
            let result = exceptor.try_call(|| unsafe {
                std::ptr::read_volatile(0x8 as *const u8);
            });
            assert!(result.is_err());
        }
        // The slot is clear again afterwards.
        exceptor.try_call(|| {}).unwrap();
    }
}
