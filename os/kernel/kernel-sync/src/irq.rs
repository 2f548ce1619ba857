//! Interrupt-disable critical sections for a single-core kernel.
//!
//! On one core, "disable interrupts, do the work, restore the previous state"
//! is the only lock the memory manager needs. [`IrqGuard`] packages that as an
//! RAII guard: it snapshots `EFLAGS.IF` on construction, clears it if it was
//! set, and restores it on drop. Nested guards therefore never re-enable
//! interrupts early; only the outermost guard that found them enabled turns
//! them back on.
//!
//! # Platform
//!
//! On bare-metal i386 (`target_arch = "x86"`, `target_os = "none"`) the guard
//! uses `pushfd/pop`, `cli` and `sti`. Everywhere else (host builds and tests)
//! the interrupt flag is simulated by a process-wide atomic that starts out
//! cleared, matching the state of the CPU right after boot.

/// Bit 9 of `EFLAGS`: interrupt enable flag.
pub const EFLAGS_IF: u32 = 1 << 9;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod arch {
    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn eflags() -> u32 {
        let r: u32;
        unsafe { core::arch::asm!("pushfd; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod arch {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Simulated `EFLAGS.IF`.
    static INTERRUPT_FLAG: AtomicBool = AtomicBool::new(false);

    #[inline]
    pub fn disable() {
        INTERRUPT_FLAG.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable() {
        INTERRUPT_FLAG.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn eflags() -> u32 {
        // Bit 1 is architecturally always set.
        let base = 1 << 1;
        if INTERRUPT_FLAG.load(Ordering::SeqCst) {
            base | super::EFLAGS_IF
        } else {
            base
        }
    }
}

/// Disables hardware interrupts (`cli`).
///
/// # Privilege
///
/// On bare metal this must run at CPL0 (or with sufficient IOPL).
#[inline]
pub fn cli_stop_interrupts() {
    arch::disable();
}

/// Enables hardware interrupts (`sti`).
///
/// # Privilege
///
/// On bare metal this must run at CPL0 (or with sufficient IOPL). Typically
/// used to restore a previously disabled interrupt state.
#[inline]
pub fn sti_enable_interrupts() {
    arch::enable();
}

/// Returns the current `EFLAGS` value (via `pushfd/pop`).
#[inline]
#[must_use]
pub fn eflags() -> u32 {
    arch::eflags()
}

/// Whether maskable interrupts are currently enabled (`EFLAGS.IF`).
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    eflags() & EFLAGS_IF != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were previously
/// enabled, preserving the original state. Early returns and panics release
/// the guard like any other exit path.
///
/// # Examples
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _outer = IrqGuard::new();
///     {
///         let _inner = IrqGuard::new();
///         assert!(!interrupts_enabled());
///     }
///     // still disabled: only the outermost guard restores
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

/// Runs `f` with interrupts disabled, restoring the previous state afterwards.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let _guard = IrqGuard::new();
    f()
}
