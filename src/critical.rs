//! The critical-section gate (spec §4.1).
//!
//! Every kernel data structure mutation is performed with this gate held.
//! `enter`/`leave` nest: only the outermost `leave` actually restores the
//! port's interrupt-mask state, mirroring how `r3_kernel::klock` treats CPU
//! Lock as a single boolean that is idempotent to "enter" from a nested
//! caller.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::port::{self, Port};

/// Nesting depth of the critical section on this (single) core.
///
/// Only ever touched while interrupts are actually masked, so a plain
/// `AtomicUsize` with `Relaxed` ordering is enough - there is no concurrent
/// writer to synchronize with.
static DEPTH: AtomicUsize = AtomicUsize::new(0);

/// RAII proof that the critical section is held for at least the lifetime
/// of this value. Dropping it calls [`leave`].
///
/// Kernel code that needs to prove to [`klock::CpuLockCell`](crate::klock)
/// that the section is active borrows a [`CsToken`](crate::klock::CsToken)
/// from this guard rather than holding the guard itself in most call sites,
/// the same division `r3_kernel` makes between `CpuLockGuard` and
/// `CpuLockTokenRefMut`.
pub struct CriticalSection {
    _private: (),
}

impl CriticalSection {
    /// Enter the critical section, masking interrupts at or below the
    /// kernel's threshold. Nestable.
    #[inline]
    pub fn enter() -> Self {
        // Safety: balanced by the `Drop` impl below.
        unsafe { enter() };
        Self { _private: () }
    }
}

impl Drop for CriticalSection {
    #[inline]
    fn drop(&mut self) {
        // Safety: this `CriticalSection` represents exactly one `enter()`.
        unsafe { leave() };
    }
}

/// Enter the critical section without an RAII guard.
///
/// # Safety
///
/// The caller must call [`leave`] exactly once for every call to `enter`,
/// in the reverse order (i.e. LIFO), before returning to unprivileged code.
#[inline]
pub unsafe fn enter() {
    let depth = DEPTH.load(Ordering::Relaxed);
    if depth == 0 {
        // Safety: we are about to record that the gate is held.
        unsafe { port::current::disable_interrupts() };
    }
    DEPTH.store(depth + 1, Ordering::Relaxed);
}

/// Leave the critical section entered by a matching [`enter`].
///
/// # Safety
///
/// See [`enter`].
#[inline]
pub unsafe fn leave() {
    let depth = DEPTH.load(Ordering::Relaxed);
    debug_assert!(depth > 0, "leave() without a matching enter()");
    DEPTH.store(depth - 1, Ordering::Relaxed);
    if depth == 1 {
        // Safety: this is the outermost `leave`, so the gate is truly being
        // relinquished; restoring interrupts now is sound.
        unsafe { port::current::enable_interrupts() };
    }
}

/// Whether the critical section is currently held by this context.
#[inline]
pub fn is_active() -> bool {
    DEPTH.load(Ordering::Relaxed) > 0
}

/// Run `f` with the critical section held, passing it nothing but proof
/// that the gate is active is conveyed implicitly (callers needing a
/// [`klock::CsToken`](crate::klock::CsToken) should use
/// [`klock::with_cs`](crate::klock::with_cs) instead).
#[inline]
pub fn with<R>(f: impl FnOnce() -> R) -> R {
    let _cs = CriticalSection::enter();
    f()
}
