//! Kernel state locking: a cell that can only be read or written while the
//! [critical-section gate](crate::critical) is held.
//!
//! This mirrors `r3_kernel::klock::CpuLockCell`, minus the `Traits` type
//! parameter: KrisOS has exactly one kernel instance, so the token type
//! doesn't need to be generic over it.

use core::fmt;

use tokenlock::{SingletonTokenId, UnsyncSingletonToken, UnsyncTokenLock};

use crate::critical::CriticalSection;

struct CsTag;

/// The key that "unlocks" [`CpuLockCell`]. Obtained via [`with_cs`] or
/// [`assume_cs`].
pub(crate) type CsToken = UnsyncSingletonToken<CsTag>;
pub(crate) type CsTokenRefMut<'a> = tokenlock::UnsyncSingletonTokenRefMut<'a, CsTag>;
pub(crate) type CsTokenRef<'a> = tokenlock::UnsyncSingletonTokenRef<'a, CsTag>;

type Keyhole = SingletonTokenId<CsTag>;

/// A cell that requires proof the critical section is held to access.
pub(crate) struct CpuLockCell<T: ?Sized>(UnsyncTokenLock<T, Keyhole>);

impl<T> CpuLockCell<T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(Keyhole::INIT, x))
    }

    /// Read the contents, given proof the critical section is held.
    pub(crate) fn read<'a>(&'a self, cs: &'a CsTokenRefMut<'_>) -> &'a T {
        self.0.read(cs)
    }

    /// Mutably borrow the contents, given proof the critical section is
    /// held.
    pub(crate) fn write<'a>(&'a self, cs: &'a mut CsTokenRefMut<'_>) -> &'a mut T {
        self.0.write(cs)
    }

    /// Replace the contents, returning the old value.
    pub(crate) fn replace(&self, cs: &mut CsTokenRefMut<'_>, value: T) -> T {
        core::mem::replace(self.0.write(cs), value)
    }

    /// Mutate the contents in place via `f`.
    pub(crate) fn modify<R>(&self, cs: &mut CsTokenRefMut<'_>, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.0.write(cs))
    }
}

impl<T: ?Sized> core::ops::Deref for CpuLockCell<T> {
    type Target = UnsyncTokenLock<T, Keyhole>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: ?Sized> core::ops::DerefMut for CpuLockCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: fmt::Debug + Clone> fmt::Debug for CpuLockCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match try_with_cs(|tok| self.0.read(tok).clone()) {
            Some(inner) => write!(f, "CpuLockCell({inner:?})"),
            None => f.write_str("CpuLockCell(<locked>)"),
        }
    }
}

/// RAII guard combining [`CriticalSection`] with the token that proves it.
pub(crate) struct CsGuard {
    _cs: CriticalSection,
    token: CsToken,
}

impl CsGuard {
    pub(crate) fn borrow_mut(&mut self) -> CsTokenRefMut<'_> {
        self.token.borrow_mut()
    }
}

impl core::ops::Deref for CsGuard {
    type Target = CsToken;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl core::ops::DerefMut for CsGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Enter the critical section and obtain a token for [`CpuLockCell`] access.
#[inline]
pub(crate) fn lock() -> CsGuard {
    let cs = CriticalSection::enter();
    // Safety: `cs` proves the gate was just entered by us, and tokenlock's
    // singleton token enforces there is only ever one `CsToken` alive.
    let token = unsafe { CsToken::new_unchecked() };
    CsGuard { _cs: cs, token }
}

/// Assume the critical section is already active (e.g. inside an ISR that
/// entered it via the port directly) and obtain a token.
///
/// # Safety
///
/// The critical section must really be held, and there must be no other
/// live [`CsToken`]/[`CsGuard`] at the point of the call.
pub(crate) unsafe fn assume_cs() -> CsToken {
    debug_assert!(crate::critical::is_active());
    unsafe { CsToken::new_unchecked() }
}

/// Convenience: run `f` with the critical section held and a token borrowed
/// for its duration.
#[inline]
pub(crate) fn with_cs<R>(f: impl FnOnce(CsTokenRefMut<'_>) -> R) -> R {
    let mut guard = lock();
    f(guard.borrow_mut())
}

fn try_with_cs<R>(f: impl FnOnce(&CsToken) -> R) -> Option<R> {
    // Safety: balanced below; entering the gate just to attempt token
    // creation is always sound, even when nested.
    unsafe { crate::critical::enter() };
    let result = CsToken::new().map(|tok| f(&tok));
    // Safety: matches the `enter` above.
    unsafe { crate::critical::leave() };
    result
}
