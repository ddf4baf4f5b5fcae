//! The error taxonomy (spec §7).
//!
//! One small `enum` per fallible operation family, the way `r3_kernel::error`
//! defines e.g. `ActivateTaskError`/`LockMutexError`/`WaitSemaphoreError`
//! rather than a single catch-all error type.

use core::fmt;

macro_rules! kernel_error {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

kernel_error! {
    /// Errors from task lifecycle operations (`sleep`, `create`, `delete`, ...).
    TaskError {
        /// Called from a non-task context (e.g. an ISR) where one is required.
        BadContext,
        /// A priority, stack size, or other creation parameter was invalid.
        BadParam,
        /// The heap could not supply memory for a dynamic task's TCB/stack.
        OutOfMemory,
    }
}

kernel_error! {
    /// Errors from mutex operations.
    MutexError {
        /// The caller does not currently hold the mutex.
        NotOwner,
        /// `delete` was called on a mutex that is owned or has waiters.
        InUse,
        /// A blocking `lock` would deadlock against the caller's own hold.
        WouldDeadlock,
        /// `lock`/`try_lock` was attempted outside a waitable context.
        BadContext,
    }
}

kernel_error! {
    /// Errors from semaphore operations.
    SemaphoreError {
        /// `try_acquire` found the counter at zero.
        WouldBlock,
        /// A blocking wait's deadline elapsed before the semaphore was
        /// signaled.
        Timeout,
        /// Blocking `acquire` was attempted from an ISR.
        BadContext,
    }
}

kernel_error! {
    /// Errors from bounded-queue operations.
    QueueError {
        /// `try_write` found the queue full, or `try_read` found it empty.
        WouldBlock,
        /// A blocking operation's deadline elapsed.
        Timeout,
        /// A blocking `write`/`read` was attempted from an ISR.
        BadContext,
    }
}

kernel_error! {
    /// Errors from heap operations.
    HeapError {
        /// No free block was large enough to satisfy the request.
        OutOfMemory,
        /// A zero-size allocation was requested.
        BadParam,
    }
}
