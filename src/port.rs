//! The environment contract (spec §6): everything the core consumes from,
//! but does not itself implement, the surrounding MCU/board crate.
//!
//! Mirrors the split `r3_kernel` makes between itself and `r3_port_arm_m` -
//! the kernel defines the trait, a separate (here: feature-gated, in-tree)
//! crate module supplies the concrete register-level implementation for one
//! architecture.

use crate::task::Task;

/// Hardware/architecture primitives the kernel needs.
///
/// An application provides exactly one implementation, selected at compile
/// time (KrisOS has one kernel instance per program, so this is a set of
/// free functions behind `current`, not a trait object or generic
/// parameter - see DESIGN.md).
pub trait Port {
    /// Mask interrupts at or below the kernel's priority threshold. Called
    /// only by [`crate::critical`], which already tracks nesting - this is
    /// the raw, non-nestable primitive.
    ///
    /// # Safety
    /// Must be paired with a matching [`enable_interrupts`].
    unsafe fn disable_interrupts();

    /// Undo [`disable_interrupts`].
    ///
    /// # Safety
    /// Must only be called to balance a prior [`disable_interrupts`].
    unsafe fn enable_interrupts();

    /// Request a context switch (spec §4.5 "deferred context switch").
    ///
    /// Must be called with the critical section released. Pends the
    /// switch and returns immediately; the processor's own exception
    /// prioritization takes it from there:
    ///
    /// - Called from task context, the pended switch preempts before this
    ///   function's caller observes any further instructions, so by the
    ///   time control returns to the caller the current task has been
    ///   through a full round trip through the ready queue (or not, if it
    ///   was already the highest-priority ready task).
    /// - Called from within an interrupt handler, the switch merely stays
    ///   pending (it cannot preempt the handler that requested it) and
    ///   fires once every higher- or equal-priority handler has returned.
    ///
    /// # Safety
    /// The caller must not hold the critical section.
    unsafe fn yield_cpu();

    /// Build the initial stack frame for a not-yet-run task so that its
    /// first dispatch lands at `entry(param)` with the given privilege
    /// level, and returns there via the kernel's task-completion shim.
    /// Returns the initial stack pointer to store in the task's control
    /// block.
    ///
    /// # Safety
    /// `stack` must be a region of at least the port's minimum task stack
    /// size, exclusively owned by the task being initialized.
    unsafe fn initialize_stack(
        stack: &mut [core::mem::MaybeUninit<u8>],
        entry: unsafe extern "C" fn(usize),
        param: usize,
        privileged: bool,
    ) -> *mut u8;

    /// Put the CPU to sleep until the next interrupt (idle task body).
    fn wait_for_interrupt();

    /// Whether the caller is running in task context (as opposed to an
    /// exception/interrupt handler).
    fn is_task_context() -> bool;

    /// Called once by [`crate::kernel::Kernel::start`] to hand control to
    /// the chosen initial task and enable preemption. Never returns.
    ///
    /// # Safety
    /// Must only be called once, during kernel start, with no task
    /// currently running.
    unsafe fn start_first_task(initial_sp: *mut u8) -> !;

    /// Called by the outgoing task's context-switch trap, implementing the
    /// register save/restore of spec §4.5. `next` is the task chosen to
    /// run. The port is responsible for persisting/restoring
    /// `Task::saved_sp`.
    ///
    /// # Safety
    /// Must only be called from the port's own context-switch exception
    /// handler.
    unsafe fn switch_to(next: &'static Task);
}

#[cfg(all(target_os = "none", feature = "cortex-m-port"))]
pub mod cortex_m_impl;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(all(target_os = "none", feature = "cortex-m-port"))]
pub(crate) use cortex_m_impl::CortexM as current;

#[cfg(test)]
pub(crate) use mock::MockPort as current;

#[cfg(not(any(test, all(target_os = "none", feature = "cortex-m-port"))))]
compile_error!(
    "krisos needs a Port implementation: enable `cortex-m-port` on a `target_os = \"none\"` \
     target, or supply your own and select it in src/port.rs"
);
