//! A host-side stand-in for [`Port`](super::Port), used only by this
//! crate's own test suite. It tracks calls instead of touching real
//! hardware, which is enough to exercise the kernel's decision logic
//! (who gets woken, who owns a mutex, queue ordering, ...) without a real
//! Cortex-M target or a working context switch.

use core::cell::Cell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::task::Task;

use super::Port;

pub(crate) struct MockPort;

/// Number of times a context switch has been requested since the test last
/// reset this counter - lets tests assert "the scheduler asked for a
/// switch" without needing a real preemption mechanism.
pub(crate) static CONTEXT_SWITCH_REQUESTS: AtomicUsize = AtomicUsize::new(0);

static INTERRUPT_DEPTH: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    static IN_TASK_CONTEXT: Cell<bool> = const { Cell::new(true) };
}

static WFI_COUNT: AtomicBool = AtomicBool::new(false);

impl MockPort {
    pub(crate) fn reset() {
        CONTEXT_SWITCH_REQUESTS.store(0, Ordering::Relaxed);
        INTERRUPT_DEPTH.store(0, Ordering::Relaxed);
        WFI_COUNT.store(false, Ordering::Relaxed);
        IN_TASK_CONTEXT.with(|c| c.set(true));
    }

    /// Simulate running the rest of this test inside an ISR.
    pub(crate) fn enter_isr() {
        IN_TASK_CONTEXT.with(|c| c.set(false));
    }

    pub(crate) fn leave_isr() {
        IN_TASK_CONTEXT.with(|c| c.set(true));
    }
}

impl Port for MockPort {
    unsafe fn disable_interrupts() {
        INTERRUPT_DEPTH.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn enable_interrupts() {
        INTERRUPT_DEPTH.fetch_sub(1, Ordering::Relaxed);
    }

    unsafe fn yield_cpu() {
        CONTEXT_SWITCH_REQUESTS.fetch_add(1, Ordering::Relaxed);
        // `sched::schedule` already updated `Task::state`/the ready queue
        // synchronously before calling this; only the register save/restore
        // is deferred to a real port's context-switch trap, which the mock
        // has no stack to run, so there is nothing left for it to do here.
    }

    unsafe fn initialize_stack(
        stack: &mut [MaybeUninit<u8>],
        _entry: unsafe extern "C" fn(usize),
        _param: usize,
        _privileged: bool,
    ) -> *mut u8 {
        // No real frame is needed: the mock never actually dispatches to a
        // task entry point. Return a pointer into the (uninitialized)
        // stack so callers have a non-null `saved_sp` to store.
        stack.as_mut_ptr().cast::<u8>()
    }

    fn wait_for_interrupt() {
        WFI_COUNT.store(true, Ordering::Relaxed);
    }

    fn is_task_context() -> bool {
        IN_TASK_CONTEXT.with(|c| c.get())
    }

    unsafe fn start_first_task(_initial_sp: *mut u8) -> ! {
        unreachable!("the mock port never actually dispatches a task")
    }

    unsafe fn switch_to(_next: &'static Task) {
        // The test harness only inspects scheduler-level decisions
        // (`Task::state`, queue membership, ...); it never relies on a real
        // register save/restore happening.
    }
}
