//! The idle task (spec §4.10): always the lowest priority, "wait for
//! interrupt" in a loop. Grounded in the original's implicit idle loop
//! (`examples/original_source/src/Kernel/scheduler.c` keeps one
//! always-ready task at `IDLE_PRIORITY`) and in `Task::spawn`'s
//! leak-into-`'static` convention for system tasks.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use crate::klock::with_cs;
use crate::task::{Task, IDLE_PRIORITY};

/// Plenty for a body that only ever calls `wait_for_interrupt` in a loop.
const IDLE_STACK_SIZE: usize = 256;

struct IdleStorage(UnsafeCell<MaybeUninit<Task>>);

// Safety: written to exactly once, by `spawn`, before any other task can
// observe `idle_task()`'s result; read-only (through `&'static Task`)
// thereafter.
unsafe impl Sync for IdleStorage {}

static IDLE_TASK: IdleStorage = IdleStorage(UnsafeCell::new(MaybeUninit::uninit()));
static mut IDLE_STACK: [MaybeUninit<u8>; IDLE_STACK_SIZE] = [MaybeUninit::uninit(); IDLE_STACK_SIZE];

/// Build and enqueue the idle task. Must be called exactly once, by
/// [`crate::kernel::init`], before [`crate::kernel::start`].
pub(crate) fn spawn() {
    // Safety: this runs once during `kernel::init`, before any other code
    // can reach `IDLE_STACK` or write `IDLE_TASK`.
    let stack: &'static mut [MaybeUninit<u8>] =
        unsafe { &mut *core::ptr::addr_of_mut!(IDLE_STACK) };

    let task = Task::new(
        crate::task::next_system_id(),
        IDLE_PRIORITY,
        stack,
        idle_entry,
        0,
        true,
    );

    // Safety: the one and only write to `IDLE_TASK`.
    let task_ref: &'static Task = unsafe { (*IDLE_TASK.0.get()).write(task) };

    with_cs(|mut cs| task_ref.spawn(&mut cs));
}

unsafe extern "C" fn idle_entry(_param: usize) {
    loop {
        crate::port::current::wait_for_interrupt();
    }
}
