//! The kernel's own lifecycle: one-time setup, handoff to the first task,
//! the tick entry point, and task teardown (spec §4.6 `init`/`start`,
//! §4.10 "tick").
//!
//! Grounded in the original `os_init`/`os_start`/`SysTick_Handler`
//! (`examples/original_source/src/Kernel/os.c`): a single running flag, an
//! init phase that brings up the idle task, and a start phase that loads
//! the chosen task's frame and never returns. `r3_kernel::task`'s
//! `exit_current_task` shape grounds this crate's version as well.

use core::sync::atomic::{AtomicBool, Ordering};

static RUNNING: AtomicBool = AtomicBool::new(false);

/// Whether [`start`] has been called. Diagnostic/assertion use only - the
/// kernel has no notion of "not yet running" state that application code
/// should branch on.
pub fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Spec §4.6 `init`. Brings up the idle task. Must run exactly once,
/// before [`start`].
pub fn init() {
    log::debug!("krisos: init");
    crate::idle::spawn();
}

/// Spec §4.6 `start`. Hands control to the highest-priority ready task
/// (the idle task, if nothing else was created) and begins accepting
/// preemption. Never returns.
pub fn start() -> ! {
    let initial_sp = crate::klock::with_cs(|cs| {
        let running = crate::sched::running_task(&cs)
            .expect("kernel::start called before kernel::init");
        running.saved_sp(&cs)
    });

    log::debug!("krisos: start");
    RUNNING.store(true, Ordering::Relaxed);

    // Safety: called exactly once, with a complete initial frame built by
    // `Task::spawn` during `init`/task creation, and no task is yet
    // actually running on the processor.
    unsafe { crate::port::current::start_first_task(initial_sp) }
}

/// Spec §4.4 `on_tick`, wired to the port's periodic timer interrupt.
pub fn on_tick() {
    crate::klock::with_cs(|mut cs| crate::sched::on_tick(&mut cs));
}

/// Teardown for a task whose body returned, or that called `task_delete`
/// on itself: release every mutex it still holds, mark it `Removed`,
/// reschedule, and - if the task was created by `trap::create_dynamic_task`
/// - free its stack and TCB back to the heap they came from (spec.md §4.6
/// selector table, `task_delete`: "free if dynamic").
pub(crate) fn exit_current_task() -> ! {
    let task = crate::klock::with_cs(|mut cs| {
        let task =
            crate::sched::running_task(&cs).expect("exit_current_task: no task is running");
        crate::mutex::Mutex::abandon_all_held_by(&mut cs, task);
        crate::sched::block_running_task(&mut cs, task, crate::state::TaskSt::Removed);
        task
    });

    task.free_if_dynamic();

    // `block_running_task` always requests a context switch away from a
    // task that, by construction, can never be chosen again; on real
    // hardware the pended switch fires on exiting the critical section
    // above, before this point is reached.
    unreachable!("scheduler rescheduled onto a Removed task")
}
