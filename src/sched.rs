//! The scheduler (spec §4.4).
//!
//! Grounded directly in `examples/original_source/src/Kernel/scheduler.c`:
//! the running task is not removed from the ready queue while it runs (it
//! simply sits at the queue's head with state `Running`), `schedule`
//! requests a context switch only when the chosen task differs from the
//! one currently running, and round-robin-on-tie is implemented by
//! comparing the running task's priority against its list successor.
//!
//! `r3_kernel::task` additionally supplies the "does a higher-priority
//! task now exist" check performed after a state change
//! (`unlock_cpu_and_check_preemption`), adapted here as
//! [`reschedule_if_needed`].

use core::cmp::Reverse;

use crate::klock::{CpuLockCell, CsTokenRefMut};
use crate::list::QueueList;
use crate::state::{TaskSt, WaitObject};
use crate::task::Task;
use crate::time::Ticks;

/// Every runnable task, including the one currently running, sorted by
/// descending priority with FIFO tie-breaking (spec §3 "Ready queue").
pub(crate) static READY: QueueList = QueueList::new();

/// Tasks sleeping or in a timed wait, sorted by ascending deadline.
pub(crate) static TIMEOUT: crate::list::TimeoutList = crate::list::TimeoutList::new();

static RUNNING: CpuLockCell<Option<&'static Task>> = CpuLockCell::new(None);
static TICK: CpuLockCell<Ticks> = CpuLockCell::new(Ticks::ZERO);

/// The task that was running immediately before the most recent
/// `schedule()` picked a different one, until the deferred context-switch
/// trap claims it by calling [`take_outgoing`]. `schedule()` itself only
/// updates bookkeeping (`RUNNING`, task states) and requests the switch;
/// the actual register save targets whichever task this names.
static OUTGOING: CpuLockCell<Option<&'static Task>> = CpuLockCell::new(None);

/// Set when a time-slice boundary was reached and round-robin succession
/// should be tried on the next `schedule()`; cleared once acted on.
static PREEMPT_FLAG: CpuLockCell<bool> = CpuLockCell::new(false);

/// Ticks between round-robin succession opportunities for same-priority
/// tasks (spec §5 "fixed time-slice").
pub const TIME_SLICE: Ticks = Ticks(10);

fn priority_key(cs: &CsTokenRefMut<'_>, t: &'static Task) -> Reverse<u8> {
    Reverse(t.priority(cs))
}

pub(crate) fn running_task(cs: &CsTokenRefMut<'_>) -> Option<&'static Task> {
    *RUNNING.read(cs)
}

pub(crate) fn current_tick(cs: &CsTokenRefMut<'_>) -> Ticks {
    *TICK.read(cs)
}

/// Transition `task` to `Ready` and insert it into the ready queue. Does
/// not itself call `schedule()` - callers batch state changes and
/// reschedule once.
///
/// # Safety
/// `task` must not currently be linked into the ready queue or any other
/// priority-ordered list.
pub(crate) unsafe fn make_ready(cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
    task.state.replace(cs, TaskSt::Ready);
    READY.insert_sorted_by_key(cs, task, priority_key);
    if RUNNING.read(cs).is_none() {
        RUNNING.replace(cs, Some(task));
        task.state.replace(cs, TaskSt::Running);
    }
}

/// Reposition an already-ready (or running) task after its priority
/// changed.
pub(crate) fn reorder_ready(cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
    READY.reorder_by_key(cs, task, priority_key);
}

/// Remove `task` from the ready queue. Used when a task blocks or exits.
pub(crate) fn remove_ready(cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
    READY.remove(cs, task);
}

/// Spec §4.4 `schedule()`. Picks the task that should run next and, if it
/// differs from the one currently running, updates states and requests a
/// context switch.
pub(crate) fn schedule(cs: &mut CsTokenRefMut<'_>) {
    let running = running_task(cs);

    let chosen = 'chosen: {
        if *PREEMPT_FLAG.read(cs) {
            if let Some(r) = running {
                if let Some(succ) = READY.next_of(cs, r) {
                    if succ.priority(cs) == r.priority(cs) {
                        break 'chosen Some(succ);
                    }
                }
            }
        }
        READY.front(cs)
    };
    PREEMPT_FLAG.replace(cs, false);

    let Some(chosen) = chosen else {
        // The idle task is always ready, so this never actually happens
        // once `kernel::start` has run.
        return;
    };

    if core::ptr::eq(chosen, running.map_or(core::ptr::null(), |r| r as *const Task)) {
        return;
    }

    if let Some(r) = running {
        if r.state(cs) == TaskSt::Running {
            r.state.replace(cs, TaskSt::Ready);
        }
    }
    chosen.state.replace(cs, TaskSt::Running);
    RUNNING.replace(cs, Some(chosen));
    OUTGOING.replace(cs, running);

    #[cfg(feature = "diagnostics")]
    chosen
        .context_switches
        .fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    // Safety: called with the critical section held, as required; the
    // caller is responsible for releasing it before this task next
    // observes kernel state (see `kernel::leave_and_reschedule`).
    unsafe { crate::port::current::yield_cpu() };
}

/// Claim the task the most recent `schedule()` switched away from, if any
/// (and if the context-switch trap hasn't already claimed it). Called by
/// the port's context-switch trap to learn whose `saved_sp` to update.
pub(crate) fn take_outgoing(cs: &mut CsTokenRefMut<'_>) -> Option<&'static Task> {
    OUTGOING.replace(cs, None)
}

/// Request a round-robin re-evaluation on the next `schedule()` call, the
/// way the tick handler does at a time-slice boundary.
pub(crate) fn request_preemption(cs: &mut CsTokenRefMut<'_>) {
    PREEMPT_FLAG.replace(cs, true);
}

/// Spec §4.4 `wake_sleepers()`. Moves every task whose deadline has
/// arrived from the timeout list to the ready queue, then reschedules.
pub(crate) fn wake_sleepers(cs: &mut CsTokenRefMut<'_>) {
    let now = current_tick(cs);
    while let Some(t) = TIMEOUT.front(cs) {
        if *t.deadline.read(cs) > now {
            break;
        }
        TIMEOUT.remove(cs, t);
        t.deadline.replace(cs, Ticks::ZERO);

        // `t` may still be linked into a mutex's or semaphore's waiter
        // list (`queue_links` is independent of `timeout_links` - Open
        // Question 2): detach it from that object before making it ready,
        // and record that this wakeup was a timeout rather than a grant.
        match *t.wait_object.read(cs) {
            WaitObject::None => {}
            WaitObject::Mutex(m) => {
                m.remove_waiter(cs, t);
                t.timed_out.replace(cs, true);
            }
            WaitObject::Semaphore(s) => {
                s.remove_waiter(cs, t);
                t.timed_out.replace(cs, true);
            }
        }
        t.wait_object.replace(cs, WaitObject::None);

        // Safety: `t` is now unlinked from every priority-ordered list.
        unsafe { make_ready(cs, t) };
    }
    schedule(cs);
}

/// Spec §4.4 `on_tick()`. Advances the tick counter and either wakes
/// sleepers or, at a time-slice boundary, requests round-robin
/// succession.
pub(crate) fn on_tick(cs: &mut CsTokenRefMut<'_>) {
    let now = TICK.read(cs).saturating_add(Ticks(1));
    TICK.replace(cs, now);

    let earliest = TIMEOUT.front(cs).map(|t| *t.deadline.read(cs));
    if earliest.is_some_and(|d| d <= now) {
        wake_sleepers(cs);
    } else if now.0 % TIME_SLICE.0 == 0 {
        request_preemption(cs);
        schedule(cs);
    }
}

/// Detach the currently running task from the ready queue and block it
/// with the given wait state, then reschedule. Used by the blocking
/// primitives (`mutex::lock`, `semaphore::acquire`, `task::sleep`, ...).
///
/// Returns once `task` is `Running` again.
pub(crate) fn block_running_task(cs: &mut CsTokenRefMut<'_>, task: &'static Task, new_state: TaskSt) {
    debug_assert!(core::ptr::eq(task, running_task(cs).unwrap()));
    remove_ready(cs, task);
    task.state.replace(cs, new_state);
    schedule(cs);
}

/// Put the currently running task to sleep until `deadline` (absolute
/// ticks), or forever if `deadline.is_forever()`.
pub(crate) fn sleep_until(cs: &mut CsTokenRefMut<'_>, task: &'static Task, deadline: Ticks) {
    block_running_task(cs, task, TaskSt::Sleeping);
    task.deadline.replace(cs, deadline);
    if !deadline.is_forever() {
        TIMEOUT.insert_sorted_by_key(cs, task, |cs, t| *t.deadline.read(cs));
    }
}

/// Cancel a pending timeout for `task`, e.g. because it was woken by an
/// object being released before its deadline. No-op if not linked.
pub(crate) fn cancel_timeout(cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
    if !deadline_is_zero(cs, task) {
        TIMEOUT.remove(cs, task);
        task.deadline.replace(cs, Ticks::ZERO);
    }
}

fn deadline_is_zero(cs: &CsTokenRefMut<'_>, task: &'static Task) -> bool {
    *task.deadline.read(cs) == Ticks::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scheduler-level tests live in `crate::tests` once tasks can be
    // constructed without a real linker-provided stack; see that module
    // for the priority-ordering and round-robin scenarios (spec §8
    // scenarios A and C).
    #[test]
    fn time_slice_is_nonzero() {
        assert!(TIME_SLICE.0 > 0);
    }
}
