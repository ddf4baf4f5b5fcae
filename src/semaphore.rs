//! Counting semaphores, ISR-safe on the release side (spec §4.8).
//!
//! Grounded in the original C `sem_acquire`/`sem_release`
//! (`examples/original_source/src/Kernel/semaphore.c`, carried over to
//! the wait-queue abstraction `r3_kernel::wait::WaitQueue` uses) - unlike
//! a mutex, a semaphore has no owner and so needs no priority-inheritance
//! chain (spec §5 "Priority inheritance ... not semaphores").

use crate::error::SemaphoreError;
use crate::klock::{CpuLockCell, CsTokenRefMut};
use crate::list::QueueList;
use crate::sched;
use crate::state::{TaskSt, WaitObject};
use crate::task::Task;
use crate::time::Ticks;

use core::cmp::Reverse;

pub struct Semaphore {
    counter: CpuLockCell<u32>,
    waiters: QueueList,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Semaphore {
            counter: CpuLockCell::new(initial),
            waiters: QueueList::new(),
        }
    }

    pub(crate) fn reorder_waiter(&self, cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
        self.waiters
            .reorder_by_key(cs, task, |cs, t| Reverse(t.priority(cs)));
    }

    /// Unlink `task` from this semaphore's waiter list without otherwise
    /// touching its state. Used when a timed-out wait needs to detach
    /// from the object it was waiting on (Open Question 2).
    pub(crate) fn remove_waiter(&self, cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
        self.waiters.remove(cs, task);
    }

    pub fn count(&self, cs: &CsTokenRefMut<'_>) -> u32 {
        *self.counter.read(cs)
    }

    /// Spec §4.8 `try_acquire` / `try_acquire_from_isr` (same operation;
    /// both task and ISR contexts may call this one).
    pub fn try_acquire(&self, cs: &mut CsTokenRefMut<'_>) -> Result<(), SemaphoreError> {
        let n = *self.counter.read(cs);
        if n == 0 {
            return Err(SemaphoreError::WouldBlock);
        }
        self.counter.replace(cs, n - 1);
        Ok(())
    }

    /// Spec §4.8 `acquire`. Forbidden from an ISR - there is no context
    /// to block in.
    pub fn acquire(&'static self, task: &'static Task, cs: &mut CsTokenRefMut<'_>) -> Result<(), SemaphoreError> {
        if !crate::port::current::is_task_context() {
            return Err(SemaphoreError::BadContext);
        }
        if self.try_acquire(cs).is_ok() {
            return Ok(());
        }
        self.block_on(task, cs, crate::time::FOREVER);
        Ok(())
    }

    /// Spec §4.8 `acquire` with a tick-count timeout; fails with
    /// `Timeout` if the deadline elapses first.
    pub fn acquire_timeout(
        &'static self,
        task: &'static Task,
        cs: &mut CsTokenRefMut<'_>,
        timeout: Ticks,
    ) -> Result<(), SemaphoreError> {
        if !crate::port::current::is_task_context() {
            return Err(SemaphoreError::BadContext);
        }
        if self.try_acquire(cs).is_ok() {
            return Ok(());
        }

        let deadline = sched::current_tick(cs).saturating_add(timeout);
        self.block_on(task, cs, deadline);

        // `sched::wake_sleepers` sets `timed_out` when this wait ended by
        // deadline rather than by `release` (Open Question 2); `release`
        // always clears it on the way out.
        if *task.timed_out.read(cs) {
            Err(SemaphoreError::Timeout)
        } else {
            Ok(())
        }
    }

    fn block_on(&'static self, task: &'static Task, cs: &mut CsTokenRefMut<'_>, deadline: Ticks) {
        task.timed_out.replace(cs, false);
        sched::remove_ready(cs, task);
        task.state.replace(cs, TaskSt::SemWait);
        task.wait_object.replace(cs, WaitObject::Semaphore(self));
        self.waiters
            .insert_sorted_by_key(cs, task, |cs, t| Reverse(t.priority(cs)));

        task.deadline.replace(cs, deadline);
        if !deadline.is_forever() {
            sched::TIMEOUT.insert_sorted_by_key(cs, task, |cs, t| *t.deadline.read(cs));
        }

        sched::schedule(cs);
    }

    /// Spec §4.8 `release` / `release_from_isr` (identical: both only
    /// touch lists under the critical-section gate and request a
    /// deferred switch, so the ISR variant is this one).
    pub fn release(&'static self, cs: &mut CsTokenRefMut<'_>) {
        match self.waiters.pop_front(cs) {
            Some(t) => {
                sched::cancel_timeout(cs, t);
                t.wait_object.replace(cs, WaitObject::None);
                t.timed_out.replace(cs, false);
                // Safety: `t` was just unlinked from `self.waiters` and
                // was not linked into any other priority-ordered list.
                unsafe { sched::make_ready(cs, t) };
                sched::schedule(cs);
            }
            None => {
                let n = *self.counter.read(cs);
                self.counter.replace(cs, n + 1);
            }
        }
    }
}
