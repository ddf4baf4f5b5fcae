//! Mutexes with priority inheritance (spec §4.7).
//!
//! The ownership/held-list bookkeeping is grounded in
//! `r3_kernel::mutex::{lock_core, unlock_mutex, abandon_held_mutexes}`
//! (owner cell, a mutex-side `prev_mutex_held`/task-side held-list
//! singly-linked chain). Priority inheritance itself follows the literal
//! chain-walking algorithm spec §4.7 describes rather than `r3_kernel`'s
//! static priority-ceiling protocol, since KrisOS mutexes have no
//! compile-time ceiling - see DESIGN.md Open Question 1.

use crate::error::MutexError;
use crate::klock::{CpuLockCell, CsTokenRefMut};
use crate::list::QueueList;
use crate::sched;
use crate::state::{TaskSt, WaitObject};
use crate::task::{Priority, Task};

use core::cmp::Reverse;

pub struct Mutex {
    owner: CpuLockCell<Option<&'static Task>>,
    waiters: QueueList,
    /// Next mutex in the owning task's held-list (`Task::held_mutexes`).
    next_held: CpuLockCell<Option<&'static Mutex>>,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            owner: CpuLockCell::new(None),
            waiters: QueueList::new(),
            next_held: CpuLockCell::new(None),
        }
    }

    pub(crate) fn owner(&self, cs: &CsTokenRefMut<'_>) -> Option<&'static Task> {
        *self.owner.read(cs)
    }

    pub(crate) fn next_held(&self, cs: &CsTokenRefMut<'_>) -> Option<&'static Mutex> {
        *self.next_held.read(cs)
    }

    pub(crate) fn set_next_held(&self, cs: &mut CsTokenRefMut<'_>, next: Option<&'static Mutex>) {
        self.next_held.replace(cs, next);
    }

    /// The priority this mutex currently imposes as a floor on its
    /// owner's effective priority: the highest priority (lowest numeric
    /// value) among its waiters, or `None` if unwaited.
    pub(crate) fn waiter_ceiling(&self, cs: &CsTokenRefMut<'_>) -> Option<Priority> {
        self.waiters.front(cs).map(|t| t.priority(cs))
    }

    pub(crate) fn reorder_waiter(&self, cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
        self.waiters
            .reorder_by_key(cs, task, |cs, t| Reverse(t.priority(cs)));
    }

    /// Unlink `task` from this mutex's waiter list without otherwise
    /// touching its state. Used when a timed-out wait needs to detach
    /// from the object it was waiting on (Open Question 2).
    pub(crate) fn remove_waiter(&self, cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
        self.waiters.remove(cs, task);
    }

    /// Spec §4.7 `try_lock`.
    pub fn try_lock(&'static self, task: &'static Task, cs: &mut CsTokenRefMut<'_>) -> Result<(), MutexError> {
        match self.owner(cs) {
            None => {
                self.owner.replace(cs, Some(task));
                task.push_held_mutex(cs, self);
                Ok(())
            }
            Some(o) if core::ptr::eq(o, task) => Ok(()),
            Some(_) => Err(MutexError::InUse),
        }
    }

    /// Spec §4.7 `lock`. Blocks (reschedules) if the mutex is held by
    /// another task; returns once ownership has been granted. Forbidden
    /// from an ISR, the same way `Semaphore::acquire` is - there is no
    /// context to block in.
    pub fn lock(&'static self, task: &'static Task, cs: &mut CsTokenRefMut<'_>) -> Result<(), MutexError> {
        if !crate::port::current::is_task_context() {
            return Err(MutexError::BadContext);
        }

        match self.try_lock(task, cs) {
            Ok(()) => return Ok(()),
            Err(MutexError::InUse) => {}
            Err(e) => return Err(e),
        }

        if would_deadlock(cs, self, task) {
            return Err(MutexError::WouldDeadlock);
        }

        propagate_priority_inheritance(cs, self, task.priority(cs));

        sched::remove_ready(cs, task);
        task.state.replace(cs, TaskSt::MutexWait);
        task.wait_object.replace(cs, WaitObject::Mutex(self));
        self.waiters
            .insert_sorted_by_key(cs, task, |cs, t| Reverse(t.priority(cs)));
        sched::schedule(cs);

        Ok(())
    }

    /// Spec §4.7 `unlock`. Fails if `task` is not the current owner.
    pub fn unlock(&'static self, task: &'static Task, cs: &mut CsTokenRefMut<'_>) -> Result<(), MutexError> {
        self.unlock_core(task, cs)?;
        sched::schedule(cs);
        Ok(())
    }

    /// The body of `unlock`, minus the reschedule. Split out so
    /// `abandon_all_held_by` can release every mutex a task holds without
    /// `schedule()` running - and possibly moving `RUNNING` elsewhere -
    /// between each release.
    fn unlock_core(&'static self, task: &'static Task, cs: &mut CsTokenRefMut<'_>) -> Result<(), MutexError> {
        if !matches!(self.owner(cs), Some(o) if core::ptr::eq(o, task)) {
            return Err(MutexError::NotOwner);
        }

        task.remove_held_mutex(cs, self);

        match self.waiters.pop_front(cs) {
            Some(next) => {
                self.owner.replace(cs, Some(next));
                next.push_held_mutex(cs, self);
                next.wait_object.replace(cs, WaitObject::None);
                // Safety: `next` was linked only in `self.waiters`, which
                // it was just removed from.
                unsafe { sched::make_ready(cs, next) };
            }
            None => {
                self.owner.replace(cs, None);
            }
        }

        // The releasing task may have been boosted by `self`'s waiters;
        // recompute from its remaining held mutexes (Open Question 1).
        task.recompute_priority(cs);

        Ok(())
    }

    /// Spec §4.7 `delete`: fails if owned or contended.
    pub fn delete(&'static self, cs: &CsTokenRefMut<'_>) -> Result<(), MutexError> {
        if self.owner(cs).is_some() || !self.waiters.is_empty(cs) {
            return Err(MutexError::InUse);
        }
        Ok(())
    }

    /// Release every mutex `task` still holds. Used by
    /// `task_delete`/`exit_current_task` (spec §3 "Lifecycle") on a task
    /// that is about to be blocked/discarded, so - unlike `unlock` -
    /// this does not reschedule after each release: `unlock`'s `schedule()`
    /// can hand a freshly-unblocked waiter the CPU before the loop's next
    /// iteration runs, moving `RUNNING` off `task` while it is still
    /// supposed to be the one exiting. The caller reschedules once, after
    /// every mutex has been released and `task` itself has been blocked.
    pub(crate) fn abandon_all_held_by(cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
        while let Some(m) = *task.held_mutexes.read(cs) {
            // `unlock_core` requires ownership, which holds here by
            // construction of the held-list.
            let _ = m.unlock_core(task, cs);
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Would blocking `task` on `mutex` deadlock it against itself? Walks the
/// same "owner is itself blocked on a mutex" chain
/// `propagate_priority_inheritance` does; if `task` turns up as the owner
/// anywhere along it, locking would wait on a chain that loops back to the
/// caller and never resolves.
fn would_deadlock(cs: &CsTokenRefMut<'_>, mutex: &'static Mutex, task: &'static Task) -> bool {
    let mut current = Some(mutex);
    while let Some(m) = current {
        let Some(owner) = m.owner(cs) else { return false };
        if core::ptr::eq(owner, task) {
            return true;
        }
        current = match owner.state(cs) {
            TaskSt::MutexWait => match *owner.wait_object.read(cs) {
                WaitObject::Mutex(next) => Some(next),
                _ => None,
            },
            _ => None,
        };
    }
    false
}

/// Spec §4.7 `lock`'s priority-inheritance walk: starting at `mutex`'s
/// owner, raise any task whose priority is weaker than `waiter_priority`
/// to match it, and continue along the "owner is itself waiting on
/// another mutex" chain until it runs out or a task is already urgent
/// enough.
fn propagate_priority_inheritance(
    cs: &mut CsTokenRefMut<'_>,
    mutex: &'static Mutex,
    waiter_priority: Priority,
) {
    let mut current = Some(mutex);
    while let Some(m) = current {
        let Some(owner) = m.owner(cs) else { break };
        if owner.priority(cs) <= waiter_priority {
            break;
        }

        let old = owner.priority.replace(cs, waiter_priority);
        debug_assert!(old > waiter_priority);

        // `owner` is itself blocked on some other object (holding `m` all
        // the while) - reposition it there, and continue the chain if
        // that object is another mutex. Otherwise `owner` is Ready or
        // Running, so only the ready queue needs reordering and the
        // chain stops here.
        let next_in_chain = match owner.state(cs) {
            TaskSt::Ready | TaskSt::Running => {
                sched::reorder_ready(cs, owner);
                None
            }
            TaskSt::MutexWait => match *owner.wait_object.read(cs) {
                WaitObject::Mutex(next) => {
                    next.reorder_waiter(cs, owner);
                    Some(next)
                }
                _ => None,
            },
            TaskSt::SemWait => {
                if let WaitObject::Semaphore(s) = *owner.wait_object.read(cs) {
                    s.reorder_waiter(cs, owner);
                }
                None
            }
            TaskSt::Sleeping | TaskSt::Removed => None,
        };

        current = next_in_chain;
    }
}
