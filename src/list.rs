//! Intrusive doubly-linked lists of `&'static Task`.
//!
//! Grounded in the hand-rolled intrusive lists the original kernel uses for
//! its ready/waiting/delayed queues (`examples/original_source/src/Kernel/scheduler.c`,
//! `task.h`), expressed the way `spec.md` §9's REDESIGN FLAGS table asks: a
//! typed "which list am I in, if any" tag per task rather than a bare
//! untyped link, and O(1) removal given only the task.
//!
//! A task participates in up to two of these lists at once: one ordered by
//! priority (the ready queue, or a mutex/semaphore waiter list) via
//! [`QueueLink`], and one ordered by deadline (the timeout list) via
//! [`TimeoutLink`] - see `SPEC_FULL.md` §3 and Open Question 2.

use crate::klock::{CpuLockCell, CsTokenRefMut};
use crate::task::Task;

/// Prev/next pointers for one list a task can belong to.
pub(crate) struct Links {
    pub(crate) prev: Option<&'static Task>,
    pub(crate) next: Option<&'static Task>,
}

impl Links {
    pub(crate) const INIT: Self = Self {
        prev: None,
        next: None,
    };
}

/// Which concrete link field of [`Task`] a [`List`] instantiation threads
/// through. `QueueLink` and `TimeoutLink` are the only implementors.
pub(crate) trait LinkField {
    fn links(task: &'static Task) -> &'static CpuLockCell<Links>;
}

/// Tag selecting `Task::queue_links` - used by the ready queue and by
/// mutex/semaphore waiter lists.
pub(crate) struct QueueLink;
impl LinkField for QueueLink {
    fn links(task: &'static Task) -> &'static CpuLockCell<Links> {
        &task.queue_links
    }
}

/// Tag selecting `Task::timeout_links` - used by the sleep/timeout list.
pub(crate) struct TimeoutLink;
impl LinkField for TimeoutLink {
    fn links(task: &'static Task) -> &'static CpuLockCell<Links> {
        &task.timeout_links
    }
}

/// A doubly-linked list header. Ordering is imposed purely by callers
/// picking the right insertion point; the list itself is just head/tail
/// pointers plus generic insert-before/remove/pop operations.
pub(crate) struct List<F> {
    head: CpuLockCell<Option<&'static Task>>,
    tail: CpuLockCell<Option<&'static Task>>,
    _field: core::marker::PhantomData<F>,
}

impl<F> List<F> {
    pub(crate) const fn new() -> Self {
        Self {
            head: CpuLockCell::new(None),
            tail: CpuLockCell::new(None),
            _field: core::marker::PhantomData,
        }
    }
}

impl<F: LinkField> List<F> {
    pub(crate) fn is_empty(&self, cs: &CsTokenRefMut<'_>) -> bool {
        self.head.read(cs).is_none()
    }

    pub(crate) fn front(&self, cs: &CsTokenRefMut<'_>) -> Option<&'static Task> {
        *self.head.read(cs)
    }

    /// Insert `task` immediately before `before` (or at the tail if `before`
    /// is `None`). `task` must not currently be linked in this list.
    fn insert_before(
        &self,
        cs: &mut CsTokenRefMut<'_>,
        task: &'static Task,
        before: Option<&'static Task>,
    ) {
        let prev = match before {
            Some(b) => F::links(b).read(cs).prev,
            None => *self.tail.read(cs),
        };

        F::links(task).replace(
            cs,
            Links {
                prev,
                next: before,
            },
        );

        match prev {
            Some(p) => F::links(p).modify(cs, |l| l.next = Some(task)),
            None => self.head.replace(cs, Some(task)),
        }
        match before {
            Some(b) => F::links(b).modify(cs, |l| l.prev = Some(task)),
            None => self.tail.replace(cs, Some(task)),
        }
    }

    pub(crate) fn push_back(&self, cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
        self.insert_before(cs, task, None);
    }

    /// Insert `task` into a list ordered by ascending `key(t)`, with ties
    /// broken in favor of tasks already present (FIFO on tie). `key` is
    /// typically "priority, descending" (ready queue / waiter lists, using
    /// `core::cmp::Reverse`) or "deadline, ascending" (timeout list).
    pub(crate) fn insert_sorted_by_key<K: Ord>(
        &self,
        cs: &mut CsTokenRefMut<'_>,
        task: &'static Task,
        mut key: impl FnMut(&CsTokenRefMut<'_>, &'static Task) -> K,
    ) {
        let task_key = key(cs, task);
        let mut cursor = self.front(cs);
        while let Some(t) = cursor {
            if key(cs, t) > task_key {
                break;
            }
            cursor = F::links(t).read(cs).next;
        }
        self.insert_before(cs, task, cursor);
    }

    /// Remove `task` from this list. `task` must currently be linked in it.
    pub(crate) fn remove(&self, cs: &mut CsTokenRefMut<'_>, task: &'static Task) {
        let Links { prev, next } = *F::links(task).read(cs);

        match prev {
            Some(p) => F::links(p).modify(cs, |l| l.next = next),
            None => self.head.replace(cs, next),
        }
        match next {
            Some(n) => F::links(n).modify(cs, |l| l.prev = prev),
            None => self.tail.replace(cs, prev),
        }

        F::links(task).replace(cs, Links::INIT);
    }

    pub(crate) fn pop_front(&self, cs: &mut CsTokenRefMut<'_>) -> Option<&'static Task> {
        let task = self.front(cs)?;
        self.remove(cs, task);
        Some(task)
    }

    /// The task immediately after `task` in the list, if any.
    pub(crate) fn next_of(&self, cs: &CsTokenRefMut<'_>, task: &'static Task) -> Option<&'static Task> {
        F::links(task).read(cs).next
    }

    /// Reposition an already-linked `task` to restore sort order after one
    /// of its keys changed (e.g. priority inheritance boosted it).
    pub(crate) fn reorder_by_key<K: Ord>(
        &self,
        cs: &mut CsTokenRefMut<'_>,
        task: &'static Task,
        key: impl FnMut(&CsTokenRefMut<'_>, &'static Task) -> K,
    ) {
        self.remove(cs, task);
        self.insert_sorted_by_key(cs, task, key);
    }
}

pub(crate) type QueueList = List<QueueLink>;
pub(crate) type TimeoutList = List<TimeoutLink>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::with_cs;
    use crate::task::Task;
    use core::mem::MaybeUninit;
    use quickcheck_macros::quickcheck;

    unsafe extern "C" fn noop_entry(_param: usize) {}

    fn leaked_task(priority: u8) -> &'static Task {
        let stack: &'static mut [MaybeUninit<u8>] =
            Box::leak(vec![MaybeUninit::uninit(); 16].into_boxed_slice());
        Box::leak(Box::new(Task::new(
            crate::task::next_user_id(),
            priority,
            stack,
            noop_entry,
            0,
            false,
        )))
    }

    /// `insert_sorted_by_key` keeps a `QueueList` walkable front-to-back in
    /// non-decreasing key order, and breaks ties in insertion order - the
    /// invariant the ready queue and mutex/semaphore waiter lists both lean
    /// on.
    #[quickcheck]
    fn insert_sorted_by_key_is_sorted_and_stable(priorities: Vec<u8>) {
        let list: QueueList = List::new();
        let tasks: Vec<&'static Task> = priorities.iter().map(|&p| leaked_task(p)).collect();

        with_cs(|mut cs| {
            for &task in &tasks {
                list.insert_sorted_by_key(&mut cs, task, |cs, t| core::cmp::Reverse(t.priority(cs)));
            }

            let mut seen = Vec::new();
            let mut cursor = list.front(&cs);
            while let Some(t) = cursor {
                seen.push(t.id());
                cursor = list.next_of(&cs, t);
            }

            let mut expected: Vec<_> = tasks.iter().map(|t| (t.priority(&cs), t.id())).collect();
            expected.sort_by_key(|&(p, id)| (p, id));
            let expected_ids: Vec<_> = expected.into_iter().map(|(_, id)| id).collect();
            assert_eq!(seen, expected_ids);
        });
    }
}
