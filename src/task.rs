//! Tasks: the schedulable unit (spec §3 "Task").
//!
//! Grounded in `r3_kernel::task::TaskCb` for the state-machine operations
//! (`make_ready`, `choose_next_running_task`, `unlock_cpu_and_check_preemption`,
//! `set_task_base_priority`) and in the original C `Task` struct
//! (`examples/original_source/src/Kernel/task.h`) for the field set this
//! crate exposes instead of `r3_kernel`'s const-generic `TaskCb<Traits, ...>`.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::klock::{CpuLockCell, CsTokenRefMut};
use crate::list::Links;
use crate::mutex::Mutex;
use crate::sched;
use crate::state::{TaskSt, WaitObject};
use crate::time::Ticks;

/// Dynamic and base task priority. Lower value means higher scheduling
/// priority (spec §5); `0` is reserved for no task in this crate's tests.
pub type Priority = u8;

/// The lowest possible priority - the idle task's.
pub const IDLE_PRIORITY: Priority = Priority::MAX;

/// A task's stable identifier: positive for application ("user") tasks,
/// negative for kernel-owned ("system") tasks, per spec §3.
pub type TaskId = i32;

/// The entry point signature a task's initial stack frame dispatches to.
pub type EntryPoint = unsafe extern "C" fn(usize);

/// Byte pattern written across a task's stack at creation time, before its
/// initial frame is built on top of it. [`Task::stack_high_water_mark`]
/// counts how much of this pattern survives to infer how deep the stack has
/// ever grown - the convention spec.md's Open Question 4 asks any
/// implementation exposing stack usage to document (see DESIGN.md).
#[cfg(feature = "diagnostics")]
pub(crate) const STACK_POISON: u8 = 0xA5;

/// Task control block. Lives for `'static` - tasks are never moved or
/// deallocated while referenced by a queue; dynamically created tasks are
/// heap-allocated once and leaked into a `&'static Task` (see
/// [`crate::heap`]).
pub struct Task {
    /// Saved stack pointer. Valid whenever the task is not `Running`.
    pub(crate) saved_sp: CpuLockCell<*mut u8>,

    /// Lowest address of this task's private stack. Used for stack-bounds
    /// diagnostics (`SPEC_FULL.md` diagnostics feature) and to recover the
    /// allocation for `task_delete`.
    pub(crate) stack_bottom: *mut u8,

    /// Size in bytes of the stack region starting at `stack_bottom`.
    pub(crate) stack_size: usize,

    /// `Some(heap)` iff this task's stack and TCB were both allocated from
    /// `heap` by `trap::create_dynamic_task`, rather than supplied as
    /// caller-owned `'static` storage. Set once, before the task is first
    /// spawned; consumed by [`Task::free_if_dynamic`] on exit.
    pub(crate) dynamic_heap: Option<&'static dyn crate::heap::DynFree>,

    /// Link fields for the priority-ordered lists this task can be a
    /// member of (ready queue, a mutex's waiters, a semaphore's waiters).
    pub(crate) queue_links: CpuLockCell<Links>,

    /// Link field for the deadline-ordered timeout list. Independent of
    /// `queue_links` so a task can be both blocked on an object and
    /// subject to a timeout at once (Open Question 2, see DESIGN.md).
    pub(crate) timeout_links: CpuLockCell<Links>,

    pub(crate) id: TaskId,

    pub(crate) base_priority: CpuLockCell<Priority>,

    /// Current scheduling priority. `priority <= base_priority` always
    /// (spec §3); boosted above base only while holding a mutex that a
    /// higher-priority task waits on.
    pub(crate) priority: CpuLockCell<Priority>,

    pub(crate) state: CpuLockCell<TaskSt>,

    /// Absolute tick at which a timed wait expires. Meaningless unless the
    /// task is linked into the timeout list.
    pub(crate) deadline: CpuLockCell<Ticks>,

    /// What this task is blocked on, if `state` is `MutexWait` or
    /// `SemWait`.
    pub(crate) wait_object: CpuLockCell<WaitObject>,

    /// Set by [`crate::sched::wake_sleepers`] when this task's wait ended
    /// because its deadline elapsed rather than because the object it
    /// waited on was released (Open Question 2). Meaningless outside a
    /// timed wait on a semaphore/queue.
    pub(crate) timed_out: CpuLockCell<bool>,

    /// Head of the singly-linked list of mutexes this task currently
    /// owns, threaded through `Mutex::next_held`.
    pub(crate) held_mutexes: CpuLockCell<Option<&'static Mutex>>,

    /// Privilege level applied to the initial stack frame (spec §4.5).
    pub(crate) privileged: bool,

    entry: EntryPoint,
    param: usize,

    #[cfg(feature = "diagnostics")]
    pub(crate) context_switches: core::sync::atomic::AtomicUsize,
}

static NEXT_SYSTEM_ID: AtomicI32 = AtomicI32::new(-1);
static NEXT_USER_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate the next system task ID (negative, descending).
pub(crate) fn next_system_id() -> TaskId {
    NEXT_SYSTEM_ID.fetch_sub(1, Ordering::Relaxed)
}

/// Allocate the next user task ID (positive, ascending).
pub(crate) fn next_user_id() -> TaskId {
    NEXT_USER_ID.fetch_add(1, Ordering::Relaxed)
}

impl Task {
    /// Build a not-yet-scheduled task control block. `stack` must outlive
    /// the task; callers place it in `'static` storage (a static array for
    /// `create_static`, a heap allocation leaked by `create_dynamic`).
    ///
    /// The task is left in state `Sleeping` with no links; the caller
    /// completes initialization by calling [`Task::spawn`].
    pub(crate) fn new(
        id: TaskId,
        priority: Priority,
        stack: &'static mut [MaybeUninit<u8>],
        entry: EntryPoint,
        param: usize,
        privileged: bool,
    ) -> Self {
        #[cfg(feature = "diagnostics")]
        for byte in stack.iter_mut() {
            *byte = MaybeUninit::new(STACK_POISON);
        }

        Task {
            saved_sp: CpuLockCell::new(stack.as_mut_ptr().cast()),
            stack_bottom: stack.as_mut_ptr().cast(),
            stack_size: stack.len(),
            dynamic_heap: None,
            queue_links: CpuLockCell::new(Links::INIT),
            timeout_links: CpuLockCell::new(Links::INIT),
            id,
            base_priority: CpuLockCell::new(priority),
            priority: CpuLockCell::new(priority),
            state: CpuLockCell::new(TaskSt::Sleeping),
            deadline: CpuLockCell::new(Ticks::ZERO),
            wait_object: CpuLockCell::new(WaitObject::None),
            timed_out: CpuLockCell::new(false),
            held_mutexes: CpuLockCell::new(None),
            privileged,
            entry,
            param,
            #[cfg(feature = "diagnostics")]
            context_switches: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Build the initial stack frame and insert the task into the ready
    /// queue. Must be called exactly once per task, before it is ever
    /// referenced by a scheduling list.
    pub(crate) fn spawn(&'static self, cs: &mut CsTokenRefMut<'_>) {
        // Safety: `stack_bottom`/`stack_size` describe a region exclusively
        // owned by this not-yet-scheduled task.
        let sp = unsafe {
            let stack = core::slice::from_raw_parts_mut(
                self.stack_bottom.cast::<MaybeUninit<u8>>(),
                self.stack_size,
            );
            crate::port::current::initialize_stack(stack, self.entry, self.param, self.privileged)
        };
        self.saved_sp.replace(cs, sp);
        // Safety: the task has a complete frame as of the line above.
        unsafe { sched::make_ready(cs, self) };
    }

    /// Record that this task's stack and own storage were allocated from
    /// `heap`, so [`Task::free_if_dynamic`] can return them on exit. Must
    /// be called, if at all, before the task is first spawned - taking
    /// `&mut self` enforces that no one else can yet be holding a shared
    /// `&'static Task` to race against.
    pub(crate) fn mark_dynamic(&mut self, heap: &'static dyn crate::heap::DynFree) {
        self.dynamic_heap = Some(heap);
    }

    /// Frees this task's stack and its own TCB storage back to the heap
    /// they were allocated from, if any (spec.md §4.6 `task_delete`: "free
    /// if dynamic"). No-op for a statically created task.
    ///
    /// # Safety considerations
    /// Must only be called once this task is `Removed` and nothing else
    /// will ever dereference `self` or its stack again - the teardown tail
    /// of `kernel::exit_current_task`.
    pub(crate) fn free_if_dynamic(&'static self) {
        if let Some(heap) = self.dynamic_heap {
            // Safety: `stack_bottom` was allocated from `heap` by
            // `trap::create_dynamic_task` and has not been freed since;
            // `self` is the TCB allocation that same call made from the
            // same heap, and by this function's contract nothing
            // references either again.
            unsafe {
                heap.free_raw(self.stack_bottom);
                heap.free_raw(self as *const Task as *mut u8);
            }
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn base_priority(&self, cs: &CsTokenRefMut<'_>) -> Priority {
        *self.base_priority.read(cs)
    }

    pub fn priority(&self, cs: &CsTokenRefMut<'_>) -> Priority {
        *self.priority.read(cs)
    }

    pub fn state(&self, cs: &CsTokenRefMut<'_>) -> TaskSt {
        *self.state.read(cs)
    }

    pub(crate) fn saved_sp(&self, cs: &CsTokenRefMut<'_>) -> *mut u8 {
        *self.saved_sp.read(cs)
    }

    /// Record where this task's context was saved to. Called only by the
    /// port's context-switch trap (`Port::switch_to`'s actual work).
    pub(crate) fn set_saved_sp(&self, cs: &mut CsTokenRefMut<'_>, sp: *mut u8) {
        self.saved_sp.replace(cs, sp);
    }

    /// Recompute and apply this task's effective priority from its base
    /// priority and the ceilings of the mutexes it currently holds
    /// (Open Question 1's resolution - see DESIGN.md). Reorders the task
    /// in whatever priority-ordered list it currently sits in.
    pub(crate) fn recompute_priority(&'static self, cs: &mut CsTokenRefMut<'_>) {
        let base = *self.base_priority.read(cs);
        let mut effective = base;

        let mut cursor = *self.held_mutexes.read(cs);
        while let Some(m) = cursor {
            if let Some(ceiling) = m.waiter_ceiling(cs) {
                effective = effective.min(ceiling);
            }
            cursor = m.next_held(cs);
        }

        let old = self.priority.replace(cs, effective);
        if old == effective {
            return;
        }

        match self.state(cs) {
            TaskSt::Ready => sched::reorder_ready(cs, self),
            TaskSt::MutexWait => {
                if let WaitObject::Mutex(m) = *self.wait_object.read(cs) {
                    m.reorder_waiter(cs, self);
                }
            }
            TaskSt::SemWait => {
                if let WaitObject::Semaphore(s) = *self.wait_object.read(cs) {
                    s.reorder_waiter(cs, self);
                }
            }
            TaskSt::Running | TaskSt::Sleeping | TaskSt::Removed => {}
        }
    }

    /// Push `m` onto this task's held-mutex list. `m` must not already be
    /// in it.
    pub(crate) fn push_held_mutex(&'static self, cs: &mut CsTokenRefMut<'_>, m: &'static Mutex) {
        let head = *self.held_mutexes.read(cs);
        m.set_next_held(cs, head);
        self.held_mutexes.replace(cs, Some(m));
    }

    /// Remove `m` from this task's held-mutex list. `m` must currently be
    /// in it.
    pub(crate) fn remove_held_mutex(&'static self, cs: &mut CsTokenRefMut<'_>, m: &'static Mutex) {
        let mut cursor = *self.held_mutexes.read(cs);
        let mut prev: Option<&'static Mutex> = None;
        while let Some(cur) = cursor {
            let next = cur.next_held(cs);
            if core::ptr::eq(cur, m) {
                match prev {
                    Some(p) => p.set_next_held(cs, next),
                    None => {
                        self.held_mutexes.replace(cs, next);
                    }
                }
                return;
            }
            prev = Some(cur);
            cursor = next;
        }
        debug_assert!(false, "remove_held_mutex: mutex not in held list");
    }

    #[cfg(feature = "diagnostics")]
    pub fn context_switch_count(&self) -> usize {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Bytes of this task's stack that have ever been written to, counted
    /// by how much of the [`STACK_POISON`] pattern laid down at creation no
    /// longer survives. The stack grows down from `stack_bottom +
    /// stack_size`, so this is `stack_size` minus the length of the
    /// untouched poisoned run starting at `stack_bottom`.
    ///
    /// Meaningless (and racy to call) while this task is `Running` on
    /// another core - KrisOS is single-core, so the only unsafe case is
    /// calling this from the task's own body, which sees its stack
    /// mid-use.
    #[cfg(feature = "diagnostics")]
    pub fn stack_high_water_mark(&self) -> usize {
        // Safety: `stack_bottom`/`stack_size` describe this task's private
        // stack for its entire lifetime; reading it outside the task's own
        // execution is race-free on a single core.
        let region =
            unsafe { core::slice::from_raw_parts(self.stack_bottom, self.stack_size) };
        let untouched = region.iter().take_while(|&&b| b == STACK_POISON).count();
        self.stack_size - untouched
    }
}

/// The kernel's own entry point for a task whose body returns instead of
/// calling `task_delete` explicitly - the completion shim named in spec
/// §4.5. Never called directly by application code.
///
/// # Safety
/// Only meant to be installed as the return address of a synthetic stack
/// frame by [`crate::port::Port::initialize_stack`].
pub unsafe extern "C" fn task_exit_trampoline(_unused: usize) {
    crate::kernel::exit_current_task();
}

#[cfg(all(test, feature = "diagnostics"))]
mod tests {
    use super::*;

    unsafe extern "C" fn noop_entry(_param: usize) {}

    #[test]
    fn stack_high_water_mark_reflects_written_depth() {
        let stack: &'static mut [MaybeUninit<u8>] =
            Box::leak(vec![MaybeUninit::uninit(); 64].into_boxed_slice());
        let bottom = stack.as_mut_ptr().cast::<u8>();
        let task = Task::new(next_user_id(), 100, stack, noop_entry, 0, false);
        assert_eq!(task.stack_high_water_mark(), 0);

        // Simulate the deepest 10 bytes (closest to `stack_bottom`, since
        // the stack grows down) having been written by some past dispatch.
        // Safety: `bottom` still points at `task`'s exclusively-owned
        // stack; nothing else accesses it concurrently in this test.
        unsafe {
            for i in (task.stack_size - 10)..task.stack_size {
                *bottom.add(i) = 0x42;
            }
        }
        assert_eq!(task.stack_high_water_mark(), 10);
    }
}
