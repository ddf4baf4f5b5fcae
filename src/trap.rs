//! The trap surface (spec §4.6, §4.6a): a closed selector enum plus a
//! single dispatch function a privileged SVC/trap handler calls with the
//! arguments it copied out of the exception frame.
//!
//! `irq_*` wrappers and `queue_{enqueue,dequeue}` from spec §4.6's
//! recognized-selector table are deliberately not reachable through this
//! enum: interrupt-controller access is environment-owned (spec §6 - an
//! application reaches it through e.g. `cortex_m::peripheral::NVIC`
//! directly rather than through this crate), and a queue's item type is
//! fixed per instance at compile time, so it has no type-erased,
//! numeric-selector-shaped form the way `Mutex`/`Semaphore`/`Task`
//! operations do.
//!
//! Grounded in `os.c`'s `SVC_Handler_C`: a selector read out of the trap
//! frame drives a `match`, each arm calling straight into the
//! corresponding in-kernel function and writing its result back into the
//! frame. `dispatch` is `#[inline(never)]` per `r3_kernel`'s
//! `#[cfg_attr(not(feature = "inline_syscall"), inline(never))]`
//! convention - unconditional here, since KrisOS has no inlining fast path.

use core::alloc::Layout;
use core::mem::MaybeUninit;

use crate::heap::Heap;
use crate::klock::with_cs;
use crate::mutex::Mutex;
use crate::sched;
use crate::semaphore::Semaphore;
use crate::task::{EntryPoint, Priority, Task, TaskId};
use crate::time::Ticks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Init,
    Start,
    TaskSleep,
    TaskYield,
    TaskDelete,
    TaskCreateStatic,
    TaskCreateDynamic,
    HeapAlloc,
    HeapFree,
    MutexTryLock,
    MutexLock,
    MutexUnlock,
    MutexDelete,
    SemTryAcquire,
    SemAcquire,
    SemAcquireTimeout,
    SemRelease,
}

/// A view onto a trap frame's argument words and single result word,
/// already copied out of the stacked exception registers by the port's
/// assembly shim.
pub struct Frame<'a> {
    pub args: &'a [usize],
    pub result: &'a mut usize,
}

/// Spec §4.6 trap dispatch. Looks up `selector`, pulls whatever arguments
/// it needs out of `frame.args`, and writes its result (a boolean
/// success flag, a pointer, or a task ID) into `frame.result`.
///
/// # Safety
/// Every pointer-shaped argument word in `frame.args` must be a live
/// value of the type its selector expects (e.g. `MutexLock`'s first word
/// must be a `&'static Mutex` cast to `usize`, its second a `&'static
/// Task`). The trap handler installing this dispatch is responsible for
/// that contract - it cannot be checked here, since a raw numeric
/// selector ABI has no type system to lean on. The same trust boundary
/// the original `SVC_Handler_C` has with its unprivileged callers.
#[inline(never)]
pub unsafe fn dispatch<const HEAP_SIZE: usize>(
    selector: Selector,
    frame: Frame<'_>,
    heap: &'static Heap<HEAP_SIZE>,
) {
    let Frame { args, result } = frame;

    match selector {
        Selector::Init => {
            crate::kernel::init();
            *result = 0;
        }
        Selector::Start => {
            crate::kernel::start();
        }
        Selector::TaskSleep => {
            let ticks = Ticks(args[0] as u64);
            with_cs(|mut cs| {
                let task = sched::running_task(&cs).expect("task_sleep with no running task");
                let deadline = sched::current_tick(&cs).saturating_add(ticks);
                sched::sleep_until(&mut cs, task, deadline);
            });
            *result = 0;
        }
        Selector::TaskYield => {
            with_cs(|mut cs| {
                sched::request_preemption(&mut cs);
                sched::schedule(&mut cs);
            });
            *result = 0;
        }
        Selector::TaskDelete => {
            crate::kernel::exit_current_task();
        }
        Selector::TaskCreateDynamic => {
            // Safety: by this function's contract, `args[0]` is a valid
            // `EntryPoint` function pointer.
            let entry: EntryPoint = unsafe { core::mem::transmute(args[0]) };
            let param = args[1];
            let priority = args[2] as Priority;
            let stack_size = args[3];

            *result = match create_dynamic_task(heap, entry, param, priority, stack_size) {
                Some(id) => id as usize,
                None => 0,
            };
        }
        Selector::TaskCreateStatic => {
            // Safety: by this function's contract, `args` carries a valid
            // entry point, a caller-owned stack region of `args[4]`
            // bytes at `args[3]`, and a caller-owned, not-yet-initialized
            // `Task` slot at `args[5]`.
            let entry: EntryPoint = unsafe { core::mem::transmute(args[0]) };
            let param = args[1];
            let priority = args[2] as Priority;
            let stack = unsafe {
                core::slice::from_raw_parts_mut(args[3] as *mut MaybeUninit<u8>, args[4])
            };
            let storage = unsafe { &mut *(args[5] as *mut MaybeUninit<Task>) };

            let task = Task::new(crate::task::next_user_id(), priority, stack, entry, param, false);
            let task_ref: &'static Task = storage.write(task);
            with_cs(|mut cs| task_ref.spawn(&mut cs));
            *result = task_ref.id() as usize;
        }
        Selector::HeapAlloc => {
            let size = args[0];
            *result = match Layout::from_size_align(size, crate::heap::HEAP_ALIGN) {
                Ok(layout) => match heap.alloc(layout) {
                    Ok(p) => p.as_ptr() as usize,
                    Err(_) => 0,
                },
                Err(_) => 0,
            };
        }
        Selector::HeapFree => {
            let ptr = args[0] as *mut u8;
            // Safety: by this function's contract, `ptr` is either null
            // or a still-live value `HeapAlloc` returned from this heap.
            unsafe { heap.free(ptr) };
            *result = 0;
        }
        Selector::MutexTryLock => {
            let (mutex, task) = mutex_and_task(args);
            *result = with_cs(|mut cs| mutex.try_lock(task, &mut cs)).is_ok() as usize;
        }
        Selector::MutexLock => {
            let (mutex, task) = mutex_and_task(args);
            *result = with_cs(|mut cs| mutex.lock(task, &mut cs)).is_ok() as usize;
        }
        Selector::MutexUnlock => {
            let (mutex, task) = mutex_and_task(args);
            *result = with_cs(|mut cs| mutex.unlock(task, &mut cs)).is_ok() as usize;
        }
        Selector::MutexDelete => {
            // Safety: by this function's contract, `args[0]` is `&'static Mutex`.
            let mutex: &'static Mutex = unsafe { &*(args[0] as *const Mutex) };
            *result = with_cs(|cs| mutex.delete(&cs)).is_ok() as usize;
        }
        Selector::SemTryAcquire => {
            // Safety: by this function's contract, `args[0]` is `&'static Semaphore`.
            let sem: &'static Semaphore = unsafe { &*(args[0] as *const Semaphore) };
            *result = with_cs(|mut cs| sem.try_acquire(&mut cs)).is_ok() as usize;
        }
        Selector::SemAcquire => {
            let (sem, task) = sem_and_task(args);
            *result = with_cs(|mut cs| sem.acquire(task, &mut cs)).is_ok() as usize;
        }
        Selector::SemAcquireTimeout => {
            let (sem, task) = sem_and_task(args);
            let timeout = Ticks(args[2] as u64);
            *result =
                with_cs(|mut cs| sem.acquire_timeout(task, &mut cs, timeout)).is_ok() as usize;
        }
        Selector::SemRelease => {
            // Safety: by this function's contract, `args[0]` is `&'static Semaphore`.
            let sem: &'static Semaphore = unsafe { &*(args[0] as *const Semaphore) };
            with_cs(|mut cs| sem.release(&mut cs));
            *result = 0;
        }
    }
}

/// Safety: by `dispatch`'s contract, `args[0]`/`args[1]` are `&'static
/// Mutex`/`&'static Task`.
unsafe fn mutex_and_task(args: &[usize]) -> (&'static Mutex, &'static Task) {
    unsafe {
        (
            &*(args[0] as *const Mutex),
            &*(args[1] as *const Task),
        )
    }
}

/// Safety: by `dispatch`'s contract, `args[0]`/`args[1]` are `&'static
/// Semaphore`/`&'static Task`.
unsafe fn sem_and_task(args: &[usize]) -> (&'static Semaphore, &'static Task) {
    unsafe {
        (
            &*(args[0] as *const Semaphore),
            &*(args[1] as *const Task),
        )
    }
}

fn create_dynamic_task<const HEAP_SIZE: usize>(
    heap: &'static Heap<HEAP_SIZE>,
    entry: EntryPoint,
    param: usize,
    priority: Priority,
    stack_size: usize,
) -> Option<TaskId> {
    let stack_layout = Layout::array::<u8>(stack_size).ok()?;
    let stack_ptr = heap.alloc(stack_layout).ok()?;
    // Safety: `heap.alloc` just returned `stack_size` freshly allocated,
    // exclusively-owned bytes.
    let stack = unsafe {
        core::slice::from_raw_parts_mut(stack_ptr.as_ptr().cast::<MaybeUninit<u8>>(), stack_size)
    };

    let tcb_layout = Layout::new::<MaybeUninit<Task>>();
    let tcb_ptr = match heap.alloc(tcb_layout) {
        Ok(p) => p,
        // Safety: `stack_ptr` was allocated from this same heap above and
        // has not been handed to anyone else yet.
        Err(_) => {
            unsafe { heap.free(stack_ptr.as_ptr()) };
            return None;
        }
    };
    // Safety: `tcb_ptr` is a fresh, exclusively-owned allocation sized
    // and aligned for one `Task`.
    let storage = unsafe { &mut *tcb_ptr.as_ptr().cast::<MaybeUninit<Task>>() };

    let task = Task::new(crate::task::next_user_id(), priority, stack, entry, param, false);
    let task_ref: &'static mut Task = storage.write(task);
    task_ref.mark_dynamic(heap);
    let task_ref: &'static Task = task_ref;
    let id = task_ref.id();
    with_cs(|mut cs| task_ref.spawn(&mut cs));
    Some(id)
}
