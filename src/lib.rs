//! KrisOS: a small preemptive, priority-based real-time kernel for
//! single-core Cortex-M-class microcontrollers.
//!
//! The pieces, in the order a task's life touches them: [`task`] (the
//! schedulable unit) is admitted by [`kernel::init`]/[`trap`]'s task-create
//! selectors into [`sched`] (the ready queue and tick-driven wakeups),
//! synchronizes with others through [`mutex`] (priority inheritance),
//! [`semaphore`], and [`queue`] (a bounded FIFO built on two semaphores),
//! and draws memory from [`heap`] (a fixed-capacity first-fit allocator).
//! [`critical`]/[`klock`] are the locking discipline everything else is
//! built on; [`port`] is the hardware boundary a board crate fills in.
//!
//! Grounded throughout in `r3_kernel`/`r3_port_arm_m`'s module split
//! between architecture-independent scheduling logic and a narrow `Port`
//! trait for the one thing that's genuinely hardware-specific (see each
//! module's own doc comment for its specific source).
#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    all(target_os = "none", feature = "cortex-m-port"),
    feature(naked_functions)
)]

pub mod critical;
pub mod error;
pub mod heap;
mod idle;
pub mod kernel;
pub(crate) mod klock;
pub(crate) mod list;
pub mod mutex;
pub mod port;
pub mod queue;
pub(crate) mod sched;
pub mod semaphore;
pub(crate) mod state;
pub mod task;
pub mod time;
pub mod trap;

pub use error::{HeapError, MutexError, QueueError, SemaphoreError, TaskError};
pub use heap::Heap;
pub use mutex::Mutex;
pub use queue::Queue;
pub use semaphore::Semaphore;
pub use task::{EntryPoint, Priority, Task, TaskId, IDLE_PRIORITY};
pub use time::Ticks;

#[cfg(test)]
mod tests {
    //! End-to-end scheduling scenarios (spec §8), run against
    //! [`crate::port::mock`] since there is no real Cortex-M target to
    //! execute a context switch on.
    //!
    //! `sched`'s ready/timeout queues and "currently running task" are
    //! process-wide singletons (krisos has exactly one kernel instance per
    //! program, by design - see `port.rs`), so unlike most Rust test
    //! suites these scenarios cannot be split across independent `#[test]`
    //! functions without one polluting the next's state (and racing it,
    //! since `cargo test` runs functions on separate threads while the
    //! mock port's critical section only tracks a nesting depth, not real
    //! mutual exclusion). A single sequential walk through the scenarios
    //! keeps this test suite honest about that constraint, the way a real
    //! target's kernel test suite runs one flashed image at a time.

    use core::mem::MaybeUninit;

    use crate::klock::with_cs;
    use crate::mutex::Mutex;
    use crate::port::mock::MockPort;
    use crate::sched;
    use crate::semaphore::Semaphore;
    use crate::state::TaskSt;
    use crate::task::{next_user_id, Task};

    unsafe extern "C" fn noop_entry(_param: usize) {}

    /// Build and admit a task at `priority`, backed by freshly leaked stack
    /// storage. Tests only ever need a handful of these, and never free
    /// them, so leaking is simplest.
    fn spawn_task(priority: u8) -> &'static Task {
        let stack: &'static mut [MaybeUninit<u8>] =
            Box::leak(vec![MaybeUninit::uninit(); 64].into_boxed_slice());
        let task = Box::leak(Box::new(Task::new(
            next_user_id(),
            priority,
            stack,
            noop_entry,
            0,
            false,
        )));
        with_cs(|mut cs| task.spawn(&mut cs));
        task
    }

    #[test]
    fn scheduler_scenarios() {
        let _ = env_logger::builder().is_test(true).try_init();
        MockPort::reset();
        static M: Mutex = Mutex::new();
        static S: Semaphore = Semaphore::new(0);

        // Scenario A: among ready tasks, the highest-priority one always
        // runs.
        let owner = spawn_task(200);
        let waiter = spawn_task(10);
        with_cs(|cs| {
            assert_eq!(sched::running_task(&cs).map(Task::id), Some(owner.id()));
        });

        // Scenario B: blocking `waiter` on a mutex `owner` holds boosts
        // `owner`'s effective priority to `waiter`'s and hands it the CPU.
        with_cs(|mut cs| {
            M.try_lock(owner, &mut cs).unwrap();
            let _ = M.lock(waiter, &mut cs);
            assert_eq!(owner.priority(&cs), waiter.base_priority(&cs));
            assert_eq!(sched::running_task(&cs).map(Task::id), Some(owner.id()));
            assert_eq!(waiter.state(&cs), TaskSt::MutexWait);
        });

        // Scenario C: releasing the mutex hands it straight to `waiter`
        // and restores `owner`'s priority.
        with_cs(|mut cs| {
            M.unlock(owner, &mut cs).unwrap();
            assert_eq!(owner.priority(&cs), owner.base_priority(&cs));
            assert_eq!(waiter.state(&cs), TaskSt::Running);
            assert_eq!(sched::running_task(&cs).map(Task::id), Some(waiter.id()));
        });

        // Scenario D: `try_lock` is idempotent for the current owner
        // (Open Question 3).
        with_cs(|mut cs| {
            assert!(M.try_lock(waiter, &mut cs).is_ok());
        });
        with_cs(|mut cs| {
            M.unlock(waiter, &mut cs).unwrap();
        });

        // Scenario E: a timed semaphore wait that elapses reports a
        // timeout and cleanly detaches from the semaphore's waiter list
        // (Open Question 2), rather than corrupting it.
        with_cs(|mut cs| {
            assert!(S.acquire_timeout(waiter, &mut cs, crate::time::Ticks(3)).is_err());
        });
        // `waiter` is blocked with a 3-tick deadline; advance the clock
        // past it without anyone releasing `S`.
        with_cs(|mut cs| {
            for _ in 0..5 {
                sched::on_tick(&mut cs);
            }
        });
        with_cs(|mut cs| {
            assert!(*waiter.timed_out.read(&cs));
            assert_eq!(waiter.state(&cs), TaskSt::Running);
            assert!(S.try_acquire(&mut cs).is_err());
        });

        // Scenario F: releasing a semaphore with no waiters just
        // increments its count.
        with_cs(|mut cs| {
            S.release(&mut cs);
            assert_eq!(S.count(&cs), 1);
            assert!(S.try_acquire(&mut cs).is_ok());
        });

        // Scenario G (spec §8 Scenario B): a task's timed sleep wakes it at
        // exactly its deadline - neither the tick before nor any tick after.
        let sleeper = spawn_task(1);
        with_cs(|mut cs| {
            // `spawn` alone never preempts a task that's already running
            // (see Scenario A); force the scheduler to notice `sleeper`
            // now outranks everything else before putting it to sleep.
            sched::schedule(&mut cs);
            assert_eq!(sched::running_task(&cs).map(Task::id), Some(sleeper.id()));
        });
        let wake_at = with_cs(|cs| sched::current_tick(&cs).saturating_add(crate::time::Ticks(50)));
        with_cs(|mut cs| {
            sched::sleep_until(&mut cs, sleeper, wake_at);
            assert_eq!(sleeper.state(&cs), TaskSt::Sleeping);
            assert_ne!(sched::running_task(&cs).map(Task::id), Some(sleeper.id()));
        });
        with_cs(|mut cs| {
            for _ in 0..49 {
                sched::on_tick(&mut cs);
            }
            assert_eq!(sleeper.state(&cs), TaskSt::Sleeping);
        });
        with_cs(|mut cs| {
            sched::on_tick(&mut cs);
            assert_eq!(sched::current_tick(&cs), wake_at);
            // `sleeper` outranks every other task still alive, so waking it
            // also hands it the CPU straight away.
            assert_eq!(sleeper.state(&cs), TaskSt::Running);
            assert_eq!(sched::running_task(&cs).map(Task::id), Some(sleeper.id()));
        });
    }
}
