//! Task state machine (spec §3 "States").

/// A task's scheduling state. Exactly one task has state `Running` at a
/// time; see `sched::Scheduler` invariant 1 in spec §8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// In the ready queue, waiting for the CPU.
    Ready,
    /// Currently executing; also sits at the head of the ready queue.
    Running,
    /// In the timeout list with a wake deadline; not waiting on any object.
    Sleeping,
    /// In a mutex's waiter list.
    MutexWait,
    /// In a semaphore's waiter list.
    SemWait,
    /// Transient: mid-teardown, about to be deallocated.
    Removed,
}

/// What a blocked task is waiting on - the sum type `spec.md` §9's REDESIGN
/// FLAGS table asks for in place of an untyped `waitingObj` pointer.
#[derive(Clone, Copy)]
pub(crate) enum WaitObject {
    None,
    Mutex(&'static crate::mutex::Mutex),
    Semaphore(&'static crate::semaphore::Semaphore),
}

impl core::fmt::Debug for WaitObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WaitObject::None => f.write_str("None"),
            WaitObject::Mutex(m) => write!(f, "Mutex({:p})", *m),
            WaitObject::Semaphore(s) => write!(f, "Semaphore({:p})", *s),
        }
    }
}
