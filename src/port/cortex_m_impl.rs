//! The bundled Cortex-M [`Port`] implementation.
//!
//! Grounded in `r3_port_arm_m`'s `threading::imp` module: PRIMASK-based
//! critical sections via the `cortex-m` crate, a synthetic exception frame
//! so a fresh task's first dispatch looks like an ordinary exception
//! return, and PendSV as the "deferred context switch" mechanism. Unlike
//! `r3_port_arm_m`, this is a single concrete implementation (no
//! `PortInstance`/const-generic parameterization) since KrisOS targets one
//! kernel configuration, not a family of them.

use core::mem::MaybeUninit;
use core::slice;

use crate::task::Task;

use super::Port;

pub struct CortexM;

/// EXC_RETURN value selecting: return to Thread mode, non-floating-point
/// state from PSP, execution continues using PSP.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// `xPSR` with only the Thumb-mode bit set - the only legal mode on
/// Arm-M, set here because the exception frame's xPSR is used verbatim on
/// the first dispatch.
const INIT_XPSR: u32 = 0x0100_0000;

/// CONTROL.SPSEL = 1 (use PSP in Thread mode); CONTROL.nPRIV set later per
/// task (bit 0).
const CONTROL_SPSEL: u32 = 0b10;

impl Port for CortexM {
    #[inline(always)]
    unsafe fn disable_interrupts() {
        cortex_m::interrupt::disable();
    }

    #[inline(always)]
    unsafe fn enable_interrupts() {
        // Safety: the caller (`crate::critical`) only calls this to balance
        // a prior `disable_interrupts`, so PRIMASK is known to be masked.
        unsafe { cortex_m::interrupt::enable() };
    }

    #[inline(always)]
    unsafe fn yield_cpu() {
        use core::sync::atomic::{compiler_fence, Ordering};

        // Make prior writes to kernel state visible before the PendSV
        // handler observes them.
        compiler_fence(Ordering::Release);
        cortex_m::peripheral::SCB::set_pendsv();
        // Not required for correctness, but ensures PendSV is taken before
        // the next instruction - otherwise a task-context caller would
        // race ahead past what should be a blocking call.
        cortex_m::asm::dsb();
        compiler_fence(Ordering::Acquire);
    }

    unsafe fn initialize_stack(
        stack: &mut [MaybeUninit<u8>],
        entry: unsafe extern "C" fn(usize),
        param: usize,
        privileged: bool,
    ) -> *mut u8 {
        // Safety: the caller guarantees `stack` is exclusively owned and
        // large enough for the 18-word frame written below (spec §4.5).
        let mut sp = stack
            .as_mut_ptr()
            .wrapping_add(stack.len())
            .cast::<MaybeUninit<u32>>();

        // Hardware exception frame: r0-r3, r12, lr, pc, xpsr.
        sp = sp.wrapping_sub(8);
        let exc_frame = unsafe { slice::from_raw_parts_mut(sp, 8) };
        exc_frame[0] = MaybeUninit::new(param as u32);
        exc_frame[5] = MaybeUninit::new(crate::task::task_exit_trampoline as usize as u32);
        // Clear the Thumb bit: in an exception frame the PC is the exact
        // value, not the BLX-style "bit 0 set" function pointer.
        exc_frame[6] = MaybeUninit::new(entry as usize as u32 & !1);
        exc_frame[7] = MaybeUninit::new(INIT_XPSR);

        // Software-saved context restored by our own PendSV handler:
        // EXC_RETURN, CONTROL, r4-r11.
        sp = sp.wrapping_sub(10);
        let extra_ctx = unsafe { slice::from_raw_parts_mut(sp, 10) };
        extra_ctx[0] = MaybeUninit::new(EXC_RETURN_THREAD_PSP);
        extra_ctx[1] = MaybeUninit::new(CONTROL_SPSEL | if privileged { 0 } else { 1 });

        sp.cast::<u8>()
    }

    fn wait_for_interrupt() {
        cortex_m::asm::wfi();
    }

    fn is_task_context() -> bool {
        // Reading IPSR tells us whether we're in Thread mode (0) or
        // handling an exception (nonzero).
        cortex_m::peripheral::SCB::vect_active()
            == cortex_m::peripheral::scb::VectActive::ThreadMode
    }

    unsafe fn start_first_task(initial_sp: *mut u8) -> ! {
        // Safety: the caller guarantees this runs exactly once, before any
        // task has executed, with `initial_sp` pointing at a frame built by
        // `initialize_stack`.
        unsafe {
            core::arch::asm!(
                "msr psp, {sp}",
                "movs r0, #2",
                "msr control, r0",
                "isb",
                "pop {{r4-r11}}",
                "pop {{r0-r3, r12, lr}}",
                "pop {{lr}}",
                "bx lr",
                sp = in(reg) initial_sp,
                options(noreturn),
            );
        }
    }

    unsafe fn switch_to(_next: &'static Task) {
        // The actual register save/restore happens in the naked `PendSV`
        // handler below, which reads/writes `Task::saved_sp` directly;
        // this hook exists so the architecture-independent scheduler code
        // has a named call site to point to in its own doc comments.
    }
}

/// The deferred context-switch trap (spec §4.5). `sched::schedule` has
/// already decided who runs next and recorded who it's switching away
/// from (`sched::take_outgoing`) by the time this fires; this handler's
/// only job is the mechanical register save/restore, split the same way
/// `initialize_stack` lays out a fresh task's frame - hardware-pushed
/// frame on top, our own `[EXC_RETURN, CONTROL, r4-r11]` block below it.
///
/// Thumb-1 (ARMv6-M) has no `stm`/`ldm` access to r8-r11, hence the
/// `mov`-through-a-low-register shuffling instead of a single block
/// transfer.
#[naked]
#[no_mangle]
pub unsafe extern "C" fn PendSV() {
    unsafe {
        core::arch::asm!(
            "mrs r0, psp",
            "mrs r1, control",
            "mov r2, lr",
            "subs r0, r0, #40",
            "str r2, [r0, #0]",
            "str r1, [r0, #4]",
            "str r4, [r0, #8]",
            "str r5, [r0, #12]",
            "str r6, [r0, #16]",
            "str r7, [r0, #20]",
            "mov r3, r8",
            "str r3, [r0, #24]",
            "mov r3, r9",
            "str r3, [r0, #28]",
            "mov r3, r10",
            "str r3, [r0, #32]",
            "mov r3, r11",
            "str r3, [r0, #36]",
            "push {{lr}}",
            "bl {switch}",
            "ldr r2, [r0, #0]",
            "ldr r1, [r0, #4]",
            "ldr r4, [r0, #8]",
            "ldr r5, [r0, #12]",
            "ldr r6, [r0, #16]",
            "ldr r7, [r0, #20]",
            "ldr r3, [r0, #24]",
            "mov r8, r3",
            "ldr r3, [r0, #28]",
            "mov r9, r3",
            "ldr r3, [r0, #32]",
            "mov r10, r3",
            "ldr r3, [r0, #36]",
            "mov r11, r3",
            "msr control, r1",
            "adds r0, r0, #40",
            "msr psp, r0",
            "isb",
            "mov lr, r2",
            "pop {{pc}}",
            switch = sym pendsv_switch,
            options(noreturn),
        );
    }
}

/// Persist the outgoing task's stack pointer (if there is one left to
/// save - there isn't the very first time `PendSV` fires, since
/// `kernel::start` jumps straight into the first task without going
/// through this trap) and return the incoming task's.
///
/// # Safety
/// Must only be called from the `PendSV` handler above, with `old_sp`
/// pointing at the software-saved-context block it just pushed.
unsafe extern "C" fn pendsv_switch(old_sp: *mut u8) -> *mut u8 {
    crate::klock::with_cs(|mut cs| {
        if let Some(prev) = crate::sched::take_outgoing(&mut cs) {
            prev.set_saved_sp(&mut cs, old_sp);
        }
        let next = crate::sched::running_task(&cs)
            .expect("PendSV fired with no task selected to run");
        next.saved_sp(&cs)
    })
}
