use alloc::boxed::Box;
use core::{arch::global_asm, cell::UnsafeCell, fmt, ptr};
use memoffset::offset_of;
use pico_rtos_kernel::{PortThreading, PortTimer, System, TaskEntry};

use crate::{
    frame::{self, InitialFrame},
    SysTickOptions, ThreadingOptions,
};

/// Implemented on a port type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    PortThreading<TaskState = TaskState> + PortTimer + ThreadingOptions + SysTickOptions
{
    /// Get the kernel instance bound to this port.
    fn system() -> &'static System<Self>;
}

/// The state shared with the PendSV handler.
#[repr(C)]
pub struct State {
    /// The saved-SP slot of the context that is physically running, or null
    /// before the first dispatch.
    running: UnsafeCell<*mut u32>,
    /// The saved-SP slot of the context to run after the next PendSV.
    next: UnsafeCell<*mut u32>,
}

impl State {
    const OFFSET_RUNNING: usize = offset_of!(State, running);
    const OFFSET_NEXT: usize = offset_of!(State, next);

    const fn new() -> Self {
        Self {
            running: UnsafeCell::new(ptr::null_mut()),
            next: UnsafeCell::new(ptr::null_mut()),
        }
    }
}

// Safety: The fields are only accessed with interrupts disabled, either
// inside CPU Lock or by PendSV, which masks them itself
unsafe impl Sync for State {}

static PORT_STATE: State = State::new();

/// The saved machine state of a context: the stack pointer it was switched
/// out with. The slot lives on the heap so that its address, which PendSV
/// writes through, stays put while the kernel moves the control block.
pub struct TaskState {
    sp: Box<UnsafeCell<u32>>,
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskState")
            .field("sp", &self.sp.get())
            .finish()
    }
}

#[inline(always)]
pub unsafe fn enter_cpu_lock() {
    // Set `PRIMASK` to `1`
    cortex_m::interrupt::disable();
}

#[inline(always)]
pub unsafe fn leave_cpu_lock() {
    // Set `PRIMASK` to `0`
    unsafe { cortex_m::interrupt::enable() };
}

#[inline(always)]
pub fn is_cpu_lock_active() -> bool {
    cortex_m::register::primask::read().is_inactive()
}

pub unsafe fn initialize_task_state<S: PortInstance>(
    stack: &mut [usize],
    entry: TaskEntry,
    param: usize,
) -> TaskState {
    let base = frame::write_initial_frame(
        stack,
        &InitialFrame {
            param: param as u32,
            entry: entry as usize as u32,
            pc: task_start::<S> as usize as u32,
            lr: task_returned as usize as u32,
        },
    );
    let sp = stack.as_mut_ptr().wrapping_add(base) as u32;
    TaskState {
        sp: Box::new(UnsafeCell::new(sp)),
    }
}

/// Precondition: CPU Lock active
pub unsafe fn prepare_context_switch(_current: Option<&TaskState>, next: &TaskState) {
    // `PORT_STATE.running` is updated by PendSV, not here. When several
    // switches are staged before PendSV runs, the kernel's `current` is
    // already a context that never got the CPU.
    unsafe { *PORT_STATE.next.get() = next.sp.get() };
}

pub fn trigger_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Precondition: CPU Lock active, a boot context
pub unsafe fn dispatch_first_task(first: &TaskState) -> ! {
    // Make sure the linker picks up our `PendSV`
    extern "C" {
        fn PendSV();
    }
    core::hint::black_box(PendSV as unsafe extern "C" fn());

    unsafe {
        *PORT_STATE.running.get() = ptr::null_mut();
        *PORT_STATE.next.get() = first.sp.get();
    }

    // Safety: We are the port, and this is the boot context
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // PendSV must not preempt any other handler
    // Safety: We don't make "priority-based critical sections"
    unsafe {
        peripherals
            .SCB
            .set_priority(cortex_m::peripheral::scb::SystemHandler::PendSV, 0xff);
    }

    // The boot context is discarded here. PendSV finds no running context,
    // so nothing is saved, and the main stack is left to exception handlers.
    cortex_m::peripheral::SCB::set_pendsv();
    unsafe { leave_cpu_lock() };

    loop {
        cortex_m::asm::wfi();
    }
}

pub fn idle_loop<S: PortInstance>() {
    loop {
        S::system().idle_step();
    }
}

pub fn wait_for_interrupt<S: PortInstance>() {
    if S::USE_WFI {
        cortex_m::asm::wfi();
    } else {
        cortex_m::asm::nop();
    }
}

/// The first code every context runs. `r0` and `r1` come from the initial
/// frame.
extern "C" fn task_start<S: PortInstance>(param: usize, entry: usize) -> ! {
    // Safety: `initialize_task_state` put a `TaskEntry` in `r1`
    let entry = unsafe { core::mem::transmute::<usize, TaskEntry>(entry) };
    entry(param);
    S::system().exit_task()
}

extern "C" fn task_returned() -> ! {
    panic!("a context returned from its start routine");
}

// The PendSV handler. Written for Armv6-M, whose `stm`/`ldm` only take
// `r0`-`r7`, and runs unchanged on Armv7-M.
//
//     if running != next:
//         if running is not null:
//             sp = psp - 36
//             *running = sp
//             sp[0..9] = [lr, r4-r11]
//         running = next
//         sp = *next
//         [lr, r4-r11] = sp[0..9]
//         psp = sp + 36
global_asm!(
    "
    .section .text.PendSV, \"ax\", %progbits
    .global PendSV
    .type PendSV, %function
    .thumb_func
PendSV:
    cpsid i
    ldr r0, .Lpend_sv_state
    ldr r1, [r0, #{running}]
    ldr r2, [r0, #{next}]
    cmp r1, r2
    beq .Lpend_sv_return
    cmp r1, #0
    beq .Lpend_sv_restore

    mrs r3, psp
    subs r3, #36
    str r3, [r1]
    mov r1, lr
    stmia r3!, {{r1, r4-r7}}
    mov r4, r8
    mov r5, r9
    mov r6, r10
    mov r7, r11
    stmia r3!, {{r4-r7}}

.Lpend_sv_restore:
    str r2, [r0, #{running}]
    ldr r3, [r2]
    adds r3, #20
    ldmia r3!, {{r4-r7}}
    mov r8, r4
    mov r9, r5
    mov r10, r6
    mov r11, r7
    msr psp, r3
    subs r3, #36
    ldmia r3!, {{r1, r4-r7}}
    mov lr, r1

.Lpend_sv_return:
    cpsie i
    bx lr

    .align 2
.Lpend_sv_state:
    .word {state}
    .size PendSV, . - PendSV
    ",
    state = sym PORT_STATE,
    running = const State::OFFSET_RUNNING,
    next = const State::OFFSET_NEXT,
);
