/// The configuration of the port.
pub trait ThreadingOptions {
    /// Enables the use of the `wfi` instruction in the idle context to save
    /// power. Defaults to `true`.
    const USE_WFI: bool = true;
}

/// Instantiate the port.
///
/// This defines a port type and a `static` [`System`] bound to it, and
/// installs the `PendSV` and `SysTick` exception handlers. You must implement
/// [`ThreadingOptions`] and [`SysTickOptions`] on the port type.
///
/// [`System`]: pico_rtos_kernel::System
/// [`SysTickOptions`]: crate::SysTickOptions
///
/// ```rust,ignore
/// pico_rtos_port_arm_m::use_port!(unsafe pub struct Port; pub static SYSTEM;);
/// ```
///
/// # Safety
///
///  - The target must really be a bare-metal Arm-M environment.
///  - The vector table must be provided by `cortex-m-rt`, which routes the
///    `PendSV` and `SysTick` exceptions to the symbols of the same names.
///  - You shouldn't interfere with the port's operations. For example, you
///    shouldn't manually modify `PRIMASK`, `CONTROL`, or the priority of
///    PendSV unless you know what you are doing.
///  - Other interrupt handlers that call into the kernel must bracket their
///    bodies with `System::interrupt_enter` and `System::interrupt_exit`.
///
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $port:ident; $svis:vis static $system:ident;) => {
        $vis struct $port;

        $svis static $system: $crate::pico_rtos_kernel::System<$port> =
            $crate::pico_rtos_kernel::System::new();

        const _: () = {
            use $crate::pico_rtos_kernel::{PortThreading, PortTimer, System, TaskEntry};
            use $crate::threading::imp::{self, PortInstance, TaskState};
            use $crate::systick::imp as systick_imp;

            // Safety: Only `use_port!` is allowed to `impl` this
            unsafe impl PortInstance for $port {
                #[inline(always)]
                fn system() -> &'static System<Self> {
                    &$system
                }
            }

            unsafe impl PortThreading for $port {
                type TaskState = TaskState;

                #[inline(always)]
                unsafe fn enter_cpu_lock() {
                    unsafe { imp::enter_cpu_lock() }
                }

                #[inline(always)]
                unsafe fn leave_cpu_lock() {
                    unsafe { imp::leave_cpu_lock() }
                }

                #[inline(always)]
                fn is_cpu_lock_active() -> bool {
                    imp::is_cpu_lock_active()
                }

                unsafe fn initialize_task_state(
                    stack: &mut [usize],
                    entry: TaskEntry,
                    param: usize,
                ) -> TaskState {
                    unsafe { imp::initialize_task_state::<Self>(stack, entry, param) }
                }

                unsafe fn prepare_context_switch(
                    current: Option<&TaskState>,
                    next: &TaskState,
                ) {
                    unsafe { imp::prepare_context_switch(current, next) }
                }

                unsafe fn trigger_switch() {
                    imp::trigger_switch()
                }

                unsafe fn dispatch_first_task(first: &TaskState) -> ! {
                    unsafe { imp::dispatch_first_task(first) }
                }

                fn idle_loop(_param: usize) {
                    imp::idle_loop::<Self>()
                }

                fn wait_for_interrupt() {
                    imp::wait_for_interrupt::<Self>()
                }
            }

            impl PortTimer for $port {
                unsafe fn init_tick_source(tick_rate_hz: u32) {
                    unsafe { systick_imp::init::<Self>(tick_rate_hz) }
                }
            }

            #[no_mangle]
            extern "C" fn SysTick() {
                systick_imp::handle_tick::<$port>()
            }
        };
    };
}
