//! The interface between the portable kernel and an architecture port

/// The entry point of a task. The parameter is the opaque value given at
/// creation time.
pub type TaskEntry = fn(usize);

/// Implemented by a port. The portable kernel uses this trait to control the
/// CPU Lock state and to transfer the CPU between tasks.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// The saved machine state of a task or the idle context. The kernel
    /// never looks inside; it only hands references back to the port.
    type TaskState: Send + 'static;

    /// Enter a CPU Lock state.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Leave a CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Enter a CPU Lock state and return `true` if it's not already active.
    /// Return `false` otherwise.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Synthesize the initial machine state of a task whose stack is `stack`.
    ///
    /// When the task is dispatched for the first time it starts executing
    /// `entry(param)`. If `entry` returns, the port must route the control to
    /// [`System::exit_task`](crate::System::exit_task) (or an equivalent)
    /// instead of letting it run off into undefined memory.
    ///
    /// The first two words of `stack` (its lowest addresses) hold the stack
    /// guard and must not be overwritten.
    ///
    /// # Safety
    ///
    /// `stack` must remain valid and must not be accessed by anything other
    /// than the task until the returned state is discarded.
    unsafe fn initialize_task_state(
        stack: &mut [usize],
        entry: TaskEntry,
        param: usize,
    ) -> Self::TaskState;

    /// Stage a context switch from `current` to `next`. `current` is `None`
    /// when no context has been dispatched yet.
    ///
    /// A switch may be staged again before the previous one is performed. The
    /// port must then save the state of the context that is physically
    /// running, which is not necessarily `current`, and resume the last
    /// `next`.
    ///
    /// Precondition: CPU Lock active
    unsafe fn prepare_context_switch(current: Option<&Self::TaskState>, next: &Self::TaskState);

    /// Request the staged context switch to be performed. The switch must be
    /// deferred until CPU Lock is released and no other interrupt handler is
    /// in progress.
    ///
    /// Precondition: CPU Lock active
    unsafe fn trigger_switch();

    /// Transfer the control to the first context. This never returns.
    ///
    /// Precondition: CPU Lock active, a boot context
    unsafe fn dispatch_first_task(first: &Self::TaskState) -> !;

    /// The entry point of the idle context. Implementations call
    /// [`System::idle_step`](crate::System::idle_step) in a loop.
    fn idle_loop(param: usize);

    /// Put the processor to sleep until an interrupt arrives.
    fn wait_for_interrupt();
}

/// Implemented by a port. Provides the periodic tick source.
pub trait PortTimer {
    /// Configure and start the tick source to fire `tick_rate_hz` times per
    /// second. Each tick must call [`System::tick`](crate::System::tick).
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel during initialization.
    unsafe fn init_tick_source(tick_rate_hz: u32);
}

/// Everything the kernel needs from a port.
pub trait Port: PortThreading + PortTimer {}
impl<T: PortThreading + PortTimer> Port for T {}
