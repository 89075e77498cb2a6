//! The task-facing kernel interface
use alloc::boxed::Box;
use core::fmt;

use crate::{
    error::*,
    klock::{self, CpuLockCell},
    memory::{MemoryStats, OutOfMemory},
    stats::SystemStats,
    task::{TaskId, TaskSt},
    timeout::{Ticks, Timeout},
    wait::WaitStart,
    Config, Kernel, MutexId, Port, Priority, QueueId, SemaphoreId, TaskEntry, TimerCallback,
    TimerId,
};

/// A kernel instance that can be placed in a `static`.
///
/// Every method enters CPU Lock, operates on the [`Kernel`], and leaves CPU
/// Lock before returning. Blocking methods leave CPU Lock while the calling
/// task is blocked, which is when the port performs the deferred context
/// switch, and complete the operation when the task is dispatched again.
///
/// # Panics
///
/// All methods except [`Self::init`] and [`Self::is_initialized`] panic if
/// the kernel hasn't been initialized or if CPU Lock is already active.
///
/// # Examples
///
/// ```ignore
/// static SYSTEM: System<MyPort> = System::new();
///
/// fn main() -> ! {
///     SYSTEM.init(Config::DEFAULT).unwrap();
///     SYSTEM.task_create("blinky", blinky, 0, 0, 1).unwrap();
///     SYSTEM.start()
/// }
/// ```
pub struct System<P: Port> {
    kernel: CpuLockCell<P, Option<Kernel<P>>>,
}

impl<P: Port> System<P> {
    pub const fn new() -> Self {
        Self {
            kernel: CpuLockCell::new(None),
        }
    }

    /// Construct the kernel and start the tick source.
    pub fn init(&self, cfg: Config) -> Result<(), InitError> {
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            panic!("CPU Lock is already active");
        };
        let slot = self.kernel.write(&mut *lock);
        if slot.is_some() {
            return Err(InitError::AlreadyInitialized);
        }
        *slot = Some(Kernel::new(cfg)?);
        drop(lock);

        kinfo!("kernel {} initialized: {:?}", crate::VERSION, cfg);

        // Safety: Only the kernel initializes the tick source
        unsafe { P::init_tick_source(cfg.tick_rate_hz) };
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        let Ok(lock) = klock::lock_cpu::<P>() else {
            panic!("CPU Lock is already active");
        };
        self.kernel.read(&*lock).is_some()
    }

    /// Run `f` on the kernel inside CPU Lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel<P>) -> R) -> R {
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            panic!("CPU Lock is already active");
        };
        match self.kernel.write(&mut *lock) {
            Some(kernel) => f(kernel),
            None => panic!("the kernel is not initialized"),
        }
    }

    /// Drive a blocked operation to completion. `resume` is called every
    /// time the task is dispatched again until it reports `Done`.
    fn complete_wait<T, E>(
        &self,
        mut st: WaitStart<T>,
        mut resume: impl FnMut(&mut Kernel<P>) -> Result<WaitStart<T>, E>,
    ) -> Result<T, E> {
        loop {
            match st {
                WaitStart::Done(x) => return Ok(x),
                // CPU Lock was released at the end of the previous call,
                // which is when this task was switched out
                WaitStart::Blocked => st = self.with(&mut resume)?,
            }
        }
    }

    /// Start the scheduler and dispatch the first task.
    ///
    /// # Panics
    ///
    /// This panics if no tasks have been created.
    pub fn start(&self) -> ! {
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            panic!("CPU Lock is already active");
        };
        let Some(kernel) = self.kernel.write(&mut *lock) else {
            panic!("the kernel is not initialized");
        };
        match kernel.start() {
            // Safety: CPU Lock active, and this is the boot context. CPU Lock
            // is released by the port once the first context is running.
            Ok(first) => unsafe { P::dispatch_first_task(first) },
            Err(e) => panic!("cannot start the scheduler: {:?}", e),
        }
    }

    /// The tick handler. Call this from the port's tick interrupt.
    ///
    /// Timer callbacks run after CPU Lock is left.
    pub fn tick(&self) {
        self.with(|k| k.tick()).run_timers();
    }

    pub fn interrupt_enter(&self) {
        self.with(|k| k.interrupt_enter());
    }

    pub fn interrupt_exit(&self) {
        self.with(|k| k.interrupt_exit());
    }

    /// One iteration of the idle context: run the idle hook if there is one,
    /// or sleep until the next interrupt.
    ///
    /// # Panics
    ///
    /// This panics when a stack overflow is detected.
    pub fn idle_step(&self) {
        let step = self.with(|k| k.idle_step());
        if let Some(overflow) = step.overflow {
            kerror!("stack overflow: {:?}", overflow);
            panic!("stack overflow detected in {:?}", overflow);
        }
        match step.hook {
            Some(hook) => hook(),
            None => P::wait_for_interrupt(),
        }
    }

    // Tasks
    // ----------------------------------------------------------------------

    pub fn task_create(
        &self,
        name: &'static str,
        entry: TaskEntry,
        param: usize,
        stack_words: usize,
        priority: Priority,
    ) -> Result<TaskId, CreateTaskError> {
        self.with(|k| k.task_create(name, entry, param, stack_words, priority))
    }

    pub fn task_create_static(
        &self,
        name: &'static str,
        entry: TaskEntry,
        param: usize,
        stack: &'static mut [usize],
        priority: Priority,
    ) -> Result<TaskId, CreateTaskError> {
        self.with(|k| k.task_create_static(name, entry, param, stack, priority))
    }

    pub fn task_delete(&self, task: TaskId) -> Result<(), DeleteTaskError> {
        self.with(|k| k.task_delete(task))
    }

    pub fn task_suspend(&self, task: TaskId) -> Result<(), SuspendTaskError> {
        self.with(|k| k.task_suspend(task))
    }

    pub fn task_resume(&self, task: TaskId) -> Result<(), SuspendTaskError> {
        self.with(|k| k.task_resume(task))
    }

    pub fn task_resume_highest_priority(&self) -> Option<TaskId> {
        self.with(|k| k.task_resume_highest_priority())
    }

    pub fn task_set_priority(
        &self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), SetTaskPriorityError> {
        self.with(|k| k.task_set_priority(task, priority))
    }

    pub fn task_priority(&self, task: TaskId) -> Result<Priority, BadIdError> {
        self.with(|k| k.task_priority(task))
    }

    pub fn task_state(&self, task: TaskId) -> Result<TaskSt, BadIdError> {
        self.with(|k| k.task_state(task))
    }

    pub fn task_name(&self, task: TaskId) -> Result<&'static str, BadIdError> {
        self.with(|k| k.task_name(task))
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.with(|k| k.current_task())
    }

    pub fn yield_now(&self) {
        self.with(|k| k.yield_now());
    }

    /// Block the calling task for `ticks` ticks.
    pub fn delay(&self, ticks: Ticks) -> Result<(), DelayError> {
        let st = self.with(|k| k.delay(ticks))?;
        self.complete_wait(st, |_| Ok(WaitStart::Done(())))
    }

    /// Block the calling task until `*last_wake + period`.
    pub fn delay_until(&self, last_wake: &mut Ticks, period: Ticks) -> Result<(), DelayError> {
        let st = self.with(|k| k.delay_until(last_wake, period))?;
        self.complete_wait(st, |_| Ok(WaitStart::Done(())))
    }

    /// Terminate the calling task. This is where a task returning from its
    /// entry function ends up.
    pub fn exit_task(&self) -> ! {
        if let Err(e) = self.with(|k| k.exit_task()) {
            panic!("exit_task called outside a task: {:?}", e);
        }
        // The switch away from this task happens when CPU Lock is left
        loop {
            P::wait_for_interrupt();
        }
    }

    // Mutexes
    // ----------------------------------------------------------------------

    pub fn mutex_create(&self) -> Result<MutexId, CreateObjectError> {
        self.with(|k| k.mutex_create())
    }

    pub fn mutex_lock(&self, mutex: MutexId, timeout: Timeout) -> Result<(), LockMutexError> {
        let st = self.with(|k| k.mutex_lock(mutex, timeout))?;
        self.complete_wait(st, |k| k.mutex_lock_resume(mutex).map(WaitStart::Done))
    }

    pub fn mutex_try_lock(&self, mutex: MutexId) -> Result<(), LockMutexError> {
        self.with(|k| k.mutex_try_lock(mutex))
    }

    pub fn mutex_unlock(&self, mutex: MutexId) -> Result<(), UnlockMutexError> {
        self.with(|k| k.mutex_unlock(mutex))
    }

    pub fn mutex_owner(&self, mutex: MutexId) -> Result<Option<TaskId>, BadIdError> {
        self.with(|k| k.mutex_owner(mutex))
    }

    pub fn mutex_delete(&self, mutex: MutexId) -> Result<(), BadIdError> {
        self.with(|k| k.mutex_delete(mutex))
    }

    // Semaphores
    // ----------------------------------------------------------------------

    pub fn semaphore_create(
        &self,
        initial: u32,
        max_count: u32,
    ) -> Result<SemaphoreId, CreateObjectError> {
        self.with(|k| k.semaphore_create(initial, max_count))
    }

    pub fn semaphore_give(&self, sem: SemaphoreId) -> Result<(), GiveSemaphoreError> {
        self.with(|k| k.semaphore_give(sem))
    }

    pub fn semaphore_take(&self, sem: SemaphoreId, timeout: Timeout) -> Result<(), TakeSemaphoreError> {
        let st = self.with(|k| k.semaphore_take(sem, timeout))?;
        self.complete_wait(st, |k| k.semaphore_take_resume(sem).map(WaitStart::Done))
    }

    pub fn semaphore_try_take(&self, sem: SemaphoreId) -> Result<(), TakeSemaphoreError> {
        self.with(|k| k.semaphore_try_take(sem))
    }

    pub fn semaphore_count(&self, sem: SemaphoreId) -> Result<u32, BadIdError> {
        self.with(|k| k.semaphore_count(sem))
    }

    pub fn semaphore_is_available(&self, sem: SemaphoreId) -> Result<bool, BadIdError> {
        self.with(|k| k.semaphore_is_available(sem))
    }

    pub fn semaphore_delete(&self, sem: SemaphoreId) -> Result<(), BadIdError> {
        self.with(|k| k.semaphore_delete(sem))
    }

    // Queues
    // ----------------------------------------------------------------------

    pub fn queue_create(&self, item_size: usize, capacity: usize) -> Result<QueueId, CreateObjectError> {
        self.with(|k| k.queue_create(item_size, capacity))
    }

    pub fn queue_send(&self, queue: QueueId, item: &[u8], timeout: Timeout) -> Result<(), QueueError> {
        let st = self.with(|k| k.queue_send(queue, item, timeout))?;
        self.complete_wait(st, |k| k.queue_send_resume(queue, item))
    }

    pub fn queue_receive(
        &self,
        queue: QueueId,
        out: &mut [u8],
        timeout: Timeout,
    ) -> Result<(), QueueError> {
        let st = self.with(|k| k.queue_receive(queue, out, timeout))?;
        self.complete_wait(st, |k| k.queue_receive_resume(queue, out))
    }

    pub fn queue_send_value<T: bytemuck::Pod>(
        &self,
        queue: QueueId,
        value: &T,
        timeout: Timeout,
    ) -> Result<(), QueueError> {
        self.queue_send(queue, bytemuck::bytes_of(value), timeout)
    }

    pub fn queue_receive_value<T: bytemuck::Pod>(
        &self,
        queue: QueueId,
        timeout: Timeout,
    ) -> Result<T, QueueError> {
        let mut value = T::zeroed();
        self.queue_receive(queue, bytemuck::bytes_of_mut(&mut value), timeout)?;
        Ok(value)
    }

    pub fn queue_len(&self, queue: QueueId) -> Result<usize, BadIdError> {
        self.with(|k| k.queue_len(queue))
    }

    pub fn queue_is_empty(&self, queue: QueueId) -> Result<bool, BadIdError> {
        self.with(|k| k.queue_is_empty(queue))
    }

    pub fn queue_is_full(&self, queue: QueueId) -> Result<bool, BadIdError> {
        self.with(|k| k.queue_is_full(queue))
    }

    pub fn queue_delete(&self, queue: QueueId) -> Result<(), BadIdError> {
        self.with(|k| k.queue_delete(queue))
    }

    // Timers
    // ----------------------------------------------------------------------

    pub fn timer_create(
        &self,
        name: &'static str,
        callback: TimerCallback,
        param: usize,
        period: Ticks,
        auto_reload: bool,
    ) -> Result<TimerId, CreateObjectError> {
        self.with(|k| k.timer_create(name, callback, param, period, auto_reload))
    }

    pub fn timer_start(&self, timer: TimerId) -> Result<(), BadIdError> {
        self.with(|k| k.timer_start(timer))
    }

    pub fn timer_stop(&self, timer: TimerId) -> Result<bool, BadIdError> {
        self.with(|k| k.timer_stop(timer))
    }

    pub fn timer_reset(&self, timer: TimerId) -> Result<(), BadIdError> {
        self.with(|k| k.timer_reset(timer))
    }

    pub fn timer_change_period(
        &self,
        timer: TimerId,
        period: Ticks,
    ) -> Result<(), ChangeTimerPeriodError> {
        self.with(|k| k.timer_change_period(timer, period))
    }

    pub fn timer_is_running(&self, timer: TimerId) -> Result<bool, BadIdError> {
        self.with(|k| k.timer_is_running(timer))
    }

    pub fn timer_remaining_time(&self, timer: TimerId) -> Result<Ticks, BadIdError> {
        self.with(|k| k.timer_remaining_time(timer))
    }

    pub fn timer_delete(&self, timer: TimerId) -> Result<(), BadIdError> {
        self.with(|k| k.timer_delete(timer))
    }

    // System services
    // ----------------------------------------------------------------------

    pub fn tick_count(&self) -> Ticks {
        self.with(|k| k.tick_count())
    }

    pub fn uptime_ms(&self) -> u64 {
        self.with(|k| k.uptime_ms())
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.with(|k| k.memory_stats())
    }

    pub fn tracked_alloc(&self, bytes: usize) -> Result<Box<[u8]>, OutOfMemory> {
        self.with(|k| k.tracked_alloc(bytes))
    }

    pub fn tracked_free(&self, buf: Box<[u8]>) {
        self.with(|k| k.tracked_free(buf))
    }

    pub fn system_stats(&self) -> SystemStats {
        self.with(|k| k.system_stats())
    }

    pub fn set_idle_hook(&self, hook: Option<fn()>) {
        self.with(|k| k.set_idle_hook(hook))
    }

    pub fn check_stack_overflow(&self) -> Option<TaskId> {
        self.with(|k| k.check_stack_overflow())
    }
}

impl<P: Port> Default for System<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> fmt::Debug for System<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System").field("kernel", &self.kernel).finish()
    }
}
