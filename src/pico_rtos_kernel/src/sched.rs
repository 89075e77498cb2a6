//! The kernel object and the scheduler
use alloc::{boxed::Box, vec::Vec};

use crate::{
    error::{BadContextError, InitError, StartError},
    memory::{MemoryAccount, MemoryStats, OutOfMemory},
    mutex::{MutexCb, MutexId},
    queue::{QueueCb, QueueId},
    semaphore::{SemaphoreCb, SemaphoreId},
    stats::SystemStats,
    task::{TaskCb, TaskId, TaskSt, TaskStack},
    timeout::Ticks,
    timer::{ExpiredTimers, TimerCb, TimerId},
    utils::pool::Pool,
    wait::{BlockingObjectCb, BlockingObjectId},
    Config, Port, PortThreading,
};

/// The version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The state of the idle context, which runs whenever no task is Ready.
struct IdleCb<P: PortThreading> {
    stack: TaskStack,
    ctx: P::TaskState,
    counter: u32,
    hook: Option<fn()>,
}

/// The complete state of the kernel.
///
/// See [the crate-level documentation](crate) for how this type is meant to
/// be driven.
pub struct Kernel<P: Port> {
    pub(crate) cfg: Config,
    pub(crate) tick_count: Ticks,
    /// Set by [`Self::start`]. Until then, nothing is dispatched.
    pub(crate) running: bool,

    pub(crate) tasks: Pool<TaskId, TaskCb<P>>,
    /// All tasks in creation order
    pub(crate) task_list: Vec<TaskId>,
    /// The task that owns the CPU. `None` means the idle context.
    pub(crate) current: Option<TaskId>,

    pub(crate) objects: Pool<BlockingObjectId, BlockingObjectCb>,
    pub(crate) mutexes: Pool<MutexId, MutexCb>,
    pub(crate) semaphores: Pool<SemaphoreId, SemaphoreCb>,
    pub(crate) queues: Pool<QueueId, QueueCb>,
    pub(crate) timers: Pool<TimerId, TimerCb>,
    /// All timers in creation order
    pub(crate) timer_list: Vec<TimerId>,

    pub(crate) memory: MemoryAccount,
    idle: IdleCb<P>,

    pub(crate) interrupt_nesting: u32,
    /// A reschedule was requested in an interrupt context.
    switch_pending: bool,
}

/// The work left by [`Kernel::tick`] for the caller to do outside CPU Lock.
#[derive(Debug)]
#[must_use = "the expired timers' callbacks must be run"]
pub struct TickOutcome {
    timers: ExpiredTimers,
}

impl TickOutcome {
    /// Get the number of timer callbacks to run.
    pub fn expired_timers(&self) -> usize {
        self.timers.len()
    }

    /// Run the callbacks of the expired timers in creation order.
    pub fn run_timers(self) {
        for (callback, param) in self.timers {
            callback(param);
        }
    }
}

/// Where a stack overflow was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOverflow {
    Task(TaskId),
    Idle,
}

/// The work left by [`Kernel::idle_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleStep {
    /// The idle hook to call, if registered
    pub hook: Option<fn()>,
    /// A stack whose guard words have been overwritten
    pub overflow: Option<StackOverflow>,
}

impl From<OutOfMemory> for InitError {
    fn from(OutOfMemory: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

impl<P: Port> Kernel<P> {
    /// Construct a kernel with no tasks. The scheduler doesn't run until
    /// [`Self::start`] is called.
    pub fn new(cfg: Config) -> Result<Self, InitError> {
        cfg.validate()?;

        // The idle stack isn't counted in the memory statistics
        let mut stack = Vec::new();
        stack
            .try_reserve_exact(cfg.idle_stack_words)
            .map_err(|_| InitError::OutOfMemory)?;
        stack.resize(cfg.idle_stack_words, 0);
        let mut stack = TaskStack::Owned(stack.into_boxed_slice());
        stack.arm_guard();

        // Safety: The stack is owned by `IdleCb`, which outlives the state
        let ctx = unsafe { P::initialize_task_state(stack.as_mut_slice(), P::idle_loop, 0) };

        Ok(Self {
            cfg,
            tick_count: 0,
            running: false,
            tasks: Pool::with_capacity(cfg.max_tasks),
            task_list: Vec::with_capacity(cfg.max_tasks),
            current: None,
            objects: Pool::with_capacity(0),
            mutexes: Pool::with_capacity(0),
            semaphores: Pool::with_capacity(0),
            queues: Pool::with_capacity(0),
            timers: Pool::with_capacity(cfg.max_timers),
            timer_list: Vec::with_capacity(cfg.max_timers),
            memory: MemoryAccount::default(),
            idle: IdleCb {
                stack,
                ctx,
                counter: 0,
                hook: None,
            },
            interrupt_nesting: 0,
            switch_pending: false,
        })
    }

    /// Start the scheduler. Returns the context to dispatch first, which is
    /// the highest-priority Ready task, or the idle context if every task is
    /// suspended.
    pub fn start(&mut self) -> Result<&P::TaskState, StartError> {
        if self.running {
            return Err(StartError::AlreadyRunning);
        }
        if !self
            .task_list
            .iter()
            .any(|&t| self.tasks[t].st != TaskSt::Terminated)
        {
            return Err(StartError::NoTasks);
        }

        self.running = true;
        self.current = self.highest_priority_in(|task_cb| task_cb.st == TaskSt::Ready);
        ktrace!("starting with {:?}", self.current);
        Ok(match self.current {
            Some(task) => {
                let task_cb = &mut self.tasks[task];
                task_cb.st = TaskSt::Running;
                &task_cb.ctx
            }
            None => &self.idle.ctx,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advance the tick counter and process everything that depends on it.
    ///
    /// Expired timers are returned in [`TickOutcome`]; their callbacks must be
    /// run by the caller after leaving CPU Lock.
    pub fn tick(&mut self) -> TickOutcome {
        self.tick_count = self.tick_count.wrapping_add(1);
        let now = self.tick_count;

        if now % self.cfg.cleanup_interval == 0 {
            self.cleanup_terminated_tasks();
        }

        for i in 0..self.task_list.len() {
            let task = self.task_list[i];
            let task_cb = &mut self.tasks[task];
            if task_cb.st != TaskSt::Blocked || !task_cb.deadline.has_elapsed(now) {
                continue;
            }
            if task_cb.blocking_object.is_some() {
                self.time_out_waiter(task);
            } else {
                // Delay
                task_cb.st = TaskSt::Ready;
                task_cb.block_reason = crate::BlockReason::None;
            }
        }

        let timers = self.collect_expired_timers();

        self.reschedule(false);
        TickOutcome { timers }
    }

    /// Transfer the CPU to the highest-priority Ready task if it should
    /// preempt the current one. If `allow_equal` is set, a task with the same
    /// priority as the current one also takes over.
    ///
    /// In an interrupt context, this only marks the reschedule as pending.
    pub(crate) fn reschedule(&mut self, allow_equal: bool) {
        if !self.running {
            return;
        }
        if self.interrupt_nesting > 0 {
            self.switch_pending = true;
            return;
        }

        let prev = self.current;
        let running = prev.filter(|&t| self.tasks[t].st == TaskSt::Running);
        let next = match running {
            Some(cur) => {
                let cur_priority = self.tasks[cur].priority;
                match self.highest_priority_in(|task_cb| task_cb.st == TaskSt::Ready) {
                    Some(cand) if self.tasks[cand].priority > cur_priority => Some(cand),
                    Some(_) if allow_equal => match self.next_peer(cur) {
                        Some(peer) => Some(peer),
                        None => return,
                    },
                    _ => return,
                }
            }
            None => self.highest_priority_in(|task_cb| task_cb.st == TaskSt::Ready),
        };

        if next == prev {
            // `prev` may have left and re-entered Ready without losing the
            // CPU (e.g., suspended and resumed by the same interrupt handler)
            if let Some(task) = next {
                self.tasks[task].st = TaskSt::Running;
            }
            return;
        }

        if let Some(cur) = running {
            self.tasks[cur].st = TaskSt::Ready;
        }
        if let Some(next) = next {
            self.tasks[next].st = TaskSt::Running;
        }
        self.current = next;
        ktrace!("switch {:?} -> {:?}", prev, next);

        let from = match prev {
            Some(task) => &self.tasks[task].ctx,
            None => &self.idle.ctx,
        };
        let to = match next {
            Some(task) => &self.tasks[task].ctx,
            None => &self.idle.ctx,
        };
        // Safety: Only the kernel controls the dispatcher
        unsafe {
            P::prepare_context_switch(Some(from), to);
            P::trigger_switch();
        }
    }

    /// Find the Ready task with the same priority as `cur` that comes next
    /// after `cur` in creation order, wrapping around.
    fn next_peer(&self, cur: TaskId) -> Option<TaskId> {
        let priority = self.tasks[cur].priority;
        let pos = self.task_list.iter().position(|&t| t == cur)?;
        let (before, after) = self.task_list.split_at(pos + 1);
        after.iter().chain(before).cloned().find(|&t| {
            let task_cb = &self.tasks[t];
            task_cb.st == TaskSt::Ready && task_cb.priority == priority
        })
    }

    /// Give up the CPU to another Ready task of the same or higher priority,
    /// if any. Equal-priority tasks take turns in creation order.
    pub fn yield_now(&mut self) {
        self.reschedule(true);
    }

    /// Get the current task if the current context allows blocking.
    pub(crate) fn current_waitable(&self) -> Result<TaskId, BadContextError> {
        if self.interrupt_nesting > 0 {
            return Err(BadContextError::BadContext);
        }
        self.current.ok_or(BadContextError::BadContext)
    }

    /// Mark the beginning of an interrupt handler. Context switches requested
    /// until the matching [`Self::interrupt_exit`] are deferred.
    pub fn interrupt_enter(&mut self) {
        self.interrupt_nesting += 1;
    }

    /// Mark the end of an interrupt handler. Leaving the outermost handler
    /// performs the deferred reschedule.
    pub fn interrupt_exit(&mut self) {
        debug_assert!(self.interrupt_nesting > 0);
        self.interrupt_nesting = self.interrupt_nesting.saturating_sub(1);
        if self.interrupt_nesting == 0 && core::mem::take(&mut self.switch_pending) {
            self.reschedule(false);
        }
    }

    pub fn interrupt_nesting(&self) -> u32 {
        self.interrupt_nesting
    }

    pub fn tick_count(&self) -> Ticks {
        self.tick_count
    }

    /// Get the time elapsed since the kernel was constructed, in
    /// milliseconds.
    pub fn uptime_ms(&self) -> u64 {
        u64::from(self.tick_count) * 1000 / u64::from(self.cfg.tick_rate_hz)
    }

    pub fn tick_rate_hz(&self) -> u32 {
        self.cfg.tick_rate_hz
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn version() -> &'static str {
        VERSION
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.stats()
    }

    /// Allocate a zero-filled buffer that is counted in
    /// [`Self::memory_stats`].
    pub fn tracked_alloc(&mut self, bytes: usize) -> Result<Box<[u8]>, OutOfMemory> {
        self.memory.alloc_zeroed(bytes)
    }

    /// Release a buffer obtained from [`Self::tracked_alloc`].
    pub fn tracked_free(&mut self, buf: Box<[u8]>) {
        self.memory.free(buf);
    }

    /// Get the number of idle iterations so far.
    pub fn idle_counter(&self) -> u32 {
        self.idle.counter
    }

    /// Register a function to call on every idle iteration. `None` removes
    /// the hook.
    pub fn set_idle_hook(&mut self, hook: Option<fn()>) {
        self.idle.hook = hook;
    }

    /// Perform the bookkeeping of one idle iteration.
    pub fn idle_step(&mut self) -> IdleStep {
        self.idle.counter = self.idle.counter.wrapping_add(1);

        let mut overflow = None;
        if cfg!(feature = "stack_check")
            && self.idle.counter % self.cfg.stack_check_interval == 0
        {
            overflow = if !self.idle.stack.is_guard_intact() {
                Some(StackOverflow::Idle)
            } else {
                self.check_stack_overflow().map(StackOverflow::Task)
            };
        }

        IdleStep {
            hook: self.idle.hook,
            overflow,
        }
    }

    /// Find the first task (in creation order) whose stack guard has been
    /// overwritten.
    pub fn check_stack_overflow(&self) -> Option<TaskId> {
        let task = self
            .task_list
            .iter()
            .cloned()
            .find(|&t| !self.tasks[t].stack.is_guard_intact());
        if let Some(task) = task {
            kwarn!("stack overflow in {:?}", task);
        }
        task
    }

    /// Take a snapshot of the kernel counters.
    pub fn system_stats(&self) -> SystemStats {
        let mut stats = SystemStats::default();
        for &task in &self.task_list {
            stats.total_tasks += 1;
            match self.tasks[task].st {
                TaskSt::Ready | TaskSt::Running => stats.ready_tasks += 1,
                TaskSt::Blocked => stats.blocked_tasks += 1,
                TaskSt::Suspended => stats.suspended_tasks += 1,
                TaskSt::Terminated => stats.terminated_tasks += 1,
            }
        }
        let memory = self.memory.stats();
        stats.current_memory = memory.current;
        stats.peak_memory = memory.peak;
        stats.total_allocations = memory.allocations;
        stats.idle_counter = self.idle.counter;
        stats.system_uptime = self.uptime_ms();
        stats
    }
}

impl<P: Port> core::fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("tick_count", &self.tick_count)
            .field("running", &self.running)
            .field("current", &self.current)
            .field("tasks", &self.tasks)
            .field("mutexes", &self.mutexes)
            .field("semaphores", &self.semaphores)
            .field("queues", &self.queues)
            .field("timers", &self.timers)
            .field("interrupt_nesting", &self.interrupt_nesting)
            .finish_non_exhaustive()
    }
}
