//! Tasks
use alloc::boxed::Box;
use core::fmt;

use crate::{
    error::{
        CreateTaskError, DelayError, DeleteTaskError, ExitTaskError, SetTaskPriorityError,
        SuspendTaskError,
    },
    memory::OutOfMemory,
    timeout::{time_reached, Deadline, Ticks, Timeout},
    wait::{BlockingObjectId, WaitLink, WaitOutcome, WaitStart},
    BadIdError, Kernel, Port, PortThreading, Priority, TaskEntry,
};

define_id! {
    /// Identifies a task. Identifiers of deleted tasks are never reused.
    pub struct TaskId;
}

/// The value written to the two lowest words of every task stack. The stack
/// grows downwards, so an overflow overwrites these first.
pub const STACK_GUARD: usize = 0xDEAD_BEEF;

/// The smallest stack accepted by [`Kernel::task_create`], in words. This
/// covers the guard words, the initial exception frame, and a little margin.
pub const MIN_STACK_WORDS: usize = 32;

/// Task state machine
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                .-------.   resume    .-----------.
///    .---------->| Ready |<------------| Suspended |
///    |           '-------'             '-----------'
///    |      dispatch | ^                     ^
///    |               | |                     | suspend
///    | unblock,      v | preempt, yield      |
///    | timeout   .---------.-----------------'
///    |           | Running |
/// .---------.    '---------'
/// | Blocked |<-----'   |
/// '---------'  block   | exit, delete
///                      v
///               .------------.
///               | Terminated |
///               '------------'
/// ```
)]
///
/// </center>
///
/// `Terminated` is absorbing. A terminated task keeps its identifier until
/// it's reclaimed by [`Kernel::cleanup_terminated_tasks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSt {
    Ready,
    /// The task owns the CPU. At most one task is in this state.
    Running,
    /// The task is waiting for a delay to elapse or for a blocking object.
    Blocked,
    Suspended,
    Terminated,
}

/// The reason a task entered the Blocked state.
///
/// When a wait on a blocking object ends because of its deadline, the reason
/// is left in place until the waiting operation observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    None,
    Delay,
    Mutex,
    Semaphore,
    QueueFull,
    QueueEmpty,
    /// A wait on a bare blocking object
    /// ([`Kernel::blocking_object_block`]).
    Other,
}

/// The stack region of a task.
pub(crate) enum TaskStack {
    /// Allocated by the kernel through tracked allocation
    Owned(Box<[usize]>),
    /// Provided by the application
    Static(&'static mut [usize]),
}

impl TaskStack {
    pub(crate) fn as_mut_slice(&mut self) -> &mut [usize] {
        match self {
            Self::Owned(x) => x,
            Self::Static(x) => x,
        }
    }

    fn as_slice(&self) -> &[usize] {
        match self {
            Self::Owned(x) => x,
            Self::Static(x) => x,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Write the guard words.
    pub(crate) fn arm_guard(&mut self) {
        let stack = self.as_mut_slice();
        stack[0] = STACK_GUARD;
        stack[1] = STACK_GUARD;
    }

    /// Return `false` if a guard word has been overwritten.
    pub(crate) fn is_guard_intact(&self) -> bool {
        match self.as_slice() {
            [a, b, ..] => *a == STACK_GUARD && *b == STACK_GUARD,
            _ => false,
        }
    }
}

impl fmt::Debug for TaskStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(x) => write!(f, "Owned({} words)", x.len()),
            Self::Static(x) => write!(f, "Static({} words)", x.len()),
        }
    }
}

/// *Task control block* - the state data of a task.
pub(crate) struct TaskCb<P: PortThreading> {
    pub(crate) name: &'static str,
    pub(crate) entry: TaskEntry,
    pub(crate) param: usize,
    pub(crate) stack: TaskStack,

    /// The port-specific saved context.
    pub(crate) ctx: P::TaskState,

    /// The task's effective priority. It's never lower than
    /// `original_priority` and may be temporarily elevated by priority
    /// inheritance.
    pub(crate) priority: Priority,

    /// The priority assigned at creation or by [`Kernel::task_set_priority`].
    pub(crate) original_priority: Priority,

    pub(crate) st: TaskSt,
    pub(crate) block_reason: BlockReason,

    /// The blocking object whose wait list contains this task.
    pub(crate) blocking_object: Option<BlockingObjectId>,

    /// Links to the neighbors in the wait list of `blocking_object`.
    pub(crate) wait_link: WaitLink,

    /// When the current wait ends regardless of the resource.
    pub(crate) deadline: Deadline,

    /// Why the last wait ended. Taken by the resuming operation.
    pub(crate) wait_outcome: Option<WaitOutcome>,

    /// The wait list this task was granted from and the reason it was
    /// waiting, until the resuming operation consumes the grant.
    pub(crate) pending_grant: Option<(BlockingObjectId, BlockReason)>,

    /// The tick at which the task was terminated.
    pub(crate) terminated_at: Ticks,
}

impl<P: PortThreading> fmt::Debug for TaskCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("param", &self.param)
            .field("stack", &self.stack)
            .field("priority", &self.priority)
            .field("original_priority", &self.original_priority)
            .field("st", &self.st)
            .field("block_reason", &self.block_reason)
            .field("blocking_object", &self.blocking_object)
            .field("deadline", &self.deadline)
            .field("wait_outcome", &self.wait_outcome)
            .field("pending_grant", &self.pending_grant)
            .finish_non_exhaustive()
    }
}

impl From<OutOfMemory> for CreateTaskError {
    fn from(OutOfMemory: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

/// Task management
impl<P: Port> Kernel<P> {
    /// Create a task with a kernel-allocated stack of `stack_words` words
    /// (or [`Config::default_stack_words`] if zero).
    ///
    /// The task becomes Ready immediately. If the scheduler is running and
    /// the new task has a higher priority than the current one, the current
    /// task is preempted.
    ///
    /// [`Config::default_stack_words`]: crate::Config::default_stack_words
    pub fn task_create(
        &mut self,
        name: &'static str,
        entry: TaskEntry,
        param: usize,
        stack_words: usize,
        priority: Priority,
    ) -> Result<TaskId, CreateTaskError> {
        let stack_words = if stack_words == 0 {
            self.cfg.default_stack_words
        } else {
            stack_words
        };
        self.check_task_creation(stack_words)?;
        let stack = self.memory.alloc_zeroed::<usize>(stack_words)?;
        Ok(self.add_task(name, entry, param, TaskStack::Owned(stack), priority))
    }

    /// Create a task that runs on a stack provided by the caller. The stack
    /// is never released by the kernel.
    pub fn task_create_static(
        &mut self,
        name: &'static str,
        entry: TaskEntry,
        param: usize,
        stack: &'static mut [usize],
        priority: Priority,
    ) -> Result<TaskId, CreateTaskError> {
        self.check_task_creation(stack.len())?;
        Ok(self.add_task(name, entry, param, TaskStack::Static(stack), priority))
    }

    fn check_task_creation(&self, stack_words: usize) -> Result<(), CreateTaskError> {
        if self.interrupt_nesting > 0 {
            return Err(CreateTaskError::BadContext);
        }
        if stack_words < MIN_STACK_WORDS {
            return Err(CreateTaskError::StackTooSmall);
        }
        if self.tasks.len() >= self.cfg.max_tasks {
            return Err(CreateTaskError::LimitExceeded);
        }
        Ok(())
    }

    fn add_task(
        &mut self,
        name: &'static str,
        entry: TaskEntry,
        param: usize,
        mut stack: TaskStack,
        priority: Priority,
    ) -> TaskId {
        stack.arm_guard();

        // Safety: The stack is owned by the task control block, which
        //         outlives the task state
        let ctx = unsafe { P::initialize_task_state(stack.as_mut_slice(), entry, param) };

        let task = self.tasks.insert(TaskCb {
            name,
            entry,
            param,
            stack,
            ctx,
            priority,
            original_priority: priority,
            st: TaskSt::Ready,
            block_reason: BlockReason::None,
            blocking_object: None,
            wait_link: WaitLink::default(),
            deadline: Deadline::Never,
            wait_outcome: None,
            pending_grant: None,
            terminated_at: 0,
        });
        self.task_list.push(task);
        ktrace!("created task {:?} ({:?}) with priority {}", task, name, priority);

        self.reschedule(false);
        task
    }

    /// Terminate a task.
    ///
    /// The task leaves any wait list it's in, and mutexes it owns are handed
    /// to their next waiters. Its kernel-owned stack is released when
    /// the control block is reclaimed by [`Self::cleanup_terminated_tasks`];
    /// the stack might still be in use by a context switch that is in flight.
    pub fn task_delete(&mut self, task: TaskId) -> Result<(), DeleteTaskError> {
        let task_cb = self.tasks.get(task).ok_or(DeleteTaskError::BadId)?;
        if task_cb.st == TaskSt::Terminated {
            return Err(DeleteTaskError::BadObjectState);
        }

        self.detach_waiter(task);
        self.abandon_mutexes(task);
        self.forward_pending_grant(task, true);

        let now = self.tick_count;
        let task_cb = &mut self.tasks[task];
        task_cb.st = TaskSt::Terminated;
        task_cb.block_reason = BlockReason::None;
        task_cb.wait_outcome = None;
        task_cb.pending_grant = None;
        task_cb.terminated_at = now;
        ktrace!("terminated task {:?}", task);

        self.reschedule(false);
        Ok(())
    }

    /// Terminate the calling task. This is what a task returning from its
    /// entry function ends up calling.
    pub fn exit_task(&mut self) -> Result<(), ExitTaskError> {
        let task = self
            .current_waitable()
            .map_err(|_| ExitTaskError::BadContext)?;
        self.task_delete(task)
            .map_err(|_| ExitTaskError::BadContext)
    }

    /// Suspend a task. A Blocked task leaves its wait list, and the wait
    /// ends as if it timed out.
    pub fn task_suspend(&mut self, task: TaskId) -> Result<(), SuspendTaskError> {
        let st = self.tasks.get(task).ok_or(SuspendTaskError::BadId)?.st;
        match st {
            TaskSt::Ready | TaskSt::Running => self.forward_pending_grant(task, false),
            TaskSt::Blocked => {
                if self.tasks[task].blocking_object.is_some() {
                    self.detach_waiter(task);
                    self.tasks[task].wait_outcome = Some(WaitOutcome::TimedOut);
                } else {
                    self.tasks[task].block_reason = BlockReason::None;
                }
            }
            TaskSt::Suspended | TaskSt::Terminated => {
                return Err(SuspendTaskError::BadObjectState)
            }
        }

        self.tasks[task].st = TaskSt::Suspended;
        self.reschedule(false);
        Ok(())
    }

    /// Make a Suspended task Ready again.
    pub fn task_resume(&mut self, task: TaskId) -> Result<(), SuspendTaskError> {
        let task_cb = self.tasks.get_mut(task).ok_or(SuspendTaskError::BadId)?;
        if task_cb.st != TaskSt::Suspended {
            return Err(SuspendTaskError::BadObjectState);
        }
        task_cb.st = TaskSt::Ready;
        self.reschedule(false);
        Ok(())
    }

    /// Resume the highest-priority Suspended task, if any.
    pub fn task_resume_highest_priority(&mut self) -> Option<TaskId> {
        let task = self.highest_priority_in(|task_cb| task_cb.st == TaskSt::Suspended)?;
        self.task_resume(task).ok()?;
        Some(task)
    }

    /// Change the priority assigned to a task.
    ///
    /// The effective priority becomes the new value or the priority
    /// inherited through owned mutexes, whichever is higher.
    pub fn task_set_priority(
        &mut self,
        task: TaskId,
        priority: Priority,
    ) -> Result<(), SetTaskPriorityError> {
        let task_cb = self.tasks.get_mut(task).ok_or(SetTaskPriorityError::BadId)?;
        if task_cb.st == TaskSt::Terminated {
            return Err(SetTaskPriorityError::BadObjectState);
        }
        task_cb.original_priority = priority;
        self.update_effective_priority(task);
        self.reschedule(false);
        Ok(())
    }

    /// Get a task's effective priority.
    pub fn task_priority(&self, task: TaskId) -> Result<Priority, BadIdError> {
        Ok(self.task_cb(task)?.priority)
    }

    /// Get the priority a task returns to when it holds no contended mutexes.
    pub fn task_original_priority(&self, task: TaskId) -> Result<Priority, BadIdError> {
        Ok(self.task_cb(task)?.original_priority)
    }

    pub fn task_state(&self, task: TaskId) -> Result<TaskSt, BadIdError> {
        Ok(self.task_cb(task)?.st)
    }

    pub fn task_name(&self, task: TaskId) -> Result<&'static str, BadIdError> {
        Ok(self.task_cb(task)?.name)
    }

    pub fn task_block_reason(&self, task: TaskId) -> Result<BlockReason, BadIdError> {
        Ok(self.task_cb(task)?.block_reason)
    }

    /// Get the size of a task's stack in words.
    pub fn task_stack_words(&self, task: TaskId) -> Result<usize, BadIdError> {
        Ok(self.task_cb(task)?.stack.len())
    }

    /// Get the task that owns the CPU, or `None` if the CPU is idle or the
    /// scheduler hasn't started.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    /// Iterate over all tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.task_list.iter().cloned()
    }

    /// Get the task created right after `task`.
    pub fn next_task(&self, task: TaskId) -> Option<TaskId> {
        let i = self.task_list.iter().position(|&t| t == task)?;
        self.task_list.get(i + 1).cloned()
    }

    /// Block the calling task for `ticks` ticks. Zero is equivalent to
    /// [`Self::yield_now`].
    pub fn delay(&mut self, ticks: Ticks) -> Result<WaitStart<()>, DelayError> {
        let task = self.current_waitable()?;
        if ticks == 0 {
            self.yield_now();
            return Ok(WaitStart::Done(()));
        }
        let deadline =
            Deadline::after(self.tick_count, Timeout::Ticks(ticks)).ok_or(DelayError::BadParam)?;
        self.sleep_until(task, deadline);
        Ok(WaitStart::Blocked)
    }

    /// Block the calling task until `*last_wake + period`, then advance
    /// `*last_wake` by `period`. If the point has passed already, return
    /// without blocking.
    pub fn delay_until(
        &mut self,
        last_wake: &mut Ticks,
        period: Ticks,
    ) -> Result<WaitStart<()>, DelayError> {
        let task = self.current_waitable()?;
        if period > crate::timeout::MAX_DURATION {
            return Err(DelayError::BadParam);
        }
        let target = last_wake.wrapping_add(period);
        *last_wake = target;
        if time_reached(self.tick_count, target) {
            return Ok(WaitStart::Done(()));
        }
        self.sleep_until(task, Deadline::At(target));
        Ok(WaitStart::Blocked)
    }

    fn sleep_until(&mut self, task: TaskId, deadline: Deadline) {
        let task_cb = &mut self.tasks[task];
        task_cb.st = TaskSt::Blocked;
        task_cb.block_reason = BlockReason::Delay;
        task_cb.deadline = deadline;
        task_cb.wait_outcome = None;
        self.reschedule(false);
    }

    pub(crate) fn task_cb(&self, task: TaskId) -> Result<&TaskCb<P>, BadIdError> {
        self.tasks.get(task).ok_or(BadIdError::BadId)
    }

    /// Find the highest-priority task satisfying `pred`. Ties are broken by
    /// creation order.
    pub(crate) fn highest_priority_in(
        &self,
        mut pred: impl FnMut(&TaskCb<P>) -> bool,
    ) -> Option<TaskId> {
        let mut best: Option<(TaskId, Priority)> = None;
        for &task in &self.task_list {
            let task_cb = &self.tasks[task];
            if pred(task_cb) && best.map_or(true, |(_, p)| task_cb.priority > p) {
                best = Some((task, task_cb.priority));
            }
        }
        best.map(|(task, _)| task)
    }

    /// Recalculate a task's effective priority from its original priority
    /// and the waiters of the mutexes it owns.
    pub(crate) fn update_effective_priority(&mut self, task: TaskId) {
        let inherited = self.inherited_priority(task);
        let task_cb = &self.tasks[task];
        let new_priority = match inherited {
            Some(p) => p.max(task_cb.original_priority),
            None => task_cb.original_priority,
        };
        self.set_effective_priority(task, new_priority);
    }

    /// Change a task's effective priority and keep the wait list it's in
    /// sorted.
    pub(crate) fn set_effective_priority(&mut self, task: TaskId, priority: Priority) {
        let task_cb = &mut self.tasks[task];
        if task_cb.priority == priority {
            return;
        }
        ktrace!(
            "priority of {:?}: {} -> {}",
            task,
            task_cb.priority,
            priority
        );
        task_cb.priority = priority;
        if let Some(obj) = task_cb.blocking_object {
            let reason = task_cb.block_reason;
            self.reorder_waiter(task);
            if reason == BlockReason::Mutex {
                self.mutex_wait_list_changed(obj);
            }
        }
    }

    /// Pass on a grant that `task` received but hasn't consumed yet because
    /// it's being suspended or terminated.
    ///
    /// A queue wakeup goes to the next waiter of the same list. A semaphore
    /// token is returned only on termination; a suspended task keeps it.
    /// Mutexes are released by [`Self::abandon_mutexes`].
    fn forward_pending_grant(&mut self, task: TaskId, terminating: bool) {
        let Some((obj, reason)) = self.tasks[task].pending_grant else {
            return;
        };
        match reason {
            BlockReason::QueueEmpty | BlockReason::QueueFull => {
                self.tasks[task].pending_grant = None;
                if self.objects.contains(obj) {
                    if let Some(next) = self.wake_highest(obj) {
                        ktrace!("wakeup of {:?} forwarded to {:?}", task, next);
                    }
                }
            }
            BlockReason::Semaphore if terminating => {
                self.tasks[task].pending_grant = None;
                self.semaphore_token_returned(obj);
            }
            _ => {}
        }
    }

    /// Reclaim the control blocks of terminated tasks and release their
    /// kernel-owned stacks. Returns the number of reclaimed tasks.
    ///
    /// A task terminated during the current tick is skipped because a
    /// context switch away from it might not have completed yet.
    pub fn cleanup_terminated_tasks(&mut self) -> usize {
        let now = self.tick_count;
        let mut reclaimed = 0;
        let mut i = 0;
        while i < self.task_list.len() {
            let task = self.task_list[i];
            let task_cb = &self.tasks[task];
            if task_cb.st != TaskSt::Terminated
                || task_cb.terminated_at == now
                || self.current == Some(task)
            {
                i += 1;
                continue;
            }

            self.task_list.remove(i);
            if let Some(task_cb) = self.tasks.remove(task) {
                if let TaskStack::Owned(stack) = task_cb.stack {
                    self.memory.free(stack);
                }
            }
            ktrace!("reclaimed task {:?}", task);
            reclaimed += 1;
        }
        reclaimed
    }
}
