//! Blocking objects: priority-ordered wait lists shared by all
//! synchronization primitives
//!
//! A blocking object is a doubly linked list threaded through the task
//! control blocks. The list is kept sorted by descending effective priority,
//! so the most eligible waiter is always at the head. Tasks of equal
//! priority are kept in arrival order.
use core::iter;

use crate::{
    error::{BadIdError, BlockError, CreateObjectError},
    task::{BlockReason, TaskCb, TaskId, TaskSt},
    timeout::{Deadline, Timeout},
    utils::pool::Pool,
    Kernel, Port, PortThreading, Priority,
};

define_id! {
    /// Identifies a blocking object.
    pub struct BlockingObjectId;
}

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitOutcome {
    /// The waiter was removed from the list by the owner of the resource,
    /// which usually means the resource was handed to it.
    Granted,
    /// The deadline elapsed first.
    TimedOut,
    /// The blocking object was deleted.
    Deleted,
}

/// The result of an operation that may block the calling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WaitStart<T> {
    /// The operation completed without blocking.
    Done(T),
    /// The calling task has been blocked and a context switch has been
    /// requested. Once the task runs again, the operation must be completed
    /// by calling its `*_resume` counterpart.
    Blocked,
}

impl<T> WaitStart<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(x) => Some(x),
            Self::Blocked => None,
        }
    }
}

/// A summary of a blocking object's wait list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingStats {
    pub blocked_count: usize,
    /// The priority of the task at the head of the list
    pub highest_priority: Option<Priority>,
}

/// The links of a task in a wait list.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WaitLink {
    prev: Option<TaskId>,
    next: Option<TaskId>,
}

/// *Blocking object control block*
#[derive(Debug, Default)]
pub(crate) struct BlockingObjectCb {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    count: usize,
}

/// Insert `task` after every waiter whose priority is not lower.
fn list_insert<P: PortThreading>(
    tasks: &mut Pool<TaskId, TaskCb<P>>,
    obj: &mut BlockingObjectCb,
    task: TaskId,
) {
    let priority = tasks[task].priority;

    // Find the first waiter with a strictly lower priority
    let mut before = obj.head;
    while let Some(cur) = before {
        if tasks[cur].priority < priority {
            break;
        }
        before = tasks[cur].wait_link.next;
    }

    let prev = match before {
        Some(b) => tasks[b].wait_link.prev,
        None => obj.tail,
    };

    tasks[task].wait_link = WaitLink { prev, next: before };
    match prev {
        Some(p) => tasks[p].wait_link.next = Some(task),
        None => obj.head = Some(task),
    }
    match before {
        Some(b) => tasks[b].wait_link.prev = Some(task),
        None => obj.tail = Some(task),
    }
    obj.count += 1;
}

fn list_remove<P: PortThreading>(
    tasks: &mut Pool<TaskId, TaskCb<P>>,
    obj: &mut BlockingObjectCb,
    task: TaskId,
) {
    let WaitLink { prev, next } = tasks[task].wait_link;
    match prev {
        Some(p) => tasks[p].wait_link.next = next,
        None => obj.head = next,
    }
    match next {
        Some(n) => tasks[n].wait_link.prev = prev,
        None => obj.tail = prev,
    }
    tasks[task].wait_link = WaitLink::default();
    obj.count -= 1;
}

/// Blocking object operations
impl<P: Port> Kernel<P> {
    /// Create an empty blocking object.
    pub fn blocking_object_create(&mut self) -> Result<BlockingObjectId, CreateObjectError> {
        Ok(self.objects.insert(BlockingObjectCb::default()))
    }

    /// Put `task` in the wait list of `obj` with an absolute deadline derived
    /// from `timeout`, and reschedule.
    pub fn blocking_object_block(
        &mut self,
        obj: BlockingObjectId,
        task: TaskId,
        timeout: Timeout,
    ) -> Result<(), BlockError> {
        if !self.objects.contains(obj) {
            return Err(BlockError::BadId);
        }
        let task_cb = self.tasks.get(task).ok_or(BlockError::BadId)?;
        if !matches!(task_cb.st, TaskSt::Ready | TaskSt::Running) {
            return Err(BlockError::BadObjectState);
        }
        let deadline = Deadline::after(self.tick_count, timeout).ok_or(BlockError::BadParam)?;
        self.wait_on(obj, task, BlockReason::Other, deadline);
        self.reschedule(false);
        Ok(())
    }

    /// Wake the highest-priority waiter of `obj` with [`WaitOutcome::Granted`]
    /// and reschedule.
    pub fn blocking_object_unblock_highest_priority(
        &mut self,
        obj: BlockingObjectId,
    ) -> Result<Option<TaskId>, BadIdError> {
        if !self.objects.contains(obj) {
            return Err(BadIdError::BadId);
        }
        let task = self.wake_highest(obj);
        if task.is_some() {
            self.reschedule(false);
        }
        Ok(task)
    }

    /// Wake every waiter of `obj` whose deadline has elapsed. Returns the
    /// number of woken tasks.
    ///
    /// The woken tasks keep their [`BlockReason`] so that the waiting
    /// operation can tell a timeout from a grant.
    pub fn blocking_object_check_timeouts(
        &mut self,
        obj: BlockingObjectId,
    ) -> Result<usize, BadIdError> {
        let now = self.tick_count;
        let mut cursor = self.objects.get(obj).ok_or(BadIdError::BadId)?.head;
        let mut woken = 0;
        while let Some(task) = cursor {
            cursor = self.tasks[task].wait_link.next;
            if self.tasks[task].deadline.has_elapsed(now) {
                self.time_out_waiter(task);
                woken += 1;
            }
        }
        if woken > 0 {
            self.reschedule(false);
        }
        Ok(woken)
    }

    /// Wake all waiters with [`WaitOutcome::Deleted`] and delete `obj`.
    pub fn blocking_object_delete(&mut self, obj: BlockingObjectId) -> Result<(), BadIdError> {
        if !self.objects.contains(obj) {
            return Err(BadIdError::BadId);
        }
        self.wake_all(obj, WaitOutcome::Deleted);
        self.objects.remove(obj);
        self.reschedule(false);
        Ok(())
    }

    pub fn blocking_object_blocked_count(&self, obj: BlockingObjectId) -> Result<usize, BadIdError> {
        Ok(self.objects.get(obj).ok_or(BadIdError::BadId)?.count)
    }

    pub fn blocking_object_stats(&self, obj: BlockingObjectId) -> Result<BlockingStats, BadIdError> {
        let obj_cb = self.objects.get(obj).ok_or(BadIdError::BadId)?;
        Ok(BlockingStats {
            blocked_count: obj_cb.count,
            highest_priority: obj_cb.head.map(|t| self.tasks[t].priority),
        })
    }

    /// Iterate over the waiters of `obj` from the head.
    pub fn blocking_object_waiters(
        &self,
        obj: BlockingObjectId,
    ) -> Result<impl Iterator<Item = TaskId> + '_, BadIdError> {
        let mut cursor = self.objects.get(obj).ok_or(BadIdError::BadId)?.head;
        Ok(iter::from_fn(move || {
            let task = cursor?;
            cursor = self.tasks[task].wait_link.next;
            Some(task)
        }))
    }

    /// Check that the wait list of `obj` is sorted, that its links are
    /// consistent, and that its count matches the tasks blocked on it.
    pub fn blocking_object_validate_priority_ordering(
        &self,
        obj: BlockingObjectId,
    ) -> Result<bool, BadIdError> {
        let obj_cb = self.objects.get(obj).ok_or(BadIdError::BadId)?;
        let mut prev: Option<TaskId> = None;
        let mut len = 0;
        let mut cursor = obj_cb.head;
        while let Some(task) = cursor {
            let task_cb = &self.tasks[task];
            if task_cb.wait_link.prev != prev
                || task_cb.blocking_object != Some(obj)
                || task_cb.st != TaskSt::Blocked
            {
                return Ok(false);
            }
            if let Some(p) = prev {
                if self.tasks[p].priority < task_cb.priority {
                    return Ok(false);
                }
            }
            prev = Some(task);
            cursor = task_cb.wait_link.next;
            len += 1;
        }

        let blocked_here = self
            .tasks
            .iter()
            .filter(|(_, t)| t.st == TaskSt::Blocked && t.blocking_object == Some(obj))
            .count();
        Ok(obj_cb.tail == prev && obj_cb.count == len && blocked_here == len)
    }

    /// Block `task` on `obj`.
    pub(crate) fn wait_on(
        &mut self,
        obj: BlockingObjectId,
        task: TaskId,
        reason: BlockReason,
        deadline: Deadline,
    ) {
        let task_cb = &mut self.tasks[task];
        debug_assert!(task_cb.blocking_object.is_none());
        task_cb.st = TaskSt::Blocked;
        task_cb.block_reason = reason;
        task_cb.deadline = deadline;
        task_cb.wait_outcome = None;
        task_cb.pending_grant = None;
        task_cb.blocking_object = Some(obj);
        list_insert(&mut self.tasks, &mut self.objects[obj], task);
        ktrace!("{:?} waits on {:?} ({:?})", task, obj, reason);
    }

    /// Remove the head of the wait list of `obj` and make it Ready with
    /// [`WaitOutcome::Granted`]. This doesn't reschedule.
    pub(crate) fn wake_highest(&mut self, obj: BlockingObjectId) -> Option<TaskId> {
        let task = self.objects[obj].head?;
        self.wake(task, WaitOutcome::Granted);
        Some(task)
    }

    /// Wake every waiter of `obj`. This doesn't reschedule.
    pub(crate) fn wake_all(&mut self, obj: BlockingObjectId, outcome: WaitOutcome) {
        while let Some(task) = self.objects[obj].head {
            self.wake(task, outcome);
        }
    }

    fn wake(&mut self, task: TaskId, outcome: WaitOutcome) {
        let obj = self.tasks[task].blocking_object;
        self.detach_waiter(task);
        let task_cb = &mut self.tasks[task];
        task_cb.pending_grant = match (outcome, obj) {
            (WaitOutcome::Granted, Some(obj)) => Some((obj, task_cb.block_reason)),
            _ => None,
        };
        task_cb.st = TaskSt::Ready;
        task_cb.block_reason = BlockReason::None;
        task_cb.wait_outcome = Some(outcome);
        ktrace!("{:?} woken ({:?})", task, outcome);
    }

    /// End the wait of `task` because of its deadline. The block reason is
    /// kept. This doesn't reschedule.
    pub(crate) fn time_out_waiter(&mut self, task: TaskId) {
        self.detach_waiter(task);
        let task_cb = &mut self.tasks[task];
        task_cb.st = TaskSt::Ready;
        task_cb.wait_outcome = Some(WaitOutcome::TimedOut);
        ktrace!("{:?} timed out ({:?})", task, task_cb.block_reason);
    }

    /// Remove `task` from the wait list it's in, if any. The task state is
    /// left unchanged.
    pub(crate) fn detach_waiter(&mut self, task: TaskId) {
        if let Some(obj) = self.tasks[task].blocking_object.take() {
            list_remove(&mut self.tasks, &mut self.objects[obj], task);
            if self.tasks[task].block_reason == BlockReason::Mutex {
                self.mutex_wait_list_changed(obj);
            }
        }
    }

    /// Move `task` to the position matching its current priority.
    pub(crate) fn reorder_waiter(&mut self, task: TaskId) {
        if let Some(obj) = self.tasks[task].blocking_object {
            let obj_cb = &mut self.objects[obj];
            list_remove(&mut self.tasks, obj_cb, task);
            list_insert(&mut self.tasks, obj_cb, task);
        }
    }

    /// Take the outcome of the last wait of the calling task and clear its
    /// block reason.
    pub(crate) fn finish_wait(&mut self, task: TaskId) -> Option<WaitOutcome> {
        let task_cb = &mut self.tasks[task];
        debug_assert_ne!(task_cb.st, TaskSt::Blocked);
        task_cb.block_reason = BlockReason::None;
        task_cb.pending_grant = None;
        task_cb.wait_outcome.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_port::TestPort, Config};
    use assert_matches::assert_matches;
    use quickcheck_macros::quickcheck;

    fn nop(_: usize) {}

    fn kernel() -> Kernel<TestPort> {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::new(Config::DEFAULT.with_max_tasks(64)).unwrap()
    }

    #[test]
    fn unblock_in_descending_priority_order() {
        let mut k = kernel();
        let obj = k.blocking_object_create().unwrap();
        let prios = [3, 9, 1, 7, 5];
        let tasks: Vec<_> = prios
            .iter()
            .map(|&p| k.task_create("t", nop, 0, 64, p).unwrap())
            .collect();
        for &t in &tasks {
            k.blocking_object_block(obj, t, Timeout::FOREVER).unwrap();
            assert_eq!(k.task_block_reason(t), Ok(BlockReason::Other));
        }
        assert_eq!(k.blocking_object_blocked_count(obj), Ok(5));
        assert_eq!(k.blocking_object_validate_priority_ordering(obj), Ok(true));
        assert_eq!(
            k.blocking_object_stats(obj),
            Ok(BlockingStats {
                blocked_count: 5,
                highest_priority: Some(9)
            })
        );

        let mut order = Vec::new();
        while let Some(t) = k.blocking_object_unblock_highest_priority(obj).unwrap() {
            assert_eq!(k.task_state(t), Ok(TaskSt::Ready));
            assert_eq!(k.task_block_reason(t), Ok(BlockReason::None));
            assert_eq!(k.tasks[t].wait_outcome, Some(WaitOutcome::Granted));
            order.push(k.task_priority(t).unwrap());
        }
        assert_eq!(order, vec![9, 7, 5, 3, 1]);
        assert_eq!(k.blocking_object_blocked_count(obj), Ok(0));
    }

    #[test]
    fn equal_priorities_keep_arrival_order() {
        let mut k = kernel();
        let obj = k.blocking_object_create().unwrap();
        let a = k.task_create("a", nop, 0, 64, 4).unwrap();
        let b = k.task_create("b", nop, 0, 64, 4).unwrap();
        let c = k.task_create("c", nop, 0, 64, 4).unwrap();
        for t in [b, a, c] {
            k.blocking_object_block(obj, t, Timeout::FOREVER).unwrap();
        }
        assert_eq!(
            k.blocking_object_waiters(obj).unwrap().collect::<Vec<_>>(),
            vec![b, a, c]
        );
    }

    #[test]
    fn timeout_keeps_block_reason() {
        let mut k = kernel();
        let obj = k.blocking_object_create().unwrap();
        let a = k.task_create("a", nop, 0, 64, 4).unwrap();
        let b = k.task_create("b", nop, 0, 64, 4).unwrap();
        k.blocking_object_block(obj, a, Timeout::Ticks(2)).unwrap();
        k.blocking_object_block(obj, b, Timeout::FOREVER).unwrap();

        k.tick_count = 1;
        assert_eq!(k.blocking_object_check_timeouts(obj), Ok(0));
        k.tick_count = 2;
        assert_eq!(k.blocking_object_check_timeouts(obj), Ok(1));

        assert_eq!(k.task_state(a), Ok(TaskSt::Ready));
        assert_eq!(k.task_block_reason(a), Ok(BlockReason::Other));
        assert_eq!(k.tasks[a].wait_outcome, Some(WaitOutcome::TimedOut));
        assert_eq!(k.finish_wait(a), Some(WaitOutcome::TimedOut));
        assert_eq!(k.task_block_reason(a), Ok(BlockReason::None));

        assert_eq!(k.task_state(b), Ok(TaskSt::Blocked));
        assert_eq!(k.blocking_object_validate_priority_ordering(obj), Ok(true));
    }

    #[test]
    fn delete_force_wakes_everyone() {
        let mut k = kernel();
        let obj = k.blocking_object_create().unwrap();
        let a = k.task_create("a", nop, 0, 64, 1).unwrap();
        let b = k.task_create("b", nop, 0, 64, 2).unwrap();
        k.blocking_object_block(obj, a, Timeout::FOREVER).unwrap();
        k.blocking_object_block(obj, b, Timeout::FOREVER).unwrap();
        k.blocking_object_delete(obj).unwrap();

        for t in [a, b] {
            assert_eq!(k.task_state(t), Ok(TaskSt::Ready));
            assert_eq!(k.task_block_reason(t), Ok(BlockReason::None));
            assert_eq!(k.tasks[t].wait_outcome, Some(WaitOutcome::Deleted));
        }
        assert_eq!(k.blocking_object_blocked_count(obj), Err(BadIdError::BadId));
    }

    #[test]
    fn block_rejects_bad_arguments() {
        let mut k = kernel();
        let obj = k.blocking_object_create().unwrap();
        let a = k.task_create("a", nop, 0, 64, 1).unwrap();
        assert_matches!(
            k.blocking_object_block(obj, a, Timeout::Ticks(u32::MAX - 1)),
            Err(BlockError::BadParam)
        );
        k.blocking_object_block(obj, a, Timeout::FOREVER).unwrap();
        assert_matches!(
            k.blocking_object_block(obj, a, Timeout::FOREVER),
            Err(BlockError::BadObjectState)
        );
        k.blocking_object_delete(obj).unwrap();
        assert_matches!(
            k.blocking_object_block(obj, a, Timeout::FOREVER),
            Err(BlockError::BadId)
        );
    }

    #[test]
    fn priority_change_repositions_waiter() {
        let mut k = kernel();
        let obj = k.blocking_object_create().unwrap();
        let a = k.task_create("a", nop, 0, 64, 1).unwrap();
        let b = k.task_create("b", nop, 0, 64, 5).unwrap();
        k.blocking_object_block(obj, a, Timeout::FOREVER).unwrap();
        k.blocking_object_block(obj, b, Timeout::FOREVER).unwrap();
        k.task_set_priority(a, 10).unwrap();
        assert_eq!(
            k.blocking_object_waiters(obj).unwrap().collect::<Vec<_>>(),
            vec![a, b]
        );
        assert_eq!(k.blocking_object_validate_priority_ordering(obj), Ok(true));
    }

    /// An operation on a blocking object.
    #[derive(Debug)]
    enum Cmd {
        Block { priority: Priority },
        Unblock,
        Suspend(usize),
        Reprioritize(usize, Priority),
    }

    /// Map random bytes to operations.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        bytecode.chunks_exact(3).map(|instr| match instr[0] % 4 {
            0 | 1 => Cmd::Block {
                priority: (instr[1] % 8) as Priority,
            },
            2 => Cmd::Unblock,
            _ if instr[2] % 2 == 0 => Cmd::Suspend(instr[1] as usize),
            _ => Cmd::Reprioritize(instr[1] as usize, (instr[2] % 8) as Priority),
        })
    }

    #[quickcheck]
    fn matches_reference_model(bytecode: Vec<u8>) {
        let mut k = kernel();
        let obj = k.blocking_object_create().unwrap();

        // The reference list, kept sorted with a stable sort
        let mut reference: Vec<(TaskId, Priority)> = Vec::new();

        for cmd in interpret(&bytecode) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Block { priority } => {
                    if k.tasks.len() >= 64 {
                        continue;
                    }
                    let t = k.task_create("t", nop, 0, MIN_STACK, priority).unwrap();
                    k.blocking_object_block(obj, t, Timeout::FOREVER).unwrap();
                    let pos = reference
                        .iter()
                        .position(|&(_, p)| p < priority)
                        .unwrap_or(reference.len());
                    reference.insert(pos, (t, priority));
                }
                Cmd::Unblock => {
                    let got = k.blocking_object_unblock_highest_priority(obj).unwrap();
                    let expected = if reference.is_empty() {
                        None
                    } else {
                        Some(reference.remove(0).0)
                    };
                    assert_eq!(got, expected);
                    if let Some(t) = got {
                        k.task_delete(t).unwrap();
                        k.tick_count += 1;
                        k.cleanup_terminated_tasks();
                    }
                }
                Cmd::Suspend(i) => {
                    if reference.is_empty() {
                        continue;
                    }
                    let (t, _) = reference.remove(i % reference.len());
                    k.task_suspend(t).unwrap();
                    assert_eq!(k.tasks[t].wait_outcome, Some(WaitOutcome::TimedOut));
                    k.task_delete(t).unwrap();
                }
                Cmd::Reprioritize(i, priority) => {
                    if reference.is_empty() {
                        continue;
                    }
                    let (t, old_priority) = reference[i % reference.len()];
                    k.task_set_priority(t, priority).unwrap();
                    if old_priority == priority {
                        // Unchanged priority keeps the position
                        continue;
                    }
                    reference.remove(i % reference.len());
                    let pos = reference
                        .iter()
                        .position(|&(_, p)| p < priority)
                        .unwrap_or(reference.len());
                    reference.insert(pos, (t, priority));
                }
            }

            assert_eq!(k.blocking_object_validate_priority_ordering(obj), Ok(true));
            assert_eq!(
                k.blocking_object_waiters(obj).unwrap().collect::<Vec<_>>(),
                reference.iter().map(|&(t, _)| t).collect::<Vec<_>>()
            );
        }
    }

    const MIN_STACK: usize = crate::MIN_STACK_WORDS;
}
