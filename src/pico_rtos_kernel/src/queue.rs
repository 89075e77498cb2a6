//! Message queues
//!
//! A queue is a bounded ring buffer of fixed-size items with two wait lists,
//! one for senders waiting for room and one for receivers waiting for data.
//! Items are copied in and out whole.
use alloc::boxed::Box;
use bytemuck::Pod;

use crate::{
    error::{BadIdError, CreateObjectError, QueueError},
    task::{BlockReason, TaskId},
    timeout::{Deadline, Timeout},
    wait::{BlockingObjectId, WaitOutcome, WaitStart},
    Kernel, Port,
};

define_id! {
    /// Identifies a message queue.
    pub struct QueueId;
}

/// *Queue control block*
#[derive(Debug)]
pub(crate) struct QueueCb {
    item_size: usize,
    capacity: usize,
    buf: Box<[u8]>,
    /// The slot of the oldest item
    head: usize,
    /// The slot the next item is written to
    tail: usize,
    count: usize,
    senders: BlockingObjectId,
    receivers: BlockingObjectId,
}

impl QueueCb {
    fn slot(&mut self, i: usize) -> &mut [u8] {
        let start = i * self.item_size;
        &mut self.buf[start..start + self.item_size]
    }
}

/// Message queue operations
impl<P: Port> Kernel<P> {
    /// Create a queue holding up to `capacity` items of `item_size` bytes.
    /// The storage is allocated through tracked allocation.
    pub fn queue_create(
        &mut self,
        item_size: usize,
        capacity: usize,
    ) -> Result<QueueId, CreateObjectError> {
        if item_size == 0 || capacity == 0 {
            return Err(CreateObjectError::BadParam);
        }
        let len = item_size
            .checked_mul(capacity)
            .ok_or(CreateObjectError::BadParam)?;
        let buf = self.memory.alloc_zeroed::<u8>(len)?;
        let senders = self.blocking_object_create()?;
        let receivers = self.blocking_object_create()?;
        Ok(self.queues.insert(QueueCb {
            item_size,
            capacity,
            buf,
            head: 0,
            tail: 0,
            count: 0,
            senders,
            receivers,
        }))
    }

    /// Append a copy of `item` to the queue.
    ///
    /// If the queue is full and `timeout` is not zero, the calling task is
    /// blocked until a receiver makes room. A zero `timeout` never blocks and
    /// may be used in an interrupt context.
    pub fn queue_send(
        &mut self,
        queue: QueueId,
        item: &[u8],
        timeout: Timeout,
    ) -> Result<WaitStart<()>, QueueError> {
        let queue_cb = self.queues.get(queue).ok_or(QueueError::BadId)?;
        if item.len() != queue_cb.item_size {
            return Err(QueueError::BadParam);
        }
        if self.queue_push(queue, item) {
            return Ok(WaitStart::Done(()));
        }
        let senders = self.queues[queue].senders;
        self.queue_wait(senders, BlockReason::QueueFull, timeout)
    }

    /// Finish a [`Self::queue_send`] call that returned
    /// [`WaitStart::Blocked`]. `item` must be the same item.
    ///
    /// Being woken doesn't guarantee that there's room, so this may block
    /// the task again, in which case it must be called again.
    pub fn queue_send_resume(
        &mut self,
        queue: QueueId,
        item: &[u8],
    ) -> Result<WaitStart<()>, QueueError> {
        let (task, outcome) = self.queue_resume_prologue(queue)?;
        let queue_cb = &self.queues[queue];
        if item.len() != queue_cb.item_size {
            return Err(QueueError::BadParam);
        }
        if self.queue_push(queue, item) {
            return Ok(WaitStart::Done(()));
        }
        let senders = self.queues[queue].senders;
        self.queue_rewait(task, outcome, senders, BlockReason::QueueFull)
    }

    /// Remove the oldest item from the queue and copy it to `out`.
    ///
    /// If the queue is empty and `timeout` is not zero, the calling task is
    /// blocked until a sender provides an item. A zero `timeout` never
    /// blocks and may be used in an interrupt context.
    pub fn queue_receive(
        &mut self,
        queue: QueueId,
        out: &mut [u8],
        timeout: Timeout,
    ) -> Result<WaitStart<()>, QueueError> {
        let queue_cb = self.queues.get(queue).ok_or(QueueError::BadId)?;
        if out.len() != queue_cb.item_size {
            return Err(QueueError::BadParam);
        }
        if self.queue_pop(queue, out) {
            return Ok(WaitStart::Done(()));
        }
        let receivers = self.queues[queue].receivers;
        self.queue_wait(receivers, BlockReason::QueueEmpty, timeout)
    }

    /// Finish a [`Self::queue_receive`] call that returned
    /// [`WaitStart::Blocked`]. This may block the task again.
    pub fn queue_receive_resume(
        &mut self,
        queue: QueueId,
        out: &mut [u8],
    ) -> Result<WaitStart<()>, QueueError> {
        let (task, outcome) = self.queue_resume_prologue(queue)?;
        if out.len() != self.queues[queue].item_size {
            return Err(QueueError::BadParam);
        }
        if self.queue_pop(queue, out) {
            return Ok(WaitStart::Done(()));
        }
        let receivers = self.queues[queue].receivers;
        self.queue_rewait(task, outcome, receivers, BlockReason::QueueEmpty)
    }

    /// [`Self::queue_send`] for a plain-old-data value whose size equals the
    /// item size.
    pub fn queue_send_value<T: Pod>(
        &mut self,
        queue: QueueId,
        value: &T,
        timeout: Timeout,
    ) -> Result<WaitStart<()>, QueueError> {
        self.queue_send(queue, bytemuck::bytes_of(value), timeout)
    }

    pub fn queue_send_value_resume<T: Pod>(
        &mut self,
        queue: QueueId,
        value: &T,
    ) -> Result<WaitStart<()>, QueueError> {
        self.queue_send_resume(queue, bytemuck::bytes_of(value))
    }

    /// [`Self::queue_receive`] for a plain-old-data value whose size equals
    /// the item size.
    pub fn queue_receive_value<T: Pod>(
        &mut self,
        queue: QueueId,
        timeout: Timeout,
    ) -> Result<WaitStart<T>, QueueError> {
        let mut value = T::zeroed();
        Ok(
            match self.queue_receive(queue, bytemuck::bytes_of_mut(&mut value), timeout)? {
                WaitStart::Done(()) => WaitStart::Done(value),
                WaitStart::Blocked => WaitStart::Blocked,
            },
        )
    }

    pub fn queue_receive_value_resume<T: Pod>(
        &mut self,
        queue: QueueId,
    ) -> Result<WaitStart<T>, QueueError> {
        let mut value = T::zeroed();
        Ok(
            match self.queue_receive_resume(queue, bytemuck::bytes_of_mut(&mut value))? {
                WaitStart::Done(()) => WaitStart::Done(value),
                WaitStart::Blocked => WaitStart::Blocked,
            },
        )
    }

    pub fn queue_len(&self, queue: QueueId) -> Result<usize, BadIdError> {
        Ok(self.queues.get(queue).ok_or(BadIdError::BadId)?.count)
    }

    pub fn queue_is_empty(&self, queue: QueueId) -> Result<bool, BadIdError> {
        Ok(self.queue_len(queue)? == 0)
    }

    pub fn queue_is_full(&self, queue: QueueId) -> Result<bool, BadIdError> {
        let queue_cb = self.queues.get(queue).ok_or(BadIdError::BadId)?;
        Ok(queue_cb.count == queue_cb.capacity)
    }

    /// Delete a queue. Waiters on both sides are woken with `Deleted`, and
    /// the storage is released.
    pub fn queue_delete(&mut self, queue: QueueId) -> Result<(), BadIdError> {
        let queue_cb = self.queues.remove(queue).ok_or(BadIdError::BadId)?;
        for obj in [queue_cb.senders, queue_cb.receivers] {
            self.wake_all(obj, WaitOutcome::Deleted);
            self.objects.remove(obj);
        }
        self.memory.free(queue_cb.buf);
        self.reschedule(false);
        Ok(())
    }

    /// Write `item` at the tail and wake a receiver. Returns `false` if the
    /// queue is full.
    fn queue_push(&mut self, queue: QueueId, item: &[u8]) -> bool {
        let queue_cb = &mut self.queues[queue];
        if queue_cb.count == queue_cb.capacity {
            return false;
        }
        let tail = queue_cb.tail;
        queue_cb.slot(tail).copy_from_slice(item);
        queue_cb.tail = (tail + 1) % queue_cb.capacity;
        queue_cb.count += 1;

        let receivers = queue_cb.receivers;
        if self.wake_highest(receivers).is_some() {
            self.reschedule(false);
        }
        true
    }

    /// Read the item at the head into `out` and wake a sender. Returns
    /// `false` if the queue is empty.
    fn queue_pop(&mut self, queue: QueueId, out: &mut [u8]) -> bool {
        let queue_cb = &mut self.queues[queue];
        if queue_cb.count == 0 {
            return false;
        }
        let head = queue_cb.head;
        out.copy_from_slice(queue_cb.slot(head));
        queue_cb.head = (head + 1) % queue_cb.capacity;
        queue_cb.count -= 1;

        let senders = queue_cb.senders;
        if self.wake_highest(senders).is_some() {
            self.reschedule(false);
        }
        true
    }

    fn queue_wait(
        &mut self,
        obj: BlockingObjectId,
        reason: BlockReason,
        timeout: Timeout,
    ) -> Result<WaitStart<()>, QueueError> {
        if timeout.is_zero() {
            return Err(QueueError::Timeout);
        }
        let task = self
            .current_waitable()
            .map_err(|_| QueueError::BadContext)?;
        let deadline = Deadline::after(self.tick_count, timeout).ok_or(QueueError::BadParam)?;
        self.wait_on(obj, task, reason, deadline);
        self.reschedule(false);
        Ok(WaitStart::Blocked)
    }

    fn queue_resume_prologue(
        &mut self,
        queue: QueueId,
    ) -> Result<(TaskId, Option<WaitOutcome>), QueueError> {
        let task = self
            .current_waitable()
            .map_err(|_| QueueError::BadContext)?;
        let outcome = self.finish_wait(task);
        if outcome == Some(WaitOutcome::Deleted) {
            return Err(QueueError::Deleted);
        }
        if !self.queues.contains(queue) {
            return Err(QueueError::BadId);
        }
        Ok((task, outcome))
    }

    /// Block again after a wakeup whose slot (or item) was taken by someone
    /// else. The original deadline still applies.
    fn queue_rewait(
        &mut self,
        task: TaskId,
        outcome: Option<WaitOutcome>,
        obj: BlockingObjectId,
        reason: BlockReason,
    ) -> Result<WaitStart<()>, QueueError> {
        let deadline = self.tasks[task].deadline;
        if outcome != Some(WaitOutcome::Granted) || deadline.has_elapsed(self.tick_count) {
            return Err(QueueError::Timeout);
        }
        ktrace!("{:?} lost the race on {:?}, waiting again", task, obj);
        self.wait_on(obj, task, reason, deadline);
        self.reschedule(false);
        Ok(WaitStart::Blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_port::TestPort, Config};
    use assert_matches::assert_matches;
    use crate::TaskSt;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    fn nop(_: usize) {}

    fn kernel() -> Kernel<TestPort> {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::new(Config::DEFAULT).unwrap()
    }

    #[test]
    fn capacity_three_scenario() {
        let mut k = kernel();
        let q = k.queue_create(4, 3).unwrap();
        for x in [1u32, 2, 3] {
            assert_eq!(k.queue_send_value(q, &x, Timeout::NO_WAIT), Ok(WaitStart::Done(())));
        }
        assert_eq!(k.queue_is_full(q), Ok(true));
        assert_eq!(
            k.queue_send_value(q, &4u32, Timeout::NO_WAIT),
            Err(QueueError::Timeout)
        );

        for x in [1u32, 2, 3] {
            assert_eq!(
                k.queue_receive_value::<u32>(q, Timeout::NO_WAIT),
                Ok(WaitStart::Done(x))
            );
        }
        assert_eq!(k.queue_is_empty(q), Ok(true));
        assert_eq!(
            k.queue_receive_value::<u32>(q, Timeout::NO_WAIT),
            Err(QueueError::Timeout)
        );
    }

    #[test]
    fn create_and_delete_track_memory() {
        let mut k = kernel();
        assert_matches!(k.queue_create(0, 3), Err(CreateObjectError::BadParam));
        assert_matches!(k.queue_create(4, 0), Err(CreateObjectError::BadParam));
        assert_matches!(k.queue_create(usize::MAX, 2), Err(CreateObjectError::BadParam));

        let before = k.memory_stats().current;
        let q = k.queue_create(8, 5).unwrap();
        assert_eq!(k.memory_stats().current, before + 40);
        k.queue_delete(q).unwrap();
        assert_eq!(k.memory_stats().current, before);
        assert_eq!(k.queue_len(q), Err(BadIdError::BadId));
    }

    #[test]
    fn item_length_must_match() {
        let mut k = kernel();
        let q = k.queue_create(4, 2).unwrap();
        assert_matches!(
            k.queue_send(q, &[1, 2, 3], Timeout::NO_WAIT),
            Err(QueueError::BadParam)
        );
        let mut out = [0u8; 2];
        assert_matches!(
            k.queue_receive(q, &mut out, Timeout::NO_WAIT),
            Err(QueueError::BadParam)
        );
    }

    #[test]
    fn blocked_receiver_is_woken_by_send() {
        let mut k = kernel();
        let p = k.task_create("p", nop, 0, 64, 1).unwrap();
        let r = k.task_create("r", nop, 0, 64, 3).unwrap();
        k.start().unwrap();
        let q = k.queue_create(2, 2).unwrap();

        let mut out = [0u8; 2];
        assert_eq!(
            k.queue_receive(q, &mut out, Timeout::FOREVER),
            Ok(WaitStart::Blocked)
        );
        assert_eq!(k.task_block_reason(r), Ok(BlockReason::QueueEmpty));
        assert_eq!(k.current_task(), Some(p));

        k.queue_send(q, &[7, 8], Timeout::NO_WAIT).unwrap();
        assert_eq!(k.current_task(), Some(r));
        assert_eq!(
            k.queue_receive_resume(q, &mut out),
            Ok(WaitStart::Done(()))
        );
        assert_eq!(out, [7, 8]);
        assert_eq!(k.queue_len(q), Ok(0));
    }

    #[test]
    fn sender_waits_again_if_slot_is_taken() {
        let mut k = kernel();
        let l = k.task_create("l", nop, 0, 64, 1).unwrap();
        let s = k.task_create("s", nop, 0, 64, 5).unwrap();
        k.start().unwrap();
        let q = k.queue_create(1, 1).unwrap();

        k.queue_send(q, &[1], Timeout::NO_WAIT).unwrap();
        assert_eq!(k.queue_send(q, &[2], Timeout::FOREVER), Ok(WaitStart::Blocked));
        assert_eq!(k.task_block_reason(s), Ok(BlockReason::QueueFull));
        assert_eq!(k.current_task(), Some(l));

        // An interrupt handler makes room and then fills it again before the
        // woken sender gets to run
        let mut out = [0u8];
        k.interrupt_enter();
        k.queue_receive(q, &mut out, Timeout::NO_WAIT).unwrap();
        assert_eq!(out, [1]);
        k.queue_send(q, &[3], Timeout::NO_WAIT).unwrap();
        k.interrupt_exit();

        assert_eq!(k.current_task(), Some(s));
        assert_eq!(k.queue_send_resume(q, &[2]), Ok(WaitStart::Blocked));
        assert_eq!(k.current_task(), Some(l));

        k.queue_receive(q, &mut out, Timeout::NO_WAIT).unwrap();
        assert_eq!(out, [3]);
        assert_eq!(k.current_task(), Some(s));
        assert_eq!(k.queue_send_resume(q, &[2]), Ok(WaitStart::Done(())));
        assert_eq!(k.queue_len(q), Ok(1));
    }

    #[test]
    fn wakeup_moves_on_when_receiver_is_suspended() {
        let mut k = kernel();
        let p = k.task_create("p", nop, 0, 64, 1).unwrap();
        let r1 = k.task_create("r1", nop, 0, 64, 5).unwrap();
        let r2 = k.task_create("r2", nop, 0, 64, 4).unwrap();
        k.start().unwrap();
        let q = k.queue_create(1, 1).unwrap();

        let mut out = [0u8];
        assert!(k.queue_receive(q, &mut out, Timeout::FOREVER).unwrap().is_blocked());
        assert_eq!(k.current_task(), Some(r2));
        assert!(k.queue_receive(q, &mut out, Timeout::FOREVER).unwrap().is_blocked());
        assert_eq!(k.current_task(), Some(p));

        // `r1` is picked for the item but gets suspended before it runs
        k.interrupt_enter();
        k.queue_send(q, &[9], Timeout::NO_WAIT).unwrap();
        k.task_suspend(r1).unwrap();
        k.interrupt_exit();

        assert_eq!(k.task_state(r2), Ok(TaskSt::Running));
        assert_eq!(k.queue_receive_resume(q, &mut out), Ok(WaitStart::Done(())));
        assert_eq!(out, [9]);
        assert_eq!(k.queue_len(q), Ok(0));

        // The item is gone by the time `r1` comes back, so it waits again
        k.task_resume(r1).unwrap();
        assert_eq!(k.current_task(), Some(r1));
        assert_eq!(k.queue_receive_resume(q, &mut out), Ok(WaitStart::Blocked));
        assert_eq!(k.task_block_reason(r1), Ok(BlockReason::QueueEmpty));
    }

    #[test]
    fn wakeup_moves_on_when_sender_is_deleted() {
        let mut k = kernel();
        let p = k.task_create("p", nop, 0, 64, 1).unwrap();
        let s1 = k.task_create("s1", nop, 0, 64, 5).unwrap();
        let s2 = k.task_create("s2", nop, 0, 64, 4).unwrap();
        k.start().unwrap();
        let q = k.queue_create(1, 1).unwrap();
        k.queue_send(q, &[1], Timeout::NO_WAIT).unwrap();

        assert!(k.queue_send(q, &[2], Timeout::FOREVER).unwrap().is_blocked());
        assert!(k.queue_send(q, &[3], Timeout::FOREVER).unwrap().is_blocked());
        assert_eq!(k.current_task(), Some(p));

        let mut out = [0u8];
        k.interrupt_enter();
        k.queue_receive(q, &mut out, Timeout::NO_WAIT).unwrap();
        k.task_delete(s1).unwrap();
        k.interrupt_exit();

        assert_eq!(k.task_state(s1), Ok(TaskSt::Terminated));
        assert_eq!(k.current_task(), Some(s2));
        assert_eq!(k.queue_send_resume(q, &[3]), Ok(WaitStart::Done(())));
        assert_eq!(k.queue_receive(q, &mut out, Timeout::NO_WAIT), Ok(WaitStart::Done(())));
        assert_eq!(out, [3]);
    }

    #[test]
    fn receive_times_out() {
        let mut k = kernel();
        let p = k.task_create("p", nop, 0, 64, 1).unwrap();
        let r = k.task_create("r", nop, 0, 64, 3).unwrap();
        k.start().unwrap();
        let q = k.queue_create(1, 1).unwrap();
        let mut out = [0u8];
        assert_eq!(
            k.queue_receive(q, &mut out, Timeout::Ticks(2)),
            Ok(WaitStart::Blocked)
        );
        let _ = k.tick();
        assert_eq!(k.current_task(), Some(p));
        let _ = k.tick();
        assert_eq!(k.current_task(), Some(r));
        assert_eq!(k.queue_receive_resume(q, &mut out), Err(QueueError::Timeout));
    }

    #[test]
    fn delete_wakes_both_sides() {
        let mut k = kernel();
        let p = k.task_create("p", nop, 0, 64, 1).unwrap();
        let r = k.task_create("r", nop, 0, 64, 3).unwrap();
        k.start().unwrap();
        let q = k.queue_create(1, 1).unwrap();
        let mut out = [0u8];
        assert!(k.queue_receive(q, &mut out, Timeout::FOREVER).unwrap().is_blocked());
        assert_eq!(k.current_task(), Some(p));
        k.queue_delete(q).unwrap();
        assert_eq!(k.current_task(), Some(r));
        assert_eq!(k.queue_receive_resume(q, &mut out), Err(QueueError::Deleted));
    }

    #[test]
    fn blocking_needs_a_task() {
        let mut k = kernel();
        let q = k.queue_create(1, 1).unwrap();
        let mut out = [0u8];
        assert_matches!(
            k.queue_receive(q, &mut out, Timeout::FOREVER),
            Err(QueueError::BadContext)
        );
    }

    /// Non-blocking operations against a `VecDeque` with the same capacity
    #[quickcheck]
    fn fifo_matches_reference_model(capacity: u8, ops: Vec<Option<u16>>) {
        let capacity = usize::from(capacity % 6) + 1;
        let mut k = kernel();
        let q = k.queue_create(2, capacity).unwrap();
        let mut reference = VecDeque::new();

        for op in ops {
            log::trace!("    {op:?}");
            match op {
                Some(x) => {
                    let got = k.queue_send_value(q, &x, Timeout::NO_WAIT);
                    if reference.len() == capacity {
                        assert_eq!(got, Err(QueueError::Timeout));
                    } else {
                        assert_eq!(got, Ok(WaitStart::Done(())));
                        reference.push_back(x);
                    }
                }
                None => {
                    let got = k.queue_receive_value::<u16>(q, Timeout::NO_WAIT);
                    match reference.pop_front() {
                        Some(x) => assert_eq!(got, Ok(WaitStart::Done(x))),
                        None => assert_eq!(got, Err(QueueError::Timeout)),
                    }
                }
            }
            assert_eq!(k.queue_len(q), Ok(reference.len()));
            assert_eq!(k.queue_is_full(q), Ok(reference.len() == capacity));
        }
    }
}
