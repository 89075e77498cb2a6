//! Counting semaphores
use crate::{
    error::{BadIdError, CreateObjectError, GiveSemaphoreError, TakeSemaphoreError},
    task::BlockReason,
    timeout::{Deadline, Timeout},
    wait::{BlockingObjectId, WaitOutcome, WaitStart},
    Kernel, Port,
};

define_id! {
    /// Identifies a semaphore.
    pub struct SemaphoreId;
}

/// *Semaphore control block*
#[derive(Debug)]
pub(crate) struct SemaphoreCb {
    count: u32,
    max_count: u32,
    wait: BlockingObjectId,
}

/// Semaphore operations
impl<P: Port> Kernel<P> {
    /// Create a semaphore holding `initial` tokens out of at most
    /// `max_count`.
    pub fn semaphore_create(
        &mut self,
        initial: u32,
        max_count: u32,
    ) -> Result<SemaphoreId, CreateObjectError> {
        if max_count == 0 || initial > max_count {
            return Err(CreateObjectError::BadParam);
        }
        let wait = self.blocking_object_create()?;
        Ok(self.semaphores.insert(SemaphoreCb {
            count: initial,
            max_count,
            wait,
        }))
    }

    /// Release a token. If a task is waiting, the token is handed to it
    /// directly and the count is left unchanged.
    ///
    /// This operation may be used in an interrupt context.
    pub fn semaphore_give(&mut self, sem: SemaphoreId) -> Result<(), GiveSemaphoreError> {
        let sem_cb = self.semaphores.get(sem).ok_or(GiveSemaphoreError::BadId)?;
        if sem_cb.count >= sem_cb.max_count {
            return Err(GiveSemaphoreError::Overflow);
        }

        let wait = sem_cb.wait;
        if self.wake_highest(wait).is_some() {
            self.reschedule(false);
        } else {
            self.semaphores[sem].count += 1;
        }
        Ok(())
    }

    /// Acquire a token.
    ///
    /// A zero `timeout` never blocks and may be used in an interrupt context.
    pub fn semaphore_take(
        &mut self,
        sem: SemaphoreId,
        timeout: Timeout,
    ) -> Result<WaitStart<()>, TakeSemaphoreError> {
        let sem_cb = self.semaphores.get_mut(sem).ok_or(TakeSemaphoreError::BadId)?;
        if sem_cb.count > 0 {
            sem_cb.count -= 1;
            return Ok(WaitStart::Done(()));
        }
        if timeout.is_zero() {
            return Err(TakeSemaphoreError::Timeout);
        }
        let wait = sem_cb.wait;

        let task = self
            .current_waitable()
            .map_err(|_| TakeSemaphoreError::BadContext)?;
        let deadline =
            Deadline::after(self.tick_count, timeout).ok_or(TakeSemaphoreError::BadParam)?;
        self.wait_on(wait, task, BlockReason::Semaphore, deadline);
        self.reschedule(false);
        Ok(WaitStart::Blocked)
    }

    /// Finish a [`Self::semaphore_take`] call that returned
    /// [`WaitStart::Blocked`]. A granted wait means a token was handed over
    /// by [`Self::semaphore_give`].
    pub fn semaphore_take_resume(&mut self, sem: SemaphoreId) -> Result<(), TakeSemaphoreError> {
        let task = self
            .current_waitable()
            .map_err(|_| TakeSemaphoreError::BadContext)?;
        match self.finish_wait(task) {
            Some(WaitOutcome::Granted) => Ok(()),
            Some(WaitOutcome::Deleted) => Err(TakeSemaphoreError::Deleted),
            Some(WaitOutcome::TimedOut) | None if !self.semaphores.contains(sem) => {
                Err(TakeSemaphoreError::BadId)
            }
            Some(WaitOutcome::TimedOut) | None => Err(TakeSemaphoreError::Timeout),
        }
    }

    /// Equivalent to `semaphore_take(sem, Timeout::NO_WAIT)`.
    pub fn semaphore_try_take(&mut self, sem: SemaphoreId) -> Result<(), TakeSemaphoreError> {
        match self.semaphore_take(sem, Timeout::NO_WAIT)? {
            WaitStart::Done(()) => Ok(()),
            WaitStart::Blocked => unreachable!(),
        }
    }

    pub fn semaphore_count(&self, sem: SemaphoreId) -> Result<u32, BadIdError> {
        Ok(self.semaphores.get(sem).ok_or(BadIdError::BadId)?.count)
    }

    pub fn semaphore_is_available(&self, sem: SemaphoreId) -> Result<bool, BadIdError> {
        Ok(self.semaphore_count(sem)? > 0)
    }

    /// Put back a token that was handed to a waiter that will never take it.
    pub(crate) fn semaphore_token_returned(&mut self, wait: BlockingObjectId) {
        let Some(sem) = self
            .semaphores
            .iter()
            .find(|(_, s)| s.wait == wait)
            .map(|(id, _)| id)
        else {
            return;
        };
        if self.wake_highest(wait).is_none() {
            let sem_cb = &mut self.semaphores[sem];
            sem_cb.count = (sem_cb.count + 1).min(sem_cb.max_count);
        }
    }

    /// Delete a semaphore. Waiters are woken with `Deleted`.
    pub fn semaphore_delete(&mut self, sem: SemaphoreId) -> Result<(), BadIdError> {
        let sem_cb = self.semaphores.remove(sem).ok_or(BadIdError::BadId)?;
        self.wake_all(sem_cb.wait, WaitOutcome::Deleted);
        self.objects.remove(sem_cb.wait);
        self.reschedule(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_port::TestPort, Config, TaskId, TaskSt};
    use assert_matches::assert_matches;
    use quickcheck_macros::quickcheck;

    fn nop(_: usize) {}

    fn kernel() -> Kernel<TestPort> {
        let _ = env_logger::builder().is_test(true).try_init();
        Kernel::new(Config::DEFAULT).unwrap()
    }

    #[test]
    fn create_validates_counts() {
        let mut k = kernel();
        assert_matches!(k.semaphore_create(0, 0), Err(CreateObjectError::BadParam));
        assert_matches!(k.semaphore_create(3, 2), Err(CreateObjectError::BadParam));
        let s = k.semaphore_create(2, 2).unwrap();
        assert_eq!(k.semaphore_count(s), Ok(2));
        assert_eq!(k.semaphore_is_available(s), Ok(true));
    }

    #[test]
    fn give_overflows_at_max() {
        let mut k = kernel();
        let s = k.semaphore_create(0, 1).unwrap();
        k.semaphore_give(s).unwrap();
        assert_matches!(k.semaphore_give(s), Err(GiveSemaphoreError::Overflow));
        k.semaphore_try_take(s).unwrap();
        assert_matches!(k.semaphore_try_take(s), Err(TakeSemaphoreError::Timeout));
        assert_eq!(k.semaphore_is_available(s), Ok(false));
    }

    /// Start the kernel with a consumer `c` (higher priority) and a producer
    /// `p`, and let `c` block on an empty semaphore.
    fn blocked_consumer(k: &mut Kernel<TestPort>, timeout: Timeout) -> (SemaphoreId, TaskId, TaskId) {
        let p = k.task_create("p", nop, 0, 64, 1).unwrap();
        let c = k.task_create("c", nop, 0, 64, 4).unwrap();
        k.start().unwrap();
        assert_eq!(k.current_task(), Some(c));
        let s = k.semaphore_create(0, 4).unwrap();
        assert_eq!(k.semaphore_take(s, timeout), Ok(WaitStart::Blocked));
        assert_eq!(k.task_block_reason(c), Ok(BlockReason::Semaphore));
        assert_eq!(k.current_task(), Some(p));
        (s, p, c)
    }

    #[test]
    fn give_hands_token_to_waiter() {
        let mut k = kernel();
        let (s, _, c) = blocked_consumer(&mut k, Timeout::FOREVER);

        k.semaphore_give(s).unwrap();
        // The token went to `c`, not to the counter
        assert_eq!(k.semaphore_count(s), Ok(0));
        assert_eq!(k.current_task(), Some(c));
        assert_eq!(k.semaphore_take_resume(s), Ok(()));
        assert_eq!(k.task_block_reason(c), Ok(BlockReason::None));
    }

    #[test]
    fn take_times_out() {
        let mut k = kernel();
        let (s, p, c) = blocked_consumer(&mut k, Timeout::Ticks(5));
        for _ in 0..4 {
            let _ = k.tick();
            assert_eq!(k.current_task(), Some(p));
        }
        let _ = k.tick();
        assert_eq!(k.current_task(), Some(c));
        assert_eq!(k.task_state(c), Ok(TaskSt::Running));
        // The reason is left for the resuming operation to observe
        assert_eq!(k.task_block_reason(c), Ok(BlockReason::Semaphore));
        assert_eq!(k.semaphore_take_resume(s), Err(TakeSemaphoreError::Timeout));
        assert_eq!(k.tick_count(), 5);
    }

    #[test]
    fn delete_wakes_waiter() {
        let mut k = kernel();
        let (s, _, c) = blocked_consumer(&mut k, Timeout::FOREVER);
        k.semaphore_delete(s).unwrap();
        assert_eq!(k.current_task(), Some(c));
        assert_eq!(k.semaphore_take_resume(s), Err(TakeSemaphoreError::Deleted));
        assert_eq!(k.semaphore_count(s), Err(BadIdError::BadId));
    }

    #[test]
    fn token_of_deleted_waiter_goes_to_next_waiter() {
        let mut k = kernel();
        let (s, p, c) = blocked_consumer(&mut k, Timeout::FOREVER);
        let c2 = k.task_create("c2", nop, 0, 64, 3).unwrap();
        assert_eq!(k.current_task(), Some(c2));
        assert_eq!(k.semaphore_take(s, Timeout::FOREVER), Ok(WaitStart::Blocked));
        assert_eq!(k.current_task(), Some(p));

        k.semaphore_give(s).unwrap();
        assert_eq!(k.current_task(), Some(c));
        k.task_delete(c).unwrap();

        assert_eq!(k.current_task(), Some(c2));
        assert_eq!(k.semaphore_take_resume(s), Ok(()));
        assert_eq!(k.semaphore_count(s), Ok(0));
    }

    #[test]
    fn token_of_deleted_waiter_goes_back_to_count() {
        let mut k = kernel();
        let (s, p, c) = blocked_consumer(&mut k, Timeout::FOREVER);
        k.interrupt_enter();
        k.semaphore_give(s).unwrap();
        k.task_delete(c).unwrap();
        k.interrupt_exit();

        assert_eq!(k.current_task(), Some(p));
        assert_eq!(k.semaphore_count(s), Ok(1));
    }

    #[test]
    fn suspended_waiter_keeps_its_token() {
        let mut k = kernel();
        let (s, p, c) = blocked_consumer(&mut k, Timeout::FOREVER);
        k.interrupt_enter();
        k.semaphore_give(s).unwrap();
        k.task_suspend(c).unwrap();
        k.interrupt_exit();
        assert_eq!(k.current_task(), Some(p));
        assert_eq!(k.semaphore_count(s), Ok(0));

        k.task_resume(c).unwrap();
        assert_eq!(k.current_task(), Some(c));
        assert_eq!(k.semaphore_take_resume(s), Ok(()));
    }

    #[test]
    fn blocking_take_needs_a_task() {
        let mut k = kernel();
        let s = k.semaphore_create(0, 1).unwrap();
        assert_matches!(
            k.semaphore_take(s, Timeout::FOREVER),
            Err(TakeSemaphoreError::BadContext)
        );
    }

    #[test]
    fn give_from_interrupt_defers_switch() {
        let mut k = kernel();
        let (s, p, c) = blocked_consumer(&mut k, Timeout::FOREVER);
        k.interrupt_enter();
        k.semaphore_give(s).unwrap();
        assert_eq!(k.current_task(), Some(p));
        k.interrupt_exit();
        assert_eq!(k.current_task(), Some(c));
    }

    /// The number of successful takes never exceeds the number of successful
    /// gives plus the initial count, and the count never exceeds the maximum.
    #[quickcheck]
    fn conservation(initial: u8, max: u8, ops: Vec<bool>) -> bool {
        let max = u32::from(max % 8) + 1;
        let initial = u32::from(initial) % (max + 1);
        let mut k = kernel();
        let s = k.semaphore_create(initial, max).unwrap();

        let (mut gives, mut takes) = (0u32, 0u32);
        for give in ops {
            if give {
                gives += k.semaphore_give(s).is_ok() as u32;
            } else {
                takes += k.semaphore_try_take(s).is_ok() as u32;
            }
            let count = k.semaphore_count(s).unwrap();
            if count > max || takes > gives + initial || count != initial + gives - takes {
                return false;
            }
        }
        true
    }
}
