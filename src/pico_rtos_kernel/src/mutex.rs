//! ~~Mutices~~ Mutexes with priority inheritance
use crate::{
    error::{BadIdError, CreateObjectError, LockMutexError, UnlockMutexError},
    task::{BlockReason, TaskId},
    timeout::{Deadline, Timeout},
    wait::{BlockingObjectId, WaitOutcome, WaitStart},
    Kernel, Port, Priority,
};

define_id! {
    /// Identifies a mutex.
    pub struct MutexId;
}

/// *Mutex control block*
#[derive(Debug)]
pub(crate) struct MutexCb {
    /// The owner. `None` iff `lock_count == 0`.
    pub(crate) owner: Option<TaskId>,
    pub(crate) lock_count: u32,
    pub(crate) wait: BlockingObjectId,
}

/// Mutex operations
impl<P: Port> Kernel<P> {
    pub fn mutex_create(&mut self) -> Result<MutexId, CreateObjectError> {
        let wait = self.blocking_object_create()?;
        Ok(self.mutexes.insert(MutexCb {
            owner: None,
            lock_count: 0,
            wait,
        }))
    }

    /// Acquire a mutex on behalf of the calling task.
    ///
    /// The owner may lock the mutex again; each lock must be matched by an
    /// unlock. If another task owns the mutex and has a lower priority, the
    /// owner inherits the caller's priority. A zero `timeout` then fails
    /// with `Timeout`; otherwise the caller is blocked and the lock is
    /// finished by [`Self::mutex_lock_resume`].
    pub fn mutex_lock(
        &mut self,
        mutex: MutexId,
        timeout: Timeout,
    ) -> Result<WaitStart<()>, LockMutexError> {
        let task = self
            .current_waitable()
            .map_err(|_| LockMutexError::BadContext)?;
        let mutex_cb = self.mutexes.get_mut(mutex).ok_or(LockMutexError::BadId)?;

        let owner = match mutex_cb.owner {
            None => {
                mutex_cb.owner = Some(task);
                mutex_cb.lock_count = 1;
                return Ok(WaitStart::Done(()));
            }
            Some(owner) if owner == task => {
                mutex_cb.lock_count += 1;
                return Ok(WaitStart::Done(()));
            }
            Some(owner) => owner,
        };
        let wait = mutex_cb.wait;

        let deadline =
            Deadline::after(self.tick_count, timeout).ok_or(LockMutexError::BadParam)?;

        let priority = self.tasks[task].priority;
        if priority > self.tasks[owner].priority {
            ktrace!("{:?} inherits priority {} through {:?}", owner, priority, mutex);
            self.set_effective_priority(owner, priority);
        }

        if timeout.is_zero() {
            return Err(LockMutexError::Timeout);
        }

        self.wait_on(wait, task, BlockReason::Mutex, deadline);
        self.reschedule(false);
        Ok(WaitStart::Blocked)
    }

    /// Finish a [`Self::mutex_lock`] call that returned
    /// [`WaitStart::Blocked`]. Ownership is checked directly because a
    /// timeout also resumes the task.
    pub fn mutex_lock_resume(&mut self, mutex: MutexId) -> Result<(), LockMutexError> {
        let task = self
            .current_waitable()
            .map_err(|_| LockMutexError::BadContext)?;
        let outcome = self.finish_wait(task);
        let mutex_cb = match self.mutexes.get(mutex) {
            Some(x) => x,
            None if outcome == Some(WaitOutcome::Deleted) => return Err(LockMutexError::Deleted),
            None => return Err(LockMutexError::BadId),
        };

        if mutex_cb.owner == Some(task) {
            return Ok(());
        }

        // The inheritance from this task may have been the only reason for
        // the owner's current priority
        if let Some(owner) = mutex_cb.owner {
            self.update_effective_priority(owner);
        }

        match outcome {
            Some(WaitOutcome::Deleted) => Err(LockMutexError::Deleted),
            _ => Err(LockMutexError::Timeout),
        }
    }

    /// Equivalent to `mutex_lock(mutex, Timeout::NO_WAIT)`.
    pub fn mutex_try_lock(&mut self, mutex: MutexId) -> Result<(), LockMutexError> {
        match self.mutex_lock(mutex, Timeout::NO_WAIT)? {
            WaitStart::Done(()) => Ok(()),
            WaitStart::Blocked => unreachable!(),
        }
    }

    /// Release a mutex held by the calling task.
    ///
    /// When the lock count reaches zero, the caller's priority is restored
    /// and the ownership is transferred directly to the highest-priority
    /// waiter (with a lock count of one).
    pub fn mutex_unlock(&mut self, mutex: MutexId) -> Result<(), UnlockMutexError> {
        let task = self
            .current_waitable()
            .map_err(|_| UnlockMutexError::BadContext)?;
        let mutex_cb = self.mutexes.get_mut(mutex).ok_or(UnlockMutexError::BadId)?;
        if mutex_cb.owner != Some(task) {
            return Err(UnlockMutexError::NotOwner);
        }

        mutex_cb.lock_count -= 1;
        if mutex_cb.lock_count > 0 {
            return Ok(());
        }
        mutex_cb.owner = None;

        self.update_effective_priority(task);
        self.hand_off_mutex(mutex);
        self.reschedule(false);
        Ok(())
    }

    /// Give an unowned mutex to its highest-priority waiter, if any.
    fn hand_off_mutex(&mut self, mutex: MutexId) {
        let wait = self.mutexes[mutex].wait;
        if let Some(next) = self.wake_highest(wait) {
            let mutex_cb = &mut self.mutexes[mutex];
            mutex_cb.owner = Some(next);
            mutex_cb.lock_count = 1;
            ktrace!("{:?} handed to {:?}", mutex, next);

            // Inherit from the waiters still queued behind the new owner
            self.update_effective_priority(next);
        }
    }

    pub fn mutex_owner(&self, mutex: MutexId) -> Result<Option<TaskId>, BadIdError> {
        Ok(self.mutexes.get(mutex).ok_or(BadIdError::BadId)?.owner)
    }

    pub fn mutex_lock_count(&self, mutex: MutexId) -> Result<u32, BadIdError> {
        Ok(self.mutexes.get(mutex).ok_or(BadIdError::BadId)?.lock_count)
    }

    /// Delete a mutex. Waiters are woken with `Deleted`, and the owner loses
    /// the priority it inherited through this mutex.
    pub fn mutex_delete(&mut self, mutex: MutexId) -> Result<(), BadIdError> {
        let mutex_cb = self.mutexes.remove(mutex).ok_or(BadIdError::BadId)?;
        self.wake_all(mutex_cb.wait, WaitOutcome::Deleted);
        self.objects.remove(mutex_cb.wait);
        if let Some(owner) = mutex_cb.owner {
            self.update_effective_priority(owner);
        }
        self.reschedule(false);
        Ok(())
    }

    /// Get the highest priority among the waiters of the mutexes owned by
    /// `task`.
    pub(crate) fn inherited_priority(&self, task: TaskId) -> Option<Priority> {
        self.mutexes
            .iter()
            .filter(|(_, m)| m.owner == Some(task))
            .filter_map(|(_, m)| {
                self.blocking_object_stats(m.wait)
                    .ok()
                    .and_then(|s| s.highest_priority)
            })
            .max()
    }

    /// Recalculate the priority of the owner of the mutex whose wait list is
    /// `wait` after a waiter left it or changed its priority.
    pub(crate) fn mutex_wait_list_changed(&mut self, wait: BlockingObjectId) {
        let owner = self
            .mutexes
            .iter()
            .find(|(_, m)| m.wait == wait)
            .and_then(|(_, m)| m.owner);
        if let Some(owner) = owner {
            self.update_effective_priority(owner);
        }
    }

    /// Release every mutex owned by a task that is being terminated.
    pub(crate) fn abandon_mutexes(&mut self, task: TaskId) {
        loop {
            let found = self
                .mutexes
                .iter()
                .find(|(_, m)| m.owner == Some(task))
                .map(|(id, _)| id);
            let Some(mutex) = found else { break };
            kwarn!("{:?} abandoned by {:?}", mutex, task);
            let mutex_cb = &mut self.mutexes[mutex];
            mutex_cb.owner = None;
            mutex_cb.lock_count = 0;
            self.hand_off_mutex(mutex);
        }
    }
}
