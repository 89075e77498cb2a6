//! Result codes and per-operation error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use pico_rtos_kernel::ResultCode;
            /// assert_eq!(ResultCode::NotOwner.as_str(), "NotOwner");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                (*self).fmt(f)
            }
        }

        impl fmt::Display for ResultCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} ({})", self.as_str(), *self as u16)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that kernel operations can
    /// produce.
    ///
    /// The numeric values are grouped by subsystem: `1xx` for tasks, `2xx` for
    /// memory, `3xx` for synchronization primitives, and `4xx` for the system
    /// as a whole.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(u16)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// The guard words at the bottom of a task stack were overwritten.
        StackOverflow = 101,
        /// A target object is in a state that disallows the operation.
        BadObjectState = 102,
        /// A parameter is invalid in a way that is not covered by any other
        /// error codes.
        BadParam = 103,
        /// The requested stack cannot hold the initial frame and the guard
        /// words.
        StackTooSmall = 104,
        /// A specified object identifier is invalid or refers to an object
        /// that has been deleted.
        BadId = 106,
        /// The configured maximum number of objects of this kind exist
        /// already.
        LimitExceeded = 109,
        /// Tracked allocation failed.
        OutOfMemory = 200,
        /// The operation timed out.
        Timeout = 300,
        /// The caller does not own the resource.
        NotOwner = 301,
        /// The counter is at its maximum value.
        Overflow = 311,
        /// The object was deleted while the caller was waiting on it.
        Deleted = 340,
        /// The kernel has not been initialized.
        NotInitialized = 400,
        /// The kernel has been initialized already.
        AlreadyInitialized = 401,
        /// A configuration value is out of range.
        BadConfig = 402,
        /// The scheduler has been started already.
        AlreadyRunning = 404,
        /// The current context disallows the operation.
        BadContext = 406,
        /// The scheduler was started with no tasks to run.
        NoTasks = 409,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    #[inline]
    pub fn is_err(self) -> bool {
        self != Self::Success
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as u16
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod bad_context_error {}
    /// Error type indicating that the current context disallows the
    /// operation.
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod bad_id_error {}
    /// Error type for operations whose only failure mode is an invalid object
    /// identifier, such as [`Kernel::task_state`] and
    /// [`Kernel::semaphore_delete`].
    ///
    /// [`Kernel::task_state`]: crate::Kernel::task_state
    /// [`Kernel::semaphore_delete`]: crate::Kernel::semaphore_delete
    pub enum BadIdError {
        BadId,
    }
}

define_error! {
    mod init_error {}
    /// Error type for [`Kernel::new`].
    ///
    /// [`Kernel::new`]: crate::Kernel::new
    pub enum InitError {
        /// The kernel has been initialized already.
        AlreadyInitialized,
        /// A field of [`Config`](crate::Config) is out of range.
        BadConfig,
        /// The idle stack couldn't be allocated.
        OutOfMemory,
    }
}

define_error! {
    mod start_error {}
    /// Error type for [`Kernel::start`].
    ///
    /// [`Kernel::start`]: crate::Kernel::start
    pub enum StartError {
        /// The scheduler is already running.
        AlreadyRunning,
        /// There are no tasks to run.
        NoTasks,
    }
}

define_error! {
    mod create_task_error {}
    /// Error type for [`Kernel::task_create`] and
    /// [`Kernel::task_create_static`].
    ///
    /// [`Kernel::task_create`]: crate::Kernel::task_create
    /// [`Kernel::task_create_static`]: crate::Kernel::task_create_static
    pub enum CreateTaskError {
        /// The current context is an interrupt context.
        BadContext,
        /// The stack is smaller than [`MIN_STACK_WORDS`](crate::MIN_STACK_WORDS).
        StackTooSmall,
        /// [`Config::max_tasks`](crate::Config::max_tasks) tasks exist
        /// already.
        LimitExceeded,
        /// The stack couldn't be allocated.
        OutOfMemory,
    }
}

define_error! {
    mod delete_task_error {}
    /// Error type for [`Kernel::task_delete`].
    ///
    /// [`Kernel::task_delete`]: crate::Kernel::task_delete
    pub enum DeleteTaskError {
        BadId,
        /// The task has been terminated already.
        BadObjectState,
    }
}

define_error! {
    mod suspend_task_error {}
    /// Error type for [`Kernel::task_suspend`] and [`Kernel::task_resume`].
    ///
    /// [`Kernel::task_suspend`]: crate::Kernel::task_suspend
    /// [`Kernel::task_resume`]: crate::Kernel::task_resume
    pub enum SuspendTaskError {
        BadId,
        /// The task is not in a state that allows the transition.
        BadObjectState,
    }
}

define_error! {
    mod set_task_priority_error {}
    /// Error type for [`Kernel::task_set_priority`].
    ///
    /// [`Kernel::task_set_priority`]: crate::Kernel::task_set_priority
    pub enum SetTaskPriorityError {
        BadId,
        /// The task has been terminated.
        BadObjectState,
    }
}

define_error! {
    mod exit_task_error {}
    /// Error type for [`Kernel::exit_task`].
    ///
    /// [`Kernel::exit_task`]: crate::Kernel::exit_task
    pub enum ExitTaskError: BadContextError {
        /// The current context is not a task context.
        BadContext,
    }
}

define_error! {
    mod delay_error {}
    /// Error type for [`Kernel::delay`] and [`Kernel::delay_until`].
    ///
    /// [`Kernel::delay`]: crate::Kernel::delay
    /// [`Kernel::delay_until`]: crate::Kernel::delay_until
    pub enum DelayError: BadContextError {
        /// The current context is not a task context.
        BadContext,
        /// The duration exceeds the representable range.
        BadParam,
    }
}

define_error! {
    mod create_object_error {}
    /// Error type for the object creation operations such as
    /// [`Kernel::semaphore_create`].
    ///
    /// [`Kernel::semaphore_create`]: crate::Kernel::semaphore_create
    pub enum CreateObjectError {
        /// A size, count, or period parameter is zero or inconsistent.
        BadParam,
        /// The configured maximum number of objects of this kind exist
        /// already.
        LimitExceeded,
        /// Tracked allocation failed.
        OutOfMemory,
    }
}

define_error! {
    mod block_error {}
    /// Error type for [`Kernel::blocking_object_block`].
    ///
    /// [`Kernel::blocking_object_block`]: crate::Kernel::blocking_object_block
    pub enum BlockError {
        BadId,
        /// The task is not in a state that allows blocking.
        BadObjectState,
        /// The timeout exceeds the representable range.
        BadParam,
    }
}

define_error! {
    mod wait_error {}
    /// Error type for the resumption of a wait operation.
    pub enum WaitError {
        /// The deadline elapsed before the resource was granted.
        Timeout,
        /// The object was deleted while the task was waiting on it.
        Deleted,
    }
}

define_error! {
    mod lock_mutex_error {}
    /// Error type for [`Kernel::mutex_lock`].
    ///
    /// [`Kernel::mutex_lock`]: crate::Kernel::mutex_lock
    pub enum LockMutexError: WaitError {
        BadId,
        /// The current context is not a task context.
        BadContext,
        /// The timeout exceeds the representable range.
        BadParam,
        Timeout,
        Deleted,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Kernel::mutex_unlock`].
    ///
    /// [`Kernel::mutex_unlock`]: crate::Kernel::mutex_unlock
    pub enum UnlockMutexError {
        BadId,
        /// The current context is not a task context.
        BadContext,
        /// The current task does not own the mutex.
        NotOwner,
    }
}

define_error! {
    mod give_semaphore_error {}
    /// Error type for [`Kernel::semaphore_give`].
    ///
    /// [`Kernel::semaphore_give`]: crate::Kernel::semaphore_give
    pub enum GiveSemaphoreError {
        BadId,
        /// The semaphore is at its maximum count.
        Overflow,
    }
}

define_error! {
    mod take_semaphore_error {}
    /// Error type for [`Kernel::semaphore_take`].
    ///
    /// [`Kernel::semaphore_take`]: crate::Kernel::semaphore_take
    pub enum TakeSemaphoreError: WaitError {
        BadId,
        /// The call would block in an interrupt context.
        BadContext,
        /// The timeout exceeds the representable range.
        BadParam,
        Timeout,
        Deleted,
    }
}

define_error! {
    mod queue_error {}
    /// Error type for [`Kernel::queue_send`] and [`Kernel::queue_receive`].
    ///
    /// [`Kernel::queue_send`]: crate::Kernel::queue_send
    /// [`Kernel::queue_receive`]: crate::Kernel::queue_receive
    pub enum QueueError: WaitError {
        BadId,
        /// The call would block in an interrupt context.
        BadContext,
        /// The item length does not match the queue's item size, or the
        /// timeout exceeds the representable range.
        BadParam,
        Timeout,
        Deleted,
    }
}

define_error! {
    mod change_timer_period_error {}
    /// Error type for [`Kernel::timer_change_period`].
    ///
    /// [`Kernel::timer_change_period`]: crate::Kernel::timer_change_period
    pub enum ChangeTimerPeriodError {
        BadId,
        /// The period is zero.
        BadParam,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_taxonomy() {
        assert_eq!(ResultCode::StackTooSmall as u16 / 100, 1);
        assert_eq!(ResultCode::OutOfMemory as u16 / 100, 2);
        assert_eq!(ResultCode::NotOwner as u16 / 100, 3);
        assert_eq!(ResultCode::BadContext as u16 / 100, 4);
        assert!(ResultCode::Success.is_ok());
        assert!(ResultCode::Timeout.is_err());
    }

    #[test]
    fn sub_error_conversion() {
        assert_eq!(LockMutexError::from(WaitError::Timeout), LockMutexError::Timeout);
        assert_eq!(QueueError::from(WaitError::Deleted), QueueError::Deleted);
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(format!("{}", ResultCode::Overflow), "Overflow (311)");
        assert_eq!(format!("{:?}", TakeSemaphoreError::Timeout), "Timeout");
    }
}
