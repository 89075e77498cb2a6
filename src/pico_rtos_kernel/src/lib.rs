//! A preemptive, priority-based real-time kernel for single-core
//! microcontrollers.
//!
//! The kernel is split into two layers:
//!
//!  - [`Kernel`] is the complete kernel state (tasks, blocking objects,
//!    mutexes, semaphores, queues, software timers, tick counter). Its methods
//!    take `&mut self` and never touch the CPU directly; everything
//!    architecture-specific goes through the [`Port`] trait. Blocking
//!    operations return [`WaitStart::Blocked`] instead of suspending, and the
//!    caller resumes them through the matching `*_resume` method once the
//!    task is dispatched again.
//!
//!  - [`System`] wraps a `Kernel` in a CPU Lock-protected cell so that it can
//!    be placed in a `static`. Its methods are what application tasks and
//!    interrupt handlers call. Blocking methods drive the
//!    block/switch/resume cycle described above.
//!
//! # Contexts
//!
//! A *task context* is code running on behalf of a task. An *interrupt
//! context* is code running between [`Kernel::interrupt_enter`] and
//! [`Kernel::interrupt_exit`]. Operations that may block the caller are only
//! allowed in a task context, and only with a timeout other than
//! [`Timeout::NO_WAIT`] from there.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]

extern crate alloc;

#[macro_use]
mod utils;

pub mod cfg;
mod error;
mod klock;
pub mod memory;
mod mutex;
mod port;
mod queue;
mod sched;
mod semaphore;
pub mod stats;
mod system;
mod task;
mod timeout;
mod timer;
mod wait;

#[cfg(test)]
mod test_port;

pub use self::{
    cfg::Config,
    error::*,
    memory::MemoryStats,
    mutex::MutexId,
    port::*,
    queue::QueueId,
    sched::{IdleStep, Kernel, StackOverflow, TickOutcome, VERSION},
    semaphore::SemaphoreId,
    stats::SystemStats,
    system::System,
    task::{BlockReason, TaskId, TaskSt, MIN_STACK_WORDS, STACK_GUARD},
    timeout::{Ticks, Timeout},
    timer::{TimerCallback, TimerId, MAX_EXPIRED_PER_TICK},
    wait::{BlockingObjectId, BlockingStats, WaitOutcome, WaitStart},
};

/// Task priority. Higher values are more urgent.
pub type Priority = u32;
