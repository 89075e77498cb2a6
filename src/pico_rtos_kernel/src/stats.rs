//! System statistics

/// A snapshot of the kernel counters, returned by
/// [`Kernel::system_stats`](crate::Kernel::system_stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemStats {
    /// The number of tasks, including terminated tasks that haven't been
    /// reclaimed yet
    pub total_tasks: usize,
    /// Ready tasks plus the running task
    pub ready_tasks: usize,
    pub blocked_tasks: usize,
    pub suspended_tasks: usize,
    pub terminated_tasks: usize,
    /// Bytes of tracked allocation in use
    pub current_memory: usize,
    pub peak_memory: usize,
    pub total_allocations: u32,
    pub idle_counter: u32,
    /// Milliseconds since the kernel was constructed
    pub system_uptime: u64,
}
