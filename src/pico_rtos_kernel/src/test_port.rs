//! A host port that records what the kernel asks of it
use std::cell::{Cell, RefCell};

use crate::{PortThreading, PortTimer, TaskEntry};

pub(crate) struct TestPort;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PortEvent {
    InitTick(u32),
    Prepare { from: Option<u32>, to: u32 },
    Trigger,
}

#[derive(Debug)]
pub(crate) struct TestTaskState {
    /// Serial number assigned at creation
    pub(crate) serial: u32,
    pub(crate) entry: TaskEntry,
    pub(crate) param: usize,
    pub(crate) stack_words: usize,
}

thread_local! {
    static CPU_LOCK: Cell<bool> = Cell::new(false);
    static NEXT_SERIAL: Cell<u32> = Cell::new(0);
    static EVENTS: RefCell<Vec<PortEvent>> = RefCell::new(Vec::new());
}

impl TestPort {
    /// Take the recorded events.
    pub(crate) fn take_events() -> Vec<PortEvent> {
        EVENTS.with(|e| std::mem::take(&mut *e.borrow_mut()))
    }

    /// Count the switch requests in `events`.
    pub(crate) fn count_triggers(events: &[PortEvent]) -> usize {
        events.iter().filter(|e| **e == PortEvent::Trigger).count()
    }

    fn record(event: PortEvent) {
        log::trace!("port: {event:?}");
        EVENTS.with(|e| e.borrow_mut().push(event));
    }
}

unsafe impl PortThreading for TestPort {
    type TaskState = TestTaskState;

    unsafe fn enter_cpu_lock() {
        CPU_LOCK.with(|c| {
            assert!(!c.get());
            c.set(true);
        });
    }

    unsafe fn leave_cpu_lock() {
        CPU_LOCK.with(|c| {
            assert!(c.get());
            c.set(false);
        });
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.with(|c| c.get())
    }

    unsafe fn initialize_task_state(
        stack: &mut [usize],
        entry: TaskEntry,
        param: usize,
    ) -> Self::TaskState {
        let serial = NEXT_SERIAL.with(|s| {
            let x = s.get();
            s.set(x + 1);
            x
        });
        TestTaskState {
            serial,
            entry,
            param,
            stack_words: stack.len(),
        }
    }

    unsafe fn prepare_context_switch(current: Option<&Self::TaskState>, next: &Self::TaskState) {
        Self::record(PortEvent::Prepare {
            from: current.map(|s| s.serial),
            to: next.serial,
        });
    }

    unsafe fn trigger_switch() {
        Self::record(PortEvent::Trigger);
    }

    unsafe fn dispatch_first_task(_first: &Self::TaskState) -> ! {
        panic!("the host port cannot dispatch tasks");
    }

    fn idle_loop(_param: usize) {}

    fn wait_for_interrupt() {}
}

impl PortTimer for TestPort {
    unsafe fn init_tick_source(tick_rate_hz: u32) {
        Self::record(PortEvent::InitTick(tick_rate_hz));
    }
}
