//! The `PortTimer` implementation based on SysTick.
use cortex_m::peripheral::{scb::SystemHandler, syst::SystClkSource};

use crate::{threading::imp::PortInstance, tick_period};

/// Configure SysTick to fire `tick_rate_hz` times per second.
///
/// # Safety
///
/// Only meant to be called by the kernel during initialization.
pub unsafe fn init<S: PortInstance>(tick_rate_hz: u32) {
    let Some(period) = tick_period(S::FREQUENCY, tick_rate_hz) else {
        panic!(
            "SysTick can't produce {} Hz from a {} Hz clock",
            tick_rate_hz,
            S::FREQUENCY
        );
    };

    // Safety: We have the control of SysTick
    let mut peripherals = unsafe { cortex_m::Peripherals::steal() };

    // Safety: We don't make "priority-based critical sections"
    unsafe {
        peripherals
            .SCB
            .set_priority(SystemHandler::SysTick, S::INTERRUPT_PRIORITY)
    };

    peripherals.SYST.set_clock_source(SystClkSource::Core);
    peripherals.SYST.set_reload(period - 1);
    peripherals.SYST.clear_current();
    peripherals.SYST.enable_interrupt();
    peripherals.SYST.enable_counter();
}

/// Handle a SysTick exception.
#[inline(always)]
pub fn handle_tick<S: PortInstance>() {
    let system = S::system();
    system.interrupt_enter();
    system.tick();
    system.interrupt_exit();
}
