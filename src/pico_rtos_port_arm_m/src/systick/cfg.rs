/// The configuration for the SysTick-based tick source.
pub trait SysTickOptions {
    /// The frequency of the processor clock, which SysTick counts.
    const FREQUENCY: u32;

    /// The priority of the SysTick exception. Defaults to `0xc0`.
    ///
    /// Only the implemented high-order bits are used (two bits on Armv6-M).
    const INTERRUPT_PRIORITY: u8 = 0xc0;
}

/// The largest tick period SysTick can count, measured in cycles.
pub const MAX_TICK_PERIOD: u32 = 0x100_0000;

/// Get the tick period measured in SysTick cycles, or `None` if the tick rate
/// can't be produced from `frequency`.
pub const fn tick_period(frequency: u32, tick_rate_hz: u32) -> Option<u32> {
    if tick_rate_hz == 0 {
        return None;
    }
    let period = frequency / tick_rate_hz;
    if period == 0 || period > MAX_TICK_PERIOD {
        None
    } else {
        Some(period)
    }
}
