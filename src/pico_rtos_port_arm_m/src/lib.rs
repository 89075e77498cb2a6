//! The Cortex-M port for `pico_rtos_kernel`.
//!
//! Every context, including the kernel's idle context, runs in Thread mode on
//! the process stack (PSP). The main stack (MSP) that the boot code was
//! running on is taken over by exception handlers once the first context is
//! dispatched.
//!
//! # Context switching
//!
//! The kernel decides which context runs next while holding CPU Lock and
//! pends PendSV. PendSV has the lowest priority, so the switch is performed
//! once CPU Lock is released and every other handler has returned. Several
//! switches staged before PendSV runs collapse into one: the port saves into
//! the context that is physically running and restores the last one staged.
//!
//! CPU Lock is implemented by `PRIMASK`, which makes the port usable on
//! Armv6-M (e.g., RP2040) as well as on Armv7-M.
//!
//! # Kernel timing
//!
//! SysTick drives the kernel tick. Its input clock frequency is supplied
//! through [`SysTickOptions`], and the tick rate comes from the kernel
//! configuration passed to `System::init`.
//!
//! # Usage
//!
//! ```rust,ignore
//! pico_rtos_port_arm_m::use_port!(unsafe struct Port; static SYSTEM;);
//!
//! impl pico_rtos_port_arm_m::ThreadingOptions for Port {}
//!
//! impl pico_rtos_port_arm_m::SysTickOptions for Port {
//!     const FREQUENCY: u32 = 125_000_000;
//! }
//!
//! #[cortex_m_rt::entry]
//! fn main() -> ! {
//!     SYSTEM.init(Config::DEFAULT).unwrap();
//!     SYSTEM.task_create("blinky", blinky, 0, 0, 1).unwrap();
//!     SYSTEM.start()
//! }
//! ```
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]

extern crate alloc;

/// The layout of the initial stack frame of a new context.
#[doc(hidden)]
pub mod frame;

/// The [`pico_rtos_kernel::PortThreading`] implementation.
#[doc(hidden)]
pub mod threading {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

/// The [`pico_rtos_kernel::PortTimer`] implementation based on SysTick.
#[doc(hidden)]
pub mod systick {
    pub mod cfg;
    #[cfg(target_os = "none")]
    pub mod imp;
}

pub use self::{systick::cfg::*, threading::cfg::*};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate pico_rtos_kernel;
/// Used by `use_port!`
#[doc(hidden)]
#[cfg(target_os = "none")]
pub use cortex_m_rt;
